//! End-to-end tests driving the real accept loop over loopback sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sockem::config::ConnConfig;
use sockem::core::crypt;
use sockem::core::firewall::{Firewall, FirewallConfig};
use sockem::core::frame::{encode_frame, FrameBuffer};
use sockem::core::udp_relay::{add_client_header, strip_client_header};
use sockem::core::{Address, Extension, ExtensionChain, Server};
use sockem::extensions::AesExtension;
use sockem::server_runner::{bind_listener, run_server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(server: Server) -> TestServer {
    let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 64).unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(run_server(Arc::new(server), listener, shutdown.clone()));
    TestServer { addr, shutdown }
}

fn conn_config(reuse: bool) -> ConnConfig {
    ConnConfig {
        proxy_host: "127.0.0.1".parse().unwrap(),
        no_new_tcp_server_per_client: reuse,
        remote_timeout: Some(Duration::from_secs(5)),
        ..ConnConfig::default()
    }
}

/// Echo remote that reports each connection once it has seen EOF from the proxy
async fn tcp_echo_reporting_close() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = listener.accept().await {
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let (mut r, mut w) = s.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                drop(s);
                let _ = closed_tx.send(());
            });
        }
    });
    (addr, closed_rx)
}

async fn tcp_echo() -> SocketAddr {
    tcp_echo_reporting_close().await.0
}

async fn udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Negotiate no-auth and send `cmd` for `target`; returns the bound address
async fn handshake(control: &mut TcpStream, cmd: u8, target: SocketAddr) -> SocketAddr {
    control.write_all(&[0x05, 0x02, 0x00, 0x01]).await.unwrap();
    let mut method = [0u8; 2];
    control.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, cmd, 0x00];
    Address::from(target).encode(&mut request);
    control.write_all(&request).await.unwrap();

    let mut head = [0u8; 4];
    control.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..3], &[0x05, 0x00, 0x00]);
    assert_eq!(head[3], 0x01, "IPv4 bound address expected on loopback");
    let mut rest = [0u8; 6];
    control.read_exact(&mut rest).await.unwrap();
    let ip = std::net::Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
    SocketAddr::new(ip.into(), u16::from_be_bytes([rest[4], rest[5]]))
}

async fn expect_closed(addr: SocketAddr) {
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("listener {} still accepting", addr);
}

#[tokio::test]
async fn test_connect_through_reply_port() {
    let (echo, mut remote_closed) = tcp_echo_reporting_close().await;
    let server = start(Server::builder().conn_config(conn_config(false)).build()).await;

    let mut control = TcpStream::connect(server.addr).await.unwrap();
    let bound = handshake(&mut control, 0x01, echo).await;
    assert_ne!(bound, server.addr);

    let mut client = TcpStream::connect(bound).await.unwrap();
    client.write_all(b"hello through the proxy").await.unwrap();
    let mut buf = [0u8; 23];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the proxy");

    // Closing the client closes the outbound socket and releases the listener
    drop(client);
    tokio::time::timeout(Duration::from_secs(5), remote_closed.recv())
        .await
        .expect("outbound socket was not closed")
        .unwrap();
    let mut rest = Vec::new();
    let _ = control.read_to_end(&mut rest).await;
    expect_closed(bound).await;
}

#[tokio::test]
async fn test_connect_reusing_control_connection() {
    let echo = tcp_echo().await;
    let server = start(Server::builder().conn_config(conn_config(true)).build()).await;

    let mut control = TcpStream::connect(server.addr).await.unwrap();
    let bound = handshake(&mut control, 0x01, echo).await;
    assert_eq!(bound, control.peer_addr().unwrap());

    control.write_all(b"same socket").await.unwrap();
    let mut buf = [0u8; 11];
    control.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"same socket");
}

#[tokio::test]
async fn test_connect_non_compliant_client() {
    let echo = tcp_echo().await;
    let server = start(Server::builder().conn_config(conn_config(false)).build()).await;

    let mut control = TcpStream::connect(server.addr).await.unwrap();
    let bound = handshake(&mut control, 0x01, echo).await;

    // Ignore the reply port and keep talking on the control connection
    control.write_all(b"stubborn").await.unwrap();
    let mut buf = [0u8; 8];
    control.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"stubborn");
    expect_closed(bound).await;
}

#[tokio::test]
async fn test_connect_refused_replies_general_failure() {
    let closed = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let server = start(Server::builder().conn_config(conn_config(false)).build()).await;

    let mut control = TcpStream::connect(server.addr).await.unwrap();
    control.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut request = vec![0x05, 0x01, 0x00];
    Address::from(closed).encode(&mut request);
    control.write_all(&request).await.unwrap();

    let mut reply = Vec::new();
    control.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, vec![0x05, 0x00, 0x05, 0x01, 0x00]);
}

#[tokio::test]
async fn test_udp_associate_round_trip() {
    let echo = udp_echo().await;
    let server = start(Server::builder().conn_config(conn_config(false)).build()).await;

    let mut control = TcpStream::connect(server.addr).await.unwrap();
    let relay = handshake(&mut control, 0x03, echo).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = Address::from(echo);
    client
        .send_to(&add_client_header(&target, b"datagram"), relay)
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, relay);
    let (addr, payload) = strip_client_header(&buf[..n]).unwrap();
    assert_eq!(addr, target);
    assert_eq!(payload, Bytes::from_static(b"datagram"));

    // A datagram for some other destination is dropped
    let other = Address::from_host("127.0.0.1", 9);
    client
        .send_to(&add_client_header(&other, b"nope"), relay)
        .await
        .unwrap();
    let silence = tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
    assert!(silence.is_err());
}

#[tokio::test]
async fn test_firewall_rejects_peer() {
    let firewall = Firewall::new(&FirewallConfig {
        enabled: true,
        ips_allowed: vec!["192.0.2.0/24".into(), "2001:db8::/32".into()],
    })
    .unwrap();
    let server = start(
        Server::builder()
            .firewall(Arc::new(firewall))
            .conn_config(conn_config(false))
            .build(),
    )
    .await;

    let mut control = TcpStream::connect(server.addr).await.unwrap();
    let _ = control.write_all(&[0x05, 0x01, 0x00]).await;
    let mut reply = Vec::new();
    let n = control.read_to_end(&mut reply).await.unwrap_or(0);
    assert_eq!(n, 0, "denied peers get no SOCKS reply");
}

#[tokio::test]
async fn test_no_acceptable_method() {
    let server = start(Server::builder().conn_config(conn_config(false)).build()).await;
    let mut control = TcpStream::connect(server.addr).await.unwrap();
    control.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = Vec::new();
    control.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, vec![0x05, 0xFF]);
}

/// Remote that speaks the framed cipher: decrypts each frame and answers
/// with the uppercased text, framed and encrypted again.
async fn aes_peer(key: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        let mut frames = FrameBuffer::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match s.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for frame in frames.feed(&buf[..n]).unwrap() {
                let plain = crypt::decrypt_bytes(&frame, key).unwrap();
                let answer = crypt::encrypt(&plain.to_ascii_uppercase(), key).unwrap();
                s.write_all(&encode_frame(answer.as_bytes())).await.unwrap();
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_aes_extension_end_to_end() {
    const KEY: &str = "pre-shared";
    let peer = aes_peer(KEY).await;

    let aes: Arc<dyn Extension> = Arc::new(AesExtension::new(KEY.into(), [peer.to_string()]));
    let chain = ExtensionChain::new(vec![], vec![Arc::clone(&aes)], vec![aes]);
    let server = start(
        Server::builder()
            .chain(Arc::new(chain))
            .conn_config(conn_config(true))
            .build(),
    )
    .await;

    let mut control = TcpStream::connect(server.addr).await.unwrap();
    handshake(&mut control, 0x01, peer).await;

    control.write_all(b"quiet words").await.unwrap();
    let mut buf = [0u8; 11];
    control.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"QUIET WORDS");

    control.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    control.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"AGAIN");
}
