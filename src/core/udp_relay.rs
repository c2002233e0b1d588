//! UDP relay manager
//!
//! One relay socket per UDP ASSOCIATE. Datagrams from the SOCKS client carry
//! the RFC 1928 section 7 header:
//!
//! RSV(2)=0 FRAG(1)=0 ATYP(1) DST.ADDR DST.PORT(2) DATA
//!
//! The header is stripped on the way to the remote and synthesized on the
//! way back. The relay lives exactly as long as the TCP control connection.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};

use super::address::{canonical_ip, same_ip, Address, AddressFamily, DecodeResult};
use super::hooks::ExtensionChain;
use crate::config::ConnConfig;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Largest datagram the relay reads
const UDP_MAX_DATAGRAM: usize = 64 * 1024;

/// Prepend the SOCKS UDP header for `dest` to `payload`
pub fn add_client_header(dest: &Address, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + 1 + 1 + 255 + 2 + payload.len());
    out.extend_from_slice(&[0x00, 0x00, 0x00]);
    dest.encode(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Split a client datagram into its destination and bare payload
pub fn strip_client_header(datagram: &[u8]) -> Result<(Address, Bytes)> {
    if datagram.len() < 4 {
        return Err(ProxyError::Protocol("UDP datagram shorter than header".into()));
    }
    if datagram[0] != 0 || datagram[1] != 0 {
        return Err(ProxyError::Protocol("non-zero RSV in UDP header".into()));
    }
    if datagram[2] != 0 {
        return Err(ProxyError::Protocol("UDP fragmentation is not supported".into()));
    }
    match Address::decode(&datagram[3..]) {
        DecodeResult::Ok(addr, consumed) => {
            Ok((addr, Bytes::copy_from_slice(&datagram[3 + consumed..])))
        }
        DecodeResult::NeedMoreData => Err(ProxyError::Protocol("truncated UDP header".into())),
        DecodeResult::Invalid(msg) => Err(ProxyError::Protocol(msg.into())),
    }
}

/// Creates UDP relays for ASSOCIATE requests
pub struct UdpRelayManager {
    chain: Arc<ExtensionChain>,
    proxy_host: IpAddr,
}

impl UdpRelayManager {
    pub fn new(conn_config: &ConnConfig, chain: Arc<ExtensionChain>) -> Self {
        Self {
            chain,
            proxy_host: conn_config.proxy_host,
        }
    }

    /// Bind address for a relay serving a control connection whose local
    /// address is `control_local`. Falls back to the unspecified address when
    /// the configured host is of the other family.
    fn bind_ip(&self, control_local: SocketAddr) -> IpAddr {
        let family = AddressFamily::of(&control_local.ip());
        if AddressFamily::of(&self.proxy_host) == family {
            canonical_ip(self.proxy_host)
        } else {
            match family {
                AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            }
        }
    }

    /// Bind the relay socket and resolve the (rewritten) destination
    pub async fn create_proxy(
        &self,
        target: &Address,
        control_peer: SocketAddr,
        control_local: SocketAddr,
    ) -> Result<UdpRelay> {
        let bind_addr = SocketAddr::new(self.bind_ip(control_local), 0);
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            log::error!(peer = %control_peer, error = %e, "Couldn't create a new UDP relay");
            ProxyError::Bind(format!("{}: {}", bind_addr, e))
        })?;
        let local_addr = socket.local_addr()?;
        log::proxy_listener(&control_peer, &local_addr, "udp relay listening");

        let (host, port) = self.chain.pre_connect(target.host(), target.port())?;
        let destination = Address::from_host(&host, port);
        let remote_addr = destination
            .to_socket_addr()
            .await
            .map_err(|e| ProxyError::RemoteConnect(format!("resolve {}: {}", destination, e)))?;

        Ok(UdpRelay {
            socket,
            local_addr,
            negotiated: target.clone(),
            remote_addr: socket_native(remote_addr, local_addr),
            control_peer,
            client: None,
        })
    }
}

/// Express `addr` in the family of a socket bound to `local`
fn socket_native(addr: SocketAddr, local: SocketAddr) -> SocketAddr {
    match (addr.ip(), local.ip()) {
        (IpAddr::V4(v4), IpAddr::V6(_)) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
        (IpAddr::V6(v6), IpAddr::V4(_)) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        _ => addr,
    }
}

/// Outcome of validating one inbound datagram
#[derive(Debug, PartialEq, Eq)]
enum Dispatch {
    /// Bare payload for the remote
    ToRemote(Bytes),
    /// Headered datagram for the current client
    ToClient(SocketAddr, Vec<u8>),
    Drop,
}

enum Event {
    Control(std::io::Result<usize>),
    Datagram(std::io::Result<(usize, SocketAddr)>),
}

/// Relay socket plus the state of one UDP ASSOCIATE
pub struct UdpRelay {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Destination exactly as the client requested it
    negotiated: Address,
    /// Destination after pre-connect rewriting, resolved
    remote_addr: SocketAddr,
    control_peer: SocketAddr,
    /// Envelope address of the current UDP client
    client: Option<SocketAddr>,
}

impl UdpRelay {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Address announced in the SOCKS reply
    pub fn bound_addr(&self, control_local: SocketAddr) -> SocketAddr {
        if self.local_addr.ip().is_unspecified() {
            SocketAddr::new(canonical_ip(control_local.ip()), self.local_addr.port())
        } else {
            self.local_addr
        }
    }

    /// Validate a datagram. The from-client check runs first, so a sender
    /// that matches both directions is treated as the client.
    fn dispatch(&mut self, datagram: &[u8], from: SocketAddr) -> Dispatch {
        if same_ip(from.ip(), self.control_peer.ip()) {
            if let Ok((dest, payload)) = strip_client_header(datagram) {
                if dest == self.negotiated {
                    self.client = Some(from);
                    return Dispatch::ToRemote(payload);
                }
            }
        }

        if same_ip(from.ip(), self.remote_addr.ip()) && from.port() == self.remote_addr.port() {
            if let Some(client) = self.client {
                let dest = Address::from_host(&self.negotiated.host(), self.negotiated.port());
                return Dispatch::ToClient(client, add_client_header(&dest, datagram));
            }
        }

        Dispatch::Drop
    }

    /// Relay datagrams until the control connection closes
    pub async fn run(mut self, mut control: TcpStream) -> Result<()> {
        let mut control_buf = [0u8; 512];
        let mut buf = vec![0u8; UDP_MAX_DATAGRAM];

        loop {
            let event = tokio::select! {
                r = control.read(&mut control_buf) => Event::Control(r),
                r = self.socket.recv_from(&mut buf) => Event::Datagram(r),
            };

            match event {
                Event::Control(Ok(0)) => {
                    log::debug!(peer = %self.control_peer, "Control connection closed, closing UDP relay");
                    break;
                }
                Event::Control(Ok(_)) => {}
                Event::Control(Err(e)) => {
                    log::debug!(peer = %self.control_peer, error = %e, "Control connection error, closing UDP relay");
                    break;
                }
                Event::Datagram(Ok((n, from))) => match self.dispatch(&buf[..n], from) {
                    Dispatch::ToRemote(payload) => {
                        if let Err(e) = self.socket.send_to(&payload, self.remote_addr).await {
                            log::error!(peer = %self.control_peer, error = %e, "Got UDP error, ignoring");
                        }
                    }
                    Dispatch::ToClient(client, datagram) => {
                        if let Err(e) = self.socket.send_to(&datagram, client).await {
                            log::error!(peer = %self.control_peer, error = %e, "Got UDP error, ignoring");
                        }
                    }
                    Dispatch::Drop => {
                        log::trace!(peer = %self.control_peer, from = %from, "Dropped unexpected datagram");
                    }
                },
                Event::Datagram(Err(e)) => {
                    log::error!(peer = %self.control_peer, error = %e, "Got UDP error, ignoring");
                }
            }
        }

        log::proxy_listener(&self.control_peer, &self.local_addr, "udp relay closed");
        Ok(())
    }
}
