//! SOCKS5 session handling
//!
//! One task per accepted control connection walks the session through
//! method negotiation and the request, then hands the sockets over to the
//! TCP or UDP relay manager.

use bytes::{Buf, BytesMut};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::core::socks5::{
    failure_reply, method_reply, success_reply, MethodRequest, SocksCmd, SocksRequest,
    METHOD_NO_ACCEPTABLE,
};
use crate::core::{Address, DecodeResult, Server};
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Upper bound for a buffered handshake message. The largest legal request
/// (domain address) is 262 bytes.
const MAX_HANDSHAKE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitMethods,
    AwaitRequest,
    Relaying,
    Closed,
}

struct Session<'a> {
    server: &'a Server,
    peer: SocketAddr,
    local: SocketAddr,
    state: SessionState,
    /// Bytes read from the control connection but not consumed yet
    buf: BytesMut,
}

async fn read_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<usize> {
    match timeout {
        Some(d) => tokio::time::timeout(d, stream.read(buf))
            .await
            .map_err(|_| ProxyError::Timeout("client request"))?
            .map_err(ProxyError::from),
        None => Ok(stream.read(buf).await?),
    }
}

impl<'a> Session<'a> {
    fn new(server: &'a Server, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            server,
            peer,
            local,
            state: SessionState::AwaitMethods,
            buf: BytesMut::with_capacity(512),
        }
    }

    /// Read until `decode` yields a complete message. Bytes past the message
    /// stay buffered.
    async fn read_message<T>(
        &mut self,
        stream: &mut TcpStream,
        decode: fn(&[u8]) -> DecodeResult<T>,
    ) -> Result<T> {
        let mut temp = [0u8; 512];
        loop {
            match decode(&self.buf) {
                DecodeResult::Ok(msg, consumed) => {
                    self.buf.advance(consumed);
                    return Ok(msg);
                }
                DecodeResult::Invalid(e) => return Err(ProxyError::Protocol(e.into())),
                DecodeResult::NeedMoreData => {}
            }
            if self.buf.len() > MAX_HANDSHAKE_SIZE {
                return Err(ProxyError::Protocol("handshake message too large".into()));
            }

            let n = read_with_timeout(stream, &mut temp, self.server.conn_config.request_timeout).await?;
            if n == 0 {
                let msg = if self.buf.is_empty() {
                    "connection closed before the message"
                } else {
                    "connection closed with an incomplete message"
                };
                return Err(ProxyError::Protocol(msg.into()));
            }
            self.buf.extend_from_slice(&temp[..n]);
        }
    }

    /// Drive `op` while still watching the control connection: a client that
    /// hangs up cancels the pending operation, and anything it pipelines is
    /// kept for the relay.
    async fn while_pending<T, F>(&mut self, stream: &mut TcpStream, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::pin!(op);
        let limit = self.server.conn_config.buffer_size.max(MAX_HANDSHAKE_SIZE);
        let mut temp = vec![0u8; limit];
        loop {
            tokio::select! {
                r = &mut op => return r,
                r = stream.read(&mut temp) => match r {
                    Ok(0) => {
                        return Err(ProxyError::Protocol(
                            "client closed while the request was pending".into(),
                        ))
                    }
                    Ok(n) => {
                        self.buf.extend_from_slice(&temp[..n]);
                        if self.buf.len() > limit * 4 {
                            return Err(ProxyError::Protocol(
                                "client sent too much data before the reply".into(),
                            ));
                        }
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    async fn serve(&mut self, mut stream: TcpStream) -> Result<()> {
        let offer = self.read_message(&mut stream, MethodRequest::decode).await?;
        let method = offer.select();
        stream.write_all(&method_reply(method)).await?;
        if method == METHOD_NO_ACCEPTABLE {
            log::debug!(peer = %self.peer, methods = ?offer.methods, "No acceptable authentication method");
            return Ok(());
        }

        self.state = SessionState::AwaitRequest;
        let request = self.read_message(&mut stream, SocksRequest::decode).await?;
        log::debug!(peer = %self.peer, cmd = %request.cmd, target = %request.addr, "SOCKS request");

        match request.cmd {
            SocksCmd::Connect => self.connect(stream, request.addr).await,
            SocksCmd::UdpAssociate => self.associate(stream, request.addr).await,
        }
    }

    async fn connect(&mut self, mut stream: TcpStream, target: Address) -> Result<()> {
        let server = self.server;
        let pending = server.tcp_relay.create_proxy(&target, self.peer);
        let binding = match self.while_pending(&mut stream, pending).await {
            Ok(binding) => binding,
            Err(e) => {
                let _ = stream.write_all(&failure_reply()).await;
                return Err(e);
            }
        };

        let bound = binding.bound_addr(self.local);
        stream.write_all(&success_reply(bound)).await?;
        self.state = SessionState::Relaying;
        log::info!(peer = %self.peer, target = %target, remote = %binding.remote_addr(), bound = %bound, "Access to remote");

        let client_data = self.buf.split().freeze();
        let copied = binding
            .run(stream, client_data, server.conn_config.request_timeout)
            .await?;
        log::debug!(peer = %self.peer, upload = copied.a_to_b, download = copied.b_to_a, "Relay finished");
        Ok(())
    }

    async fn associate(&mut self, mut stream: TcpStream, target: Address) -> Result<()> {
        let server = self.server;
        let pending = server.udp_relay.create_proxy(&target, self.peer, self.local);
        let relay = match self.while_pending(&mut stream, pending).await {
            Ok(relay) => relay,
            Err(e) => {
                let _ = stream.write_all(&failure_reply()).await;
                return Err(e);
            }
        };

        let bound = relay.bound_addr(self.local);
        stream.write_all(&success_reply(bound)).await?;
        self.state = SessionState::Relaying;
        log::info!(peer = %self.peer, target = %target, remote = %relay.remote_addr(), bound = %bound, "UDP access to remote");

        // The control connection is expected to sit idle from here on
        relay.run(stream).await
    }
}

/// Serve one SOCKS5 control connection to completion
pub async fn process_connection(server: &Server, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let local = stream.local_addr()?;
    let mut session = Session::new(server, peer, local);

    let _closed = scopeguard::guard((), |_| log::connection(&peer, "closed"));

    let result = session.serve(stream).await;
    if let Err(ref e) = result {
        log::debug!(peer = %peer, state = ?session.state, error = %e, "Session aborted");
    }
    session.state = SessionState::Closed;
    result
}
