//! TCP relay manager
//!
//! Owns one CONNECT session after the request is parsed:
//! 1. pre-connect rewrite of the destination
//! 2. optional ephemeral listener the client reconnects to
//! 3. outbound connect with the remote timeout
//! 4. hookup of whichever client socket shows up, then the relay pump

use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use super::address::{same_ip, Address, AddressFamily};
use super::hooks::{ConnectionContext, ExtensionChain};
use super::relay::{relay_through_chain, CopyResult, RelaySettings, Replay};
use crate::config::ConnConfig;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Ephemeral listener that is closed at most once
pub struct ListenerGuard {
    listener: Mutex<Option<Arc<TcpListener>>>,
    stopped: AtomicBool,
    local_addr: SocketAddr,
    peer: SocketAddr,
}

impl ListenerGuard {
    fn new(listener: TcpListener, peer: SocketAddr) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            stopped: AtomicBool::new(false),
            local_addr,
            peer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Close the listener. Returns `true` only for the call that closed it.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
        log::proxy_listener(&self.peer, &self.local_addr, "closed");
        true
    }

    /// Accept the next client; pends forever once stopped
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        let listener = self.listener.lock().ok().and_then(|slot| slot.clone());
        match listener {
            Some(listener) => listener.accept().await,
            None => std::future::pending().await,
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Creates outbound TCP legs for CONNECT requests
pub struct TcpRelayManager {
    chain: Arc<ExtensionChain>,
    proxy_host: IpAddr,
    reuse_control: bool,
    remote_timeout: Option<Duration>,
    tcp_nodelay: bool,
    settings: RelaySettings,
}

impl TcpRelayManager {
    pub fn new(conn_config: &ConnConfig, chain: Arc<ExtensionChain>) -> Self {
        Self {
            chain,
            proxy_host: conn_config.proxy_host,
            reuse_control: conn_config.no_new_tcp_server_per_client,
            remote_timeout: conn_config.remote_timeout,
            tcp_nodelay: conn_config.tcp_nodelay,
            settings: RelaySettings {
                client_timeout: conn_config.client_timeout,
                remote_timeout: conn_config.remote_timeout,
                buffer_size: conn_config.buffer_size,
            },
        }
    }

    /// Set up the outbound leg for `target`. Resolves once the remote is
    /// connected; on failure any listener created so far is released.
    pub async fn create_proxy(&self, target: &Address, peer: SocketAddr) -> Result<ProxyBinding> {
        let (host, port) = self.chain.pre_connect(target.host(), target.port())?;
        if host != target.host() || port != target.port() {
            log::debug!(peer = %peer, target = %target, rewritten = %format!("{}:{}", host, port), "Destination rewritten");
        }

        let listener = if self.reuse_control {
            None
        } else {
            let listener = TcpListener::bind(SocketAddr::new(self.proxy_host, 0))
                .await
                .and_then(|l| ListenerGuard::new(l, peer))
                .map_err(|e| {
                    log::error!(peer = %peer, error = %e, "Couldn't create a new proxy listener");
                    ProxyError::Bind(format!("{}:0: {}", self.proxy_host, e))
                })?;
            log::proxy_listener(&peer, &listener.local_addr(), "listening");
            Some(listener)
        };

        let destination = Address::from_host(&host, port);
        let remote_addr = destination
            .to_socket_addr()
            .await
            .map_err(|e| ProxyError::RemoteConnect(format!("resolve {}: {}", destination, e)))?;

        let connect = TcpStream::connect(remote_addr);
        let remote = match self.remote_timeout {
            Some(d) => tokio::time::timeout(d, connect)
                .await
                .map_err(|_| ProxyError::RemoteConnect(format!("{}: connect timeout", remote_addr)))?,
            None => connect.await,
        }
        .map_err(|e| {
            log::error!(peer = %peer, remote = %remote_addr, error = %e, "Couldn't connect to the remote host");
            ProxyError::RemoteConnect(format!("{}: {}", remote_addr, e))
        })?;

        if self.tcp_nodelay {
            let _ = remote.set_nodelay(true);
        }
        log::debug!(peer = %peer, remote = %remote_addr, "Connected to remote");

        Ok(ProxyBinding {
            listener,
            remote,
            remote_addr,
            peer,
            chain: Arc::clone(&self.chain),
            settings: self.settings.clone(),
            tcp_nodelay: self.tcp_nodelay,
        })
    }
}

/// Outbound connection plus the optional ephemeral listener of one CONNECT
pub struct ProxyBinding {
    listener: Option<ListenerGuard>,
    remote: TcpStream,
    remote_addr: SocketAddr,
    peer: SocketAddr,
    chain: Arc<ExtensionChain>,
    settings: RelaySettings,
    tcp_nodelay: bool,
}

enum Waiting {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Control(std::io::Result<usize>),
    Remote(std::io::Result<usize>),
    Idle,
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

impl ProxyBinding {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn listener(&self) -> Option<&ListenerGuard> {
        self.listener.as_ref()
    }

    /// Address announced in the SOCKS reply: the ephemeral listener, or the
    /// control connection itself when there is none. An unspecified bind
    /// address is replaced by the control connection's local IP.
    pub fn bound_addr(&self, control_local: SocketAddr) -> SocketAddr {
        match &self.listener {
            Some(listener) => {
                let addr = listener.local_addr();
                let same_family = AddressFamily::of(&addr.ip()) == AddressFamily::of(&control_local.ip());
                if addr.ip().is_unspecified() && same_family {
                    SocketAddr::new(control_local.ip(), addr.port())
                } else {
                    addr
                }
            }
            None => control_local,
        }
    }

    /// Drive the binding after the success reply went out.
    ///
    /// `client_data` holds bytes the client pipelined behind its request;
    /// `request_timeout` bounds how long the control connection may sit idle
    /// before a client attaches.
    pub async fn run(
        self,
        mut control: TcpStream,
        client_data: Bytes,
        request_timeout: Option<Duration>,
    ) -> Result<CopyResult> {
        let Some(listener) = self.listener.as_ref() else {
            let ctx = ConnectionContext {
                client_addr: self.peer,
                remote_addr: self.remote_addr,
            };
            let replay = Replay {
                client_data,
                remote_data: Bytes::new(),
            };
            return relay_through_chain(control, self.remote, ctx, &self.chain, &self.settings, replay, || {}).await;
        };

        let mut pending_client = BytesMut::from(&client_data[..]);
        let mut pending_remote = BytesMut::new();
        let mut control_buf = vec![0u8; self.settings.buffer_size];
        let mut remote_buf = vec![0u8; self.settings.buffer_size];
        let mut remote = self.remote;

        loop {
            let event = tokio::select! {
                r = listener.accept() => Waiting::Accepted(r),
                r = control.read(&mut control_buf) => Waiting::Control(r),
                r = remote.read(&mut remote_buf) => Waiting::Remote(r),
                _ = idle(request_timeout) => Waiting::Idle,
            };

            match event {
                Waiting::Accepted(Ok((client, addr))) => {
                    if !same_ip(addr.ip(), self.peer.ip()) {
                        log::warn!(peer = %self.peer, from = %addr, "Reply port used by a different host");
                    }
                    if self.tcp_nodelay {
                        let _ = client.set_nodelay(true);
                    }
                    log::info!(peer = %addr, remote = %self.remote_addr, "Access to remote");
                    let ctx = ConnectionContext {
                        client_addr: addr,
                        remote_addr: self.remote_addr,
                    };
                    let replay = Replay {
                        client_data: pending_client.freeze(),
                        remote_data: pending_remote.freeze(),
                    };
                    // The control connection stays open until the relay ends
                    let result = relay_through_chain(client, remote, ctx, &self.chain, &self.settings, replay, || {
                        listener.stop();
                    })
                    .await;
                    drop(control);
                    return result;
                }
                Waiting::Accepted(Err(e)) => {
                    log::debug!(peer = %self.peer, error = %e, "Proxy listener accept failed");
                    listener.stop();
                }
                Waiting::Control(Ok(0)) => {
                    log::debug!(peer = %self.peer, "Client closed before using the reply port");
                    return Ok(CopyResult::default());
                }
                Waiting::Control(Ok(n)) => {
                    log::error!(
                        peer = %self.peer,
                        "Bad client, RFC 1928 section 6, doesn't follow reply port"
                    );
                    listener.stop();
                    pending_client.extend_from_slice(&control_buf[..n]);
                    let ctx = ConnectionContext {
                        client_addr: self.peer,
                        remote_addr: self.remote_addr,
                    };
                    let replay = Replay {
                        client_data: pending_client.freeze(),
                        remote_data: pending_remote.freeze(),
                    };
                    return relay_through_chain(control, remote, ctx, &self.chain, &self.settings, replay, || {
                        listener.stop();
                    })
                    .await;
                }
                Waiting::Control(Err(e)) => return Err(e.into()),
                Waiting::Remote(Ok(0)) => {
                    log::error!(peer = %self.peer, remote = %self.remote_addr, "Remote disconnected before the client attached");
                    return Err(ProxyError::RemoteConnect(format!(
                        "{}: immediate disconnect",
                        self.remote_addr
                    )));
                }
                Waiting::Remote(Ok(n)) => {
                    pending_remote.extend_from_slice(&remote_buf[..n]);
                    if pending_remote.len() > self.settings.buffer_size * 4 {
                        return Err(ProxyError::Protocol(
                            "remote sent too much data before the client attached".into(),
                        ));
                    }
                }
                Waiting::Remote(Err(e)) => return Err(e.into()),
                Waiting::Idle => {
                    log::error!(peer = %self.peer, "Client socket timeout");
                    return Err(ProxyError::Timeout("client request"));
                }
            }
        }
    }
}
