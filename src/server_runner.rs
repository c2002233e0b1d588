//! Server startup and accept loop
//!
//! This module binds the SOCKS5 listener and runs the main accept loop.

use crate::core::Server;
use crate::handler::process_connection;
use crate::logger::log;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval for control connections. Dead peers are detected
/// in ~45s (three unanswered keepalives at 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind the main listener with SO_REUSEADDR. Binding `::` also accepts
/// IPv4 peers.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

fn tune_control_socket(stream: &TcpStream, tcp_nodelay: bool) {
    if tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Run the accept loop until `shutdown` is cancelled
pub async fn run_server(
    server: Arc<Server>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    log::info!(
        address = %local_addr,
        firewall = server.firewall.is_enabled(),
        rules = server.firewall.rule_count(),
        extensions = ?server.chain,
        reuse_control = server.conn_config.no_new_tcp_server_per_client,
        "Server started"
    );

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!(address = %local_addr, "Listener closed");
                break;
            }
            r = listener.accept() => r,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = server.admit(&peer) {
                    log::access_denied(&peer);
                    log::debug!(error = %e, "Connection dropped without reply");
                    drop(stream);
                    continue;
                }
                log::connection(&peer, "new");

                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    tune_control_socket(&stream, server.conn_config.tcp_nodelay);
                    if let Err(e) = process_connection(&server, stream, peer).await {
                        log::debug!(peer = %peer, error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                // Continue accepting unless it's a fatal error
                if e.kind() == std::io::ErrorKind::Other {
                    break;
                }
            }
        }
    }

    Ok(())
}
