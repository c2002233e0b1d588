//! Core proxy server implementation
//!
//! The Server struct bundles the shared, read-only state every session needs.

use std::net::SocketAddr;
use std::sync::Arc;

use super::firewall::Firewall;
use super::hooks::ExtensionChain;
use super::tcp_relay::TcpRelayManager;
use super::udp_relay::UdpRelayManager;
use crate::config::{Config, ConnConfig};
use crate::error::{ProxyError, Result};

/// Core proxy server
pub struct Server {
    /// Peer allow-list, checked once per accepted connection
    pub firewall: Arc<Firewall>,
    /// Extension hooks shared by all sessions
    pub chain: Arc<ExtensionChain>,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
    pub tcp_relay: TcpRelayManager,
    pub udp_relay: UdpRelayManager,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Build from the derived runtime configuration
    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .firewall(Arc::new(config.firewall.clone()))
            .chain(Arc::new(config.chain.clone()))
            .conn_config(config.conn.clone())
            .build()
    }

    /// Firewall gate for a freshly accepted peer
    pub fn admit(&self, peer: &SocketAddr) -> Result<()> {
        if self.firewall.is_allowed(&peer.ip()) {
            Ok(())
        } else {
            Err(ProxyError::AccessDenied(peer.to_string()))
        }
    }
}

/// Builder for constructing a Server
#[derive(Default)]
pub struct ServerBuilder {
    firewall: Option<Arc<Firewall>>,
    chain: Option<Arc<ExtensionChain>>,
    conn_config: Option<ConnConfig>,
}

impl ServerBuilder {
    /// Create a new server builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the firewall (default: disabled, every peer allowed)
    pub fn firewall(mut self, firewall: Arc<Firewall>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    /// Set the extension chain (default: no extensions)
    pub fn chain(mut self, chain: Arc<ExtensionChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Build the server
    pub fn build(self) -> Server {
        let firewall = self.firewall.unwrap_or_else(|| Arc::new(Firewall::disabled()));
        let chain = self.chain.unwrap_or_else(|| Arc::new(ExtensionChain::empty()));
        let conn_config = self.conn_config.unwrap_or_default();
        Server {
            tcp_relay: TcpRelayManager::new(&conn_config, Arc::clone(&chain)),
            udp_relay: UdpRelayManager::new(&conn_config, Arc::clone(&chain)),
            firewall,
            chain,
            conn_config,
        }
    }
}
