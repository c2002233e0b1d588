//! Core proxy server module
//!
//! This module contains the protocol engine:
//! - SOCKS5 and address parsing
//! - Access control
//! - The extension pipeline and its framing codec
//! - TCP and UDP relay managers

pub mod address;
pub mod crypt;
pub mod firewall;
pub mod frame;
pub mod hooks;
pub mod relay;
mod server;
pub mod socks5;
pub mod tcp_relay;
pub mod udp_relay;

pub use address::{Address, AddressFamily, DecodeResult};
pub use firewall::{Firewall, FirewallConfig};
pub use hooks::{ConnectionContext, Extension, ExtensionChain};
pub use server::{Server, ServerBuilder};
pub use socks5::{SocksCmd, SocksRequest};
