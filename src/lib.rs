//! SOCKS5 proxy server with pluggable extensions
//!
//! Architecture:
//! - `core/`: protocol engine (SOCKS5 session pieces, relays, firewall, extension pipeline)
//! - `extensions/`: built-in extensions selected by name from the config
//! - `handler`: per-connection SOCKS5 session
//! - `server_runner`: listener setup and accept loop

pub mod config;
pub mod core;
pub mod error;
pub mod extensions;
pub mod handler;
pub mod logger;
pub mod server_runner;

pub use crate::core::{Server, ServerBuilder};
pub use crate::error::{ExtensionError, ProxyError};
