use std::io;
use thiserror::Error;

use crate::core::crypt::CryptError;
use crate::core::frame::FrameError;

/// Unified error type for the SOCKS5 engine
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error on a session or relay socket
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Bad version byte, unsupported command or address type
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer rejected by the firewall
    #[error("Access denied for {0}")]
    AccessDenied(String),

    /// Ephemeral listener or UDP relay socket could not be created
    #[error("Bind error: {0}")]
    Bind(String),

    /// Outbound connect refused, timed out, or dropped immediately
    #[error("Remote connect error: {0}")]
    RemoteConnect(String),

    /// Socket idle past its configured timeout
    #[error("Timeout: {0}")]
    Timeout(&'static str),

    /// Extension stage failure that could not be handled fail-open
    #[error("Extension error: {0}")]
    Extension(ExtensionError),

    /// Corrupt length prefix on a framed stream
    #[error("Frame decode error: {0}")]
    FrameDecode(#[from] FrameError),

    /// Cipher failure outside an extension stage (key unsealing, CLI)
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error raised by an extension stage
#[derive(Error, Debug)]
pub enum ExtensionError {
    /// Pre-connect rewrite failed
    #[error("pre-connect rejected {host}:{port}: {reason}")]
    PreConnect {
        host: String,
        port: u16,
        reason: String,
    },

    /// Cipher failure inside a transform
    #[error("cipher error: {0}")]
    Crypt(#[from] CryptError),

    /// Framing stream is corrupt
    #[error("frame decode error: {0}")]
    Frame(#[from] FrameError),

    /// Any other stage failure
    #[error("{0}")]
    Other(String),
}

impl ExtensionError {
    /// Fatal errors close the relay instead of failing open. Once a length
    /// prefix is corrupt the stream position is lost for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExtensionError::Frame(_))
    }
}

/// Corrupt framing surfaces as `FrameDecode`, every other stage error as
/// `Extension`
impl From<ExtensionError> for ProxyError {
    fn from(err: ExtensionError) -> Self {
        match err {
            ExtensionError::Frame(e) => ProxyError::FrameDecode(e),
            other => ProxyError::Extension(other),
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::Config(format!("TOML parse error: {}", err))
    }
}
