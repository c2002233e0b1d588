use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a log level, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Filter directive for a log mode; unknown modes fall back to info
pub fn filter_directive(log_mode: &str) -> String {
    let level = LogLevel::parse(log_mode).unwrap_or_default();
    format!("sockem={}", level.as_str())
}

/// Initialize the global subscriber. `RUST_LOG` wins when set.
pub fn init_logger(log_mode: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(log_mode)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .try_init();
}

pub mod log {
    use std::net::SocketAddr;

    pub use tracing::{debug, error, info, trace, warn};

    /// Connection lifecycle event for a client peer
    pub fn connection(peer: &SocketAddr, event: &str) {
        debug!(peer = %peer, event = event, "Connection");
    }

    /// Peer rejected by the firewall
    pub fn access_denied(peer: &SocketAddr) {
        warn!(peer = %peer, "Access denied by firewall");
    }

    /// Ephemeral listener or UDP relay event
    pub fn proxy_listener(peer: &SocketAddr, addr: &SocketAddr, event: &str) {
        info!(peer = %peer, listener = %addr, event = event, "Proxy listener");
    }
}
