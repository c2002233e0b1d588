//! Configuration module for the SOCKS5 server
//!
//! Two layers:
//! - `CliArgs`: command line with `SOCKEM_` environment fallbacks
//! - `FileConfig`: the TOML document named by `--config-file`
//!
//! Both are folded once at startup into an immutable [`Config`] holding
//! already-parsed firewall rules and an already-resolved extension chain.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::firewall::{Firewall, FirewallConfig};
use crate::core::hooks::ExtensionChain;
use crate::error::ProxyError;
use crate::extensions;

/// Parse a timeout value: humantime (`"30s"`, `"5m"`) or plain milliseconds.
/// `-1`, `0` and `"disabled"` turn the timeout off.
pub fn parse_timeout(s: &str) -> std::result::Result<Option<Duration>, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("disabled") {
        return Ok(None);
    }
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok((!d.is_zero()).then_some(d));
    }
    s.parse::<i64>()
        .map(millis_to_timeout)
        .map_err(|_| {
            format!(
                "Invalid timeout '{}'. Use formats like '30s', '5m', plain milliseconds, or -1 to disable",
                s
            )
        })
}

fn millis_to_timeout(ms: i64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}

/// Timeout as written in the config file: a number of milliseconds or text
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TimeoutSetting {
    Millis(i64),
    Text(String),
}

impl TimeoutSetting {
    pub fn resolve(&self) -> std::result::Result<Option<Duration>, String> {
        match self {
            TimeoutSetting::Millis(ms) => Ok(millis_to_timeout(*ms)),
            TimeoutSetting::Text(s) => parse_timeout(s),
        }
    }
}

fn resolve_timeout(
    name: &str,
    setting: &Option<TimeoutSetting>,
) -> std::result::Result<Option<Duration>, ProxyError> {
    match setting {
        Some(t) => t
            .resolve()
            .map_err(|e| ProxyError::Config(format!("[server] {}: {}", name, e))),
        None => Ok(None),
    }
}

/// CLI arguments for the SOCKS5 server
///
/// Supports environment variables with SOCKEM_ prefix
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "SOCKS5 proxy server with pluggable traffic extensions"
)]
pub struct CliArgs {
    /// TOML configuration file
    #[arg(short = 'c', long, env = "SOCKEM_CONFIG_FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "SOCKEM_LOG_MODE", default_value = "info", global = true)]
    pub log_mode: String,

    /// Runtime worker threads, 0 = one per CPU
    #[arg(long, env = "SOCKEM_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Lower bound on worker threads
    #[arg(long, env = "SOCKEM_MIN_WORKERS", default_value_t = 1)]
    pub min_workers: usize,

    /// Listen host, overrides [server] host
    #[arg(long, env = "SOCKEM_HOST")]
    pub host: Option<String>,

    /// Listen port, overrides [server] port
    #[arg(long, env = "SOCKEM_PORT")]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Encrypt or decrypt a value with the master key (e.g. for [aes] encrypted_key)
    Crypt {
        #[arg(value_enum)]
        action: CryptAction,
        /// Text to encrypt, or ciphertext to decrypt
        text: String,
        /// Master key, defaults to [crypt] key from the config file
        #[arg(long, env = "SOCKEM_CRYPT_KEY")]
        key: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptAction {
    Encrypt,
    Decrypt,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        match (&self.command, &self.config_file) {
            (None, None) => {
                return Err(anyhow!("Config file is required (--config-file)"));
            }
            (Some(Command::Crypt { key: None, .. }), None) => {
                return Err(anyhow!("Crypt needs --key or a config file with [crypt] key"));
            }
            _ => {}
        }

        if let Some(ref path) = self.config_file {
            if !path.exists() {
                return Err(anyhow!("Config file not found: {}", path.display()));
            }
        }

        if self.min_workers == 0 {
            return Err(anyhow!("min_workers must be greater than 0"));
        }

        Ok(())
    }

    /// Worker threads for the runtime
    pub fn worker_threads(&self) -> usize {
        let wanted = if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        };
        wanted.max(self.min_workers)
    }
}

/// `[server]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen host (default: "::", dual stack)
    pub host: String,
    /// Listen port (default: 1080)
    pub port: u16,
    /// Bind address for ephemeral TCP listeners and UDP relays
    pub proxy_host: String,
    /// Control connection idle timeout until the relay is wired up
    pub timeout: Option<TimeoutSetting>,
    /// Relay idle timeout on the client side
    pub client_timeout: Option<TimeoutSetting>,
    /// Outbound connect timeout and relay idle timeout on the remote side
    pub remote_timeout: Option<TimeoutSetting>,
    /// Relay CONNECT traffic over the control connection instead of a new listener
    pub no_new_tcp_server_per_client: bool,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Buffer size for data transfer in bytes
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "::".to_string(),
            port: 1080,
            proxy_host: "0.0.0.0".to_string(),
            timeout: None,
            client_timeout: None,
            remote_timeout: None,
            no_new_tcp_server_per_client: false,
            tcp_nodelay: true,
            buffer_size: 32 * 1024,
            tcp_backlog: 1024,
        }
    }
}

/// `[extensions]` section: ordered extension names per hook
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    pub pre_connect: Vec<String>,
    pub pre_out: Vec<String>,
    pub pre_in: Vec<String>,
}

/// `[aes]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AesConfig {
    /// Plaintext shared key
    pub key: Option<String>,
    /// Shared key sealed with the `[crypt]` master key
    pub encrypted_key: Option<String>,
    /// Remote peers the transform applies to
    pub endpoints: Vec<String>,
}

/// `[crypt]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CryptConfig {
    /// Master key
    pub key: Option<String>,
}

/// The whole TOML document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub firewall: FirewallConfig,
    pub extensions: ExtensionsConfig,
    /// DNS rewrite table for the `dns` extension
    pub dns: HashMap<String, String>,
    pub aes: AesConfig,
    pub crypt: CryptConfig,
}

impl FileConfig {
    pub fn parse(text: &str) -> std::result::Result<Self, ProxyError> {
        Ok(toml::from_str(text)?)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Control connection idle timeout during negotiation
    pub request_timeout: Option<Duration>,
    /// Relay idle timeout, client side
    pub client_timeout: Option<Duration>,
    /// Outbound connect and relay idle timeout, remote side
    pub remote_timeout: Option<Duration>,
    /// Bind address for ephemeral listeners and UDP relays
    pub proxy_host: IpAddr,
    /// Reuse the control connection for CONNECT traffic
    pub no_new_tcp_server_per_client: bool,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            client_timeout: None,
            remote_timeout: None,
            proxy_host: IpAddr::from([0, 0, 0, 0]),
            no_new_tcp_server_per_client: false,
            buffer_size: 32 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

impl ConnConfig {
    pub fn from_section(server: &ServerSection) -> std::result::Result<Self, ProxyError> {
        let proxy_host = server
            .proxy_host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| {
                ProxyError::Config(format!(
                    "[server] proxy_host must be an IP address, got '{}'",
                    server.proxy_host
                ))
            })?;
        if server.buffer_size == 0 {
            return Err(ProxyError::Config("[server] buffer_size must be greater than 0".into()));
        }

        Ok(Self {
            request_timeout: resolve_timeout("timeout", &server.timeout)?,
            client_timeout: resolve_timeout("client_timeout", &server.client_timeout)?,
            remote_timeout: resolve_timeout("remote_timeout", &server.remote_timeout)?,
            proxy_host,
            no_new_tcp_server_per_client: server.no_new_tcp_server_per_client,
            buffer_size: server.buffer_size,
            tcp_backlog: server.tcp_backlog,
            tcp_nodelay: server.tcp_nodelay,
        })
    }
}

/// Immutable runtime configuration derived from the file and CLI
#[derive(Debug, Clone)]
pub struct Config {
    /// Host address to bind
    pub host: String,
    /// Port number
    pub port: u16,
    pub conn: ConnConfig,
    pub firewall: Firewall,
    pub chain: ExtensionChain,
}

impl Config {
    /// Read, parse and derive in one step
    pub fn load(path: &Path) -> Result<Self> {
        let file = FileConfig::read(path)?;
        Ok(Self::from_file(&file)?)
    }

    pub fn from_file(file: &FileConfig) -> std::result::Result<Self, ProxyError> {
        Ok(Self {
            host: file.server.host.clone(),
            port: file.server.port,
            conn: ConnConfig::from_section(&file.server)?,
            firewall: Firewall::new(&file.firewall)?,
            chain: extensions::build_chain(file)?,
        })
    }

    /// Apply `--host` / `--port`
    pub fn with_cli_overrides(mut self, cli: &CliArgs) -> Self {
        if let Some(ref host) = cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        self
    }

    /// Socket address of the main listener
    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, ProxyError> {
        let ip = self
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| {
                ProxyError::Config(format!("listen host must be an IP address, got '{}'", self.host))
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}
