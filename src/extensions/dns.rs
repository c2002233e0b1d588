//! Static DNS rewrite table (pre-connect)
//!
//! Keys are `host:port` or `[v6]:port`. Values take any of these forms:
//! - `[v6]:port` / `[v6]`
//! - bare IPv6 (`2001:db8::1`, no port)
//! - `host:port`
//! - bare `host`
//!
//! A value without a port keeps the requested one.

use std::collections::HashMap;

use crate::core::hooks::Extension;
use crate::error::ExtensionError;

/// Pre-connect rewrite from a static table
#[derive(Debug, Clone, Default)]
pub struct DnsExtension {
    table: HashMap<String, String>,
}

impl DnsExtension {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }

    fn lookup(&self, host: &str, port: u16) -> Option<&str> {
        self.table
            .get(&format!("{}:{}", host, port))
            .or_else(|| self.table.get(&format!("[{}]:{}", host, port)))
            .map(|entry| entry.trim())
    }
}

/// Split a table entry into host and optional port
fn split_entry(entry: &str) -> (&str, Option<&str>) {
    if let Some(rest) = entry.strip_prefix('[') {
        return match rest.rfind(']') {
            Some(close) => {
                let host = &rest[..close];
                let port = rest[close + 1..].strip_prefix(':').filter(|p| !p.is_empty());
                (host, port)
            }
            None => (rest, None),
        };
    }
    match entry.matches(':').count() {
        0 => (entry, None),
        1 => match entry.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (entry, None),
        },
        // Bare IPv6 literal carries no port
        _ => (entry, None),
    }
}

#[async_trait::async_trait]
impl Extension for DnsExtension {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn pre_connect(&self, host: String, port: u16) -> Result<(String, u16), ExtensionError> {
        let Some(entry) = self.lookup(&host, port) else {
            return Ok((host, port));
        };

        let (new_host, new_port) = split_entry(entry);
        let new_port = match new_port {
            Some(p) => p.parse::<u16>().map_err(|_| ExtensionError::PreConnect {
                host: host.clone(),
                port,
                reason: format!("invalid port in DNS entry '{}'", entry),
            })?,
            None => port,
        };
        Ok((new_host.to_string(), new_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns(entries: &[(&str, &str)]) -> DnsExtension {
        DnsExtension::new(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_unknown_host_passes_through() {
        let ext = dns(&[("a.example:80", "10.0.0.1")]);
        assert_eq!(
            ext.pre_connect("b.example".into(), 80).unwrap(),
            ("b.example".to_string(), 80)
        );
        // Port is part of the key
        assert_eq!(
            ext.pre_connect("a.example".into(), 443).unwrap(),
            ("a.example".to_string(), 443)
        );
    }

    #[test]
    fn test_entry_forms() {
        let ext = dns(&[
            ("plain:1", "10.0.0.1"),
            ("withport:1", "10.0.0.2:8080"),
            ("domain:1", "  internal.example:25  "),
            ("v6bare:1", "2001:db8::1"),
            ("v6bracket:1", "[2001:db8::2]"),
            ("v6port:1", "[2001:db8::3]:9000"),
        ]);
        let cases = [
            ("plain", ("10.0.0.1", 1)),
            ("withport", ("10.0.0.2", 8080)),
            ("domain", ("internal.example", 25)),
            ("v6bare", ("2001:db8::1", 1)),
            ("v6bracket", ("2001:db8::2", 1)),
            ("v6port", ("2001:db8::3", 9000)),
        ];
        for (host, (want_host, want_port)) in cases {
            assert_eq!(
                ext.pre_connect(host.into(), 1).unwrap(),
                (want_host.to_string(), want_port),
                "entry for {}",
                host
            );
        }
    }

    #[test]
    fn test_ipv6_key_uses_brackets() {
        let ext = dns(&[("[::1]:53", "127.0.0.53")]);
        assert_eq!(
            ext.pre_connect("::1".into(), 53).unwrap(),
            ("127.0.0.53".to_string(), 53)
        );
    }

    #[test]
    fn test_bad_port_is_pre_connect_error() {
        let ext = dns(&[("x:1", "y:notaport")]);
        assert!(matches!(
            ext.pre_connect("x".into(), 1),
            Err(ExtensionError::PreConnect { .. })
        ));
    }
}
