//! CIDR allow-list for inbound peers
//!
//! Rules are parsed once at startup into fixed-width integers and never
//! mutated afterwards, so one `Arc<Firewall>` is shared by every session.

use std::net::IpAddr;

use super::address::{canonical_ip, AddressFamily};
use crate::error::ProxyError;

/// One allowed CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallRule {
    /// Base address as a 128-bit integer (IPv4 uses the low 32 bits)
    base: u128,
    /// Prefix length
    prefix_len: u8,
    /// Address family of the rule
    family: AddressFamily,
}

fn ip_to_int(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

/// Mask keeping the top `prefix_len` bits of a `bits`-wide address
fn mask(prefix_len: u8, bits: u8) -> u128 {
    let width_mask = if bits == 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    };
    let host_bits = (bits - prefix_len) as u32;
    u128::MAX.checked_shl(host_bits).unwrap_or(0) & width_mask
}

impl FirewallRule {
    /// Parse `base/prefix` or a bare address (treated as a single host)
    pub fn parse(cidr: &str) -> Result<Self, ProxyError> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let ip: IpAddr = addr
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| ProxyError::Config(format!("invalid CIDR address '{}'", cidr)))?;
        let ip = canonical_ip(ip);
        let family = AddressFamily::of(&ip);

        let prefix_len = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= family.bits())
                .ok_or_else(|| {
                    ProxyError::Config(format!("invalid CIDR prefix length in '{}'", cidr))
                })?,
            None => family.bits(),
        };

        Ok(Self {
            base: ip_to_int(&ip),
            prefix_len,
            family,
        })
    }

    /// Whether `ip` falls inside this range. Never matches across families.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = canonical_ip(*ip);
        if AddressFamily::of(&ip) != self.family {
            return false;
        }
        let m = mask(self.prefix_len, self.family.bits());
        ip_to_int(&ip) & m == self.base & m
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

/// Firewall configuration collaborator
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Enable the allow-list
    pub enabled: bool,
    /// Allowed CIDR ranges
    pub ips_allowed: Vec<String>,
}

/// Immutable allow-list
#[derive(Debug, Clone, Default)]
pub struct Firewall {
    rules: Vec<FirewallRule>,
    enabled: bool,
}

impl Firewall {
    /// Build from configuration. An empty allow-list disables the filter.
    pub fn new(config: &FirewallConfig) -> Result<Self, ProxyError> {
        let rules = config
            .ips_allowed
            .iter()
            .map(|cidr| FirewallRule::parse(cidr))
            .collect::<Result<Vec<_>, _>>()?;
        let enabled = config.enabled && !rules.is_empty();
        Ok(Self { rules, enabled })
    }

    /// A firewall that admits everyone
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Check a peer against the allow-list; first matching rule wins
    pub fn is_allowed(&self, peer: &IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        self.rules.iter().any(|rule| rule.contains(peer))
    }
}
