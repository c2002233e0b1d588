//! Address utilities
//!
//! SOCKS5 address encoding (ATYP + address + port) plus the small set of IP
//! helpers the firewall, the UDP relay and the extensions share:
//! - octet conversion for IPv4/IPv6
//! - fully expanded IPv6 text form
//! - address family classification (IPv4-mapped IPv6 counts as IPv4)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::lookup_host;

/// Address type constants
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Address family of an IP address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Classify an address. IPv4-mapped IPv6 addresses are reported as IPv4.
    pub fn of(ip: &IpAddr) -> Self {
        match canonical_ip(*ip) {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Width of the address in bits
    pub fn bits(&self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Unwrap IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) into plain IPv4.
///
/// A dual-stack listener bound on `::` reports IPv4 peers in mapped form.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Parse an IP literal and classify it. Returns `None` for anything that is
/// not an IP literal (e.g. a domain name).
pub fn analyze_ip(text: &str) -> Option<(IpAddr, AddressFamily)> {
    let trimmed = text.trim_start_matches('[').trim_end_matches(']');
    let ip = canonical_ip(trimmed.parse::<IpAddr>().ok()?);
    Some((ip, AddressFamily::of(&ip)))
}

/// Whether the text is an IPv4 or IPv6 literal
pub fn is_ip_literal(text: &str) -> bool {
    analyze_ip(text).is_some()
}

/// Raw octets of an IP address: 4 bytes for IPv4, 16 for IPv6
pub fn ip_to_octets(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Octets of an IP literal given as text
pub fn parse_ip_octets(text: &str) -> Option<Vec<u8>> {
    analyze_ip(text).map(|(ip, _)| ip_to_octets(&ip))
}

/// Build an IP address from 4 or 16 raw octets
pub fn ip_from_octets(octets: &[u8]) -> Option<IpAddr> {
    match octets.len() {
        4 => {
            let mut ip = [0u8; 4];
            ip.copy_from_slice(octets);
            Some(IpAddr::V4(Ipv4Addr::from(ip)))
        }
        16 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(octets);
            Some(IpAddr::V6(Ipv6Addr::from(ip)))
        }
        _ => None,
    }
}

/// Expand a (possibly compressed) IPv6 literal to eight zero-padded groups,
/// e.g. `2001:db8::1` -> `2001:0db8:0000:0000:0000:0000:0000:0001`.
/// Embedded IPv4 tails are converted to hex groups.
pub fn expand_ipv6(text: &str) -> Option<String> {
    let trimmed = text.trim_start_matches('[').trim_end_matches(']');
    let ip: Ipv6Addr = trimmed.parse().ok()?;
    let groups: Vec<String> = ip.segments().iter().map(|s| format!("{:04x}", s)).collect();
    Some(groups.join(":"))
}

/// Compare two addresses ignoring IPv4-mapped IPv6 wrapping
pub fn same_ip(a: IpAddr, b: IpAddr) -> bool {
    canonical_ip(a) == canonical_ip(b)
}

/// Address decode result
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// Successfully decoded
    Ok(T, usize),
    /// Need more data
    NeedMoreData,
    /// Invalid data
    Invalid(&'static str),
}

/// Destination address as carried on the SOCKS5 wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match canonical_ip(addr.ip()) {
            IpAddr::V4(v4) => Address::IPv4(v4.octets(), addr.port()),
            IpAddr::V6(v6) => Address::IPv6(v6.octets(), addr.port()),
        }
    }
}

impl Address {
    /// Build an address from a textual host, classifying IP literals so that
    /// `"10.0.0.1"` becomes `IPv4` rather than a domain.
    pub fn from_host(host: &str, port: u16) -> Self {
        match analyze_ip(host) {
            Some((IpAddr::V4(v4), _)) => Address::IPv4(v4.octets(), port),
            Some((IpAddr::V6(v6), _)) => Address::IPv6(v6.octets(), port),
            None => Address::Domain(host.to_string(), port),
        }
    }

    /// Decode address from buffer
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }

        let atyp = buf[0];
        match atyp {
            ATYP_IPV4 => {
                // 1 (type) + 4 (ip) + 2 (port) = 7 bytes
                if buf.len() < 7 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                DecodeResult::Ok(Address::IPv4(ip, port), 7)
            }
            ATYP_IPV6 => {
                // 1 (type) + 16 (ip) + 2 (port) = 19 bytes
                if buf.len() < 19 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                DecodeResult::Ok(Address::IPv6(ip, port), 19)
            }
            ATYP_DOMAIN => {
                // 1 (type) + 1 (len) + len (domain) + 2 (port)
                if buf.len() < 2 {
                    return DecodeResult::NeedMoreData;
                }
                let domain_len = buf[1] as usize;
                if domain_len == 0 {
                    return DecodeResult::Invalid("empty domain name");
                }
                let total_len = 1 + 1 + domain_len + 2;
                if buf.len() < total_len {
                    return DecodeResult::NeedMoreData;
                }
                let domain = match std::str::from_utf8(&buf[2..2 + domain_len]) {
                    Ok(s) => s.to_string(),
                    Err(_) => return DecodeResult::Invalid("invalid domain encoding"),
                };
                let port = u16::from_be_bytes([buf[2 + domain_len], buf[3 + domain_len]]);
                DecodeResult::Ok(Address::Domain(domain, port), total_len)
            }
            _ => DecodeResult::Invalid("unsupported address type"),
        }
    }

    /// Encode address to buffer
    /// Returns the number of bytes written
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start_len = buf.len();
        match self {
            Address::IPv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::IPv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                // Domain length is a single byte on the wire
                let name = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf.len() - start_len
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host string (IP or domain)
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Resolve to socket address
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port)),
            Address::IPv6(ip, port) => Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port)),
            Address::Domain(domain, port) => {
                let mut addrs = lookup_host((domain.as_str(), *port)).await?;
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                })
            }
        }
    }
}
