//! SOCKS5 protocol parsing (RFC 1928)
//!
//! Method negotiation:
//! - Client: VER(1)=5 NMETHODS(1) METHODS(NMETHODS)
//! - Server: VER(1)=5 METHOD(1)
//!
//! Request:
//! - Client: VER(1)=5 CMD(1) RSV(1) ATYP(1) DST.ADDR DST.PORT(2)
//! - Server: VER(1)=5 REP(1) RSV(1) ATYP(1) BND.ADDR BND.PORT(2)

use std::net::SocketAddr;

use super::address::{Address, DecodeResult};

/// Protocol version byte
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required"
pub const METHOD_NO_AUTH: u8 = 0x00;

/// "No acceptable methods"
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Reply code: succeeded
pub const REP_SUCCEEDED: u8 = 0x00;

/// Reply code: general SOCKS server failure
pub const REP_GENERAL_FAILURE: u8 = 0x01;

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCmd {
    /// TCP connect
    Connect = 1,
    /// UDP associate
    UdpAssociate = 3,
}

impl TryFrom<u8> for SocksCmd {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SocksCmd::Connect),
            2 => Err("BIND command is not supported"),
            3 => Ok(SocksCmd::UdpAssociate),
            _ => Err("unsupported command"),
        }
    }
}

impl std::fmt::Display for SocksCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksCmd::Connect => write!(f, "CONNECT"),
            SocksCmd::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// First client message: the offered authentication methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// Decode from the head of `buf`
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }
        if buf[0] != SOCKS_VERSION {
            return DecodeResult::Invalid("bad SOCKS version byte");
        }
        if buf.len() < 2 {
            return DecodeResult::NeedMoreData;
        }
        let total = 2 + buf[1] as usize;
        if buf.len() < total {
            return DecodeResult::NeedMoreData;
        }
        DecodeResult::Ok(
            MethodRequest {
                methods: buf[2..total].to_vec(),
            },
            total,
        )
    }

    /// Only "no authentication" is supported
    pub fn select(&self) -> u8 {
        if self.methods.contains(&METHOD_NO_AUTH) {
            METHOD_NO_AUTH
        } else {
            METHOD_NO_ACCEPTABLE
        }
    }
}

/// Server reply to method negotiation
pub fn method_reply(method: u8) -> [u8; 2] {
    [SOCKS_VERSION, method]
}

/// Second client message: the command and its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub cmd: SocksCmd,
    pub addr: Address,
}

impl SocksRequest {
    /// Decode from the head of `buf`
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }
        if buf[0] != SOCKS_VERSION {
            return DecodeResult::Invalid("bad SOCKS version byte");
        }
        if buf.len() < 2 {
            return DecodeResult::NeedMoreData;
        }
        let cmd = match SocksCmd::try_from(buf[1]) {
            Ok(cmd) => cmd,
            Err(msg) => return DecodeResult::Invalid(msg),
        };
        if buf.len() < 4 {
            return DecodeResult::NeedMoreData;
        }
        match Address::decode(&buf[3..]) {
            DecodeResult::Ok(addr, consumed) => DecodeResult::Ok(SocksRequest { cmd, addr }, 3 + consumed),
            DecodeResult::NeedMoreData => DecodeResult::NeedMoreData,
            DecodeResult::Invalid(msg) => DecodeResult::Invalid(msg),
        }
    }
}

/// Success reply carrying the bound address
pub fn success_reply(bound: SocketAddr) -> Vec<u8> {
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[SOCKS_VERSION, REP_SUCCEEDED, 0x00]);
    Address::from(bound).encode(&mut reply);
    reply
}

/// General failure reply
pub fn failure_reply() -> [u8; 3] {
    [SOCKS_VERSION, REP_GENERAL_FAILURE, 0x00]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_with_no_auth_offered() {
        match MethodRequest::decode(&[0x05, 0x02, 0x00, 0x01]) {
            DecodeResult::Ok(req, consumed) => {
                assert_eq!(consumed, 4);
                assert_eq!(method_reply(req.select()), [0x05, 0x00]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negotiation_without_no_auth() {
        match MethodRequest::decode(&[0x05, 0x01, 0x01]) {
            DecodeResult::Ok(req, _) => assert_eq!(method_reply(req.select()), [0x05, 0xFF]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negotiation_bad_version() {
        assert!(matches!(
            MethodRequest::decode(&[0x04, 0x01, 0x00]),
            DecodeResult::Invalid(_)
        ));
    }

    #[test]
    fn test_negotiation_partial() {
        assert!(matches!(MethodRequest::decode(&[0x05]), DecodeResult::NeedMoreData));
        assert!(matches!(
            MethodRequest::decode(&[0x05, 0x03, 0x00]),
            DecodeResult::NeedMoreData
        ));
    }

    #[test]
    fn test_request_connect_ipv4() {
        let buf = [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        match SocksRequest::decode(&buf) {
            DecodeResult::Ok(req, consumed) => {
                assert_eq!(consumed, buf.len());
                assert_eq!(req.cmd, SocksCmd::Connect);
                assert_eq!(req.addr, Address::IPv4([127, 0, 0, 1], 80));
                assert_eq!(req.addr.host(), "127.0.0.1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_domain() {
        let mut buf = vec![0x05, 0x03, 0x00, 0x03, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&443u16.to_be_bytes());
        match SocksRequest::decode(&buf) {
            DecodeResult::Ok(req, _) => {
                assert_eq!(req.cmd, SocksCmd::UdpAssociate);
                assert_eq!(req.addr, Address::Domain("example.com".into(), 443));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_ipv6() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x04];
        buf.extend_from_slice(&[0u8; 15]);
        buf.push(1);
        buf.extend_from_slice(&8080u16.to_be_bytes());
        match SocksRequest::decode(&buf) {
            DecodeResult::Ok(req, consumed) => {
                assert_eq!(consumed, 22);
                assert_eq!(req.addr.host(), "::1");
                assert_eq!(req.addr.port(), 8080);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_rejects_bind_and_unknown_commands() {
        let bind = [0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        assert!(matches!(SocksRequest::decode(&bind), DecodeResult::Invalid(_)));
        let unknown = [0x05, 0x09, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        assert!(matches!(SocksRequest::decode(&unknown), DecodeResult::Invalid(_)));
    }

    #[test]
    fn test_request_rejects_unknown_address_type() {
        let buf = [0x05, 0x01, 0x00, 0x02, 1, 2, 3, 4, 0, 80];
        assert!(matches!(SocksRequest::decode(&buf), DecodeResult::Invalid(_)));
    }

    #[test]
    fn test_request_partial_then_leftover() {
        let full = [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90, b'G', b'E', b'T'];
        assert!(matches!(
            SocksRequest::decode(&full[..6]),
            DecodeResult::NeedMoreData
        ));
        match SocksRequest::decode(&full) {
            DecodeResult::Ok(_, consumed) => assert_eq!(&full[consumed..], b"GET"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_success_reply_layout() {
        let reply = success_reply("127.0.0.1:4242".parse().unwrap());
        assert_eq!(reply, vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x10, 0x92]);

        let reply = success_reply("[::1]:80".parse().unwrap());
        assert_eq!(reply.len(), 3 + 1 + 16 + 2);
        assert_eq!(reply[3], 0x04);
    }

    #[test]
    fn test_failure_reply() {
        assert_eq!(failure_reply(), [0x05, 0x01, 0x00]);
    }
}
