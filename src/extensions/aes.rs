//! Pre-shared key encryption for selected endpoints (pre-out + pre-in)
//!
//! Outbound chunks are encrypted and wrapped in one frame each. Inbound
//! bytes are reassembled into frames and every complete frame is decrypted,
//! so one read from the remote may yield zero, one, or several chunks.
//!
//! Endpoints are matched against the remote address as `ip:port`,
//! `[v6]:port`, or a bare `ip`.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use crate::core::address::canonical_ip;
use crate::core::crypt;
use crate::core::frame::{encode_frame, FrameBuffer};
use crate::core::hooks::{ConnectionContext, Extension};
use crate::error::ExtensionError;
use crate::logger::log;

pub struct AesExtension {
    key: String,
    endpoints: HashSet<String>,
}

impl std::fmt::Debug for AesExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesExtension")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

fn endpoint_key(addr: &SocketAddr) -> String {
    match canonical_ip(addr.ip()) {
        IpAddr::V4(v4) => format!("{}:{}", v4, addr.port()),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, addr.port()),
    }
}

/// Normalize a configured endpoint so textual variants of one address match
fn normalize_endpoint(entry: &str) -> String {
    let entry = entry.trim();
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return endpoint_key(&addr);
    }
    match entry.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(ip) => canonical_ip(ip).to_string(),
        Err(_) => entry.to_string(),
    }
}

impl AesExtension {
    pub fn new<I, S>(key: String, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            key,
            endpoints: endpoints
                .into_iter()
                .map(|e| normalize_endpoint(e.as_ref()))
                .collect(),
        }
    }

    pub fn is_endpoint_enabled(&self, remote: &SocketAddr) -> bool {
        self.endpoints.contains(&endpoint_key(remote))
            || self.endpoints.contains(&canonical_ip(remote.ip()).to_string())
    }
}

#[async_trait]
impl Extension for AesExtension {
    fn name(&self) -> &'static str {
        "aes"
    }

    fn pre_out(&self, ctx: &ConnectionContext, chunk: Bytes) -> Result<Bytes, ExtensionError> {
        if !self.is_endpoint_enabled(&ctx.remote_addr) {
            return Ok(chunk);
        }
        let encrypted = crypt::encrypt(&chunk, &self.key)?;
        let frame = encode_frame(encrypted.as_bytes());
        log::trace!(remote = %ctx.remote_addr, len = frame.len(), "Sending frame");
        Ok(frame)
    }

    async fn pre_in(
        &self,
        ctx: &ConnectionContext,
        frames: &mut FrameBuffer,
        chunk: Bytes,
    ) -> Result<Vec<Bytes>, ExtensionError> {
        if !self.is_endpoint_enabled(&ctx.remote_addr) {
            return Ok(vec![chunk]);
        }
        frames
            .feed(&chunk)?
            .iter()
            .map(|frame| {
                crypt::decrypt_bytes(frame, &self.key)
                    .map(Bytes::from)
                    .map_err(ExtensionError::from)
            })
            .collect()
    }
}
