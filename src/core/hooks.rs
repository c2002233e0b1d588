//! Extension hooks
//!
//! Defines the extension points that let configured middleware rewrite
//! destinations and transform relayed bytes:
//! - pre-connect: `(host, port) -> (host, port)` before the outbound connect
//! - pre-outbound: client -> remote chunks, synchronous
//! - pre-inbound: remote -> client chunks, asynchronous, may emit zero or
//!   more chunks per input (a reassembling stage emits one per frame)
//!
//! Transform stages fail open: a failing stage forwards its input untouched.
//! Pre-connect failures abort the connection attempt.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

use super::frame::FrameBuffer;
use crate::error::ExtensionError;
use crate::logger::log;

/// Read-only view of the relay a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    /// SOCKS client address
    pub client_addr: SocketAddr,
    /// Outbound peer address
    pub remote_addr: SocketAddr,
}

/// Middleware stage. Every hook defaults to a pass-through, so an extension
/// only implements the hooks it participates in.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Rewrite the outbound destination
    fn pre_connect(&self, host: String, port: u16) -> Result<(String, u16), ExtensionError> {
        Ok((host, port))
    }

    /// Transform a client -> remote chunk
    fn pre_out(&self, _ctx: &ConnectionContext, chunk: Bytes) -> Result<Bytes, ExtensionError> {
        Ok(chunk)
    }

    /// Transform a remote -> client chunk. `frames` is this stage's private
    /// reassembly state for the connection.
    async fn pre_in(
        &self,
        _ctx: &ConnectionContext,
        _frames: &mut FrameBuffer,
        chunk: Bytes,
    ) -> Result<Vec<Bytes>, ExtensionError> {
        Ok(vec![chunk])
    }
}

/// Per-connection state for the pre-inbound stages, one slot per stage
#[derive(Debug, Default)]
pub struct PipelineState {
    stages: Vec<FrameBuffer>,
}

/// Ordered, immutable set of configured stages
#[derive(Clone, Default)]
pub struct ExtensionChain {
    pre_connect: Vec<Arc<dyn Extension>>,
    pre_out: Vec<Arc<dyn Extension>>,
    pre_in: Vec<Arc<dyn Extension>>,
}

impl std::fmt::Debug for ExtensionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |v: &[Arc<dyn Extension>]| v.iter().map(|e| e.name()).collect::<Vec<_>>();
        f.debug_struct("ExtensionChain")
            .field("pre_connect", &names(&self.pre_connect))
            .field("pre_out", &names(&self.pre_out))
            .field("pre_in", &names(&self.pre_in))
            .finish()
    }
}

impl ExtensionChain {
    pub fn new(
        pre_connect: Vec<Arc<dyn Extension>>,
        pre_out: Vec<Arc<dyn Extension>>,
        pre_in: Vec<Arc<dyn Extension>>,
    ) -> Self {
        Self {
            pre_connect,
            pre_out,
            pre_in,
        }
    }

    /// Chain with no stages; every hook is the identity
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pre_connect.is_empty() && self.pre_out.is_empty() && self.pre_in.is_empty()
    }

    /// Fresh pre-inbound state for a new relay
    pub fn new_state(&self) -> PipelineState {
        PipelineState {
            stages: self.pre_in.iter().map(|_| FrameBuffer::new()).collect(),
        }
    }

    /// Run the pre-connect stages in order, each feeding the next
    pub fn pre_connect(&self, host: String, port: u16) -> Result<(String, u16), ExtensionError> {
        let mut target = (host, port);
        for ext in &self.pre_connect {
            target = ext.pre_connect(target.0, target.1)?;
        }
        Ok(target)
    }

    /// Run the pre-outbound stages. Never fails: if any stage errors, the
    /// chunk is forwarded exactly as it entered the chain.
    pub fn pre_out(&self, ctx: &ConnectionContext, chunk: Bytes) -> Bytes {
        let mut out = chunk.clone();
        for ext in &self.pre_out {
            out = match ext.pre_out(ctx, out) {
                Ok(out) => out,
                Err(e) => {
                    log::error!(
                        extension = ext.name(),
                        remote = %ctx.remote_addr,
                        error = %e,
                        "pre-out stage failed, forwarding original chunk"
                    );
                    return chunk;
                }
            };
        }
        out
    }

    /// Run the pre-inbound stages. Each output chunk of one stage is fed to
    /// the next; the returned chunks are what gets written to the client.
    /// A non-fatal stage error forwards the chunk as it entered the chain.
    ///
    /// Only fatal errors (corrupt framing) are returned.
    pub async fn pre_in(
        &self,
        ctx: &ConnectionContext,
        state: &mut PipelineState,
        chunk: Bytes,
    ) -> Result<Vec<Bytes>, ExtensionError> {
        if state.stages.len() < self.pre_in.len() {
            state.stages.resize_with(self.pre_in.len(), FrameBuffer::new);
        }

        let mut chunks = vec![chunk.clone()];
        for (ext, frames) in self.pre_in.iter().zip(state.stages.iter_mut()) {
            let mut next = Vec::with_capacity(chunks.len());
            for piece in chunks {
                match ext.pre_in(ctx, frames, piece).await {
                    Ok(out) => next.extend(out),
                    Err(e) if e.is_fatal() => {
                        log::error!(
                            extension = ext.name(),
                            remote = %ctx.remote_addr,
                            error = %e,
                            "pre-in stage failed fatally"
                        );
                        return Err(e);
                    }
                    Err(e) => {
                        log::error!(
                            extension = ext.name(),
                            remote = %ctx.remote_addr,
                            error = %e,
                            "pre-in stage failed, forwarding original chunk"
                        );
                        return Ok(vec![chunk]);
                    }
                }
            }
            chunks = next;
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::FrameError;

    fn ctx() -> ConnectionContext {
        ConnectionContext {
            client_addr: "127.0.0.1:5000".parse().unwrap(),
            remote_addr: "10.0.0.1:80".parse().unwrap(),
        }
    }

    struct Upper;

    #[async_trait]
    impl Extension for Upper {
        fn name(&self) -> &'static str {
            "upper"
        }
        fn pre_out(&self, _ctx: &ConnectionContext, chunk: Bytes) -> Result<Bytes, ExtensionError> {
            Ok(Bytes::from(chunk.to_ascii_uppercase()))
        }
        async fn pre_in(
            &self,
            _ctx: &ConnectionContext,
            _frames: &mut FrameBuffer,
            chunk: Bytes,
        ) -> Result<Vec<Bytes>, ExtensionError> {
            Ok(vec![Bytes::from(chunk.to_ascii_uppercase())])
        }
    }

    struct Suffix(&'static str);

    #[async_trait]
    impl Extension for Suffix {
        fn name(&self) -> &'static str {
            "suffix"
        }
        fn pre_connect(&self, host: String, port: u16) -> Result<(String, u16), ExtensionError> {
            Ok((format!("{}{}", host, self.0), port + 1))
        }
        fn pre_out(&self, _ctx: &ConnectionContext, chunk: Bytes) -> Result<Bytes, ExtensionError> {
            let mut v = chunk.to_vec();
            v.extend_from_slice(self.0.as_bytes());
            Ok(Bytes::from(v))
        }
    }

    struct Broken;

    #[async_trait]
    impl Extension for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn pre_connect(&self, host: String, port: u16) -> Result<(String, u16), ExtensionError> {
            Err(ExtensionError::PreConnect {
                host,
                port,
                reason: "always fails".into(),
            })
        }
        fn pre_out(&self, _ctx: &ConnectionContext, _chunk: Bytes) -> Result<Bytes, ExtensionError> {
            Err(ExtensionError::Other("always fails".into()))
        }
        async fn pre_in(
            &self,
            _ctx: &ConnectionContext,
            _frames: &mut FrameBuffer,
            _chunk: Bytes,
        ) -> Result<Vec<Bytes>, ExtensionError> {
            Err(ExtensionError::Other("always fails".into()))
        }
    }

    struct CorruptFraming;

    #[async_trait]
    impl Extension for CorruptFraming {
        fn name(&self) -> &'static str {
            "corrupt"
        }
        async fn pre_in(
            &self,
            _ctx: &ConnectionContext,
            _frames: &mut FrameBuffer,
            _chunk: Bytes,
        ) -> Result<Vec<Bytes>, ExtensionError> {
            Err(FrameError::NegativeLength(-1).into())
        }
    }

    /// Splits every chunk in two
    struct Split;

    #[async_trait]
    impl Extension for Split {
        fn name(&self) -> &'static str {
            "split"
        }
        async fn pre_in(
            &self,
            _ctx: &ConnectionContext,
            _frames: &mut FrameBuffer,
            chunk: Bytes,
        ) -> Result<Vec<Bytes>, ExtensionError> {
            let mid = chunk.len() / 2;
            Ok(vec![chunk.slice(..mid), chunk.slice(mid..)])
        }
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = ExtensionChain::empty();
        assert!(chain.is_empty());
        assert_eq!(
            chain.pre_connect("example.com".into(), 80).unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(chain.pre_out(&ctx(), Bytes::from_static(b"abc")), "abc");
    }

    #[test]
    fn test_pre_connect_stages_compose_in_order() {
        let chain = ExtensionChain::new(
            vec![Arc::new(Suffix(".a")), Arc::new(Suffix(".b"))],
            vec![],
            vec![],
        );
        assert_eq!(
            chain.pre_connect("host".into(), 80).unwrap(),
            ("host.a.b".to_string(), 82)
        );
    }

    #[test]
    fn test_pre_connect_failure_surfaces() {
        let chain = ExtensionChain::new(vec![Arc::new(Broken)], vec![], vec![]);
        assert!(matches!(
            chain.pre_connect("host".into(), 80),
            Err(ExtensionError::PreConnect { .. })
        ));
    }

    #[test]
    fn test_pre_out_stages_compose_in_order() {
        let chain = ExtensionChain::new(
            vec![],
            vec![Arc::new(Suffix("!")), Arc::new(Upper)],
            vec![],
        );
        assert_eq!(chain.pre_out(&ctx(), Bytes::from_static(b"hi")), "HI!");
    }

    #[test]
    fn test_pre_out_fails_open() {
        let chain = ExtensionChain::new(vec![], vec![Arc::new(Broken)], vec![]);
        assert_eq!(
            chain.pre_out(&ctx(), Bytes::from_static(b"original")),
            "original"
        );
    }

    #[test]
    fn test_pre_out_failure_after_transform_forwards_original() {
        let chain = ExtensionChain::new(
            vec![],
            vec![Arc::new(Upper), Arc::new(Broken), Arc::new(Suffix("?"))],
            vec![],
        );
        assert_eq!(chain.pre_out(&ctx(), Bytes::from_static(b"ab")), "ab");
    }

    #[tokio::test]
    async fn test_pre_in_failure_after_transform_forwards_original() {
        let chain = ExtensionChain::new(
            vec![],
            vec![],
            vec![Arc::new(Split), Arc::new(Upper), Arc::new(Broken)],
        );
        let mut state = chain.new_state();
        let out = chain
            .pre_in(&ctx(), &mut state, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"abcd")]);
    }

    #[tokio::test]
    async fn test_pre_in_chains_outputs() {
        let chain = ExtensionChain::new(vec![], vec![], vec![Arc::new(Split), Arc::new(Upper)]);
        let mut state = chain.new_state();
        let out = chain
            .pre_in(&ctx(), &mut state, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"AB"), Bytes::from_static(b"CD")]);
    }

    #[tokio::test]
    async fn test_pre_in_fails_open() {
        let chain = ExtensionChain::new(vec![], vec![], vec![Arc::new(Broken)]);
        let mut state = chain.new_state();
        let out = chain
            .pre_in(&ctx(), &mut state, Bytes::from_static(b"raw"))
            .await
            .unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"raw")]);
    }

    #[tokio::test]
    async fn test_pre_in_fatal_error_propagates() {
        let chain = ExtensionChain::new(vec![], vec![], vec![Arc::new(CorruptFraming)]);
        let mut state = chain.new_state();
        let err = chain
            .pre_in(&ctx(), &mut state, Bytes::from_static(b"raw"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_pre_in_without_stages_passes_through() {
        let chain = ExtensionChain::empty();
        let mut state = PipelineState::default();
        let out = chain
            .pre_in(&ctx(), &mut state, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"x")]);
    }

    #[test]
    fn test_debug_lists_stage_names() {
        let chain = ExtensionChain::new(vec![], vec![Arc::new(Upper)], vec![Arc::new(Split)]);
        let dbg = format!("{:?}", chain);
        assert!(dbg.contains("upper"));
        assert!(dbg.contains("split"));
    }
}
