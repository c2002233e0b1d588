//! Bidirectional relay through the extension chain
//!
//! - client -> pre-out stages -> remote
//! - remote -> pre-in stages -> client
//!
//! EOF on one side half-closes the other. An error or idle timeout on either
//! side tears down both.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::hooks::{ConnectionContext, ExtensionChain};
use crate::error::{ProxyError, Result};

/// Per-relay tunables
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Idle timeout on the client side, `None` = disabled
    pub client_timeout: Option<Duration>,
    /// Idle timeout on the remote side, `None` = disabled
    pub remote_timeout: Option<Duration>,
    /// Read buffer size per direction
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            client_timeout: None,
            remote_timeout: None,
            buffer_size: 32 * 1024,
        }
    }
}

/// Data that arrived before the relay was wired up
#[derive(Debug, Clone, Default)]
pub struct Replay {
    /// Client bytes not yet sent to the remote
    pub client_data: Bytes,
    /// Remote bytes not yet sent to the client
    pub remote_data: Bytes,
}

/// Result of bidirectional copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes read from the client (upload)
    pub a_to_b: u64,
    /// Bytes read from the remote (download)
    pub b_to_a: u64,
}

/// Last traffic seen on one socket, in either direction
struct ActivityClock {
    start: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .store(self.start.elapsed().as_millis() as u64, Ordering::Release);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Acquire));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Read, failing once the socket behind `clock` has been idle in both
/// directions for `timeout`. Writes by the other direction keep it alive.
async fn read_idle<R>(
    reader: &mut R,
    buf: &mut [u8],
    clock: &ActivityClock,
    timeout: Option<Duration>,
    what: &'static str,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let Some(window) = timeout else {
        let n = reader.read(buf).await?;
        clock.touch();
        return Ok(n);
    };

    let read = reader.read(buf);
    tokio::pin!(read);
    loop {
        let remaining = window.saturating_sub(clock.idle_for());
        if remaining.is_zero() {
            return Err(ProxyError::Timeout(what));
        }
        tokio::select! {
            r = &mut read => {
                let n = r?;
                clock.touch();
                return Ok(n);
            }
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}

/// Pump both directions until both sides have finished.
///
/// `on_close` runs every time a direction terminates, so it must be
/// idempotent.
pub async fn relay_through_chain<A, B, F>(
    client: A,
    remote: B,
    ctx: ConnectionContext,
    chain: &ExtensionChain,
    settings: &RelaySettings,
    replay: Replay,
    on_close: F,
) -> Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    F: Fn(),
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut remote_r, mut remote_w) = tokio::io::split(remote);
    let mut state = chain.new_state();
    let client_clock = ActivityClock::new();
    let remote_clock = ActivityClock::new();

    let replayed_up = replay.client_data.len() as u64;
    let replayed_down = replay.remote_data.len() as u64;
    if !replay.client_data.is_empty() {
        remote_w
            .write_all(&chain.pre_out(&ctx, replay.client_data))
            .await?;
        remote_clock.touch();
    }
    if !replay.remote_data.is_empty() {
        for chunk in chain.pre_in(&ctx, &mut state, replay.remote_data).await? {
            client_w.write_all(&chunk).await?;
        }
        client_clock.touch();
    }

    let upstream = async {
        let mut buf = vec![0u8; settings.buffer_size];
        let mut total = replayed_up;
        let result = loop {
            let read = read_idle(
                &mut client_r,
                &mut buf,
                &client_clock,
                settings.client_timeout,
                "client idle",
            );
            let n = match read.await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            };
            total += n as u64;
            let chunk = chain.pre_out(&ctx, Bytes::copy_from_slice(&buf[..n]));
            if let Err(e) = remote_w.write_all(&chunk).await {
                break Err(e.into());
            }
            remote_clock.touch();
        };
        on_close();
        result?;
        let _ = remote_w.shutdown().await;
        Ok::<u64, ProxyError>(total)
    };

    let downstream = async {
        let mut buf = vec![0u8; settings.buffer_size];
        let mut total = replayed_down;
        let result = loop {
            let read = read_idle(
                &mut remote_r,
                &mut buf,
                &remote_clock,
                settings.remote_timeout,
                "remote idle",
            );
            let n = match read.await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            };
            total += n as u64;
            let chunks = match chain
                .pre_in(&ctx, &mut state, Bytes::copy_from_slice(&buf[..n]))
                .await
            {
                Ok(chunks) => chunks,
                Err(e) => break Err(e.into()),
            };
            let mut write_err = None;
            for chunk in chunks {
                if let Err(e) = client_w.write_all(&chunk).await {
                    write_err = Some(e);
                    break;
                }
                client_clock.touch();
            }
            if let Some(e) = write_err {
                break Err(e.into());
            }
        };
        on_close();
        result?;
        let _ = client_w.shutdown().await;
        Ok::<u64, ProxyError>(total)
    };

    let (a_to_b, b_to_a) = tokio::try_join!(upstream, downstream)?;
    Ok(CopyResult { a_to_b, b_to_a })
}
