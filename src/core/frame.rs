//! Length-prefixed framing over a byte stream
//!
//! Frame format:
//! - Length (8 bytes, little-endian i64): size of the body that follows
//! - Body (Length bytes)
//!
//! TCP may split or coalesce frames arbitrarily, so decoding is incremental:
//! each connection owns a [`FrameBuffer`] that survives between reads.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::logger::log;

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Largest body a peer may announce
pub const MAX_FRAME_LEN: i64 = 64 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("negative frame length {0}")]
    NegativeLength(i64),

    #[error("frame length {0} exceeds limit of {MAX_FRAME_LEN} bytes")]
    TooLarge(i64),
}

/// Wrap a body in one frame
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    out.extend_from_slice(&(body.len() as i64).to_le_bytes());
    out.extend_from_slice(body);
    out.freeze()
}

fn checked_length(prefix: [u8; LENGTH_PREFIX_LEN]) -> Result<usize, FrameError> {
    let declared = i64::from_le_bytes(prefix);
    if declared < 0 {
        return Err(FrameError::NegativeLength(declared));
    }
    if declared > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(declared));
    }
    Ok(declared as usize)
}

/// Per-connection reassembly state
///
/// Invariant: `received <= expected` while `waiting` is set.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    /// A frame body is partially accumulated
    waiting: bool,
    /// Body length announced by the current frame's prefix
    expected: usize,
    /// Body bytes accumulated so far
    received: usize,
    /// Accumulated body
    buf: BytesMut,
    /// Length prefix bytes seen so far, when the prefix itself was split
    header: Vec<u8>,
    /// Bytes left over after a completed frame, not yet consumed
    overflow: Option<Bytes>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a partial frame (prefix or body) is pending
    pub fn is_waiting(&self) -> bool {
        self.waiting || !self.header.is_empty()
    }

    /// Feed newly arrived bytes and return every frame body they complete,
    /// in stream order.
    ///
    /// Leftover bytes after a completed frame are stashed in `overflow`
    /// before the frame is delivered and taken back out exactly once, so a
    /// fragment is never processed twice or lost.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        let mut frames = Vec::new();
        self.overflow = Some(Bytes::copy_from_slice(data));
        while let Some(chunk) = self.overflow.take() {
            self.consume(chunk, &mut frames)?;
        }
        Ok(frames)
    }

    fn consume(&mut self, mut data: Bytes, frames: &mut Vec<Bytes>) -> Result<(), FrameError> {
        if !self.waiting {
            let Some(expected) = self.read_prefix(&mut data)? else {
                return Ok(());
            };
            log::trace!(expected = expected, available = data.len(), "New frame");

            if data.len() < expected {
                self.waiting = true;
                self.expected = expected;
                self.received = data.len();
                self.buf = BytesMut::from(&data[..]);
            } else if data.len() > expected {
                let rest = data.split_off(expected);
                self.overflow = Some(rest);
                frames.push(data);
            } else {
                frames.push(data);
            }
            return Ok(());
        }

        let missing = self.expected - self.received;
        if data.len() < missing {
            self.received += data.len();
            self.buf.extend_from_slice(&data);
            return Ok(());
        }

        self.buf.extend_from_slice(&data[..missing]);
        if data.len() > missing {
            self.overflow = Some(data.slice(missing..));
        }
        let frame = self.buf.split().freeze();
        self.reset();
        frames.push(frame);
        Ok(())
    }

    /// Pull the length prefix off the head of `data`. Returns `None` while
    /// the prefix is still incomplete.
    fn read_prefix(&mut self, data: &mut Bytes) -> Result<Option<usize>, FrameError> {
        if self.header.is_empty() && data.len() >= LENGTH_PREFIX_LEN {
            let prefix = data.split_to(LENGTH_PREFIX_LEN);
            let mut raw = [0u8; LENGTH_PREFIX_LEN];
            raw.copy_from_slice(&prefix);
            return checked_length(raw).map(Some);
        }

        let take = (LENGTH_PREFIX_LEN - self.header.len()).min(data.len());
        self.header.extend_from_slice(&data.split_to(take));
        if self.header.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut raw = [0u8; LENGTH_PREFIX_LEN];
        raw.copy_from_slice(&self.header);
        self.header.clear();
        checked_length(raw).map(Some)
    }

    fn reset(&mut self) {
        self.waiting = false;
        self.expected = 0;
        self.received = 0;
        self.buf.clear();
    }
}
