use super::pool::BufferPool;
use std::time::Instant;

/// Terminal codes stamped on the last chunk of a stream. The handler uses
/// them to decide between clean teardown and retrying with another source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamStatus {
    /// The client went away; nothing left to do.
    ClientClosed = 0,
    /// Upstream failed in a way worth retrying elsewhere.
    ServerError = 1,
    /// Upstream reported end of stream.
    Eof = 2,
    /// A live playlist reached `EXT-X-ENDLIST` and was drained.
    PlaylistFinished = 3,
    /// The playlist body could not be parsed.
    PlaylistParseError = 4,
    /// A segment carried a content type that cannot be concatenated.
    Incompatible = 5,
}

impl StreamStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One unit staged in a coordinator's ring.
///
/// Exactly one of (non-empty buffer, error, status) is the meaningful
/// payload, except that a terminal chunk may carry trailing bytes picked up
/// on the same read that hit EOF.
#[derive(Debug)]
pub struct Chunk {
    pub(crate) buffer: Vec<u8>,
    pub(crate) error: Option<String>,
    pub(crate) status: Option<StreamStatus>,
    pub(crate) timestamp: Instant,
    pub(crate) seq: u64,
}

impl Chunk {
    /// An empty slot placeholder. Carries no pooled capacity.
    pub fn empty() -> Self {
        Self {
            buffer: Vec::new(),
            error: None,
            status: None,
            timestamp: Instant::now(),
            seq: 0,
        }
    }

    /// A data chunk owning `buffer` (normally pool-acquired).
    pub fn data(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            error: None,
            status: None,
            timestamp: Instant::now(),
            seq: 0,
        }
    }

    /// A terminal chunk, optionally with trailing bytes.
    pub fn terminal(status: StreamStatus, error: Option<String>, trailing: Vec<u8>) -> Self {
        Self {
            buffer: trailing,
            error,
            status: Some(status),
            timestamp: Instant::now(),
            seq: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn status(&self) -> Option<StreamStatus> {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Whether this chunk ends the stream for its readers.
    pub fn is_terminal(&self) -> bool {
        self.error.is_some() || self.status.is_some()
    }

    /// Return the buffer to `pool` and clear the payload.
    ///
    /// Idempotent: after the first call the chunk holds no capacity, and the
    /// pool ignores zero-capacity releases.
    pub fn reset(&mut self, pool: &BufferPool) {
        let buffer = std::mem::take(&mut self.buffer);
        pool.release(buffer);
        self.error = None;
        self.status = None;
        self.seq = 0;
    }
}
