// Stream coordinator: a single-writer / multi-reader ring of chunks with
// broadcast wake-ups and an Active / Draining / Closed lifecycle.

use super::chunk::{Chunk, StreamStatus};
use super::pool::BufferPool;
use crate::error::RelayError;
use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoordinatorState {
    Active = 0,
    Draining = 1,
    Closed = 2,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Response head of the source a writer is currently consuming, retained so
/// clients that join an existing stream can reuse it without re-dialing.
#[derive(Debug, Clone)]
pub struct WriterSourceInfo {
    pub url: Url,
    pub index: String,
    pub sub_index: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub is_hls: bool,
}

/// Result of one [`StreamCoordinator::read_chunks`] call.
pub struct ReadOutcome {
    /// Copied data chunks, in write order. Caller must `reset` each one.
    pub chunks: Vec<Chunk>,
    /// First terminal chunk in the walked range, or the latched stream
    /// error. Caller must `reset` it too.
    pub error: Option<Chunk>,
    /// Cursor to resume from on the next call.
    pub cursor: u64,
    /// The reader was lapped and resynchronized at head; data was lost.
    pub lapped: bool,
}

struct RingState {
    slots: Vec<Chunk>,
    /// Sequence of the most recently written chunk; the slot holding seq `s`
    /// is `(s - 1) % N`, so `write_seq % N` is the next slot to overwrite.
    write_seq: u64,
    /// First terminal chunk ever written, kept for readers that arrive after
    /// its slot was walked past.
    last_error: Option<(Option<StreamStatus>, Option<String>)>,
}

/// Per-channel fan-out hub.
///
/// One writer task fills the ring; any number of client readers walk it at
/// their own pace, parking on a watch channel whenever they catch up with
/// the write cursor.
pub struct StreamCoordinator {
    stream_id: String,
    pool: Arc<BufferPool>,
    ring: RwLock<RingState>,
    state: AtomicU8,
    client_count: AtomicU64,
    wake: watch::Sender<u64>,
    writer_active: AtomicBool,
    writer_token: Mutex<Option<CancellationToken>>,
    writer_source: Mutex<Option<WriterSourceInfo>>,
}

impl StreamCoordinator {
    pub fn new(stream_id: impl Into<String>, buffer_size: usize) -> Self {
        let slots = (0..buffer_size.max(1)).map(|_| Chunk::empty()).collect();
        let (wake, _) = watch::channel(0u64);
        Self {
            stream_id: stream_id.into(),
            pool: Arc::new(BufferPool::default()),
            ring: RwLock::new(RingState {
                slots,
                write_seq: 0,
                last_error: None,
            }),
            state: AtomicU8::new(CoordinatorState::Active as u8),
            client_count: AtomicU64::new(0),
            wake,
            writer_active: AtomicBool::new(false),
            writer_token: Mutex::new(None),
            writer_source: Mutex::new(None),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn client_count(&self) -> u64 {
        self.client_count.load(Ordering::SeqCst)
    }

    /// Register one client reader.
    ///
    /// A fully shut down coordinator with no clients left is revived in
    /// place, which keeps the registry map stable when a channel is
    /// re-requested between sweeps.
    pub fn register_client(&self) -> Result<(), RelayError> {
        if self.client_count.load(Ordering::SeqCst) == 0
            && self
                .state
                .compare_exchange(
                    CoordinatorState::Closed as u8,
                    CoordinatorState::Active as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        {
            debug!(stream_id = %self.stream_id, "Revived closed coordinator");
        }

        match self.state() {
            CoordinatorState::Active => {
                self.client_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            CoordinatorState::Draining => Err(RelayError::StreamDraining),
            CoordinatorState::Closed => Err(RelayError::StreamClosed),
        }
    }

    /// Unregister one client reader; the last one out shuts the stream down.
    pub fn unregister_client(&self) {
        let mut current = self.client_count.load(Ordering::SeqCst);
        while current > 0 {
            match self.client_count.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.initiate_shutdown();
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Tear the stream down: stop the writer, clear the ring, close.
    ///
    /// Runs from Active (last client left) and from Draining (an error chunk
    /// was latched and every reader has drained out); a no-op once Closed.
    pub fn initiate_shutdown(&self) {
        if self.state() == CoordinatorState::Closed {
            return;
        }
        let _ = self.state.compare_exchange(
            CoordinatorState::Active as u8,
            CoordinatorState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        if let Some(token) = self.writer_token.lock().take() {
            token.cancel();
        }
        self.writer_source.lock().take();

        let write_seq = {
            let mut ring = self.ring.write();
            for slot in ring.slots.iter_mut() {
                slot.reset(&self.pool);
            }
            ring.last_error = None;
            ring.write_seq
        };

        self.state
            .store(CoordinatorState::Closed as u8, Ordering::SeqCst);
        // Final broadcast so any parked reader wakes and observes Closed.
        let _ = self.wake.send(write_seq);
        debug!(stream_id = %self.stream_id, "Coordinator closed");
    }

    /// Claim the single writer slot.
    ///
    /// The claim covers the whole writer startup, balancing included, so a
    /// coordinator never has more than one upstream dial in flight. Release
    /// with [`Self::install_writer`]'s task calling [`Self::finish_writer`],
    /// or with [`Self::abort_writer_claim`] when startup fails.
    pub fn try_claim_writer(&self) -> bool {
        self.writer_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Give up a claim that never produced a writer.
    pub fn abort_writer_claim(&self) {
        self.writer_active.store(false, Ordering::SeqCst);
    }

    /// Install the writer's source info and hand out its cancellation
    /// token. The caller must hold the claim from [`Self::try_claim_writer`].
    pub fn install_writer(&self, source: WriterSourceInfo) -> CancellationToken {
        let token = CancellationToken::new();
        *self.writer_token.lock() = Some(token.clone());
        *self.writer_source.lock() = Some(source);
        token
    }

    /// Release the writer slot after the writer loop exits.
    pub fn finish_writer(&self) {
        self.writer_token.lock().take();
        self.writer_source.lock().take();
        self.writer_active.store(false, Ordering::SeqCst);
    }

    pub fn writer_active(&self) -> bool {
        self.writer_active.load(Ordering::SeqCst)
    }

    pub fn writer_source(&self) -> Option<WriterSourceInfo> {
        self.writer_source.lock().clone()
    }

    /// Cursor for a freshly joined reader: one behind the write head so the
    /// most recently staged chunk is delivered immediately.
    pub fn subscribe_cursor(&self) -> u64 {
        self.ring.read().write_seq.saturating_sub(1)
    }

    /// Stage one chunk in the ring.
    ///
    /// The caller's buffer is swapped into the ring slot and the slot's
    /// previous buffer rides back out through the caller's chunk, which is
    /// reset (returning that buffer to the pool) on every path, including
    /// the bail when the stream is no longer Active. Returns whether the
    /// chunk was accepted.
    pub fn write(&self, mut chunk: Chunk) -> bool {
        let mut wake_seq = None;
        {
            let mut ring = self.ring.write();
            if self.state() == CoordinatorState::Active {
                let slot_count = ring.slots.len() as u64;
                let seq = ring.write_seq + 1;
                let idx = ((seq - 1) % slot_count) as usize;

                let (terminal, latch) = {
                    let slot = &mut ring.slots[idx];
                    std::mem::swap(&mut slot.buffer, &mut chunk.buffer);
                    slot.error = chunk.error.take();
                    slot.status = chunk.status.take();
                    slot.timestamp = chunk.timestamp;
                    slot.seq = seq;
                    (slot.is_terminal(), (slot.status, slot.error.clone()))
                };
                if terminal {
                    ring.last_error.get_or_insert(latch);
                }
                ring.write_seq = seq;

                if terminal {
                    let _ = self.state.compare_exchange(
                        CoordinatorState::Active as u8,
                        CoordinatorState::Draining as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    trace!(stream_id = %self.stream_id, seq, "Terminal chunk staged, draining");
                }
                wake_seq = Some(seq);
            }
        }

        let accepted = wake_seq.is_some();
        if let Some(seq) = wake_seq {
            let _ = self.wake.send(seq);
        }
        chunk.reset(&self.pool);
        accepted
    }

    /// Read everything staged after `from`, parking until the writer
    /// advances when the reader has caught up.
    ///
    /// The caller must `reset` every returned chunk (data and error alike)
    /// once consumed, and resume the next call from `outcome.cursor`.
    pub async fn read_chunks(
        &self,
        from: u64,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome, RelayError> {
        loop {
            let mut wake_rx = self.wake.subscribe();
            {
                let ring = self.ring.read();
                let write_seq = ring.write_seq;
                let slot_count = ring.slots.len() as u64;

                // Lapped reader: the slot after `from` was already
                // overwritten. Resync at head rather than skipping silently.
                if write_seq > from && write_seq - from > slot_count {
                    let behind = write_seq - from;
                    drop(ring);
                    debug!(
                        stream_id = %self.stream_id,
                        behind,
                        "Reader lapped by writer, resynchronizing at head"
                    );
                    return Ok(ReadOutcome {
                        chunks: Vec::new(),
                        error: Some(Chunk::terminal(
                            StreamStatus::ServerError,
                            Some(format!("data loss: reader fell {behind} chunks behind")),
                            Vec::new(),
                        )),
                        cursor: write_seq,
                        lapped: true,
                    });
                }

                if write_seq > from {
                    let mut chunks = Vec::new();
                    let mut error = None;
                    for seq in (from + 1)..=write_seq {
                        let slot = &ring.slots[((seq - 1) % slot_count) as usize];
                        if !slot.bytes().is_empty() {
                            let mut copy = Chunk::data(self.pool.acquire(slot.bytes().len()));
                            copy.buffer.extend_from_slice(slot.bytes());
                            copy.seq = slot.seq;
                            copy.timestamp = slot.timestamp;
                            chunks.push(copy);
                        }
                        if slot.is_terminal() && error.is_none() {
                            error = Some(Chunk::terminal(
                                slot.status().unwrap_or(StreamStatus::ServerError),
                                slot.error().map(str::to_owned),
                                Vec::new(),
                            ));
                        }
                    }
                    if error.is_none()
                        && let Some((status, message)) = ring.last_error.clone()
                    {
                        error = Some(Chunk::terminal(
                            status.unwrap_or(StreamStatus::ServerError),
                            message,
                            Vec::new(),
                        ));
                    }
                    return Ok(ReadOutcome {
                        chunks,
                        error,
                        cursor: write_seq,
                        lapped: false,
                    });
                }

                // Nothing new. A non-Active stream will not produce more,
                // so surface the latched error instead of parking forever.
                if self.state() != CoordinatorState::Active {
                    let (status, message) = ring
                        .last_error
                        .clone()
                        .map(|(status, message)| {
                            (status.unwrap_or(StreamStatus::ServerError), message)
                        })
                        .unwrap_or((StreamStatus::ServerError, Some("stream closed".to_owned())));
                    return Ok(ReadOutcome {
                        chunks: Vec::new(),
                        error: Some(Chunk::terminal(status, message, Vec::new())),
                        cursor: from,
                        lapped: false,
                    });
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                changed = wake_rx.changed() => {
                    // A closed watch channel means the coordinator was
                    // dropped mid-read; loop once more and observe state.
                    if changed.is_err() && self.state() != CoordinatorState::Active {
                        return Err(RelayError::StreamClosed);
                    }
                }
            }
        }
    }
}
