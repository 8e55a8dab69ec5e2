// Client reader: drains one coordinator's ring into one client's byte
// channel at the client's own pace.

use crate::error::RelayError;
use crate::ring::{StreamCoordinator, StreamStatus};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a reader loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The stream's terminal status: a terminal chunk from the ring, or
    /// `ClientClosed` when the client disconnected or was cancelled.
    Status(StreamStatus),
    /// The reader was lapped by the writer; the connection must close so
    /// the client can rejoin at the live edge with a clean stream.
    Lapped,
}

/// Drain `coordinator` into `sink` until a terminal chunk, cancellation, or
/// client disconnect. The caller owns registration and unregistration.
pub async fn run_reader(
    coordinator: &Arc<StreamCoordinator>,
    cancel: &CancellationToken,
    sink: &mpsc::Sender<Result<Bytes, RelayError>>,
) -> ReaderExit {
    let mut cursor = coordinator.subscribe_cursor();
    let pool = Arc::clone(coordinator.pool());

    loop {
        if cancel.is_cancelled() {
            return ReaderExit::Status(StreamStatus::ClientClosed);
        }

        let mut outcome = match coordinator.read_chunks(cursor, cancel).await {
            Ok(outcome) => outcome,
            Err(RelayError::Cancelled) => {
                return ReaderExit::Status(StreamStatus::ClientClosed);
            }
            Err(e) => {
                debug!(stream_id = %coordinator.stream_id(), error = %e, "Read failed");
                return ReaderExit::Status(StreamStatus::ServerError);
            }
        };

        if outcome.lapped {
            for chunk in outcome.chunks.iter_mut() {
                chunk.reset(&pool);
            }
            if let Some(error) = outcome.error.as_mut() {
                warn!(
                    stream_id = %coordinator.stream_id(),
                    error = error.error().unwrap_or_default(),
                    "Slow consumer resynchronized, closing its connection"
                );
                error.reset(&pool);
            }
            return ReaderExit::Lapped;
        }

        let mut client_gone = false;
        for chunk in outcome.chunks.iter_mut() {
            if !client_gone {
                let payload = Bytes::copy_from_slice(chunk.bytes());
                if sink.send(Ok(payload)).await.is_err() {
                    client_gone = true;
                }
            }
            chunk.reset(&pool);
        }
        if client_gone {
            // Remaining pooled buffers already returned above.
            if let Some(error) = outcome.error.as_mut() {
                error.reset(&pool);
            }
            return ReaderExit::Status(StreamStatus::ClientClosed);
        }

        if let Some(error) = outcome.error.as_mut() {
            let status = error.status().unwrap_or(StreamStatus::ServerError);
            debug!(
                stream_id = %coordinator.stream_id(),
                status = status.code(),
                message = error.error().unwrap_or_default(),
                "Terminal chunk observed"
            );
            error.reset(&pool);
            return ReaderExit::Status(status);
        }

        if outcome.chunks.is_empty() {
            // Nothing copied and no terminal signal; yield briefly rather
            // than spinning on the ring.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cursor = outcome.cursor;
    }
}
