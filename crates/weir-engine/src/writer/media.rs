// Plain-media writer: forwards an upstream byte stream into the ring until
// EOF, timeout, cancellation, or the stream stops accepting writes.

use super::stage_bytes;
use crate::backoff::BackoffStrategy;
use crate::config::RelayConfig;
use crate::ring::{Chunk, StreamCoordinator, StreamStatus};
use crate::throughput::ThroughputMeter;
use reqwest::Response;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
/// Backoff cap when retries are unlimited (no inactivity timeout to derive
/// one from).
const UNLIMITED_BACKOFF_MAX: Duration = Duration::from_secs(2);
/// Consecutive empty reads treated as end of stream.
const MAX_ZERO_READS: u32 = 10;

pub struct MediaWriter {
    coordinator: Arc<StreamCoordinator>,
    config: RelayConfig,
    token: CancellationToken,
}

impl MediaWriter {
    pub fn new(
        coordinator: Arc<StreamCoordinator>,
        config: RelayConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            config,
            token,
        }
    }

    fn backoff_cap(&self) -> Duration {
        match self.config.stream_timeout {
            Some(timeout) => timeout.saturating_sub(Duration::from_secs(1)),
            None => UNLIMITED_BACKOFF_MAX,
        }
    }

    /// Consume `response` into the ring. Never returns an error: every
    /// failure becomes a terminal status chunk so all clients observe the
    /// same signal.
    pub async fn run(self, mut response: Response) {
        let stream_id = self.coordinator.stream_id().to_owned();
        let deadline = self.config.read_deadline();
        let mut backoff = BackoffStrategy::new(READ_BACKOFF_INITIAL, self.backoff_cap());
        let mut meter = ThroughputMeter::new(self.config.minimum_throughput);
        let mut zero_reads = 0u32;
        let mut last_progress = Instant::now();
        let mut last_error_at: Option<Instant> = None;

        loop {
            if self.token.is_cancelled() {
                debug!(stream_id, "Media writer cancelled");
                return;
            }

            let read = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!(stream_id, "Media writer cancelled mid-read");
                    return;
                }
                read = tokio::time::timeout(deadline, response.chunk()) => read,
            };

            match read {
                Err(_elapsed) => {
                    // With unlimited retries the deadline is only a watchdog
                    // on a wedged socket; keep trying.
                    if self.config.unlimited_retries() {
                        warn!(stream_id, "No upstream data within watchdog, retrying");
                        if !backoff.sleep(&self.token).await {
                            return;
                        }
                        continue;
                    }
                    warn!(stream_id, timeout = ?deadline, "Upstream read timed out");
                    self.finish(StreamStatus::ServerError, Some("upstream read timed out"));
                    return;
                }
                Ok(Ok(Some(bytes))) => {
                    if bytes.is_empty() {
                        zero_reads += 1;
                        if zero_reads >= MAX_ZERO_READS {
                            debug!(stream_id, "Repeated empty reads, synthesizing EOF");
                            self.finish(StreamStatus::Eof, None);
                            return;
                        }
                        continue;
                    }
                    zero_reads = 0;

                    meter.record(bytes.len());
                    if meter.is_starved() {
                        warn!(
                            stream_id,
                            minimum = self.config.minimum_throughput,
                            "Upstream throughput below minimum"
                        );
                        self.finish(StreamStatus::ServerError, Some("throughput below minimum"));
                        return;
                    }

                    if !stage_bytes(&self.coordinator, &bytes, self.config.chunk_size) {
                        debug!(stream_id, "Ring stopped accepting writes, stopping");
                        return;
                    }

                    last_progress = Instant::now();
                    if let Some(at) = last_error_at
                        && at.elapsed() >= Duration::from_secs(1)
                    {
                        backoff.reset();
                        last_error_at = None;
                    }
                }
                Ok(Ok(None)) => {
                    debug!(stream_id, "Upstream reported end of stream");
                    self.finish(StreamStatus::Eof, None);
                    return;
                }
                Ok(Err(e)) => {
                    let retry_allowed = self.config.unlimited_retries()
                        || self
                            .config
                            .stream_timeout
                            .is_some_and(|timeout| last_progress.elapsed() < timeout);
                    if retry_allowed {
                        warn!(stream_id, error = %e, "Upstream read failed, backing off");
                        last_error_at = Some(Instant::now());
                        if !backoff.sleep(&self.token).await {
                            return;
                        }
                        continue;
                    }
                    warn!(stream_id, error = %e, "Upstream read failed, no retry budget left");
                    self.finish(StreamStatus::ServerError, Some("upstream read failed"));
                    return;
                }
            }
        }
    }

    fn finish(&self, status: StreamStatus, message: Option<&str>) {
        self.coordinator.write(Chunk::terminal(
            status,
            message.map(str::to_owned),
            Vec::new(),
        ));
    }
}
