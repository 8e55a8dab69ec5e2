// HLS writer: polls a live media playlist and feeds newly published
// segments into the ring, byte-faithfully and in order.

use super::stage_bytes;
use crate::config::RelayConfig;
use crate::ring::{Chunk, StreamCoordinator, StreamStatus};
use m3u8_rs::parse_playlist_res;
use rand::RngExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Content types whose payloads are safe to concatenate into one stream.
const SAFE_SEGMENT_TYPES: [&str; 4] = ["video/mp2t", "video/mpeg", "audio/aac", "audio/mpeg"];

/// Compute the next playlist poll interval from the current one and the
/// playlist's target duration, per the HLS client recommendation of half
/// the target duration, with ±10 % jitter to spread refreshes.
fn next_poll_interval(current: Duration, target_duration: f64) -> Duration {
    let candidate = (target_duration / 2.0).max(current.as_secs_f64() * 0.9);
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_secs_f64((candidate * jitter).max(0.1))
}

enum SegmentFailure {
    /// Transient fetch problem; retried on the next poll.
    Transport(String),
    /// Content type cannot be concatenated.
    Incompatible(String),
    /// The ring stopped accepting writes.
    Stopped,
}

pub struct HlsWriter {
    coordinator: Arc<StreamCoordinator>,
    config: RelayConfig,
    client: Client,
    token: CancellationToken,
}

impl HlsWriter {
    pub fn new(
        coordinator: Arc<StreamCoordinator>,
        config: RelayConfig,
        client: Client,
        token: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            config,
            client,
            token,
        }
    }

    /// Poll `playlist_url` until the playlist ends, stalls, errors, or the
    /// writer is cancelled. The balancer's already-open response serves as
    /// the first poll.
    pub async fn run(self, initial_response: Response, playlist_url: url::Url) {
        let stream_id = self.coordinator.stream_id().to_owned();
        let mut poll_interval = Duration::from_secs(1);
        let mut highest_fetched: Option<u64> = None;
        let mut last_change = Instant::now();
        let mut initial = Some(initial_response);

        loop {
            if self.token.is_cancelled() {
                debug!(stream_id, "HLS writer cancelled");
                return;
            }

            let body = match initial.take() {
                Some(response) => response.bytes().await,
                None => match self.client.get(playlist_url.clone()).send().await {
                    Ok(response) => response.bytes().await,
                    Err(e) => Err(e),
                },
            };

            match body {
                Ok(body) => match parse_playlist_res(&body) {
                    Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
                        warn!(stream_id, "Master playlist received, cannot relay");
                        self.finish(StreamStatus::ServerError, Some("master playlist not supported"));
                        return;
                    }
                    Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => {
                        poll_interval =
                            next_poll_interval(poll_interval, playlist.target_duration as f64);
                        trace!(
                            stream_id,
                            media_sequence = playlist.media_sequence,
                            segments = playlist.segments.len(),
                            poll_ms = poll_interval.as_millis() as u64,
                            "Playlist refreshed"
                        );

                        let mut fetched_any = false;
                        for (idx, segment) in playlist.segments.iter().enumerate() {
                            let sequence = playlist.media_sequence + idx as u64;
                            // Regressions and already-fetched entries are
                            // skipped; every segment is relayed exactly once.
                            if highest_fetched.is_some_and(|highest| sequence <= highest) {
                                continue;
                            }
                            if self.token.is_cancelled() {
                                return;
                            }
                            match self.fetch_segment(&playlist_url, &segment.uri).await {
                                Ok(()) => {
                                    highest_fetched = Some(sequence);
                                    fetched_any = true;
                                }
                                Err(SegmentFailure::Incompatible(content_type)) => {
                                    warn!(
                                        stream_id,
                                        content_type,
                                        uri = %segment.uri,
                                        "Segment content type cannot be concatenated"
                                    );
                                    self.finish(
                                        StreamStatus::Incompatible,
                                        Some(&format!("incompatible content type {content_type}")),
                                    );
                                    return;
                                }
                                Err(SegmentFailure::Transport(reason)) => {
                                    warn!(stream_id, uri = %segment.uri, reason, "Segment fetch failed");
                                    break;
                                }
                                Err(SegmentFailure::Stopped) => {
                                    debug!(stream_id, "Ring stopped accepting writes, stopping");
                                    return;
                                }
                            }
                        }
                        if fetched_any {
                            last_change = Instant::now();
                        }

                        if playlist.end_list {
                            debug!(stream_id, "Playlist ended, all segments drained");
                            self.finish(StreamStatus::PlaylistFinished, None);
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(stream_id, error = %e, "Playlist body failed to parse");
                        self.finish(StreamStatus::PlaylistParseError, Some("unparseable playlist"));
                        return;
                    }
                },
                Err(e) => {
                    warn!(stream_id, error = %e, "Playlist fetch failed, will re-poll");
                }
            }

            // A live playlist that stops advancing is a dead stream.
            if last_change.elapsed() > self.config.read_deadline() + poll_interval {
                debug!(stream_id, "Playlist stalled, treating as end of stream");
                self.finish(StreamStatus::Eof, Some("playlist stalled"));
                return;
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!(stream_id, "HLS writer cancelled during poll sleep");
                    return;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn fetch_segment(&self, base: &url::Url, uri: &str) -> Result<(), SegmentFailure> {
        let url = base
            .join(uri)
            .map_err(|e| SegmentFailure::Transport(format!("bad segment URI: {e}")))?;

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| SegmentFailure::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SegmentFailure::Transport(format!(
                "HTTP {} for {url}",
                response.status()
            )));
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            let essence = content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if !SAFE_SEGMENT_TYPES.contains(&essence.as_str()) {
                return Err(SegmentFailure::Incompatible(essence));
            }
        }

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    if !stage_bytes(&self.coordinator, &bytes, self.config.chunk_size) {
                        return Err(SegmentFailure::Stopped);
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(SegmentFailure::Transport(e.to_string())),
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
