// Writer loops: the single task per coordinator that fills the ring from a
// chosen upstream, either as a plain byte stream or by polling a live HLS
// media playlist.

mod hls;
mod media;

pub use hls::HlsWriter;
pub use media::MediaWriter;

use crate::balancer::BalancedSource;
use crate::concurrency::ConcurrencyManager;
use crate::config::RelayConfig;
use crate::ring::{Chunk, StreamCoordinator, StreamStatus, WriterSourceInfo};
use futures::FutureExt;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::HeaderMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};
use url::Url;

/// Media playlist content types that select the HLS writer.
const HLS_CONTENT_TYPES: [&str; 5] = [
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/x-mpegurl",
    "audio/mpegurl",
    "application/mpegurl",
];

/// Whether an upstream response should be polled as an HLS playlist rather
/// than forwarded byte-for-byte.
pub fn is_hls_playlist(headers: &HeaderMap, url: &Url) -> bool {
    if let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if HLS_CONTENT_TYPES.contains(&essence.as_str()) {
            return true;
        }
    }
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

/// Install and spawn the writer loop matching the balanced source.
///
/// The caller must hold the coordinator's writer claim (see
/// `StreamCoordinator::try_claim_writer`); the claim is released by the
/// spawned task on exit. Returns the response head of the chosen source.
///
/// The spawned task pairs the concurrency increment with a decrement on
/// every exit path, and a panicking loop is converted into a server-error
/// status chunk so clients all observe the same terminal signal.
pub fn spawn_writer(
    coordinator: Arc<StreamCoordinator>,
    balanced: BalancedSource,
    config: RelayConfig,
    concurrency: Arc<ConcurrencyManager>,
    client: Client,
) -> WriterSourceInfo {
    let is_hls = is_hls_playlist(balanced.response.headers(), &balanced.url);
    let info = WriterSourceInfo {
        url: balanced.url.clone(),
        index: balanced.index.clone(),
        sub_index: balanced.sub_index.clone(),
        status: balanced.response.status().as_u16(),
        headers: balanced.response.headers().clone(),
        is_hls,
    };

    let token = coordinator.install_writer(info.clone());
    concurrency.increment(&balanced.index);

    let index = balanced.index.clone();
    let stream_id = coordinator.stream_id().to_owned();
    tokio::spawn(async move {
        debug!(stream_id, source = %balanced.source_key(), is_hls, "Writer starting");

        let run = async {
            if is_hls {
                HlsWriter::new(Arc::clone(&coordinator), config, client, token.clone())
                    .run(balanced.response, balanced.url)
                    .await;
            } else {
                MediaWriter::new(Arc::clone(&coordinator), config, token.clone())
                    .run(balanced.response)
                    .await;
            }
        };

        if AssertUnwindSafe(run).catch_unwind().await.is_err() {
            error!(stream_id, "Writer panicked, converting to server error");
            coordinator.write(Chunk::terminal(
                StreamStatus::ServerError,
                Some("writer panicked".to_owned()),
                Vec::new(),
            ));
        }

        coordinator.finish_writer();
        concurrency.decrement(&index);
        debug!(stream_id, "Writer finished");
    });

    info
}

/// Stage `bytes` into the ring in `chunk_size`-bounded pieces.
///
/// Returns `false` as soon as a write is rejected (the stream left Active),
/// which tells the caller to stop producing.
pub(crate) fn stage_bytes(coordinator: &StreamCoordinator, bytes: &[u8], chunk_size: usize) -> bool {
    for piece in bytes.chunks(chunk_size.max(1)) {
        let mut buffer = coordinator.pool().acquire(piece.len());
        buffer.extend_from_slice(piece);
        if !coordinator.write(Chunk::data(buffer)) {
            return false;
        }
    }
    true
}
