// Stream handler: orchestrates one client's lifecycle across coordinator
// registration, writer spawning, and source failover.

use crate::balancer::LoadBalancer;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::reader::{ReaderExit, run_reader};
use crate::registry::StreamRegistry;
use crate::ring::{StreamCoordinator, StreamStatus, WriterSourceInfo};
use crate::source::Session;
use crate::writer::spawn_writer;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Called when a stream ends with an incompatible-segment status, so an
/// outer layer can fall back to passthrough for that channel.
pub type IncompatibleHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Response head plus the byte stream for one client.
pub struct StreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    body: mpsc::Receiver<Result<Bytes, RelayError>>,
}

impl StreamResponse {
    pub fn into_body_stream(self) -> ReceiverStream<Result<Bytes, RelayError>> {
        ReceiverStream::new(self.body)
    }
}

/// Derive the stream ID from a request path: the basename with its
/// extension (if any) stripped.
pub fn stream_id_from_path(path: &str) -> Option<String> {
    let base = path.trim_end_matches('/').rsplit('/').next()?;
    let id = base
        .rsplit_once('.')
        .map(|(stem, _ext)| stem)
        .unwrap_or(base);
    if id.is_empty() {
        None
    } else {
        Some(id.to_owned())
    }
}

pub struct StreamHandler {
    registry: Arc<StreamRegistry>,
    balancer: Arc<LoadBalancer>,
    config: RelayConfig,
    client: Client,
    on_incompatible: Option<IncompatibleHook>,
}

impl StreamHandler {
    pub fn new(
        config: RelayConfig,
        registry: Arc<StreamRegistry>,
        balancer: Arc<LoadBalancer>,
        client: Client,
    ) -> Self {
        Self {
            registry,
            balancer,
            config,
            client,
            on_incompatible: None,
        }
    }

    pub fn with_incompatible_hook(mut self, hook: IncompatibleHook) -> Self {
        self.on_incompatible = Some(hook);
        self
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Begin streaming `stream_id` to one client.
    ///
    /// Returns the response head (status inherited from the first upstream,
    /// `Content-Length` stripped always, `Content-Type` stripped for HLS)
    /// and the body channel. The orchestration loop keeps running in its own
    /// task, transparently failing over to other sources; the client
    /// connection only ends on clean termination, slow-consumer resync, or
    /// exhaustion.
    pub async fn serve(
        self: &Arc<Self>,
        stream_id: &str,
        cancel: CancellationToken,
    ) -> Result<StreamResponse, RelayError> {
        let mut session = Session::new();
        let coordinator = self.acquire(stream_id, &cancel).await?;

        let source = match self
            .attach_source(&coordinator, stream_id, &mut session, &cancel)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                coordinator.unregister_client();
                return Err(e);
            }
        };

        let source_key = format!("{}|{}", source.index, source.sub_index);
        info!(
            stream_id,
            source = %source_key,
            clients = coordinator.client_count(),
            "Client attached"
        );

        let status = source.status;
        let headers = filtered_headers(&source);
        let current_key = source_key;

        let (tx, rx) = mpsc::channel(16);
        let handler = Arc::clone(self);
        let id = stream_id.to_owned();
        tokio::spawn(async move {
            handler
                .client_loop(id, coordinator, session, current_key, tx, cancel)
                .await;
        });

        Ok(StreamResponse {
            status,
            headers,
            body: rx,
        })
    }

    /// Register with the channel's coordinator, re-fetching from the
    /// registry while a shutdown transient refuses registration.
    async fn acquire(
        &self,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<StreamCoordinator>, RelayError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let coordinator = self.registry.get_or_create(stream_id);
            match coordinator.register_client() {
                Ok(()) => return Ok(coordinator),
                Err(e) => {
                    debug!(stream_id, error = %e, "Registration refused, retrying");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Make sure the coordinator has a live writer and return its source
    /// head: piggyback on an existing writer, or balance and spawn one.
    ///
    /// The writer claim is taken before balancing, so a coordinator never
    /// has more than one upstream dial in flight no matter how many clients
    /// join at once; the losers wait for the winner's source info instead of
    /// dialing themselves.
    async fn attach_source(
        &self,
        coordinator: &Arc<StreamCoordinator>,
        stream_id: &str,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<WriterSourceInfo, RelayError> {
        loop {
            if let Some(source) = coordinator.writer_source() {
                debug!(stream_id, "Piggybacking on active writer");
                return Ok(source);
            }

            if coordinator.try_claim_writer() {
                let balanced = match self
                    .balancer
                    .balance(stream_id, reqwest::Method::GET, session, cancel)
                    .await
                {
                    Ok(balanced) => balanced,
                    Err(e) => {
                        coordinator.abort_writer_claim();
                        return Err(e);
                    }
                };

                return Ok(spawn_writer(
                    Arc::clone(coordinator),
                    balanced,
                    self.config.clone(),
                    Arc::clone(self.balancer.concurrency()),
                    self.client.clone(),
                ));
            }

            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            // Another client holds the claim and is still balancing.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn client_loop(
        self: Arc<Self>,
        stream_id: String,
        mut coordinator: Arc<StreamCoordinator>,
        mut session: Session,
        mut current_key: String,
        tx: mpsc::Sender<Result<Bytes, RelayError>>,
        cancel: CancellationToken,
    ) {
        loop {
            let exit = run_reader(&coordinator, &cancel, &tx).await;
            coordinator.unregister_client();

            match exit {
                ReaderExit::Lapped => {
                    warn!(stream_id, "Closing slow consumer");
                    return;
                }
                ReaderExit::Status(status) => match status {
                    StreamStatus::ClientClosed => {
                        debug!(stream_id, "Client disconnected");
                        return;
                    }
                    StreamStatus::PlaylistFinished => {
                        debug!(stream_id, "Stream finished cleanly");
                        return;
                    }
                    StreamStatus::Incompatible => {
                        if let Some(hook) = &self.on_incompatible {
                            hook(&stream_id);
                        }
                        info!(stream_id, "Stream needs passthrough, handing off");
                        return;
                    }
                    StreamStatus::Eof
                    | StreamStatus::ServerError
                    | StreamStatus::PlaylistParseError => {
                        session.mark_tested(current_key.clone());
                        if cancel.is_cancelled() {
                            return;
                        }
                        debug!(
                            stream_id,
                            failed_source = %current_key,
                            "Source failed, retrying via balancer"
                        );

                        coordinator = match self.acquire(&stream_id, &cancel).await {
                            Ok(coordinator) => coordinator,
                            Err(_) => return,
                        };
                        match self
                            .attach_source(&coordinator, &stream_id, &mut session, &cancel)
                            .await
                        {
                            Ok(source) => {
                                current_key = format!("{}|{}", source.index, source.sub_index);
                                info!(stream_id, source = %current_key, "Failed over to new source");
                            }
                            Err(e) => {
                                warn!(stream_id, error = %e, "No replacement source available");
                                coordinator.unregister_client();
                                return;
                            }
                        }
                    }
                },
            }
        }
    }
}

/// Response headers forwarded to the client. `Content-Length` never
/// survives (the relayed stream is unbounded and re-chunked), and for HLS
/// the `Content-Type` describes the playlist, not the media bytes we relay.
fn filtered_headers(source: &WriterSourceInfo) -> HeaderMap {
    let mut headers = source.headers.clone();
    headers.remove(CONTENT_LENGTH);
    if source.is_hls {
        headers.remove(CONTENT_TYPE);
    }
    headers
}
