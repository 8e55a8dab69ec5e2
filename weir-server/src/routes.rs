//! HTTP routes: the streaming endpoint and a health probe.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};
use weir_engine::{RelayError, StreamHandler, stream_id_from_path};

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<StreamHandler>,
    pub start_time: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/{stream_path}", get(stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "active_streams": state.handler.registry().len(),
    }))
}

/// `GET /<streamID>[.ext]` — join the channel's shared stream.
async fn stream(State(state): State<AppState>, Path(stream_path): Path<String>) -> Response {
    let Some(stream_id) = stream_id_from_path(&stream_path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let cancel = CancellationToken::new();
    match state.handler.serve(&stream_id, cancel.clone()).await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
            let headers = upstream.headers.clone();

            // Cancel the engine-side client task the moment axum drops the
            // body, i.e. when the client disconnects.
            let guard = cancel.drop_guard();
            let body = upstream.into_body_stream().map(move |item| {
                let _ = &guard;
                item
            });

            let mut response = Response::new(Body::from_stream(body));
            *response.status_mut() = status;
            response.headers_mut().extend(headers);
            response
        }
        Err(RelayError::NoSources { .. }) => {
            debug!(stream_id, "No sources configured");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            error!(stream_id, error = %e, "Failed to open stream");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
