use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("request cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("stream is draining, not accepting new clients")]
    StreamDraining,

    #[error("stream is closed")]
    StreamClosed,

    #[error("reader fell {behind} chunks behind the writer and was resynchronized")]
    SlowConsumer { behind: u64 },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment content type `{content_type}` cannot be concatenated")]
    Incompatible { content_type: String },

    #[error("all upstream sources failed: {reason}")]
    SourceExhausted { reason: String },

    #[error("no sources configured for stream `{stream_id}`")]
    NoSources { stream_id: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RelayError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn source_exhausted(reason: impl Into<String>) -> Self {
        Self::SourceExhausted {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::StreamClosed
            | Self::Incompatible { .. }
            | Self::NoSources { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { .. }
            | Self::StreamDraining
            | Self::SlowConsumer { .. }
            | Self::Playlist { .. }
            | Self::SourceExhausted { .. }
            | Self::Timeout { .. }
            | Self::Internal { .. } => true,
        }
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
