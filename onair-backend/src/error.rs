use onair_core::CoreError;
use thiserror::Error;

/// Errors raised while talking to the station backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Failure inside the retry middleware.
    #[error("HTTP middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// The backend answered with a non-success status.
    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    /// Websocket failure on the realtime connection.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience type alias for Results with `BackendError`.
pub type Result<T> = std::result::Result<T, BackendError>;

impl From<BackendError> for CoreError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Status { endpoint, status } => Self::BackendStatus { endpoint, status },
            BackendError::Json(e) => Self::Json(e),
            BackendError::Url(e) => Self::ConfigInvalidUrl {
                field: "backend.base_url".to_string(),
                reason: e.to_string(),
            },
            other => Self::BackendRequestFailed {
                endpoint: "backend".to_string(),
                reason: other.to_string(),
            },
        }
    }
}
