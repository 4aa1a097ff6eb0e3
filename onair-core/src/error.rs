use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Config file not found at {path}. A template has been created - please edit it with your station endpoints and restart.")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid config: {message}")]
    ConfigInvalid { message: String },

    #[error("Missing required config field: {field}")]
    ConfigMissingField { field: String },

    #[error("Failed to parse config file: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    #[error("Invalid URL in config field {field}: {reason}")]
    ConfigInvalidUrl { field: String, reason: String },

    // Backend errors
    #[error("Backend request to {endpoint} failed: {reason}")]
    BackendRequestFailed { endpoint: String, reason: String },

    #[error("Backend returned status {status} for {endpoint}")]
    BackendStatus { endpoint: String, status: u16 },

    #[error("Push channel {channel} failed: {reason}")]
    ChannelFailed { channel: String, reason: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
