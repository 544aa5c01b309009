use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidRequestError,
    RateLimitError,
    AuthenticationError,
    ServerError,
    #[serde(other)]
    Unknown,
}

/// Structured error body as sent by the upstream service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ApiErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upgrade rejected: {0}")]
    UpgradeRejected(String),

    #[error("Upstream connection error: {0}")]
    UpstreamConnect(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Audio device unavailable: {0}")]
    Device(String),

    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Could not decode audio: {0}")]
    PlaybackDecode(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,
}

impl Error {
    /// Whether the error ends the session it occurred in.
    ///
    /// Content-level failures (a single bad frame or audio delta) are
    /// contained; everything at the transport level tears the session down.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::MalformedFrame(_) | Self::PlaybackDecode(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
