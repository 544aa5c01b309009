//! The listening side of a voice session: a connection state machine that
//! streams microphone audio to the relay and plays back assistant audio.

pub mod capture;
pub mod controller;
pub mod events;
pub mod playback;
pub mod state;

use std::time::Duration;

use url::Url;

use crate::{Error, Result};

pub use capture::{AudioCaptureUnit, AudioChunk, CaptureDevice, CaptureSink, CaptureStream, PcmFileDevice};
pub use controller::ClientSessionController;
pub use events::{ControllerEvent, ControllerEventStream, Notice, Severity};
pub use playback::{AudioOutput, AudioPlaybackUnit, NullOutput, PcmWriterOutput};
pub use state::{ConnectionState, Transition};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay endpoint, `ws://` or `wss://`.
    pub url: String,
    pub connect_timeout: Duration,
    /// How often captured audio is sent as one append frame.
    pub flush_interval: Duration,
    /// Start the microphone as soon as the session is ready.
    pub auto_capture: bool,
}

impl ClientOptions {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            auto_capture: true,
        }
    }
}

/// The WebSocket URL for `path` on the deployment at `base`.
///
/// `http` maps to `ws` and `https` to `wss`; websocket schemes are kept.
/// `path` is appended to any path `base` already carries, so a relay mounted
/// under a prefix keeps it.
///
/// # Errors
/// `Configuration` if `base` is not a URL or uses another scheme.
#[allow(clippy::result_large_err)]
pub fn websocket_url(base: &str, path: &str) -> Result<String> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::Configuration(format!("unsupported scheme `{other}` in {base}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::Configuration(format!("cannot use {scheme} for {base}")))?;
    if !path.is_empty() {
        let joined = format!("{}/{}", url.path().trim_end_matches('/'), path.trim_start_matches('/'));
        url.set_path(&joined);
    }
    Ok(url.to_string())
}
