#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Realtime voice session relay.
//!
//! The [`relay`] module is a WebSocket proxy that holds the upstream API
//! credential, configures each upstream session and forwards frames both
//! ways. The [`client`] module is the listening side: a connection state
//! machine with microphone capture and ordered playback.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use client::{ClientOptions, ClientSessionController, ConnectionState, ControllerEvent, Notice};
pub use config::{Credential, RelayConfig, SessionProfile};
pub use error::{Error, Result};
pub use protocol::{ErrorDetail, Frame, FrameCodec};
pub use relay::{AppState, RelaySession, UpstreamSessionConfigurator, router, serve};
