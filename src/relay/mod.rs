//! Server side: one [`RelaySession`] per client WebSocket, each owning its
//! upstream connection.

pub mod configurator;
pub mod server;
pub mod session;

pub use configurator::UpstreamSessionConfigurator;
pub use server::{AppState, router, serve, serve_with};
pub use session::{CloseReason, RelaySession, RelaySettings, SessionState};
