//! HTTP surface of the relay.
//!
//! `GET /realtime` upgrades to a WebSocket and runs one [`RelaySession`];
//! `POST /session-token` hands out ephemeral upstream sessions for clients
//! that connect directly.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::session::{RelaySession, RelaySettings};
use crate::config::RelayConfig;
use crate::transport::rest::SessionTokenClient;
use crate::transport::ws::UpstreamConnector;
use crate::transport::{BoxFuture, Connector, FrameSink, Leg, LegEvent};
use crate::{Error, Result};

const CORS_ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type";
const CORS_HEADERS: [(HeaderName, &str); 2] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, CORS_ALLOW_HEADERS),
];

const EXPECTED_WEBSOCKET: &str = "Expected WebSocket connection";
const MISSING_CREDENTIAL: &str = "OpenAI API key not configured";
const SESSION_REQUEST_FAILED: &str = "Failed to create realtime session";

/// Shared by every request; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    config: Arc<RelayConfig>,
    settings: RelaySettings,
    upstream: Option<Arc<dyn Connector>>,
    tokens: Option<SessionTokenClient>,
}

impl AppState {
    /// # Errors
    /// Returns an error if the session profile cannot be encoded or the
    /// credential cannot be used as a header value.
    #[allow(clippy::result_large_err)]
    pub fn new(config: RelayConfig) -> Result<Self> {
        let settings = RelaySettings::from_config(&config)?;
        let (upstream, tokens) = match config.credential.clone() {
            Some(credential) => {
                info!(credential = %credential.redacted(), model = %config.model, "Upstream credential loaded");
                let tokens = SessionTokenClient::new(config.rest_url.clone(), &credential)?;
                let upstream: Arc<dyn Connector> = Arc::new(UpstreamConnector::new(
                    config.upstream_url.clone(),
                    config.model.clone(),
                    credential,
                ));
                (Some(upstream), Some(tokens))
            }
            None => {
                warn!("No upstream API key configured; relay and token requests will fail");
                (None, None)
            }
        };

        Ok(Self {
            config: Arc::new(config),
            settings,
            upstream,
            tokens,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// Build the relay router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/realtime", get(realtime_handler).options(preflight))
        .route("/session-token", post(session_token_handler).options(preflight))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// # Errors
/// Returns an error if the server fails.
pub async fn serve_with<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(address) = listener.local_addr() {
        info!(%address, "Relay listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Bind the configured address and serve until `shutdown` resolves.
///
/// # Errors
/// Returns an error if the configuration is unusable or the address cannot be bound.
pub async fn serve<F>(config: RelayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = config.address();
    let state = AppState::new(config)?;
    let listener = TcpListener::bind(&address).await?;
    serve_with(listener, state, shutdown).await
}

async fn health() -> &'static str {
    "ok"
}

async fn preflight() -> impl IntoResponse {
    (StatusCode::OK, CORS_HEADERS)
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, CORS_HEADERS, Json(json!({ "error": message }))).into_response()
}

fn requests_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

async fn realtime_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !requests_websocket(&headers) {
        return (StatusCode::UPGRADE_REQUIRED, EXPECTED_WEBSOCKET).into_response();
    }

    let Some(connector) = state.upstream.clone() else {
        error!("Rejecting relay request: {MISSING_CREDENTIAL}");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, MISSING_CREDENTIAL);
    };

    match upgrade {
        Ok(ws) => {
            let settings = state.settings.clone();
            ws.on_upgrade(move |socket| relay_socket(socket, connector, settings))
        }
        Err(rejection) => {
            warn!(%rejection, "WebSocket upgrade failed");
            (StatusCode::UPGRADE_REQUIRED, EXPECTED_WEBSOCKET).into_response()
        }
    }
}

async fn relay_socket(socket: WebSocket, connector: Arc<dyn Connector>, settings: RelaySettings) {
    let leg = socket_leg(socket);
    let session = RelaySession::new(leg.sink, settings);
    info!(session_id = %session.id(), "Client connected");
    session.run(leg.source, connector).await;
}

async fn session_token_handler(State(state): State<AppState>) -> Response {
    let Some(tokens) = state.tokens.as_ref() else {
        error!("Rejecting token request: {MISSING_CREDENTIAL}");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, MISSING_CREDENTIAL);
    };

    let config = state.config();
    let profile = &config.profile;
    match tokens.create_session(&config.model, &profile.voice, &profile.instructions).await {
        Ok(body) => {
            info!("Issued ephemeral realtime session");
            (StatusCode::OK, CORS_HEADERS, Json(body)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Session token request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, SESSION_REQUEST_FAILED)
        }
    }
}

/// Adapt an accepted socket to a leg.
fn socket_leg(socket: WebSocket) -> Leg {
    let (write, read) = socket.split();
    let source = read
        .filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(LegEvent::Frame(text.as_str().to_owned())),
                Ok(Message::Close(_)) => Some(LegEvent::Closed),
                Ok(Message::Binary(bytes)) => {
                    warn!(len = bytes.len(), "Dropping binary message from client");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(LegEvent::Failed(e.to_string())),
            }
        })
        .boxed();
    Leg {
        sink: Box::new(SocketSink { write }),
        source,
    }
}

struct SocketSink {
    write: SplitSink<WebSocket, Message>,
}

impl FrameSink for SocketSink {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.write
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.write
                .close()
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))
        })
    }
}
