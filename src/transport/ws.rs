use crate::config::Credential;
use crate::error::{Error, Result};
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use http::HeaderValue;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{BoxFuture, Connector, FrameSink, FrameSource, Leg, LegEvent};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BETA_HEADER: &str = "openai-beta";
const BETA_REALTIME_V1: &str = "realtime=v1";

/// Split a client-side socket into a leg.
pub fn into_leg(stream: WsStream) -> Leg {
    let (write, read) = stream.split();
    Leg {
        sink: Box::new(WsSink { write }),
        source: into_source(read),
    }
}

/// Map a tungstenite read half onto leg events.
pub fn into_source<S>(read: S) -> FrameSource
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Send + 'static,
{
    read.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(LegEvent::Frame(text.as_str().to_owned())),
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "Peer sent close frame");
                Some(LegEvent::Closed)
            }
            Ok(Message::Binary(bytes)) => {
                tracing::warn!(len = bytes.len(), "Dropping binary message on a text-only leg");
                None
            }
            Ok(_) => None,
            Err(e) => Some(LegEvent::Failed(e.to_string())),
        }
    })
    .boxed()
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

impl FrameSink for WsSink {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.write.send(Message::Text(text.into())).await?;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.write.close().await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// Opens the upstream realtime connection on behalf of a relay session.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    url: String,
    model: String,
    credential: Credential,
}

impl UpstreamConnector {
    #[must_use]
    pub const fn new(url: String, model: String, credential: Credential) -> Self {
        Self { url, model, credential }
    }

    #[allow(clippy::result_large_err)]
    fn request(&self) -> Result<tungstenite::handshake::client::Request> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut().append_pair("model", &self.model);

        let auth_header = HeaderValue::from_str(&format!("Bearer {}", self.credential.expose()))?;

        let mut req = url.as_str().into_client_request()?;
        let h = req.headers_mut();
        h.insert(http::header::AUTHORIZATION, auth_header);
        h.insert(BETA_HEADER, HeaderValue::from_static(BETA_REALTIME_V1));
        Ok(req)
    }
}

impl Connector for UpstreamConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Leg>> {
        let request = self.request();
        let model = self.model.clone();
        Box::pin(async move {
            let (stream, _) = connect_async(request?)
                .await
                .map_err(|e| Error::UpstreamConnect(e.to_string()))?;
            tracing::info!(%model, "Connected to upstream realtime endpoint");
            Ok(into_leg(stream))
        })
    }
}

/// Opens the client's connection to a relay.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    url: String,
}

impl RelayConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for RelayConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Leg>> {
        let url = self.url.clone();
        Box::pin(async move {
            tracing::debug!(%url, "Connecting to relay");
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => Ok(into_leg(stream)),
                Err(e) => Err(handshake_error(e)),
            }
        })
    }
}

#[derive(Deserialize)]
struct HttpErrorBody {
    error: String,
}

/// Translate a failed relay handshake into the crate's error taxonomy.
fn handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            relay_refusal(response.status().as_u16(), response.body().as_deref())
        }
        other => Error::UpstreamConnect(other.to_string()),
    }
}

fn relay_refusal(status: u16, body: Option<&[u8]>) -> Error {
    let message = body
        .and_then(|body| serde_json::from_slice::<HttpErrorBody>(body).ok())
        .map(|body| body.error);
    match status {
        500 => Error::Configuration(message.unwrap_or_else(|| "relay is not configured".to_string())),
        426 => Error::UpgradeRejected("relay expected a WebSocket upgrade".to_string()),
        _ => Error::UpstreamConnect(message.unwrap_or_else(|| format!("relay answered HTTP {status}"))),
    }
}
