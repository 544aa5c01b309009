use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use uuid::Uuid;

use super::configurator::UpstreamSessionConfigurator;
use crate::config::RelayConfig;
use crate::protocol::codec::safe_truncate;
use crate::protocol::{Frame, FrameCodec};
use crate::transport::{BoxFuture, Connector, FrameSink, FrameSource, Leg, LegEvent};
use crate::{Error, Result};

const UPSTREAM_CONNECTION_ERROR: &str = "upstream connection error";
const UPSTREAM_NOT_READY: &str = "upstream not ready; frame rejected";
const TRACE_FRAME_BYTES: usize = 256;

/// Per-session knobs, derived once from the server configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Encoded `session.update` sent upstream on open.
    pub session_update: String,
    pub connect_timeout: Duration,
    pub teardown_timeout: Duration,
    pub max_pending_frames: usize,
}

impl RelaySettings {
    /// # Errors
    /// Returns an error if the session profile cannot be encoded.
    #[allow(clippy::result_large_err)]
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Ok(Self {
            session_update: UpstreamSessionConfigurator::new(config.profile.clone()).encoded()?,
            connect_timeout: config.connect_timeout,
            teardown_timeout: config.teardown_timeout,
            max_pending_frames: config.max_pending_frames,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingUpstream,
    Open,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    DownstreamClosed,
    DownstreamFailed(String),
    UpstreamClosed,
    UpstreamFailed(String),
    UpstreamUnavailable(String),
}

/// One client connection and the upstream connection opened for it.
///
/// Both write halves are owned here and nowhere else; the read halves are
/// consumed by [`RelaySession::run`].
pub struct RelaySession {
    id: Uuid,
    created_at: DateTime<Utc>,
    state: SessionState,
    downstream: Box<dyn FrameSink>,
    upstream: Option<Box<dyn FrameSink>>,
    pending: VecDeque<String>,
    settings: RelaySettings,
}

enum Dispatch {
    Downstream(Option<LegEvent>),
    UpstreamOpened(Result<Leg>),
    Upstream(Option<LegEvent>),
}

impl RelaySession {
    #[must_use]
    pub fn new(downstream: Box<dyn FrameSink>, settings: RelaySettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            state: SessionState::AwaitingUpstream,
            downstream,
            upstream: None,
            pending: VecDeque::new(),
            settings,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until either leg ends, then close both.
    ///
    /// The upstream handshake runs concurrently with downstream reads. If the
    /// session ends first, the handshake future is dropped with it.
    pub async fn run(mut self, mut downstream: FrameSource, connector: Arc<dyn Connector>) -> CloseReason {
        tracing::info!(session_id = %self.id, "Relay session opened");

        let mut connecting = Some(self.connect_upstream(connector.as_ref()));
        let mut upstream: Option<FrameSource> = None;

        let reason = loop {
            let dispatch = tokio::select! {
                event = downstream.next() => Dispatch::Downstream(event),
                opened = poll_connect(&mut connecting) => Dispatch::UpstreamOpened(opened),
                event = next_upstream(&mut upstream) => Dispatch::Upstream(event),
            };

            let step = match dispatch {
                Dispatch::Downstream(event) => self.on_downstream(event).await,
                Dispatch::UpstreamOpened(opened) => {
                    connecting = None;
                    match opened {
                        Ok(leg) => {
                            upstream = Some(leg.source);
                            self.on_upstream_open(leg.sink).await
                        }
                        Err(e) => Err(self.on_upstream_unavailable(&e).await),
                    }
                }
                Dispatch::Upstream(event) => self.on_upstream(event).await,
            };

            if let Err(reason) = step {
                break reason;
            }
        };

        drop(connecting);
        self.teardown(&reason).await;
        reason
    }

    fn connect_upstream(&self, connector: &dyn Connector) -> BoxFuture<'static, Result<Leg>> {
        let handshake = connector.connect();
        let budget = self.settings.connect_timeout;
        Box::pin(async move {
            tokio::time::timeout(budget, handshake)
                .await
                .map_err(|_| Error::Timeout(budget))?
        })
    }

    async fn on_downstream(&mut self, event: Option<LegEvent>) -> std::result::Result<(), CloseReason> {
        match event {
            Some(LegEvent::Frame(text)) => {
                let Some(kind) = self.admit(&text, "downstream") else {
                    return Ok(());
                };
                match self.upstream.as_mut() {
                    Some(upstream) => upstream
                        .send_text(text)
                        .await
                        .map_err(|e| CloseReason::UpstreamFailed(e.to_string())),
                    None => self.hold(text, &kind).await,
                }
            }
            Some(LegEvent::Failed(e)) => Err(CloseReason::DownstreamFailed(e)),
            Some(LegEvent::Closed) | None => Err(CloseReason::DownstreamClosed),
        }
    }

    async fn on_upstream(&mut self, event: Option<LegEvent>) -> std::result::Result<(), CloseReason> {
        match event {
            Some(LegEvent::Frame(text)) => {
                if self.admit(&text, "upstream").is_none() {
                    return Ok(());
                }
                self.downstream
                    .send_text(text)
                    .await
                    .map_err(|e| CloseReason::DownstreamFailed(e.to_string()))
            }
            Some(LegEvent::Failed(e)) => {
                tracing::error!(session_id = %self.id, error = %e, "Upstream connection failed");
                self.notify_downstream(UPSTREAM_CONNECTION_ERROR).await;
                Err(CloseReason::UpstreamFailed(e))
            }
            Some(LegEvent::Closed) | None => Err(CloseReason::UpstreamClosed),
        }
    }

    /// Configure upstream, release the client from `connecting`, then flush
    /// whatever the client sent early.
    async fn on_upstream_open(&mut self, mut sink: Box<dyn FrameSink>) -> std::result::Result<(), CloseReason> {
        if let Err(e) = sink.send_text(self.settings.session_update.clone()).await {
            self.upstream = Some(sink);
            self.notify_downstream(UPSTREAM_CONNECTION_ERROR).await;
            return Err(CloseReason::UpstreamFailed(e.to_string()));
        }
        tracing::debug!(session_id = %self.id, "Sent session.update upstream");

        let ready = FrameCodec::encode(&Frame::session_created())
            .map_err(|e| CloseReason::DownstreamFailed(e.to_string()))?;
        let delivered = self.downstream.send_text(ready).await;
        self.upstream = Some(sink);
        delivered.map_err(|e| CloseReason::DownstreamFailed(e.to_string()))?;

        if !self.pending.is_empty() {
            tracing::debug!(session_id = %self.id, count = self.pending.len(), "Flushing early frames upstream");
        }
        while let Some(text) = self.pending.pop_front() {
            if let Some(upstream) = self.upstream.as_mut() {
                upstream
                    .send_text(text)
                    .await
                    .map_err(|e| CloseReason::UpstreamFailed(e.to_string()))?;
            }
        }

        self.state = SessionState::Open;
        tracing::info!(session_id = %self.id, "Upstream session ready");
        Ok(())
    }

    async fn on_upstream_unavailable(&mut self, err: &Error) -> CloseReason {
        tracing::error!(session_id = %self.id, error = %err, "Could not open upstream connection");
        self.notify_downstream(UPSTREAM_CONNECTION_ERROR).await;
        CloseReason::UpstreamUnavailable(err.to_string())
    }

    /// Queue a frame that arrived before upstream was ready, or reject it
    /// with an error frame once the queue is full.
    async fn hold(&mut self, text: String, kind: &str) -> std::result::Result<(), CloseReason> {
        if self.pending.len() < self.settings.max_pending_frames {
            self.pending.push_back(text);
            return Ok(());
        }
        tracing::warn!(
            session_id = %self.id,
            frame_type = kind,
            limit = self.settings.max_pending_frames,
            "Pending queue full, rejecting frame"
        );
        self.notify_downstream(UPSTREAM_NOT_READY).await;
        Ok(())
    }

    /// Returns the frame type if the text may be forwarded.
    fn admit(&self, text: &str, from: &'static str) -> Option<String> {
        match FrameCodec::peek_type(text) {
            Ok(kind) => {
                tracing::trace!(
                    session_id = %self.id,
                    from,
                    frame_type = %kind,
                    body = %safe_truncate(text, TRACE_FRAME_BYTES),
                    "Forwarding frame"
                );
                Some(kind)
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, from, error = %e, "Dropping malformed frame");
                None
            }
        }
    }

    async fn notify_downstream(&mut self, message: &str) {
        let sent = match FrameCodec::encode(&Frame::error(message)) {
            Ok(text) => self.downstream.send_text(text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!(session_id = %self.id, error = %e, "Could not deliver error frame downstream");
        }
    }

    async fn teardown(&mut self, reason: &CloseReason) {
        let budget = self.settings.teardown_timeout;
        if let Some(mut upstream) = self.upstream.take() {
            close_within(upstream.as_mut(), budget, "upstream").await;
        }
        close_within(self.downstream.as_mut(), budget, "downstream").await;

        if !self.pending.is_empty() {
            tracing::debug!(session_id = %self.id, count = self.pending.len(), "Discarding frames queued for a session that never opened");
            self.pending.clear();
        }
        self.state = SessionState::Closed;

        let lifetime_ms = (Utc::now() - self.created_at).num_milliseconds();
        tracing::info!(session_id = %self.id, ?reason, lifetime_ms, "Relay session closed");
    }
}

async fn close_within(sink: &mut dyn FrameSink, budget: Duration, leg: &'static str) {
    match tokio::time::timeout(budget, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(leg, error = %e, "Error while closing leg"),
        Err(_) => tracing::warn!(leg, ?budget, "Leg did not close in time, abandoning it"),
    }
}

async fn poll_connect(connecting: &mut Option<BoxFuture<'static, Result<Leg>>>) -> Result<Leg> {
    match connecting {
        Some(handshake) => handshake.await,
        None => std::future::pending().await,
    }
}

async fn next_upstream(source: &mut Option<FrameSource>) -> Option<LegEvent> {
    match source {
        Some(source) => source.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{self, Outbound, Peer};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn settings() -> RelaySettings {
        RelaySettings::from_config(&RelayConfig::default()).unwrap()
    }

    /// Hands out one prepared leg once the test releases it.
    struct GatedConnector {
        gate: Mutex<Option<oneshot::Receiver<Leg>>>,
        attempts: AtomicUsize,
    }

    impl GatedConnector {
        fn new() -> (Arc<Self>, oneshot::Sender<Leg>) {
            let (tx, rx) = oneshot::channel();
            let connector = Arc::new(Self { gate: Mutex::new(Some(rx)), attempts: AtomicUsize::new(0) });
            (connector, tx)
        }

        fn ready(leg: Leg) -> Arc<Self> {
            let (connector, tx) = Self::new();
            let _ = tx.send(leg);
            connector
        }
    }

    impl Connector for GatedConnector {
        fn connect(&self) -> BoxFuture<'static, Result<Leg>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().take();
            Box::pin(async move {
                match gate {
                    Some(rx) => rx.await.map_err(|_| Error::UpstreamConnect("gate dropped".into())),
                    None => Err(Error::UpstreamConnect("already used".into())),
                }
            })
        }
    }

    struct FailingConnector;

    impl Connector for FailingConnector {
        fn connect(&self) -> BoxFuture<'static, Result<Leg>> {
            Box::pin(async { Err(Error::UpstreamConnect("connection refused".into())) })
        }
    }

    /// Never completes; records when its handshake is abandoned.
    struct HangingConnector {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Connector for HangingConnector {
        fn connect(&self) -> BoxFuture<'static, Result<Leg>> {
            let flag = DropFlag(Arc::clone(&self.dropped));
            Box::pin(async move {
                let _flag = flag;
                std::future::pending::<Result<Leg>>().await
            })
        }
    }

    fn spawn_session(connector: Arc<dyn Connector>, settings: RelaySettings) -> (tokio::task::JoinHandle<CloseReason>, Peer) {
        let (leg, client) = memory::pair();
        let session = RelaySession::new(leg.sink, settings);
        assert_eq!(session.state(), SessionState::AwaitingUpstream);
        (tokio::spawn(session.run(leg.source, connector)), client)
    }

    fn kind_of(text: &str) -> String {
        FrameCodec::peek_type(text).unwrap()
    }

    #[tokio::test]
    async fn configures_upstream_then_announces_session() {
        let (upstream_leg, mut upstream) = memory::pair();
        let (task, mut client) = spawn_session(GatedConnector::ready(upstream_leg), settings());

        let first = upstream.next_text().await.unwrap();
        assert_eq!(kind_of(&first), "session.update");
        assert_eq!(client.next_text().await.unwrap(), r#"{"type":"session.created"}"#);

        client.inject.send(LegEvent::Closed).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::DownstreamClosed);
    }

    #[tokio::test]
    async fn frames_are_forwarded_verbatim_both_ways() {
        let (upstream_leg, mut upstream) = memory::pair();
        let (task, mut client) = spawn_session(GatedConnector::ready(upstream_leg), settings());
        upstream.next_text().await.unwrap();
        client.next_text().await.unwrap();

        let append = r#"{"type":"input_audio_buffer.append",  "audio":"QUJD"}"#;
        client.inject.send(LegEvent::Frame(append.to_string())).unwrap();
        assert_eq!(upstream.next_text().await.unwrap(), append);

        let delta = r#"{"type":"response.audio.delta","delta":"AQID","extra":{"kept":true}}"#;
        upstream.inject.send(LegEvent::Frame(delta.to_string())).unwrap();
        assert_eq!(client.next_text().await.unwrap(), delta);

        let unknown = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        upstream.inject.send(LegEvent::Frame(unknown.to_string())).unwrap();
        assert_eq!(client.next_text().await.unwrap(), unknown);

        upstream.inject.send(LegEvent::Closed).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::UpstreamClosed);
        assert_eq!(client.next_written().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn early_frames_are_held_until_upstream_is_configured() {
        let (connector, release) = GatedConnector::new();
        let (task, mut client) = spawn_session(connector.clone(), settings());

        let early = [
            r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#,
            r#"{"type":"input_audio_buffer.append","audio":"BBBB"}"#,
        ];
        for text in early {
            client.inject.send(LegEvent::Frame(text.to_string())).unwrap();
        }
        tokio::task::yield_now().await;

        let (upstream_leg, mut upstream) = memory::pair();
        release.send(upstream_leg).ok().unwrap();

        assert_eq!(kind_of(&upstream.next_text().await.unwrap()), "session.update");
        assert_eq!(upstream.next_text().await.unwrap(), early[0]);
        assert_eq!(upstream.next_text().await.unwrap(), early[1]);
        assert_eq!(kind_of(&client.next_text().await.unwrap()), "session.created");
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        client.inject.send(LegEvent::Closed).unwrap();
        task.await.unwrap();
        assert_eq!(upstream.next_written().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn overflowing_the_pending_queue_rejects_with_an_error_frame() {
        let (connector, _release) = GatedConnector::new();
        let settings = RelaySettings { max_pending_frames: 1, ..settings() };
        let (task, mut client) = spawn_session(connector, settings);

        let frame = r#"{"type":"input_audio_buffer.append","audio":"QUJD"}"#;
        client.inject.send(LegEvent::Frame(frame.to_string())).unwrap();
        client.inject.send(LegEvent::Frame(frame.to_string())).unwrap();

        let rejection = client.next_text().await.unwrap();
        let Frame::Error { error, .. } = FrameCodec::decode(&rejection).unwrap() else {
            panic!("expected error frame, got {rejection}");
        };
        assert_eq!(error.message(), UPSTREAM_NOT_READY);

        client.inject.send(LegEvent::Closed).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::DownstreamClosed);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_ending_the_session() {
        let (upstream_leg, mut upstream) = memory::pair();
        let (task, mut client) = spawn_session(GatedConnector::ready(upstream_leg), settings());
        upstream.next_text().await.unwrap();
        client.next_text().await.unwrap();

        client.inject.send(LegEvent::Frame("{not json".to_string())).unwrap();
        client.inject.send(LegEvent::Frame(r#"{"audio":"QUJD"}"#.to_string())).unwrap();
        upstream.inject.send(LegEvent::Frame("[]".to_string())).unwrap();

        let good = r#"{"type":"input_audio_buffer.append","audio":"QUJD"}"#;
        client.inject.send(LegEvent::Frame(good.to_string())).unwrap();
        assert_eq!(upstream.next_text().await.unwrap(), good);

        let done = r#"{"type":"response.audio.done"}"#;
        upstream.inject.send(LegEvent::Frame(done.to_string())).unwrap();
        assert_eq!(client.next_text().await.unwrap(), done);

        client.inject.send(LegEvent::Closed).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_sends_one_error_then_closes() {
        let (task, mut client) = spawn_session(Arc::new(FailingConnector), settings());

        let text = client.next_text().await.unwrap();
        let Frame::Error { error, .. } = FrameCodec::decode(&text).unwrap() else {
            panic!("expected error frame, got {text}");
        };
        assert_eq!(error.message(), UPSTREAM_CONNECTION_ERROR);
        assert_eq!(client.next_written().await, Some(Outbound::Close));
        assert!(matches!(task.await.unwrap(), CloseReason::UpstreamUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_handshake_is_bounded_by_the_connect_timeout() {
        let dropped = Arc::new(AtomicBool::new(false));
        let connector = Arc::new(HangingConnector { dropped: Arc::clone(&dropped) });
        let (task, mut client) = spawn_session(connector, settings());

        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::UpstreamUnavailable(_)));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(kind_of(&client.next_text().await.unwrap()), "error");
        assert_eq!(client.next_written().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn downstream_close_abandons_a_pending_handshake() {
        let dropped = Arc::new(AtomicBool::new(false));
        let connector = Arc::new(HangingConnector { dropped: Arc::clone(&dropped) });
        let (task, client) = spawn_session(connector, settings());

        client.inject.send(LegEvent::Closed).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::DownstreamClosed);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn upstream_failure_notifies_and_closes_downstream() {
        let (upstream_leg, mut upstream) = memory::pair();
        let (task, mut client) = spawn_session(GatedConnector::ready(upstream_leg), settings());
        upstream.next_text().await.unwrap();
        client.next_text().await.unwrap();

        upstream.inject.send(LegEvent::Failed("reset by peer".into())).unwrap();
        assert_eq!(kind_of(&client.next_text().await.unwrap()), "error");
        assert_eq!(client.next_written().await, Some(Outbound::Close));
        assert_eq!(task.await.unwrap(), CloseReason::UpstreamFailed("reset by peer".into()));
        assert_eq!(upstream.next_written().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn dropped_downstream_stream_counts_as_close() {
        let (upstream_leg, mut upstream) = memory::pair();
        let (task, client) = spawn_session(GatedConnector::ready(upstream_leg), settings());
        upstream.next_text().await.unwrap();

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::DownstreamClosed);
        assert_eq!(upstream.next_written().await, Some(Outbound::Close));
    }
}
