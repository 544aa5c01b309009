use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use super::capture::{AudioCaptureUnit, CaptureDevice};
use super::events::{ControllerEvent, ControllerEventStream, Notice};
use super::playback::{AudioOutput, AudioPlaybackUnit};
use super::state::{ConnectionState, Transition};
use super::ClientOptions;
use crate::protocol::{Frame, FrameCodec};
use crate::transport::ws::RelayConnector;
use crate::transport::{BoxFuture, Connector, FrameSink, FrameSource, Leg, LegEvent};
use crate::{Error, Result};

const EVENT_BUFFER: usize = 128;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Drives one downstream connection, the microphone and playback from a
/// single task. The handle is a thin command sender; dropping it shuts the
/// task down, cancelling any pending connect and releasing the device.
pub struct ClientSessionController {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: mpsc::Receiver<ControllerEvent>,
}

enum Command {
    Connect,
    Disconnect,
    StartCapture(oneshot::Sender<Result<()>>),
    StopCapture,
    Shutdown(oneshot::Sender<()>),
}

impl ClientSessionController {
    /// Controller for the relay at `options.url`.
    #[must_use]
    pub fn new(options: ClientOptions, device: Arc<dyn CaptureDevice>, output: Box<dyn AudioOutput>) -> Self {
        let connector = Arc::new(RelayConnector::new(options.url.clone()));
        Self::with_connector(options, connector, device, output)
    }

    /// Controller that opens its downstream leg through `connector`.
    #[must_use]
    pub fn with_connector(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        device: Arc<dyn CaptureDevice>,
        output: Box<dyn AudioOutput>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (event_tx, event_rx) = mpsc::channel::<ControllerEvent>(EVENT_BUFFER);

        let runner = Runner {
            options,
            connector,
            state: state_tx,
            events: event_tx,
            capture: AudioCaptureUnit::new(device),
            playback: AudioPlaybackUnit::new(output),
            attempt: None,
            sink: None,
            source: None,
        };
        tokio::spawn(runner.run(cmd_rx));

        Self {
            commands: cmd_tx,
            state: state_rx,
            events: event_rx,
        }
    }

    /// Start a connection attempt. Ignored while one is pending or open.
    ///
    /// # Errors
    /// `ConnectionClosed` if the controller task has stopped.
    pub async fn connect(&self) -> Result<()> {
        self.send(Command::Connect).await
    }

    /// Close the connection, cancel any pending attempt and release the
    /// microphone. The state becomes `idle`.
    ///
    /// # Errors
    /// `ConnectionClosed` if the controller task has stopped.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }

    /// Acquire the microphone and start streaming audio while connected.
    ///
    /// # Errors
    /// `PermissionDenied` or `Device` from the capture device.
    pub async fn start_capture(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::StartCapture(tx)).await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// # Errors
    /// `ConnectionClosed` if the controller task has stopped.
    pub async fn stop_capture(&self) -> Result<()> {
        self.send(Command::StopCapture).await
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Await the next notice or transcript delta.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        self.events.recv().await
    }

    #[must_use]
    pub fn events(&mut self) -> ControllerEventStream<'_> {
        ControllerEventStream::new(&mut self.events)
    }

    /// Disconnect and wait for the task to finish.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| Error::ConnectionClosed)
    }
}

enum Step {
    Command(Option<Command>),
    Opened(Result<Leg>),
    Leg(Option<LegEvent>),
    Flush,
}

struct Runner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ControllerEvent>,
    capture: AudioCaptureUnit,
    playback: AudioPlaybackUnit,
    attempt: Option<BoxFuture<'static, Result<Leg>>>,
    sink: Option<Box<dyn FrameSink>>,
    source: Option<FrameSource>,
}

impl Runner {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut flush = tokio::time::interval(self.options.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let streaming = self.capture.is_active() && self.sink.is_some();
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                opened = poll_attempt(&mut self.attempt) => Step::Opened(opened),
                event = next_event(&mut self.source) => Step::Leg(event),
                _ = flush.tick(), if streaming => Step::Flush,
            };

            match step {
                Step::Command(Some(Command::Connect)) => self.connect().await,
                Step::Command(Some(Command::Disconnect)) => self.disconnect().await,
                Step::Command(Some(Command::StartCapture(respond))) => {
                    let result = self.capture.start().await;
                    let _ = respond.send(result);
                }
                Step::Command(Some(Command::StopCapture)) => self.capture.stop(),
                Step::Command(Some(Command::Shutdown(done))) => {
                    self.disconnect().await;
                    let _ = done.send(());
                    break;
                }
                Step::Command(None) => {
                    tracing::debug!("Controller handle dropped, shutting down");
                    self.disconnect().await;
                    break;
                }
                Step::Opened(opened) => {
                    self.attempt = None;
                    self.on_opened(opened).await;
                }
                Step::Leg(event) => self.on_leg_event(event).await,
                Step::Flush => self.flush_audio().await,
            }
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Apply a transition; entering `error` or `idle` always releases the
    /// microphone.
    fn apply(&mut self, transition: Transition<'_>) -> ConnectionState {
        let previous = self.current();
        let next = previous.next(transition);
        if next != previous {
            tracing::info!(from = %previous, to = %next, "Connection state changed");
            self.state.send_replace(next);
        }
        if matches!(next, ConnectionState::Error | ConnectionState::Idle) {
            self.capture.stop();
            if next != previous {
                self.playback.clear();
            }
        }
        next
    }

    fn notify(&self, event: ControllerEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(error = %e, "Controller event dropped");
        }
    }

    /// A connect from `error` replaces whatever leg is still open, so its
    /// late close cannot land on the new attempt.
    async fn connect(&mut self) {
        if !self.current().accepts_connect() {
            tracing::debug!(state = %self.current(), "Already connecting or connected, skipping");
            return;
        }
        self.drop_leg().await;
        self.apply(Transition::ConnectRequested);

        let budget = self.options.connect_timeout;
        let handshake = self.connector.connect();
        tracing::info!(url = %self.options.url, "Starting realtime connection");
        self.attempt = Some(Box::pin(async move {
            tokio::time::timeout(budget, handshake)
                .await
                .map_err(|_| Error::Timeout(budget))?
        }));
    }

    async fn on_opened(&mut self, opened: Result<Leg>) {
        match opened {
            Ok(mut leg) if self.current() != ConnectionState::Connecting => {
                tracing::debug!(state = %self.current(), "Connection opened after it was abandoned, closing");
                if tokio::time::timeout(CLOSE_TIMEOUT, leg.sink.close()).await.is_err() {
                    tracing::warn!("Timed out closing abandoned connection");
                }
            }
            Ok(leg) => {
                self.sink = Some(leg.sink);
                self.source = Some(leg.source);
                self.apply(Transition::LegOpened);
                self.notify(ControllerEvent::Notice(Notice::info("Connected", "Voice assistant is ready!")));
            }
            Err(Error::Timeout(budget)) => {
                tracing::error!(?budget, "Connection attempt timed out");
                self.apply(Transition::TimedOut);
                self.notify(ControllerEvent::Notice(Notice::error(
                    "Connection Timeout",
                    format!("Failed to connect to voice assistant within {} seconds", budget.as_secs()),
                )));
            }
            Err(Error::Configuration(message)) => {
                tracing::error!(reason = %message, "Relay is not configured");
                self.apply(Transition::Failed);
                self.notify(ControllerEvent::Notice(Notice::error("Connection Failed", message)));
            }
            Err(e) => {
                tracing::error!(error = %e, "Connection attempt failed");
                self.apply(Transition::Failed);
                self.notify(ControllerEvent::Notice(Notice::error(
                    "Connection Error",
                    "Failed to connect to voice assistant. Please check your connection.",
                )));
            }
        }
    }

    async fn on_leg_event(&mut self, event: Option<LegEvent>) {
        match event {
            Some(LegEvent::Frame(text)) => match FrameCodec::decode(&text) {
                Ok(frame) => self.on_frame(frame).await,
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed frame"),
            },
            Some(LegEvent::Failed(e)) => {
                tracing::error!(error = %e, "Connection failed");
                self.drop_leg().await;
                self.apply(Transition::Failed);
                self.notify(ControllerEvent::Notice(Notice::error(
                    "Connection Error",
                    "Failed to connect to voice assistant. Please check your connection.",
                )));
            }
            Some(LegEvent::Closed) | None => {
                tracing::info!("Connection closed");
                self.drop_leg().await;
                self.apply(Transition::LegClosed);
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        tracing::debug!(frame_type = frame.kind(), "Received frame");
        let state = self.apply(Transition::Frame(&frame));

        match frame {
            Frame::SessionCreated { .. } if state == ConnectionState::Listening => {
                if self.options.auto_capture
                    && let Err(e) = self.capture.start().await
                {
                    tracing::warn!(error = %e, "Could not start capture");
                    self.notify(ControllerEvent::Notice(Notice::error("Microphone Error", e.to_string())));
                }
            }
            Frame::ResponseAudioDelta { delta, .. } if state == ConnectionState::Speaking => {
                if let Err(e) = self.playback.enqueue(&delta) {
                    tracing::warn!(error = %e, "Skipping undecodable audio delta");
                    self.notify(ControllerEvent::Notice(Notice::error("Playback Error", e.to_string())));
                }
            }
            Frame::ResponseAudioTranscriptDelta { item_id, delta, .. } => {
                self.notify(ControllerEvent::TranscriptDelta { item_id, delta });
            }
            Frame::Error { error, .. } => {
                tracing::error!(detail = error.message(), "Assistant reported an error");
                let message = match error.message() {
                    "" => "Something went wrong".to_string(),
                    message => message.to_string(),
                };
                self.notify(ControllerEvent::Notice(Notice::error("Assistant Error", message)));
            }
            _ => {}
        }
    }

    async fn flush_audio(&mut self) {
        let Some(chunk) = self.capture.flush() else {
            return;
        };
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let sent = match FrameCodec::encode(&chunk.into_frame()) {
            Ok(text) => sink.send_text(text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::error!(error = %e, "Failed to send audio");
            self.drop_leg().await;
            self.apply(Transition::Failed);
            self.notify(ControllerEvent::Notice(Notice::error("Send Error", "Failed to send audio message")));
        }
    }

    async fn disconnect(&mut self) {
        if self.attempt.take().is_some() {
            tracing::debug!("Cancelled pending connection attempt");
        }
        self.drop_leg().await;
        self.apply(Transition::DisconnectRequested);
    }

    async fn drop_leg(&mut self) {
        self.source = None;
        if let Some(mut sink) = self.sink.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Error while closing connection"),
                Err(_) => tracing::warn!("Connection did not close in time"),
            }
        }
    }
}

async fn poll_attempt(attempt: &mut Option<BoxFuture<'static, Result<Leg>>>) -> Result<Leg> {
    match attempt {
        Some(handshake) => handshake.await,
        None => std::future::pending().await,
    }
}

async fn next_event(source: &mut Option<FrameSource>) -> Option<LegEvent> {
    match source {
        Some(source) => source.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::capture::mock::MockDevice;
    use crate::client::events::Severity;
    use crate::client::playback::mock::ChannelOutput;
    use crate::transport::memory::{self, Outbound, Peer};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Hands out queued legs; connects that find the queue empty never finish.
    #[derive(Default)]
    struct QueueConnector {
        legs: Mutex<VecDeque<Result<Leg>>>,
        attempts: AtomicUsize,
        abandoned: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl QueueConnector {
        fn with(results: Vec<Result<Leg>>) -> Arc<Self> {
            Arc::new(Self { legs: Mutex::new(results.into()), ..Self::default() })
        }
    }

    impl Connector for QueueConnector {
        fn connect(&self) -> BoxFuture<'static, Result<Leg>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.legs.lock().pop_front() {
                Some(result) => Box::pin(async move { result }),
                None => {
                    let flag = DropFlag(Arc::clone(&self.abandoned));
                    Box::pin(async move {
                        let _flag = flag;
                        std::future::pending::<Result<Leg>>().await
                    })
                }
            }
        }
    }

    struct Harness {
        controller: ClientSessionController,
        connector: Arc<QueueConnector>,
        device: Arc<MockDevice>,
        played: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    fn harness(results: Vec<Result<Leg>>, options: ClientOptions) -> Harness {
        let connector = QueueConnector::with(results);
        let device = Arc::new(MockDevice::default());
        let (tx, played) = mpsc::unbounded_channel();
        let controller = ClientSessionController::with_connector(
            options,
            connector.clone(),
            device.clone(),
            Box::new(ChannelOutput(tx)),
        );
        Harness { controller, connector, device, played }
    }

    fn options() -> ClientOptions {
        ClientOptions::new("ws://relay.invalid/realtime")
    }

    async fn wait_for(controller: &ClientSessionController, want: ConnectionState) {
        let mut changes = controller.state_changes();
        tokio::time::timeout(Duration::from_secs(30), changes.wait_for(|state| *state == want))
            .await
            .unwrap_or_else(|_| panic!("never reached {want}, stuck at {}", controller.state()))
            .unwrap();
    }

    async fn next_notice(controller: &mut ClientSessionController) -> Notice {
        loop {
            match tokio::time::timeout(Duration::from_secs(30), controller.next_event()).await {
                Ok(Some(ControllerEvent::Notice(notice))) => return notice,
                Ok(Some(_)) => {}
                other => panic!("expected a notice, got {other:?}"),
            }
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    fn send(peer: &Peer, text: &str) {
        peer.inject.send(LegEvent::Frame(text.to_string())).unwrap();
    }

    /// Connect and walk to `listening`.
    async fn ready() -> (Harness, Peer) {
        let (leg, peer) = memory::pair();
        let h = harness(vec![Ok(leg)], options());
        h.controller.connect().await.unwrap();
        wait_for(&h.controller, ConnectionState::Connected).await;
        send(&peer, r#"{"type":"session.created"}"#);
        wait_for(&h.controller, ConnectionState::Listening).await;
        (h, peer)
    }

    #[tokio::test]
    async fn session_created_moves_to_listening_and_starts_capture() {
        let (mut h, _peer) = ready().await;
        let notice = match h.controller.events().next().await {
            Some(ControllerEvent::Notice(notice)) => notice,
            other => panic!("expected a notice, got {other:?}"),
        };
        assert_eq!(notice.title, "Connected");
        assert_eq!(notice.severity, Severity::Info);
        assert_eq!(h.device.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_connect_is_a_no_op() {
        let h = harness(Vec::new(), options());
        h.controller.connect().await.unwrap();
        wait_for(&h.controller, ConnectionState::Connecting).await;
        h.controller.connect().await.unwrap();
        h.controller.connect().await.unwrap();
        h.controller.disconnect().await.unwrap();
        wait_for(&h.controller, ConnectionState::Idle).await;
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);
        assert!(h.connector.abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_moves_to_error_and_allows_retry() {
        let mut h = harness(Vec::new(), options());
        h.controller.connect().await.unwrap();
        wait_for(&h.controller, ConnectionState::Error).await;
        assert!(h.connector.abandoned.load(Ordering::SeqCst));

        let notice = next_notice(&mut h.controller).await;
        assert_eq!(notice.title, "Connection Timeout");
        assert!(notice.description.contains("10 seconds"));

        h.controller.connect().await.unwrap();
        wait_for(&h.controller, ConnectionState::Connecting).await;
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn configuration_error_is_surfaced() {
        let mut h = harness(vec![Err(Error::Configuration("OpenAI API key not configured".into()))], options());
        h.controller.connect().await.unwrap();
        wait_for(&h.controller, ConnectionState::Error).await;
        let notice = next_notice(&mut h.controller).await;
        assert_eq!(notice.title, "Connection Failed");
        assert_eq!(notice.description, "OpenAI API key not configured");
        assert_eq!(notice.severity, Severity::Error);
    }

    #[tokio::test]
    async fn audio_delta_speaks_then_done_listens() {
        let (mut h, peer) = ready().await;

        send(&peer, r#"{"type":"response.audio.delta","delta":"AQID"}"#);
        wait_for(&h.controller, ConnectionState::Speaking).await;
        assert_eq!(h.played.recv().await.unwrap(), vec![1, 2, 3]);

        send(&peer, r#"{"type":"response.audio.done"}"#);
        wait_for(&h.controller, ConnectionState::Listening).await;
    }

    #[tokio::test]
    async fn bad_audio_delta_does_not_end_the_session() {
        let (mut h, peer) = ready().await;
        assert_eq!(next_notice(&mut h.controller).await.title, "Connected");

        send(&peer, r#"{"type":"response.audio.delta","delta":"***"}"#);
        assert_eq!(next_notice(&mut h.controller).await.title, "Playback Error");
        assert_eq!(h.controller.state(), ConnectionState::Speaking);

        send(&peer, r#"{"type":"response.audio.delta","delta":"AQID"}"#);
        assert_eq!(h.played.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn speech_stopped_waits_in_processing() {
        let (h, peer) = ready().await;
        send(&peer, r#"{"type":"input_audio_buffer.speech_started"}"#);
        send(&peer, r#"{"type":"input_audio_buffer.speech_stopped"}"#);
        wait_for(&h.controller, ConnectionState::Processing).await;
        send(&peer, r#"{"type":"response.audio.delta","delta":"AQID"}"#);
        wait_for(&h.controller, ConnectionState::Speaking).await;
    }

    #[tokio::test]
    async fn transcript_deltas_are_published() {
        let (mut h, peer) = ready().await;
        send(&peer, r#"{"type":"response.audio_transcript.delta","item_id":"item_1","delta":"Hello"}"#);
        loop {
            match h.controller.next_event().await.unwrap() {
                ControllerEvent::TranscriptDelta { item_id, delta } => {
                    assert_eq!(item_id.as_deref(), Some("item_1"));
                    assert_eq!(delta, "Hello");
                    break;
                }
                ControllerEvent::Notice(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn error_frame_releases_microphone_and_sticks_through_close() {
        let (mut h, peer) = ready().await;
        assert_eq!(next_notice(&mut h.controller).await.title, "Connected");

        send(&peer, r#"{"type":"error","error":"upstream connection error"}"#);
        wait_for(&h.controller, ConnectionState::Error).await;
        let notice = next_notice(&mut h.controller).await;
        assert_eq!(notice.title, "Assistant Error");
        assert_eq!(notice.description, "upstream connection error");
        assert_eq!(h.device.released(), 1);

        peer.inject.send(LegEvent::Closed).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(h.controller.state(), ConnectionState::Error);

        h.controller.disconnect().await.unwrap();
        wait_for(&h.controller, ConnectionState::Idle).await;
    }

    #[tokio::test]
    async fn reconnect_from_error_replaces_the_old_connection() {
        let (old_leg, mut old_peer) = memory::pair();
        let (new_leg, new_peer) = memory::pair();
        let h = harness(vec![Ok(old_leg), Ok(new_leg)], options());
        h.controller.connect().await.unwrap();
        wait_for(&h.controller, ConnectionState::Connected).await;
        send(&old_peer, r#"{"type":"session.created"}"#);
        wait_for(&h.controller, ConnectionState::Listening).await;
        send(&old_peer, r#"{"type":"error","error":{"message":"boom"}}"#);
        wait_for(&h.controller, ConnectionState::Error).await;

        h.controller.connect().await.unwrap();
        assert_eq!(old_peer.next_written().await, Some(Outbound::Close));
        let _ = old_peer.inject.send(LegEvent::Closed);

        wait_for(&h.controller, ConnectionState::Connected).await;
        send(&new_peer, r#"{"type":"session.created"}"#);
        wait_for(&h.controller, ConnectionState::Listening).await;
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);
        eventually(|| h.device.opens.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn error_frame_without_message_uses_fallback_notice() {
        let (mut h, peer) = ready().await;
        assert_eq!(next_notice(&mut h.controller).await.title, "Connected");

        send(&peer, r#"{"type":"error"}"#);
        wait_for(&h.controller, ConnectionState::Error).await;
        let notice = next_notice(&mut h.controller).await;
        assert_eq!(notice.title, "Assistant Error");
        assert_eq!(notice.description, "Something went wrong");
    }

    #[tokio::test]
    async fn close_while_listening_returns_to_idle() {
        let (h, peer) = ready().await;
        peer.inject.send(LegEvent::Closed).unwrap();
        wait_for(&h.controller, ConnectionState::Idle).await;
        assert_eq!(h.device.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn captured_audio_is_flushed_as_append_frames() {
        let (h, mut peer) = ready().await;
        assert!(h.device.push(b"ABC"));

        let text = peer.next_text().await.unwrap();
        assert_eq!(text, r#"{"type":"input_audio_buffer.append","audio":"QUJD"}"#);
    }

    #[tokio::test]
    async fn stop_capture_halts_streaming() {
        let (h, mut peer) = ready().await;
        h.controller.stop_capture().await.unwrap();
        h.controller.stop_capture().await.unwrap();
        eventually(|| h.device.released() == 1).await;
        assert!(!h.device.push(b"late"));

        h.controller.disconnect().await.unwrap();
        assert_eq!(peer.next_written().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn manual_capture_reports_permission_errors() {
        let h = harness(Vec::new(), ClientOptions { auto_capture: false, ..options() });
        h.device.deny.store(true, Ordering::SeqCst);
        assert!(matches!(h.controller.start_capture().await, Err(Error::PermissionDenied)));
        assert_eq!(h.controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn dropping_the_handle_closes_the_connection() {
        let (h, mut peer) = ready().await;
        let device = Arc::clone(&h.device);
        drop(h);
        assert_eq!(peer.next_written().await, Some(Outbound::Close));
        eventually(|| device.released() == 1).await;
    }
}
