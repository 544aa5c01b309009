use serde::Serialize;

use crate::protocol::Frame;

/// Client-observable lifecycle. `Idle` is both initial and re-enterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Listening,
    Speaking,
    Processing,
    Error,
}

/// Everything that can move the state machine.
#[derive(Debug, Clone, Copy)]
pub enum Transition<'a> {
    ConnectRequested,
    LegOpened,
    Frame(&'a Frame),
    LegClosed,
    Failed,
    TimedOut,
    DisconnectRequested,
}

impl ConnectionState {
    /// Whether a connect request may start a new attempt.
    #[must_use]
    pub const fn accepts_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    /// Whether a downstream leg is open.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Listening | Self::Speaking | Self::Processing)
    }

    /// The state after `transition`. Pure; callers apply side effects.
    #[must_use]
    pub fn next(self, transition: Transition<'_>) -> Self {
        match transition {
            Transition::ConnectRequested if self.accepts_connect() => Self::Connecting,
            Transition::LegOpened if self == Self::Connecting => Self::Connected,
            Transition::TimedOut if self == Self::Connecting => Self::Error,
            Transition::Failed => Self::Error,
            Transition::DisconnectRequested => Self::Idle,
            Transition::LegClosed if self == Self::Error => Self::Error,
            Transition::LegClosed => Self::Idle,
            Transition::Frame(frame) => self.on_frame(frame),
            _ => self,
        }
    }

    fn on_frame(self, frame: &Frame) -> Self {
        if matches!(frame, Frame::Error { .. }) {
            return Self::Error;
        }
        match (self, frame) {
            (Self::Connected, Frame::SessionCreated { .. })
            | (Self::Speaking | Self::Processing, Frame::InputAudioBufferSpeechStarted { .. })
            | (Self::Speaking | Self::Processing, Frame::ResponseAudioDone { .. }) => Self::Listening,
            (Self::Listening, Frame::InputAudioBufferSpeechStopped { .. }) => Self::Processing,
            (Self::Listening | Self::Processing, Frame::ResponseAudioDelta { .. }) => Self::Speaking,
            _ => self,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Processing => "processing",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
