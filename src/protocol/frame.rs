use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::models::{ArbitraryJson, SessionUpdate};
use crate::error::ServerError;

/// Payload of an `error` frame.
///
/// Upstream sends a structured object; relays and older clients send a bare
/// string. Anything else, including a missing payload, lands in `Other` so the
/// frame still reads as an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ErrorDetail {
    Message(String),
    Structured(ServerError),
    Other(ArbitraryJson),
}

impl ErrorDetail {
    /// Human readable text, empty when the sender gave none.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Message(message) => message,
            Self::Structured(err) => &err.message,
            Self::Other(value) => value.get("message").and_then(|m| m.as_str()).unwrap_or_default(),
        }
    }
}

impl Default for ErrorDetail {
    fn default() -> Self {
        Self::Other(ArbitraryJson::Null)
    }
}

impl From<&str> for ErrorDetail {
    fn from(message: &str) -> Self {
        Self::Structured(ServerError {
            error_type: None,
            code: None,
            message: message.to_string(),
            param: None,
            event_id: None,
        })
    }
}

/// One JSON message exchanged on either leg.
///
/// Kinds the crate does not model are kept as `Unknown` with their raw JSON,
/// so nothing valid is ever rejected for being unfamiliar.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SessionUpdate {
        event_id: Option<String>,
        session: Box<SessionUpdate>,
    },
    SessionCreated {
        event_id: Option<String>,
        session: Option<ArbitraryJson>,
    },
    InputAudioBufferAppend {
        event_id: Option<String>,
        audio: String,
    },
    InputAudioBufferSpeechStarted {
        event_id: Option<String>,
        audio_start_ms: Option<u32>,
        item_id: Option<String>,
    },
    InputAudioBufferSpeechStopped {
        event_id: Option<String>,
        audio_end_ms: Option<u32>,
        item_id: Option<String>,
    },
    ResponseAudioDelta {
        event_id: Option<String>,
        response_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    ResponseAudioDone {
        event_id: Option<String>,
        response_id: Option<String>,
        item_id: Option<String>,
    },
    ResponseAudioTranscriptDelta {
        event_id: Option<String>,
        response_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    Error {
        event_id: Option<String>,
        error: ErrorDetail,
    },
    Unknown(ArbitraryJson),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
enum FrameRepr {
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        session: Box<SessionUpdate>,
    },
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<ArbitraryJson>,
    },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        audio: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    InputAudioBufferSpeechStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_start_ms: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    InputAudioBufferSpeechStopped {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_end_ms: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default)]
        error: ErrorDetail,
    },
}

impl From<FrameRepr> for Frame {
    fn from(repr: FrameRepr) -> Self {
        match repr {
            FrameRepr::SessionUpdate { event_id, session } => Self::SessionUpdate { event_id, session },
            FrameRepr::SessionCreated { event_id, session } => Self::SessionCreated { event_id, session },
            FrameRepr::InputAudioBufferAppend { event_id, audio } => Self::InputAudioBufferAppend { event_id, audio },
            FrameRepr::InputAudioBufferSpeechStarted { event_id, audio_start_ms, item_id } => Self::InputAudioBufferSpeechStarted { event_id, audio_start_ms, item_id },
            FrameRepr::InputAudioBufferSpeechStopped { event_id, audio_end_ms, item_id } => Self::InputAudioBufferSpeechStopped { event_id, audio_end_ms, item_id },
            FrameRepr::ResponseAudioDelta { event_id, response_id, item_id, delta } => Self::ResponseAudioDelta { event_id, response_id, item_id, delta },
            FrameRepr::ResponseAudioDone { event_id, response_id, item_id } => Self::ResponseAudioDone { event_id, response_id, item_id },
            FrameRepr::ResponseAudioTranscriptDelta { event_id, response_id, item_id, delta } => Self::ResponseAudioTranscriptDelta { event_id, response_id, item_id, delta },
            FrameRepr::Error { event_id, error } => Self::Error { event_id, error },
        }
    }
}

impl Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let repr = match self {
            Self::Unknown(value) => return value.serialize(serializer),
            Self::SessionUpdate { event_id, session } => FrameRepr::SessionUpdate { event_id: event_id.clone(), session: session.clone() },
            Self::SessionCreated { event_id, session } => FrameRepr::SessionCreated { event_id: event_id.clone(), session: session.clone() },
            Self::InputAudioBufferAppend { event_id, audio } => FrameRepr::InputAudioBufferAppend { event_id: event_id.clone(), audio: audio.clone() },
            Self::InputAudioBufferSpeechStarted { event_id, audio_start_ms, item_id } => FrameRepr::InputAudioBufferSpeechStarted { event_id: event_id.clone(), audio_start_ms: *audio_start_ms, item_id: item_id.clone() },
            Self::InputAudioBufferSpeechStopped { event_id, audio_end_ms, item_id } => FrameRepr::InputAudioBufferSpeechStopped { event_id: event_id.clone(), audio_end_ms: *audio_end_ms, item_id: item_id.clone() },
            Self::ResponseAudioDelta { event_id, response_id, item_id, delta } => FrameRepr::ResponseAudioDelta { event_id: event_id.clone(), response_id: response_id.clone(), item_id: item_id.clone(), delta: delta.clone() },
            Self::ResponseAudioDone { event_id, response_id, item_id } => FrameRepr::ResponseAudioDone { event_id: event_id.clone(), response_id: response_id.clone(), item_id: item_id.clone() },
            Self::ResponseAudioTranscriptDelta { event_id, response_id, item_id, delta } => FrameRepr::ResponseAudioTranscriptDelta { event_id: event_id.clone(), response_id: response_id.clone(), item_id: item_id.clone(), delta: delta.clone() },
            Self::Error { event_id, error } => FrameRepr::Error { event_id: event_id.clone(), error: error.clone() },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = ArbitraryJson::deserialize(deserializer)?;
        if !value.get("type").is_some_and(serde_json::Value::is_string) {
            return Err(serde::de::Error::custom("frame has no string `type` field"));
        }
        match FrameRepr::deserialize(value.clone()) {
            Ok(repr) => Ok(repr.into()),
            Err(err) => {
                tracing::debug!("Keeping frame as unknown: {err}");
                Ok(Self::Unknown(value))
            }
        }
    }
}

impl Frame {
    /// The readiness marker the relay emits once upstream is configured.
    #[must_use]
    pub const fn session_created() -> Self {
        Self::SessionCreated { event_id: None, session: None }
    }

    #[must_use]
    pub const fn audio_append(audio: String) -> Self {
        Self::InputAudioBufferAppend { event_id: None, audio }
    }

    #[must_use]
    pub fn error(message: &str) -> Self {
        Self::Error { event_id: None, error: ErrorDetail::from(message) }
    }

    /// The `type` discriminator as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::SessionCreated { .. } => "session.created",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioBufferSpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::InputAudioBufferSpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            Self::ResponseAudioDelta { .. } => "response.audio.delta",
            Self::ResponseAudioDone { .. } => "response.audio.done",
            Self::ResponseAudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::Error { .. } => "error",
            Self::Unknown(value) => value.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
        }
    }
}
