use serde::{Deserialize, Serialize};

use super::VadThreshold;

/// The only sample format the relay negotiates: 24 kHz mono little-endian PCM16.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AudioFormat {
    #[default]
    #[serde(rename = "pcm16")]
    Pcm16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputAudioTranscription {
    pub model: String,
}

impl Default for InputAudioTranscription {
    fn default() -> Self {
        Self { model: "whisper-1".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: VadThreshold,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self::ServerVad {
            threshold: VadThreshold::default(),
            prefix_padding_ms: 300,
            silence_duration_ms: 200,
        }
    }
}
