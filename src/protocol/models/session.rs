use serde::{Deserialize, Serialize};

use super::{
    ArbitraryJson, AudioFormat, InputAudioTranscription, MaxTokens, Modality, Temperature,
    ToolChoice, TurnDetection, Voice,
};

/// Body of the `session.update` frame sent upstream once per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionUpdate {
    pub modalities: Vec<Modality>,
    pub instructions: String,
    pub voice: Voice,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub input_audio_transcription: InputAudioTranscription,
    pub turn_detection: TurnDetection,
    /// Tool definitions are passed through untyped; the relay registers none.
    #[serde(default)]
    pub tools: Vec<ArbitraryJson>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    pub temperature: Temperature,
    pub max_response_output_tokens: MaxTokens,
}
