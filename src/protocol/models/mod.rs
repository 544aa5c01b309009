pub mod audio;
pub mod common;
pub mod session;

pub use audio::{AudioFormat, InputAudioTranscription, TurnDetection};
pub use common::{
    ArbitraryJson, DEFAULT_MODEL, Infinite, MaxTokens, Modality, RangeError, Temperature,
    ToolChoice, VadThreshold, Voice,
};
pub use session::SessionUpdate;
