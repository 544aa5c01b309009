use crate::config::SessionProfile;
use crate::protocol::models::{
    AudioFormat, InputAudioTranscription, MaxTokens, Modality, SessionUpdate, ToolChoice,
    TurnDetection,
};
use crate::protocol::{Frame, FrameCodec};
use crate::Result;

/// Builds the one `session.update` a relay sends after upstream opens.
#[derive(Debug, Clone)]
pub struct UpstreamSessionConfigurator {
    profile: SessionProfile,
}

impl UpstreamSessionConfigurator {
    #[must_use]
    pub const fn new(profile: SessionProfile) -> Self {
        Self { profile }
    }

    #[must_use]
    pub fn session_update(&self) -> Frame {
        let profile = &self.profile;
        Frame::SessionUpdate {
            event_id: None,
            session: Box::new(SessionUpdate {
                modalities: vec![Modality::Text, Modality::Audio],
                instructions: profile.instructions.clone(),
                voice: profile.voice.as_str().into(),
                input_audio_format: AudioFormat::Pcm16,
                output_audio_format: AudioFormat::Pcm16,
                input_audio_transcription: InputAudioTranscription {
                    model: profile.transcription_model.clone(),
                },
                turn_detection: TurnDetection::ServerVad {
                    threshold: profile.vad_threshold,
                    prefix_padding_ms: profile.prefix_padding_ms,
                    silence_duration_ms: profile.silence_duration_ms,
                },
                tools: Vec::new(),
                tool_choice: ToolChoice::Auto,
                temperature: profile.temperature,
                max_response_output_tokens: MaxTokens::default(),
            }),
        }
    }

    /// The wire text of [`Self::session_update`].
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    #[allow(clippy::result_large_err)]
    pub fn encoded(&self) -> Result<String> {
        FrameCodec::encode(&self.session_update())
    }
}
