use std::borrow::Cow;

use serde::Deserialize;

use super::frame::Frame;
use crate::error::{Error, Result};

const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// Only the discriminator; every other field is skipped without allocation.
#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type", borrow)]
    kind: Cow<'a, str>,
}

/// JSON-per-message codec shared by both legs.
pub struct FrameCodec;

impl FrameCodec {
    /// Decode one text message into a typed frame.
    ///
    /// # Errors
    /// Returns `MalformedFrame` if the text is not a JSON object carrying a
    /// string `type`.
    #[allow(clippy::result_large_err)]
    pub fn decode(text: &str) -> Result<Frame> {
        serde_json::from_str(text).map_err(|e| Error::MalformedFrame(e.to_string()))
    }

    /// Encode a frame as a single newline-free JSON text.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    #[allow(clippy::result_large_err)]
    pub fn encode(frame: &Frame) -> Result<String> {
        Ok(serde_json::to_string(frame)?)
    }

    /// Validate the envelope and return its `type` without materialising
    /// payload fields. Used where frames are forwarded verbatim.
    ///
    /// # Errors
    /// Returns `MalformedFrame` if the text is not valid JSON or has no
    /// string `type`.
    #[allow(clippy::result_large_err)]
    pub fn peek_type(text: &str) -> Result<String> {
        serde_json::from_str::<Envelope<'_>>(text)
            .map(|envelope| envelope.kind.into_owned())
            .map_err(|e| Error::MalformedFrame(e.to_string()))
    }
}

pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> Cow<'_, str> {
    if s.len() <= max_bytes {
        return Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_type_reads_discriminator() {
        let kind = FrameCodec::peek_type(r#"{"type":"input_audio_buffer.append","audio":"QUJD"}"#).unwrap();
        assert_eq!(kind, "input_audio_buffer.append");
    }

    #[test]
    fn peek_type_rejects_garbage() {
        assert!(matches!(FrameCodec::peek_type("not json"), Err(Error::MalformedFrame(_))));
        assert!(matches!(FrameCodec::peek_type(r#"{"audio":"QUJD"}"#), Err(Error::MalformedFrame(_))));
        assert!(matches!(FrameCodec::peek_type(r#"{"type":42}"#), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn decode_keeps_unfamiliar_kinds() {
        let frame = FrameCodec::decode(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert!(matches!(frame, Frame::Unknown(_)));
        assert_eq!(frame.kind(), "rate_limits.updated");
    }

    #[test]
    fn error_frames_without_a_message_stay_errors() {
        for text in [
            r#"{"type":"error"}"#,
            r#"{"type":"error","error":null}"#,
            r#"{"type":"error","error":{"code":"server_error"}}"#,
        ] {
            match FrameCodec::decode(text).unwrap() {
                Frame::Error { error, .. } => assert_eq!(error.message(), "", "{text}"),
                other => panic!("{text} decoded as {other:?}"),
            }
        }
    }

    #[test]
    fn decode_without_type_is_malformed() {
        assert!(matches!(FrameCodec::decode(r#"{"delta":"AQID"}"#), Err(Error::MalformedFrame(_))));
        assert!(matches!(FrameCodec::decode("[1,2]"), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn encoded_frames_are_single_line() {
        let text = FrameCodec::encode(&Frame::error("line one\nline two")).unwrap();
        assert!(!text.contains('\n'));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let out = safe_truncate(s, 2);
        assert!(out.starts_with('h'));
        assert!(out.contains("truncated"));
        assert_eq!(safe_truncate("short", 64), "short");
    }
}
