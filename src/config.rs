//! Relay configuration.
//!
//! Values come from the process environment (optionally seeded from a `.env`
//! file) and may be overridden on the command line. Priority:
//! CLI flags > environment variables > `.env` values > defaults.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::protocol::models::{DEFAULT_MODEL, Temperature, VadThreshold};

pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REST_URL: &str = "https://api.openai.com/v1/realtime";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TEARDOWN_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_PENDING_FRAMES: usize = 256;

/// Checked in order; the first non-empty value wins.
const CREDENTIAL_VARS: [&str; 3] = ["OPENAI_API_KEY", "SUPABASE_OPENAI_API_KEY", "_OPENAI_API_KEY"];
const API_KEY_PREFIX: &str = "sk-";

pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful cooking assistant. Help users with recipes, \
cooking techniques, ingredient substitutions, and meal planning. Be conversational and encouraging. \
Keep responses concise and practical.";

/// Upstream API credential. Read-only after load, wiped on drop, never
/// printed in full.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential(String);

impl Credential {
    /// Build a credential from a raw configured value.
    ///
    /// Empty values count as absent. A value without the `sk-` prefix that
    /// base64-decodes to one that has it is stored decoded.
    #[must_use]
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if !trimmed.starts_with(API_KEY_PREFIX)
            && let Some(decoded) = decode_wrapped_key(trimmed)
        {
            tracing::debug!("Decoded base64 wrapped API key");
            return Some(Self(decoded));
        }
        Some(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// A short marker safe to log.
    #[must_use]
    pub fn redacted(&self) -> String {
        let visible: String = self.0.chars().take(3).collect();
        format!("{visible}...")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

fn decode_wrapped_key(value: &str) -> Option<String> {
    let bytes = general_purpose::STANDARD.decode(value).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;
    let decoded = decoded.trim();
    decoded.starts_with(API_KEY_PREFIX).then(|| decoded.to_string())
}

/// Parameters of the `session.update` sent upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProfile {
    pub instructions: String,
    pub voice: String,
    pub transcription_model: String,
    pub vad_threshold: VadThreshold,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub temperature: Temperature,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            vad_threshold: VadThreshold::default(),
            prefix_padding_ms: 300,
            silence_duration_ms: 200,
            temperature: Temperature::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub upstream_url: String,
    pub rest_url: String,
    pub model: String,
    /// Absent credentials are not a startup error; requests fail instead.
    pub credential: Option<Credential>,
    pub profile: SessionProfile,
    pub connect_timeout: Duration,
    pub teardown_timeout: Duration,
    pub max_pending_frames: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            credential: None,
            profile: SessionProfile::default(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            teardown_timeout: Duration::from_secs(DEFAULT_TEARDOWN_TIMEOUT_SECS),
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
        }
    }
}

impl RelayConfig {
    /// Load from the process environment, reading `.env` first if present.
    ///
    /// # Errors
    /// Returns `Configuration` if a numeric or bounded value does not parse.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns `Configuration` if a numeric or bounded value does not parse.
    #[allow(clippy::result_large_err)]
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let credential = CREDENTIAL_VARS
            .iter()
            .find_map(|key| get(key).and_then(|raw| Credential::new(&raw)));

        let mut profile = SessionProfile::default();
        if let Some(instructions) = get("RELAY_INSTRUCTIONS") {
            profile.instructions = instructions;
        }
        if let Some(voice) = get("RELAY_VOICE") {
            profile.voice = voice;
        }
        if let Some(model) = get("RELAY_TRANSCRIPTION_MODEL") {
            profile.transcription_model = model;
        }
        if let Some(raw) = get("RELAY_VAD_THRESHOLD") {
            let value: f64 = parse_value("RELAY_VAD_THRESHOLD", &raw)?;
            profile.vad_threshold =
                VadThreshold::new(value).map_err(|e| Error::Configuration(e.to_string()))?;
        }
        if let Some(raw) = get("RELAY_TEMPERATURE") {
            let value: f64 = parse_value("RELAY_TEMPERATURE", &raw)?;
            profile.temperature =
                Temperature::new(value).map_err(|e| Error::Configuration(e.to_string()))?;
        }
        if let Some(raw) = get("RELAY_PREFIX_PADDING_MS") {
            profile.prefix_padding_ms = parse_value("RELAY_PREFIX_PADDING_MS", &raw)?;
        }
        if let Some(raw) = get("RELAY_SILENCE_DURATION_MS") {
            profile.silence_duration_ms = parse_value("RELAY_SILENCE_DURATION_MS", &raw)?;
        }

        Ok(Self {
            host: get("RELAY_HOST").unwrap_or(defaults.host),
            port: get("RELAY_PORT")
                .map(|raw| parse_value("RELAY_PORT", &raw))
                .transpose()?
                .unwrap_or(defaults.port),
            upstream_url: get("RELAY_UPSTREAM_URL").unwrap_or(defaults.upstream_url),
            rest_url: get("RELAY_REST_URL").unwrap_or(defaults.rest_url),
            model: get("RELAY_MODEL").unwrap_or(defaults.model),
            credential,
            profile,
            connect_timeout: get("RELAY_CONNECT_TIMEOUT_SECS")
                .map(|raw| parse_value("RELAY_CONNECT_TIMEOUT_SECS", &raw).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(defaults.connect_timeout),
            teardown_timeout: get("RELAY_TEARDOWN_TIMEOUT_SECS")
                .map(|raw| parse_value("RELAY_TEARDOWN_TIMEOUT_SECS", &raw).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(defaults.teardown_timeout),
            max_pending_frames: get("RELAY_MAX_PENDING_FRAMES")
                .map(|raw| parse_value("RELAY_MAX_PENDING_FRAMES", &raw))
                .transpose()?
                .unwrap_or(defaults.max_pending_frames),
        })
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[allow(clippy::result_large_err)]
fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{key} has an invalid value: {raw}")))
}
