use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Free-form JSON payloads the relay carries without interpreting.
pub type ArbitraryJson = Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Voice(String);

impl<S: Into<String>> From<S> for Voice {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MaxTokens {
    Count(u32),
    Infinite(Infinite),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Infinite {
    #[serde(rename = "inf")]
    Inf,
}

impl Default for MaxTokens {
    fn default() -> Self {
        Self::Infinite(Infinite::Inf)
    }
}

/// A value constrained to an inclusive range, rejected at construction and
/// on deserialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeError {
    pub field: &'static str,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

impl std::fmt::Display for RangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} must be between {} and {}, got {}",
            self.field, self.min, self.max, self.value
        )
    }
}

impl std::error::Error for RangeError {}

macro_rules! bounded_f64 {
    ($name:ident, $field:literal, $min:expr, $max:expr, $default:expr) => {
        #[derive(Debug, Clone, Copy, Serialize, PartialEq)]
        #[serde(transparent)]
        pub struct $name(f64);

        impl $name {
            /// # Errors
            /// Returns an error if `val` is outside the allowed inclusive range.
            pub fn new(val: f64) -> Result<Self, RangeError> {
                if ($min..=$max).contains(&val) {
                    Ok(Self(val))
                } else {
                    Err(RangeError { field: $field, value: val, min: $min, max: $max })
                }
            }

            #[must_use]
            pub const fn get(self) -> f64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self($default)
            }
        }

        impl TryFrom<f64> for $name {
            type Error = RangeError;

            fn try_from(value: f64) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let value = f64::deserialize(deserializer)?;
                Self::new(value).map_err(serde::de::Error::custom)
            }
        }
    };
}

bounded_f64!(Temperature, "temperature", 0.0, 2.0, 0.8);
bounded_f64!(VadThreshold, "threshold", 0.0, 1.0, 0.5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_tokens_infinite_serializes_as_inf() {
        let serialized = serde_json::to_string(&MaxTokens::default()).unwrap();
        assert_eq!(serialized, "\"inf\"");
        let back: MaxTokens = serde_json::from_str(&serialized).unwrap();
        assert!(matches!(back, MaxTokens::Infinite(Infinite::Inf)));
    }

    #[test]
    fn voice_is_a_bare_string() {
        let voice = Voice::from("alloy");
        assert_eq!(serde_json::to_value(&voice).unwrap(), "alloy");
        assert!(serde_json::from_str::<Voice>(r#"{"id":"alloy"}"#).is_err());
    }

    #[test]
    fn temperature_out_of_range_is_rejected() {
        assert!(Temperature::new(2.5).is_err());
        assert!(serde_json::from_str::<Temperature>("-0.1").is_err());
        assert_eq!(Temperature::new(1.0).unwrap().get(), 1.0);
    }

    #[test]
    fn threshold_bounds() {
        assert!(VadThreshold::new(0.0).is_ok());
        assert!(VadThreshold::new(1.0).is_ok());
        let err = VadThreshold::new(1.2).unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }
}
