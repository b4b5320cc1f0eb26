//! Stream metadata discovered while decoding.

use serde::{Deserialize, Serialize};

/// Metadata fields a stream can report while it plays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TagField {
    Title,
    Artist,
    Album,
    Genre,
    Comment,
    TrackNumber,
    Duration,
    Bitrate,
    Codec,
    Organization,
    Location,
}

/// A single metadata value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TagValue {
    Text(String),
    Number(u64),
    Float(f64),
}

impl TagValue {
    /// Get the value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}
