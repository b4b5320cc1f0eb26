//! Playback transition policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a newly started stream takes over from whatever is already playing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayType {
    /// Stop anything currently playing and start immediately.
    #[default]
    Replace,
    /// Start when the currently playing stream reaches its end (gapless).
    AfterEos,
    /// Fade the playing stream out while the new one fades in.
    Crossfade,
}

impl PlayType {
    /// Get a short display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::AfterEos => "after-eos",
            Self::Crossfade => "crossfade",
        }
    }
}

impl fmt::Display for PlayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PlayType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "after-eos" | "after_eos" | "gapless" => Ok(Self::AfterEos),
            "crossfade" | "xfade" => Ok(Self::Crossfade),
            other => Err(crate::Error::Config(format!("unknown play type: {other}"))),
        }
    }
}
