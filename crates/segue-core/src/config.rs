//! Engine configuration.
//!
//! Settings are stored as JSON in the platform configuration directory.
//! Every field has a default, so a partial file (or no file at all) is fine.

use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the configuration file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Tunables for the playback engine. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default crossfade length used by callers that don't pick one.
    pub crossfade_ms: u64,
    /// How long the output stays open after the last stream unlinks.
    pub idle_stop_delay_ms: u64,
    /// Upper bound on waiting for the output device to become ready.
    pub sink_start_timeout_ms: u64,
    /// Interval between position ticks while the output is running.
    pub tick_interval_ms: u64,
    /// Length of the fade applied when pausing and resuming.
    pub pause_fade_ms: u64,
    /// How long a decoder waits for a continuation when about to finish.
    pub about_to_finish_wait_ms: u64,
    /// Buffer size handed to network sources, in kilobytes.
    pub network_buffer_kb: u32,
    /// Output volume before the caller sets one.
    pub initial_volume: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: 3000,
            idle_stop_delay_ms: 1000,
            sink_start_timeout_ms: 5000,
            tick_interval_ms: 200,
            pause_fade_ms: 500,
            about_to_finish_wait_ms: 500,
            network_buffer_kb: 2048,
            initial_volume: 1.0,
        }
    }
}

impl EngineConfig {
    /// Load the configuration from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            Some(path) => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Load the configuration from a specific file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Write the configuration to a file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Get the default configuration file path for this platform.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "segue", "Segue")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.initial_volume) {
            return Err(Error::Config(format!(
                "initial_volume must be within 0.0..=1.0, got {}",
                self.initial_volume
            )));
        }
        if self.sink_start_timeout_ms == 0 {
            return Err(Error::Config(
                "sink_start_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub const fn crossfade(&self) -> Duration {
        Duration::from_millis(self.crossfade_ms)
    }

    pub const fn idle_stop_delay(&self) -> Duration {
        Duration::from_millis(self.idle_stop_delay_ms)
    }

    pub const fn sink_start_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_start_timeout_ms)
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub const fn pause_fade(&self) -> Duration {
        Duration::from_millis(self.pause_fade_ms)
    }

    pub const fn about_to_finish_wait(&self) -> Duration {
        Duration::from_millis(self.about_to_finish_wait_ms)
    }
}
