//! # segue-core
//!
//! Core types, configuration, and error handling for the Segue playback engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, PlayerErrorKind, Result};
pub use types::*;
