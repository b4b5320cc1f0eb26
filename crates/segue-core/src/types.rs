//! Core domain types for Segue.

pub mod play;
pub mod tag;

pub use play::PlayType;
pub use tag::{TagField, TagValue};
