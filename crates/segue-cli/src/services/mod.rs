//! Services driving the playback engine from the command line.

pub mod playlist;

pub use playlist::{PlaylistService, Track};
