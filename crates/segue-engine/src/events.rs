//! Notifications delivered to the application shell.

use crate::graph::OutputElementKind;
use bytes::Bytes;
use segue_core::{PlayerErrorKind, TagField, TagValue};
use std::sync::Arc;
use std::time::Duration;

/// Event emitted by the engine. `D` is the caller's per-stream data.
#[derive(Debug)]
pub enum PlayerEvent<D> {
    /// A stream became the one being heard.
    PlayingStream(Arc<D>),
    /// Periodic position update for the current stream.
    Tick {
        data: Arc<D>,
        position: Duration,
        duration: Option<Duration>,
    },
    /// The stream's decoder will finish soon and nothing is queued after
    /// it. Opening a reusable URI now lets it continue without a gap.
    AboutToFinish(Arc<D>),
    EndOfStream(Arc<D>),
    Error {
        data: Arc<D>,
        kind: PlayerErrorKind,
        message: String,
    },
    Buffering {
        data: Arc<D>,
        percent: u8,
    },
    Info {
        data: Arc<D>,
        field: TagField,
        value: TagValue,
    },
    Image {
        data: Arc<D>,
        image: Bytes,
    },
    /// Application-defined notification from the stream.
    Event {
        data: Arc<D>,
        name: String,
    },
    Redirect {
        data: Arc<D>,
        uri: String,
    },
    VolumeChanged(f64),
    MissingPlugins {
        data: Arc<D>,
        details: Vec<String>,
        descriptions: Vec<String>,
    },
    /// A filter or tee went into the output.
    ElementInserted {
        kind: OutputElementKind,
        name: String,
    },
    /// A filter or tee is about to come out of the output.
    ElementRemoving {
        kind: OutputElementKind,
        name: String,
    },
}

impl<D> PlayerEvent<D> {
    /// The stream data this event is about, if any.
    pub const fn data(&self) -> Option<&Arc<D>> {
        match self {
            Self::PlayingStream(data)
            | Self::AboutToFinish(data)
            | Self::EndOfStream(data)
            | Self::Tick { data, .. }
            | Self::Error { data, .. }
            | Self::Buffering { data, .. }
            | Self::Info { data, .. }
            | Self::Image { data, .. }
            | Self::Event { data, .. }
            | Self::Redirect { data, .. }
            | Self::MissingPlugins { data, .. } => Some(data),
            Self::VolumeChanged(_)
            | Self::ElementInserted { .. }
            | Self::ElementRemoving { .. } => None,
        }
    }

    /// Short name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PlayingStream(_) => "playing",
            Self::Tick { .. } => "tick",
            Self::AboutToFinish(_) => "about-to-finish",
            Self::EndOfStream(_) => "eos",
            Self::Error { .. } => "error",
            Self::Buffering { .. } => "buffering",
            Self::Info { .. } => "info",
            Self::Image { .. } => "image",
            Self::Event { .. } => "event",
            Self::Redirect { .. } => "redirect",
            Self::VolumeChanged(_) => "volume-changed",
            Self::MissingPlugins { .. } => "missing-plugins",
            Self::ElementInserted { .. } => "element-inserted",
            Self::ElementRemoving { .. } => "element-removing",
        }
    }
}
