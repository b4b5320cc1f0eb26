//! Media graph abstraction.
//!
//! The engine never decodes or renders audio itself. It drives a
//! [`MediaGraph`] that builds one [`StreamGraph`] per open URI plus a
//! single shared [`OutputPath`] containing the mixer. Everything the
//! graph has to report back, from whatever thread it happens on, goes
//! through an [`EventSender`] as a [`GraphEvent`].

use crate::fade::Envelope;
use crate::hooks::{AudioFilter, SourceOptions};
use bytes::Bytes;
use crossbeam_channel::Sender;
use segue_core::{Result, TagField, TagValue};
use std::fmt;
use std::time::Duration;

/// Identifier of a stream, unique for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An input slot on the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MixerSlot(pub u32);

/// Position of a caller-supplied element on the output path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputElementKind {
    /// Inline between the mixer and the device, after the volume stage.
    Filter,
    /// Side branch fed a copy of the mixed audio.
    Tee,
}

impl fmt::Display for OutputElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Filter => "filter",
            Self::Tee => "tee",
        })
    }
}

/// Where a graph event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Stream(StreamId),
    Output,
}

/// Error categories a graph can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphErrorKind {
    /// Core framework failure
    Core,
    /// A library the graph depends on failed
    Library,
    /// A device or file is held by someone else
    ResourceBusy,
    /// Generic "data stopped flowing" error
    StreamFailed,
    /// Anything else (decode errors, missing files, ...)
    Other,
}

impl GraphErrorKind {
    /// Whether this error points at the audio device rather than the stream.
    pub const fn is_audio_failure(self) -> bool {
        matches!(self, Self::Core | Self::Library | Self::ResourceBusy)
    }
}

/// Notification from a stream sub-graph or the output path.
#[derive(Debug, Clone)]
pub enum GraphEventKind {
    /// A requested suspension (block) took effect.
    Suspended,
    /// A requested resume (unblock) took effect.
    Resumed,
    /// The stream produced its last buffer.
    EndOfStream,
    /// The stream started a new segment (after preroll or a seek).
    NewSegment,
    /// A buffer passed the stream's suspend point.
    BufferFlowing,
    /// The live gain of the stream changed.
    GainChanged(f64),
    Tag(TagField, TagValue),
    Image(Bytes),
    /// Network buffer fill level, in percent.
    Buffering(u8),
    Error {
        kind: GraphErrorKind,
        message: String,
    },
    MissingPlugin {
        detail: String,
        description: String,
    },
    /// Application-defined notification.
    Application(String),
    Redirect(String),
    /// The decoder is nearly done and can continue gaplessly into another
    /// URI. Reply with the URI to continue with, or `None`.
    AboutToFinish(Sender<Option<String>>),
    /// The output device is ready to render.
    OutputReady,
    OutputError(String),
    /// The device's native volume changed.
    OutputVolumeChanged(f64),
    /// Data is held back ahead of the output's element chain, so elements
    /// can be inserted or removed.
    ChainBlocked,
}

impl GraphEventKind {
    /// Short name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
            Self::EndOfStream => "eos",
            Self::NewSegment => "new-segment",
            Self::BufferFlowing => "buffer",
            Self::GainChanged(_) => "gain",
            Self::Tag(..) => "tag",
            Self::Image(_) => "image",
            Self::Buffering(_) => "buffering",
            Self::Error { .. } => "error",
            Self::MissingPlugin { .. } => "missing-plugin",
            Self::Application(_) => "application",
            Self::Redirect(_) => "redirect",
            Self::AboutToFinish(_) => "about-to-finish",
            Self::OutputReady => "output-ready",
            Self::OutputError(_) => "output-error",
            Self::OutputVolumeChanged(_) => "output-volume",
            Self::ChainBlocked => "chain-blocked",
        }
    }
}

/// A graph event tagged with its source.
#[derive(Debug, Clone)]
pub struct GraphEvent {
    pub source: EventSource,
    pub kind: GraphEventKind,
}

/// Posting half of the engine's event channel, bound to one source.
#[derive(Debug, Clone)]
pub struct EventSender {
    source: EventSource,
    tx: Sender<GraphEvent>,
}

impl EventSender {
    pub const fn new(source: EventSource, tx: Sender<GraphEvent>) -> Self {
        Self { source, tx }
    }

    pub const fn source(&self) -> EventSource {
        self.source
    }

    /// Post an event. Returns false once the engine has gone away.
    pub fn post(&self, kind: GraphEventKind) -> bool {
        self.tx
            .send(GraphEvent {
                source: self.source,
                kind,
            })
            .is_ok()
    }
}

/// Result of starting a stream's preroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrerollOutcome {
    /// Preroll continues in the background; `Suspended` follows.
    Pending,
    /// Preroll finished synchronously and the stream is suspended.
    Ready,
    /// Live source that can't preroll; the stream is not suspended.
    NoPreroll,
}

/// How far a seek's flush may travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// Contain the flush within the stream sub-graph. Used while the
    /// stream is linked so the mixer and its other inputs are untouched.
    Stream,
    /// Flush all the way downstream. Only valid while unlinked.
    Downstream,
}

/// Everything needed to build one stream sub-graph.
#[derive(Debug)]
pub struct StreamRequest<'a> {
    pub id: StreamId,
    pub uri: &'a str,
    pub source: SourceOptions,
    pub filters: Vec<Box<dyn AudioFilter>>,
    pub events: EventSender,
    /// Longest the decoder may block on an `AboutToFinish` answer.
    pub continuation_wait: Duration,
}

/// Per-URI decode sub-graph with a volume stage and a suspend point at
/// its output.
pub trait StreamGraph: Send {
    /// Start prerolling: decode up to the first buffer, then suspend.
    fn preroll(&mut self) -> Result<PrerollOutcome>;

    /// Request suspension at the output. Confirmed with `Suspended`.
    fn block(&mut self);

    /// Request resumption. Confirmed with `Resumed`.
    fn unblock(&mut self);

    fn attach(&mut self, slot: MixerSlot) -> Result<()>;

    fn detach(&mut self, slot: MixerSlot);

    fn play(&mut self) -> Result<()>;

    /// Shut the sub-graph down. Nothing is posted afterwards.
    fn stop(&mut self);

    /// Position in stream time, if known.
    fn position(&self) -> Option<Duration>;

    fn duration(&self) -> Option<Duration>;

    fn seekable(&self) -> bool;

    fn seek(&mut self, target: Duration, scope: FlushScope);

    /// Current live gain.
    fn gain(&self) -> f64;

    /// Set the gain directly, clearing any envelope.
    fn set_gain(&mut self, gain: f64);

    /// Drive the gain from an envelope in stream time.
    fn set_envelope(&mut self, envelope: Envelope);
}

/// The shared mixer, output volume stage and audio device.
pub trait OutputPath: Send {
    /// Begin opening the device. Readiness is reported asynchronously
    /// with `OutputReady` or `OutputError`.
    fn start(&mut self) -> Result<()>;

    fn play(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Mixer running time, if the output is running.
    fn position(&self) -> Option<Duration>;

    fn request_slot(&mut self) -> Result<MixerSlot>;

    fn release_slot(&mut self, slot: MixerSlot);

    /// Whether the device exposes its own volume control.
    fn has_device_volume(&self) -> bool;

    fn set_device_volume(&mut self, volume: f64);

    fn set_mixer_volume(&mut self, volume: f64);

    /// Hold data back ahead of the element chain. Confirmed with
    /// `ChainBlocked`; only requested while the output is playing.
    fn block_chain(&mut self);

    fn unblock_chain(&mut self);

    /// Insert an element. Called while the chain is blocked or the output
    /// is stopped.
    fn insert_element(
        &mut self,
        kind: OutputElementKind,
        element: Box<dyn AudioFilter>,
    ) -> Result<()>;

    /// Remove the element called `name`. Same conditions as insertion.
    fn remove_element(&mut self, kind: OutputElementKind, name: &str) -> Result<()>;
}

/// Factory for the shared output path and per-URI stream sub-graphs.
pub trait MediaGraph: Send + Sync {
    fn create_output(&self, events: EventSender) -> Result<Box<dyn OutputPath>>;

    fn create_stream(&self, request: StreamRequest<'_>) -> Result<Box<dyn StreamGraph>>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_event_sender_tags_source() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = EventSender::new(EventSource::Stream(StreamId(7)), tx);
        assert!(sender.post(GraphEventKind::NewSegment));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.source, EventSource::Stream(StreamId(7)));
        assert_eq!(event.kind.name(), "new-segment");

        drop(rx);
        assert!(!sender.post(GraphEventKind::EndOfStream));
    }

    #[test]
    fn test_audio_failure_kinds() {
        assert!(GraphErrorKind::ResourceBusy.is_audio_failure());
        assert!(GraphErrorKind::Core.is_audio_failure());
        assert!(!GraphErrorKind::StreamFailed.is_audio_failure());
        assert!(!GraphErrorKind::Other.is_audio_failure());
    }

    #[test]
    fn test_stream_id_display() {
        assert_eq!(StreamId(3).to_string(), "#3");
    }
}
