//! # segue-engine
//!
//! Multi-stream playback engine with crossfading and gapless transitions.
//!
//! Features:
//! - Ordered stream registry with a per-stream lifecycle state machine
//! - Gain envelope fades for crossfades, pause and resume
//! - Lazy output start with an idle stop once nothing is linked
//! - Stream reuse for gapless continuation into the next URI
//! - Filters and tees on the shared output, changed while it plays
//!
//! The engine drives an abstract [`MediaGraph`]; [`sim::SimGraph`] is an
//! in-process implementation with a manually advanced clock.

mod chain;
mod dispatch;
pub mod engine;
pub mod events;
pub mod fade;
pub mod graph;
pub mod hooks;
mod link;
mod registry;
pub mod sim;
mod sink;
pub mod stream;

pub use engine::Engine;
pub use events::PlayerEvent;
pub use graph::{
    EventSender, EventSource, FlushScope, GraphErrorKind, GraphEvent, GraphEventKind, MediaGraph,
    MixerSlot, OutputElementKind, OutputPath, PrerollOutcome, StreamGraph, StreamId,
    StreamRequest,
};
pub use hooks::{AudioFilter, NoHooks, PlayerHooks, SourceOptions};
pub use sink::SinkState;
pub use stream::{StreamSnapshot, StreamState};
