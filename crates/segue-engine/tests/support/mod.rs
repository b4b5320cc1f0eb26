//! Shared helpers for the engine integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use parking_lot::Mutex;
use segue_core::{EngineConfig, PlayType};
use segue_engine::sim::{SimGraph, SimStreamHandle};
use segue_engine::{
    AudioFilter, Engine, NoHooks, PlayerEvent, PlayerHooks, SourceOptions, StreamGraph,
    StreamState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Config with timers far enough out that they never fire on their own.
pub fn quiet_config() -> EngineConfig {
    EngineConfig {
        idle_stop_delay_ms: 60_000,
        tick_interval_ms: 60_000,
        ..EngineConfig::default()
    }
}

pub fn engine(sim: &SimGraph) -> Engine<String> {
    engine_with(sim, Arc::new(NoHooks), quiet_config())
}

/// Route engine logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn engine_with<D: Send + Sync + 'static>(
    sim: &SimGraph,
    hooks: Arc<dyn PlayerHooks>,
    config: EngineConfig,
) -> Engine<D> {
    init_logging();
    Engine::new(Arc::new(sim.clone()), hooks, config).unwrap()
}

/// Dispatch until no graph events are left.
pub fn settle<D: Send + Sync + 'static>(engine: &Engine<D>) {
    while engine.dispatch_pending() > 0 {}
}

pub fn drain<D: Send + Sync + 'static>(engine: &Engine<D>) -> Vec<PlayerEvent<D>> {
    engine.events().try_iter().collect()
}

/// Names of the streams announced as playing, in order.
pub fn playing_names(events: &[PlayerEvent<String>]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::PlayingStream(data) => Some(data.to_string()),
            _ => None,
        })
        .collect()
}

/// Open `uri` (using the URI as stream data), settle, and return its handle.
pub fn open(engine: &Engine<String>, sim: &SimGraph, uri: &str) -> SimStreamHandle {
    engine.open(uri, uri.to_string()).unwrap();
    settle(engine);
    sim.stream(uri).unwrap()
}

/// Open and start `uri` with a plain replace.
pub fn start(engine: &Engine<String>, sim: &SimGraph, uri: &str) -> SimStreamHandle {
    let handle = open(engine, sim, uri);
    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(engine);
    handle
}

pub fn state_of<D: Send + Sync + 'static>(engine: &Engine<D>, uri: &str) -> Option<StreamState> {
    engine
        .stream_states()
        .into_iter()
        .find(|s| s.uri == uri)
        .map(|s| s.state)
}

/// The linked counter agrees with the streams and the mixer.
pub fn assert_linked_consistent<D: Send + Sync + 'static>(engine: &Engine<D>, sim: &SimGraph) {
    let linked = engine.stream_states().iter().filter(|s| s.linked).count();
    assert_eq!(engine.linked_stream_count(), linked);
    assert_eq!(sim.output().slots_in_use(), linked);
}

/// No more than one stream is playing or fading in.
pub fn assert_at_most_one_active<D: Send + Sync + 'static>(engine: &Engine<D>) {
    let states = engine.stream_states();
    let active = states.iter().filter(|s| s.state.is_active()).count();
    assert!(active <= 1, "{active} active streams: {states:?}");
}

/// Stream data that counts how often it is dropped.
#[derive(Debug)]
pub struct Track {
    pub name: &'static str,
    drops: Arc<AtomicUsize>,
}

impl Track {
    pub fn new(name: &'static str, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            name,
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct NamedFilter(pub &'static str);

impl AudioFilter for NamedFilter {
    fn name(&self) -> &str {
        self.0
    }
}

/// Hooks that allow reusing any stream and record what they were asked.
#[derive(Default)]
pub struct RecordingHooks {
    pub reuse: bool,
    pub reused: Mutex<Vec<(String, String)>>,
    pub missing: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn reusing() -> Self {
        Self {
            reuse: true,
            ..Self::default()
        }
    }
}

impl PlayerHooks for RecordingHooks {
    fn prepare_source(&self, _uri: &str, source: &mut SourceOptions) {
        source.user_agent = Some("segue-tests".to_string());
    }

    fn can_reuse_stream(&self, _new_uri: &str, _old_uri: &str) -> bool {
        self.reuse
    }

    fn reuse_stream(&self, new_uri: &str, old_uri: &str, _graph: &mut dyn StreamGraph) {
        self.reused
            .lock()
            .push((old_uri.to_string(), new_uri.to_string()));
    }

    fn stream_filters(&self, _uri: &str) -> Vec<Box<dyn AudioFilter>> {
        vec![Box::new(NamedFilter("equalizer"))]
    }

    fn missing_plugins(&self, _details: &[String], descriptions: &[String]) {
        self.missing.lock().extend(descriptions.iter().cloned());
    }
}
