//! Multi-stream playback engine.
//!
//! [`Engine`] is the facade the application shell talks to. It keeps an
//! ordered set of streams, links them into a shared mixer as needed and
//! crossfades between them. Facade calls and dispatch passes all run under
//! one reentrant control lock, so stream transitions never interleave.

use crate::chain::ChainOp;
use crate::events::PlayerEvent;
use crate::fade::{replaygain_scale, scaled_fade_length};
use crate::graph::{
    EventSender, EventSource, GraphEvent, MediaGraph, OutputElementKind, StreamRequest,
};
use crate::hooks::{AudioFilter, NoHooks, PlayerHooks, SourceOptions};
use crate::registry::Registry;
use crate::sink::{OutputSink, SinkState};
use crate::stream::{Continuation, Stream, StreamSnapshot, StreamState};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex};
use segue_core::{EngineConfig, Error, PlayType, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared between the facade and the dispatch thread.
pub(crate) struct Shared<D> {
    pub config: EngineConfig,
    pub graph: Arc<dyn MediaGraph>,
    pub hooks: Arc<dyn PlayerHooks>,
    /// Serialises facade operations and dispatch passes.
    pub control: ReentrantMutex<()>,
    pub registry: Mutex<Registry<D>>,
    pub sink: OutputSink,
    /// Number of streams attached to a mixer slot.
    pub linked: AtomicUsize,
    pub event_tx: Sender<GraphEvent>,
    pub event_rx: Receiver<GraphEvent>,
    /// Events set aside while the output was starting.
    pub requeued: Mutex<VecDeque<GraphEvent>>,
    /// Streams with a seek waiting for the next dispatch pass.
    pub pending_seeks: Mutex<Vec<crate::graph::StreamId>>,
    pub player_tx: Sender<PlayerEvent<D>>,
    pub player_rx: Receiver<PlayerEvent<D>>,
    pub running: AtomicBool,
}

impl<D: Send + Sync + 'static> Shared<D> {
    pub(crate) fn emit(&self, event: PlayerEvent<D>) {
        debug!("Emitting {} event", event.name());
        // the receiver lives in `self`, so this only fails during teardown
        let _ = self.player_tx.send(event);
    }

    pub(crate) fn events_for(&self, source: EventSource) -> EventSender {
        EventSender::new(source, self.event_tx.clone())
    }

    fn find_reusable(&self, uri: &str) -> Option<Arc<Stream<D>>> {
        let streams = self.registry.lock().all();
        streams.into_iter().find(|stream| {
            let s = stream.lock();
            s.state.can_reuse_from() && self.hooks.can_reuse_stream(uri, &s.uri)
        })
    }
}

/// Crossfading playback engine. `D` is caller data attached to each stream
/// and handed back in every [`PlayerEvent`] about it.
pub struct Engine<D: Send + Sync + 'static> {
    shared: Arc<Shared<D>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Send + Sync + 'static> Engine<D> {
    /// Create an engine driving `graph`.
    pub fn new(
        graph: Arc<dyn MediaGraph>,
        hooks: Arc<dyn PlayerHooks>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = unbounded();
        let (player_tx, player_rx) = unbounded();
        let sink = OutputSink::new(config.initial_volume);

        info!("Playback engine created");
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                graph,
                hooks,
                control: ReentrantMutex::new(()),
                registry: Mutex::new(Registry::new()),
                sink,
                linked: AtomicUsize::new(0),
                event_tx,
                event_rx,
                requeued: Mutex::new(VecDeque::new()),
                pending_seeks: Mutex::new(Vec::new()),
                player_tx,
                player_rx,
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Create an engine with no hooks and the default configuration.
    pub fn with_graph(graph: Arc<dyn MediaGraph>) -> Result<Self> {
        Self::new(graph, Arc::new(NoHooks), EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Open a URI and start prerolling it.
    ///
    /// If an existing stream can be reused for the URI it is queued to
    /// continue into it instead of building a new stream.
    pub fn open(&self, uri: &str, data: D) -> Result<()> {
        let shared = &*self.shared;
        let _control = shared.control.lock();

        let created = shared
            .sink
            .ensure_created(shared.graph.as_ref(), shared.events_for(EventSource::Output))?;
        if created {
            shared.flush_output_chain();
        }
        let data = Arc::new(data);

        if let Some(stream) = shared.find_reusable(uri) {
            let replaced = {
                let mut s = stream.lock();
                info!("Reusing stream {} ({}) for {uri}", s.uri, s.state);
                s.state = StreamState::Reusing;
                let replaced = s.next.replace(Continuation {
                    uri: uri.to_string(),
                    data,
                });
                s.answer_continuation();
                replaced
            };
            drop(replaced);
            shared.registry.lock().move_to_front(stream.id());
            return Ok(());
        }

        let id = shared.registry.lock().allocate_id();
        let mut source = SourceOptions::for_uri(uri, shared.config.network_buffer_kb);
        shared.hooks.prepare_source(uri, &mut source);
        let filters = shared.hooks.stream_filters(uri);

        let graph = shared
            .graph
            .create_stream(StreamRequest {
                id,
                uri,
                source,
                filters,
                events: shared.events_for(EventSource::Stream(id)),
                continuation_wait: shared.config.about_to_finish_wait(),
            })
            .map_err(|e| {
                warn!("Failed to create stream for {uri}: {e}");
                Error::Construction(format!("{uri}: {e}"))
            })?;

        let stream = Arc::new(Stream::new(id, uri.to_string(), data, graph));
        shared.registry.lock().push_front(Arc::clone(&stream));
        info!("Opened stream {id} for {uri}");

        if let Err(e) = shared.preroll(&stream) {
            warn!("Failed to preroll {uri}: {e}");
            shared.unlink_and_dispose(&stream);
            return Err(Error::Preroll(uri.to_string()));
        }
        Ok(())
    }

    /// Whether a stream is open and not on its way out.
    pub fn opened(&self) -> bool {
        let _control = self.shared.control.lock();
        self.shared
            .registry
            .lock()
            .find_by_state(StreamState::counts_as_opened)
            .is_some()
    }

    /// Close the stream for `uri`, or every stream.
    pub fn close(&self, uri: Option<&str>) -> Result<()> {
        let shared = &*self.shared;
        let _control = shared.control.lock();

        match uri {
            Some(uri) => {
                let stream = shared
                    .registry
                    .lock()
                    .find_by_uri(uri)
                    .ok_or_else(|| Error::NotFound(uri.to_string()))?;
                info!("Closing stream {uri}");
                shared.unlink_and_dispose(&stream);
            }
            None => {
                let streams = shared.registry.lock().all();
                if !streams.is_empty() {
                    info!("Closing all {} streams", streams.len());
                }
                for stream in streams {
                    shared.unlink_and_dispose(&stream);
                }
            }
        }
        Ok(())
    }

    /// Start playing the most recently opened stream.
    pub fn play(&self, play_type: PlayType, crossfade: Duration) -> Result<()> {
        let shared = &*self.shared;
        let _control = shared.control.lock();

        let stream = shared.registry.lock().head().ok_or(Error::NothingToPlay)?;
        shared.start_sink()?;

        let state = {
            let mut s = stream.lock();
            debug!("Playing {} ({play_type}, crossfade {crossfade:?})", s.uri);
            s.play_requested = true;
            match s.state {
                StreamState::Prerolling | StreamState::PrerollPlay => {
                    debug!("Stream {} is prerolling, will play when done", s.uri);
                    s.play_type = play_type;
                    s.crossfade = crossfade;
                    s.state = StreamState::PrerollPlay;
                }
                StreamState::SeekingPaused => {
                    debug!("Unpausing seeking stream {}", s.uri);
                    s.state = StreamState::Seeking;
                    shared.start_stream_fade(
                        stream.id(),
                        &mut s,
                        0.0,
                        1.0,
                        shared.config.pause_fade(),
                    );
                }
                StreamState::FadingOutPaused => {
                    // reverse the pause fade from wherever it got to
                    let gain = s.relative_gain();
                    let length = scaled_fade_length(shared.config.pause_fade(), 1.0 - gain);
                    debug!("Stream {} was pausing, fading back in", s.uri);
                    s.state = StreamState::FadingIn;
                    shared.start_stream_fade(stream.id(), &mut s, gain, 1.0, length);
                }
                StreamState::PendingRemove => {
                    debug!("Can't play stream {} in pending remove state", s.uri);
                }
                _ => {}
            }
            s.state
        };

        match state {
            StreamState::FadingIn
            | StreamState::FadingOut
            | StreamState::Playing
            | StreamState::Seeking
            | StreamState::SeekingEos => {
                debug!("Stream {} is already playing", stream.id());
                shared.emit(PlayerEvent::PlayingStream(stream.data()));
                Ok(())
            }
            StreamState::Paused => {
                debug!("Unpausing stream {}", stream.id());
                {
                    let mut s = stream.lock();
                    s.resume_after_buffering = false;
                    shared.start_stream_fade(
                        stream.id(),
                        &mut s,
                        0.0,
                        1.0,
                        shared.config.pause_fade(),
                    );
                }
                shared.link_and_unblock(&stream)
            }
            StreamState::Waiting | StreamState::WaitingEos => {
                {
                    let mut s = stream.lock();
                    s.play_type = play_type;
                    s.crossfade = crossfade;
                }
                shared.actually_start(&stream)
            }
            StreamState::Reusing => match play_type {
                PlayType::Replace | PlayType::Crossfade => {
                    let suspended = {
                        let mut s = stream.lock();
                        s.play_type = play_type;
                        s.suspended
                    };
                    if suspended {
                        debug!("Reusing and restarting paused stream {}", stream.id());
                        shared.reuse_and_relink(&stream);
                    } else {
                        debug!("Unlinking stream {} for reuse", stream.id());
                        shared.unlink_and_block(&stream);
                    }
                    Ok(())
                }
                PlayType::AfterEos => {
                    debug!("Waiting for EOS before reusing stream {}", stream.id());
                    let mut s = stream.lock();
                    s.play_type = play_type;
                    s.answer_continuation();
                    Ok(())
                }
            },
            _ => Ok(()),
        }
    }

    /// Pause whatever is playing, fading it out first.
    pub fn pause(&self) {
        let shared = &*self.shared;
        let _control = shared.control.lock();

        let streams = shared.registry.lock().all();
        for stream in streams {
            let mut s = stream.lock();
            match s.state {
                StreamState::Waiting | StreamState::WaitingEos => {
                    debug!("Stream {} is not yet playing, can't pause", s.uri);
                }
                StreamState::Prerolling | StreamState::PrerollPlay => {
                    debug!("Stream {} is prerolling, can't pause", s.uri);
                }
                StreamState::Reusing => debug!("Stream {} is being reused, can't pause", s.uri),
                StreamState::Paused
                | StreamState::SeekingPaused
                | StreamState::FadingOutPaused => {
                    debug!("Stream {} is already paused", s.uri);
                    s.resume_after_buffering = false;
                    return;
                }
                StreamState::FadingIn | StreamState::Playing => {
                    let (start, length) = if s.state == StreamState::FadingIn {
                        let gain = s.relative_gain();
                        (gain, scaled_fade_length(shared.config.pause_fade(), gain))
                    } else {
                        (1.0, shared.config.pause_fade())
                    };
                    debug!("Pausing stream {} -> fading out", s.uri);
                    s.state = StreamState::FadingOutPaused;
                    shared.start_stream_fade(stream.id(), &mut s, start, 0.0, length);
                    return;
                }
                StreamState::Seeking | StreamState::SeekingEos => {
                    debug!("Pausing seeking stream {}", s.uri);
                    s.state = StreamState::SeekingPaused;
                    return;
                }
                StreamState::FadingOut => {
                    debug!("Stream {} is fading out, not pausing it", s.uri);
                }
                StreamState::PendingRemove => debug!("Stream {} is done, can't pause", s.uri),
            }
        }
        debug!("Couldn't find a stream to pause");
    }

    /// Whether the output is running and a stream is audible.
    pub fn playing(&self) -> bool {
        let shared = &*self.shared;
        let _control = shared.control.lock();
        shared.sink.state() == SinkState::Playing
            && shared
                .registry
                .lock()
                .find_by_state(StreamState::is_active)
                .is_some()
    }

    pub fn seekable(&self) -> bool {
        let shared = &*self.shared;
        let _control = shared.control.lock();
        let stream = shared
            .registry
            .lock()
            .find_by_state(StreamState::answers_seekable);
        stream.map_or(true, |stream| stream.lock().graph.seekable())
    }

    /// Seek the current stream.
    pub fn set_time(&self, time: Duration) {
        let shared = &*self.shared;
        let _control = shared.control.lock();

        let Some(stream) = shared
            .registry
            .lock()
            .find_by_state(StreamState::accepts_seek)
        else {
            debug!("Got seek request with no playing stream");
            return;
        };

        let mut s = stream.lock();
        s.seek_target = time;
        match s.state {
            StreamState::Paused => {
                debug!("Seeking in paused stream {}", s.uri);
                drop(s);
                shared.perform_seek(&stream);
            }
            StreamState::FadingOutPaused => {
                // the fade is pointless once we're seeking
                debug!("Seeking in pausing stream {}", s.uri);
                s.cancel_fade();
                s.state = StreamState::SeekingPaused;
                drop(s);
                shared.unlink_and_block(&stream);
            }
            StreamState::FadingIn | StreamState::Playing => {
                debug!("Seeking in playing stream {}", s.uri);
                s.state = StreamState::Seeking;
                drop(s);
                shared.perform_seek(&stream);
            }
            StreamState::PendingRemove => {
                // the stream hit EOS and is still around; bring it back
                debug!("Seeking in EOS stream {}", s.uri);
                s.state = StreamState::SeekingEos;
                s.graph.block();
                drop(s);
                shared.perform_seek(&stream);
            }
            _ => {}
        }
    }

    /// Position of the current stream.
    pub fn get_time(&self) -> Option<Duration> {
        let _control = self.shared.control.lock();
        self.shared
            .current_times()
            .map(|(_, position, _)| position)
    }

    /// Set the output volume, clamped to 0..=1.
    pub fn set_volume(&self, volume: f64) {
        let _control = self.shared.control.lock();
        let volume = volume.clamp(0.0, 1.0);
        debug!("Setting volume to {volume:.3}");
        self.shared.sink.set_volume(volume);
    }

    pub fn get_volume(&self) -> f64 {
        self.shared.sink.volume()
    }

    /// Apply replaygain values to the stream for `uri`.
    pub fn set_replaygain(
        &self,
        uri: &str,
        track_gain: f64,
        track_peak: f64,
        album_gain: f64,
        album_peak: f64,
    ) {
        let shared = &*self.shared;
        let _control = shared.control.lock();

        let Some(stream) = shared.registry.lock().find_by_uri(uri) else {
            debug!("Can't find stream for {uri}");
            return;
        };
        let Some(scale) = replaygain_scale(track_gain, track_peak, album_gain, album_peak) else {
            return;
        };

        let mut s = stream.lock();
        debug!("Replaygain scale for {uri} is {scale:.3}");
        s.replaygain_scale = scale;
        match s.state {
            // fades carry the scale in their endpoints; paused streams sit at zero
            StreamState::FadingIn
            | StreamState::FadingOut
            | StreamState::FadingOutPaused
            | StreamState::Paused
            | StreamState::PendingRemove => {}
            _ => s.graph.set_gain(scale),
        }
    }

    /// Receiver for shell notifications.
    pub fn events(&self) -> Receiver<PlayerEvent<D>> {
        self.shared.player_rx.clone()
    }

    pub fn try_recv_event(&self) -> Option<PlayerEvent<D>> {
        self.shared.player_rx.try_recv().ok()
    }

    /// Apply every pending graph event and run due timers.
    ///
    /// Returns the number of events handled.
    pub fn dispatch_pending(&self) -> usize {
        self.shared.dispatch_pending()
    }

    /// Spawn a thread that dispatches events until [`Engine::shutdown`].
    pub fn run_event_loop(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("segue-dispatch".to_string())
            .spawn(move || shared.event_loop())
            .map_err(|e| Error::Internal(format!("failed to spawn dispatch thread: {e}")))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the dispatch thread, close every stream and stop the output.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("Dispatch thread panicked");
            }
        }

        let _control = self.shared.control.lock();
        if let Err(e) = self.close(None) {
            warn!("Failed to close streams: {e}");
        }
        if let Err(e) = self.shared.sink.stop() {
            warn!("Failed to stop output: {e}");
        }
        info!("Playback engine shut down");
    }

    /// Insert a filter between the mixer and the device.
    ///
    /// Takes effect once the output exists and, while it plays, once data
    /// is held back ahead of the filter chain.
    pub fn add_filter(&self, filter: Box<dyn AudioFilter>) -> Result<()> {
        self.shared
            .change_output_chain(ChainOp::Insert(OutputElementKind::Filter, filter))
    }

    pub fn remove_filter(&self, name: &str) -> Result<()> {
        self.shared
            .change_output_chain(ChainOp::Remove(OutputElementKind::Filter, name.to_string()))
    }

    /// Attach a tee branch that receives a copy of the mixed audio.
    pub fn add_tee(&self, tee: Box<dyn AudioFilter>) -> Result<()> {
        self.shared
            .change_output_chain(ChainOp::Insert(OutputElementKind::Tee, tee))
    }

    pub fn remove_tee(&self, name: &str) -> Result<()> {
        self.shared
            .change_output_chain(ChainOp::Remove(OutputElementKind::Tee, name.to_string()))
    }

    /// Filters and tees currently in the output, in insertion order.
    pub fn output_elements(&self) -> Vec<(OutputElementKind, String)> {
        self.shared.sink.output_elements()
    }

    /// Snapshot of every stream, most recent first.
    pub fn stream_states(&self) -> Vec<StreamSnapshot> {
        let _control = self.shared.control.lock();
        let streams = self.shared.registry.lock().all();
        streams.iter().map(|stream| stream.snapshot()).collect()
    }

    /// Value of the linked stream counter.
    pub fn linked_stream_count(&self) -> usize {
        self.shared.linked.load(Ordering::SeqCst)
    }

    pub fn sink_state(&self) -> SinkState {
        self.shared.sink.state()
    }
}

impl<D: Send + Sync + 'static> Drop for Engine<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
