//! In-process simulated media graph.
//!
//! [`SimGraph`] implements [`MediaGraph`] without touching any audio
//! hardware. Time only moves when [`SimGraph::advance`] is called, which
//! makes it suitable for driving the engine deterministically from tests
//! and from the command line demo. Handles returned by [`SimGraph::stream`]
//! and [`SimGraph::output`] inject the notifications a real graph would
//! produce (buffering, tags, errors, end of stream) and expose what the
//! engine did to each sub-graph.

use crate::fade::Envelope;
use crate::graph::{
    EventSender, FlushScope, GraphErrorKind, GraphEventKind, MediaGraph, MixerSlot,
    OutputElementKind, OutputPath, PrerollOutcome, StreamGraph, StreamId, StreamRequest,
};
use crate::hooks::{AudioFilter, SourceOptions};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use segue_core::{Error, Result, TagField, TagValue};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Smallest gain change reported as a `GainChanged` event.
const GAIN_REPORT_THRESHOLD: f64 = 1e-6;

/// How a simulated stream behaves when asked to preroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimPreroll {
    /// Preroll completes at once and is reported as a suspension.
    #[default]
    Async,
    /// Preroll stays pending until [`SimStreamHandle::finish_preroll`].
    Manual,
    /// Preroll completes synchronously.
    Sync,
    /// Live source that can't preroll.
    Live,
}

struct SimStream {
    uri: String,
    events: EventSender,
    source: SourceOptions,
    filters: Vec<String>,
    blocked: bool,
    /// Block confirmations wait for [`SimStreamHandle::confirm_block`].
    manual_block: bool,
    block_pending: bool,
    slot: Option<MixerSlot>,
    playing: bool,
    stopped: bool,
    disposed: bool,
    position: Duration,
    duration: Option<Duration>,
    eos_sent: bool,
    continuation_wait: Duration,
    gain: f64,
    envelope: Option<Envelope>,
    seeks: Vec<(Duration, FlushScope)>,
}

impl SimStream {
    fn post(&self, kind: GraphEventKind) {
        if !self.events.post(kind) {
            trace!("Dropped event for disposed stream {}", self.uri);
        }
    }

    /// Re-evaluate the envelope and report a change in live gain.
    fn update_gain(&mut self) {
        let Some(gain) = self
            .envelope
            .as_ref()
            .and_then(|envelope| envelope.value_at(self.position))
        else {
            return;
        };
        if (gain - self.gain).abs() > GAIN_REPORT_THRESHOLD {
            self.gain = gain;
            self.post(GraphEventKind::GainChanged(gain));
        }
    }
}

#[derive(Default)]
struct SimOutput {
    events: Option<EventSender>,
    started: bool,
    playing: bool,
    ready_on_start: bool,
    fail_next_start: Option<String>,
    device_volume_support: bool,
    device_volume: Option<f64>,
    mixer_volume: f64,
    next_slot: u32,
    slots: BTreeSet<u32>,
    starts: u32,
    chain: Vec<(OutputElementKind, String)>,
    chain_blocked: bool,
}

impl SimOutput {
    fn post(&self, kind: GraphEventKind) {
        if let Some(events) = &self.events {
            events.post(kind);
        }
    }
}

struct SimWorld {
    clock: Duration,
    preroll: SimPreroll,
    seekable: bool,
    default_duration: Option<Duration>,
    durations: BTreeMap<String, Duration>,
    fail_create: HashSet<String>,
    fail_preroll: HashSet<String>,
    streams: BTreeMap<StreamId, SimStream>,
    output: SimOutput,
}

type World = Arc<Mutex<SimWorld>>;

/// Simulated media graph with a manually advanced clock.
#[derive(Clone)]
pub struct SimGraph {
    world: World,
}

impl Default for SimGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGraph {
    /// Graph whose streams preroll immediately and last three minutes.
    pub fn new() -> Self {
        Self {
            world: Arc::new(Mutex::new(SimWorld {
                clock: Duration::ZERO,
                preroll: SimPreroll::default(),
                seekable: true,
                default_duration: Some(Duration::from_secs(180)),
                durations: BTreeMap::new(),
                fail_create: HashSet::new(),
                fail_preroll: HashSet::new(),
                streams: BTreeMap::new(),
                output: SimOutput {
                    ready_on_start: true,
                    mixer_volume: 1.0,
                    ..SimOutput::default()
                },
            })),
        }
    }

    pub fn set_preroll(&self, mode: SimPreroll) {
        self.world.lock().preroll = mode;
    }

    pub fn set_seekable(&self, seekable: bool) {
        self.world.lock().seekable = seekable;
    }

    /// Duration of streams without a specific one; `None` for endless streams.
    pub fn set_default_duration(&self, duration: Option<Duration>) {
        self.world.lock().default_duration = duration;
    }

    pub fn set_duration(&self, uri: &str, duration: Duration) {
        self.world.lock().durations.insert(uri.to_string(), duration);
    }

    /// Make building a stream for `uri` fail.
    pub fn fail_create(&self, uri: &str) {
        self.world.lock().fail_create.insert(uri.to_string());
    }

    /// Make prerolling a stream for `uri` fail.
    pub fn fail_preroll(&self, uri: &str) {
        self.world.lock().fail_preroll.insert(uri.to_string());
    }

    /// Current mixer clock.
    pub fn clock(&self) -> Duration {
        self.world.lock().clock
    }

    /// Move time forward.
    ///
    /// The mixer clock only runs while the output plays, and a stream only
    /// advances while it is linked, unblocked and playing. Fades are
    /// evaluated at the new position and streams that run past their
    /// duration report end of stream once.
    pub fn advance(&self, by: Duration) {
        let mut world = self.world.lock();
        if !world.output.playing {
            trace!("Output not playing, clock stays at {:?}", world.clock);
            return;
        }
        world.clock += by;

        for stream in world.streams.values_mut() {
            if stream.disposed || stream.slot.is_none() || stream.blocked || !stream.playing {
                continue;
            }
            if stream.eos_sent {
                continue;
            }
            stream.position += by;
            if let Some(duration) = stream.duration {
                stream.position = stream.position.min(duration);
            }
            stream.post(GraphEventKind::BufferFlowing);
            stream.update_gain();

            if stream.duration.is_some_and(|d| stream.position >= d) {
                debug!("Simulated stream {} reached its end", stream.uri);
                stream.eos_sent = true;
                stream.post(GraphEventKind::EndOfStream);
            }
        }
    }

    /// Handle on the most recent live stream for `uri`.
    pub fn stream(&self, uri: &str) -> Option<SimStreamHandle> {
        let world = self.world.lock();
        world
            .streams
            .iter()
            .rev()
            .find(|(_, s)| !s.disposed && s.uri == uri)
            .map(|(id, _)| SimStreamHandle {
                id: *id,
                world: Arc::clone(&self.world),
            })
    }

    /// Number of stream sub-graphs that haven't been dropped.
    pub fn live_streams(&self) -> usize {
        self.world
            .lock()
            .streams
            .values()
            .filter(|s| !s.disposed)
            .count()
    }

    pub fn output(&self) -> SimOutputHandle {
        SimOutputHandle {
            world: Arc::clone(&self.world),
        }
    }
}

impl MediaGraph for SimGraph {
    fn create_output(&self, events: EventSender) -> Result<Box<dyn OutputPath>> {
        self.world.lock().output.events = Some(events);
        Ok(Box::new(SimOutputPath {
            world: Arc::clone(&self.world),
        }))
    }

    fn create_stream(&self, request: StreamRequest<'_>) -> Result<Box<dyn StreamGraph>> {
        let mut world = self.world.lock();
        if world.fail_create.contains(request.uri) {
            return Err(Error::Construction(format!(
                "no source for {}",
                request.uri
            )));
        }

        let duration = world
            .durations
            .get(request.uri)
            .copied()
            .or(world.default_duration);
        world.streams.insert(
            request.id,
            SimStream {
                uri: request.uri.to_string(),
                events: request.events,
                source: request.source,
                filters: request.filters.iter().map(|f| f.name().to_string()).collect(),
                blocked: false,
                manual_block: false,
                block_pending: false,
                slot: None,
                playing: false,
                stopped: false,
                disposed: false,
                position: Duration::ZERO,
                duration,
                eos_sent: false,
                continuation_wait: request.continuation_wait,
                gain: 1.0,
                envelope: None,
                seeks: Vec::new(),
            },
        );
        debug!("Simulated stream {} created for {}", request.id, request.uri);

        Ok(Box::new(SimStreamGraph {
            id: request.id,
            world: Arc::clone(&self.world),
        }))
    }
}

/// The engine's side of a simulated stream.
struct SimStreamGraph {
    id: StreamId,
    world: World,
}

impl SimStreamGraph {
    fn with<R>(&self, f: impl FnOnce(&mut SimStream) -> R) -> Option<R> {
        self.world.lock().streams.get_mut(&self.id).map(f)
    }
}

impl StreamGraph for SimStreamGraph {
    fn preroll(&mut self) -> Result<PrerollOutcome> {
        let mut world = self.world.lock();
        let mode = world.preroll;
        let failing = world
            .streams
            .get(&self.id)
            .is_some_and(|s| world.fail_preroll.contains(&s.uri));
        let stream = world
            .streams
            .get_mut(&self.id)
            .ok_or_else(|| Error::Internal(format!("unknown stream {}", self.id)))?;
        if failing {
            return Err(Error::Preroll(stream.uri.clone()));
        }

        match mode {
            SimPreroll::Async => {
                stream.blocked = true;
                stream.post(GraphEventKind::Suspended);
                Ok(PrerollOutcome::Pending)
            }
            SimPreroll::Manual => Ok(PrerollOutcome::Pending),
            SimPreroll::Sync => {
                stream.blocked = true;
                Ok(PrerollOutcome::Ready)
            }
            SimPreroll::Live => Ok(PrerollOutcome::NoPreroll),
        }
    }

    fn block(&mut self) {
        self.with(|s| {
            s.blocked = true;
            if s.manual_block {
                trace!("Block on {} waits for confirmation", s.uri);
                s.block_pending = true;
            } else {
                s.post(GraphEventKind::Suspended);
            }
        });
    }

    fn unblock(&mut self) {
        self.with(|s| {
            s.blocked = false;
            s.block_pending = false;
            s.post(GraphEventKind::Resumed);
        });
    }

    fn attach(&mut self, slot: MixerSlot) -> Result<()> {
        self.with(|s| s.slot = Some(slot))
            .ok_or_else(|| Error::Link(format!("unknown stream {}", self.id)))
    }

    fn detach(&mut self, slot: MixerSlot) {
        self.with(|s| {
            if s.slot == Some(slot) {
                s.slot = None;
            }
        });
    }

    fn play(&mut self) -> Result<()> {
        self.with(|s| {
            s.playing = true;
            s.stopped = false;
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.with(|s| {
            s.playing = false;
            s.stopped = true;
        });
    }

    fn position(&self) -> Option<Duration> {
        self.world.lock().streams.get(&self.id).map(|s| s.position)
    }

    fn duration(&self) -> Option<Duration> {
        self.world.lock().streams.get(&self.id).and_then(|s| s.duration)
    }

    fn seekable(&self) -> bool {
        self.world.lock().seekable
    }

    fn seek(&mut self, target: Duration, scope: FlushScope) {
        self.with(|s| {
            s.position = s.duration.map_or(target, |d| target.min(d));
            s.eos_sent = false;
            s.seeks.push((target, scope));
            s.update_gain();
            s.post(GraphEventKind::NewSegment);
        });
    }

    fn gain(&self) -> f64 {
        self.world
            .lock()
            .streams
            .get(&self.id)
            .map_or(1.0, |s| s.gain)
    }

    fn set_gain(&mut self, gain: f64) {
        self.with(|s| {
            s.gain = gain;
            s.envelope = None;
        });
    }

    fn set_envelope(&mut self, envelope: Envelope) {
        self.with(|s| s.envelope = Some(envelope));
    }
}

impl Drop for SimStreamGraph {
    fn drop(&mut self) {
        self.with(|s| {
            trace!("Simulated stream {} disposed", s.uri);
            s.disposed = true;
            s.playing = false;
            s.slot = None;
        });
    }
}

/// The engine's side of the simulated output.
struct SimOutputPath {
    world: World,
}

impl OutputPath for SimOutputPath {
    fn start(&mut self) -> Result<()> {
        let mut world = self.world.lock();
        let output = &mut world.output;
        output.started = true;
        output.starts += 1;
        if let Some(message) = output.fail_next_start.take() {
            output.post(GraphEventKind::OutputError(message));
        } else if output.ready_on_start {
            output.post(GraphEventKind::OutputReady);
        }
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.world.lock().output.playing = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut world = self.world.lock();
        world.output.started = false;
        world.output.playing = false;
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        let world = self.world.lock();
        world.output.playing.then_some(world.clock)
    }

    fn request_slot(&mut self) -> Result<MixerSlot> {
        let mut world = self.world.lock();
        let output = &mut world.output;
        let slot = output.next_slot;
        output.next_slot += 1;
        output.slots.insert(slot);
        Ok(MixerSlot(slot))
    }

    fn release_slot(&mut self, slot: MixerSlot) {
        self.world.lock().output.slots.remove(&slot.0);
    }

    fn has_device_volume(&self) -> bool {
        self.world.lock().output.device_volume_support
    }

    fn set_device_volume(&mut self, volume: f64) {
        self.world.lock().output.device_volume = Some(volume);
    }

    fn set_mixer_volume(&mut self, volume: f64) {
        self.world.lock().output.mixer_volume = volume;
    }

    fn block_chain(&mut self) {
        let mut world = self.world.lock();
        world.output.chain_blocked = true;
        world.output.post(GraphEventKind::ChainBlocked);
    }

    fn unblock_chain(&mut self) {
        self.world.lock().output.chain_blocked = false;
    }

    fn insert_element(
        &mut self,
        kind: OutputElementKind,
        element: Box<dyn AudioFilter>,
    ) -> Result<()> {
        let mut world = self.world.lock();
        let output = &mut world.output;
        if output.playing && !output.chain_blocked {
            return Err(Error::Output(format!(
                "{kind} {} inserted while data is flowing",
                element.name()
            )));
        }
        output.chain.push((kind, element.name().to_string()));
        Ok(())
    }

    fn remove_element(&mut self, kind: OutputElementKind, name: &str) -> Result<()> {
        let mut world = self.world.lock();
        let output = &mut world.output;
        if output.playing && !output.chain_blocked {
            return Err(Error::Output(format!(
                "{kind} {name} removed while data is flowing"
            )));
        }
        let index = output
            .chain
            .iter()
            .position(|(k, n)| *k == kind && n == name)
            .ok_or_else(|| Error::NotFound(format!("output {kind} {name}")))?;
        output.chain.remove(index);
        Ok(())
    }
}

/// Test-side handle on a simulated stream.
#[derive(Clone)]
pub struct SimStreamHandle {
    id: StreamId,
    world: World,
}

impl SimStreamHandle {
    fn with<R: Default>(&self, f: impl FnOnce(&mut SimStream) -> R) -> R {
        self.world
            .lock()
            .streams
            .get_mut(&self.id)
            .map(f)
            .unwrap_or_default()
    }

    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// Complete a manual preroll.
    pub fn finish_preroll(&self) {
        self.with(|s| {
            s.blocked = true;
            s.post(GraphEventKind::Suspended);
        });
    }

    /// Hold back block confirmations until [`Self::confirm_block`], as a
    /// decoder does while the next buffer is still on its way to the pad.
    pub fn set_manual_block(&self, manual: bool) {
        self.with(|s| s.manual_block = manual);
    }

    /// Deliver a held block confirmation.
    pub fn confirm_block(&self) {
        self.with(|s| {
            if s.block_pending {
                s.block_pending = false;
                s.post(GraphEventKind::Suspended);
            }
        });
    }

    /// Report end of stream now, regardless of position.
    pub fn end_of_stream(&self) {
        self.with(|s| {
            s.eos_sent = true;
            s.post(GraphEventKind::EndOfStream);
        });
    }

    /// Finish the current URI and carry on into `uri` without a gap, as a
    /// decoder does after being handed a continuation.
    pub fn continue_into(&self, uri: &str) {
        let mut world = self.world.lock();
        let duration = world
            .durations
            .get(uri)
            .copied()
            .or(world.default_duration);
        if let Some(s) = world.streams.get_mut(&self.id) {
            s.post(GraphEventKind::EndOfStream);
            s.uri = uri.to_string();
            s.duration = duration;
            s.position = Duration::ZERO;
            s.eos_sent = false;
            s.post(GraphEventKind::NewSegment);
        }
    }

    /// Announce that the decoder is about to finish and return the channel
    /// its answer arrives on.
    pub fn request_continuation(&self) -> Receiver<Option<String>> {
        let (tx, rx) = bounded(1);
        self.with(|s| s.post(GraphEventKind::AboutToFinish(tx)));
        rx
    }

    /// Announce that the decoder is about to finish and block, for no
    /// longer than the stream's continuation wait, on a URI to continue
    /// with. Needs a running dispatch loop.
    pub fn about_to_finish(&self) -> Option<String> {
        let wait = self.continuation_wait();
        self.request_continuation()
            .recv_timeout(wait)
            .ok()
            .flatten()
    }

    pub fn continuation_wait(&self) -> Duration {
        self.with(|s| s.continuation_wait)
    }

    pub fn buffering(&self, percent: u8) {
        self.with(|s| s.post(GraphEventKind::Buffering(percent)));
    }

    pub fn error(&self, kind: GraphErrorKind, message: &str) {
        self.with(|s| {
            s.post(GraphEventKind::Error {
                kind,
                message: message.to_string(),
            });
        });
    }

    pub fn tag(&self, field: TagField, value: impl Into<TagValue>) {
        let value = value.into();
        self.with(|s| s.post(GraphEventKind::Tag(field, value)));
    }

    pub fn image(&self, image: Bytes) {
        self.with(|s| s.post(GraphEventKind::Image(image)));
    }

    pub fn application(&self, name: &str) {
        self.with(|s| s.post(GraphEventKind::Application(name.to_string())));
    }

    pub fn redirect(&self, uri: &str) {
        self.with(|s| s.post(GraphEventKind::Redirect(uri.to_string())));
    }

    pub fn missing_plugin(&self, detail: &str, description: &str) {
        self.with(|s| {
            s.post(GraphEventKind::MissingPlugin {
                detail: detail.to_string(),
                description: description.to_string(),
            });
        });
    }

    pub fn uri(&self) -> String {
        self.with(|s| s.uri.clone())
    }

    pub fn gain(&self) -> f64 {
        self.with(|s| s.gain)
    }

    pub fn position(&self) -> Duration {
        self.with(|s| s.position)
    }

    pub fn is_linked(&self) -> bool {
        self.with(|s| s.slot.is_some())
    }

    pub fn is_blocked(&self) -> bool {
        self.with(|s| s.blocked)
    }

    pub fn is_playing(&self) -> bool {
        self.with(|s| s.playing)
    }

    pub fn is_stopped(&self) -> bool {
        self.with(|s| s.stopped)
    }

    /// The engine dropped this sub-graph.
    pub fn is_disposed(&self) -> bool {
        self.world
            .lock()
            .streams
            .get(&self.id)
            .map_or(true, |s| s.disposed)
    }

    /// Every seek performed, with its flush scope.
    pub fn seeks(&self) -> Vec<(Duration, FlushScope)> {
        self.with(|s| s.seeks.clone())
    }

    pub fn source(&self) -> SourceOptions {
        self.with(|s| s.source.clone())
    }

    /// Names of the filters inserted into the stream.
    pub fn filters(&self) -> Vec<String> {
        self.with(|s| s.filters.clone())
    }
}

/// Test-side handle on the simulated output.
#[derive(Clone)]
pub struct SimOutputHandle {
    world: World,
}

impl SimOutputHandle {
    /// Whether the device answers `start` with a ready notification.
    pub fn set_ready_on_start(&self, ready: bool) {
        self.world.lock().output.ready_on_start = ready;
    }

    /// Make the next start report an error instead of becoming ready.
    pub fn fail_next_start(&self, message: &str) {
        self.world.lock().output.fail_next_start = Some(message.to_string());
    }

    /// Give the device a native volume control starting at `volume`, or
    /// take it away with `None`.
    pub fn set_device_volume_support(&self, volume: Option<f64>) {
        let mut world = self.world.lock();
        world.output.device_volume_support = volume.is_some();
        world.output.device_volume = volume;
    }

    /// The device changed its own volume.
    pub fn report_device_volume(&self, volume: f64) {
        let mut world = self.world.lock();
        world.output.device_volume = Some(volume);
        world.output.post(GraphEventKind::OutputVolumeChanged(volume));
    }

    /// The device failed while running.
    pub fn report_error(&self, message: &str) {
        self.world
            .lock()
            .output
            .post(GraphEventKind::OutputError(message.to_string()));
    }

    pub fn is_started(&self) -> bool {
        self.world.lock().output.started
    }

    pub fn is_playing(&self) -> bool {
        self.world.lock().output.playing
    }

    pub fn start_count(&self) -> u32 {
        self.world.lock().output.starts
    }

    pub fn device_volume(&self) -> Option<f64> {
        self.world.lock().output.device_volume
    }

    pub fn mixer_volume(&self) -> f64 {
        self.world.lock().output.mixer_volume
    }

    /// Number of mixer slots in use.
    pub fn slots_in_use(&self) -> usize {
        self.world.lock().output.slots.len()
    }

    /// Elements in the output, in order.
    pub fn chain(&self) -> Vec<(OutputElementKind, String)> {
        self.world.lock().output.chain.clone()
    }

    pub fn is_chain_blocked(&self) -> bool {
        self.world.lock().output.chain_blocked
    }
}
