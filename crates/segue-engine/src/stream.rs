//! Per-URI stream state.
//!
//! A [`Stream`] owns one stream sub-graph together with the bookkeeping the
//! engine needs to move it through its lifecycle: preroll, linking into the
//! mixer, fades, seeks, reuse and eventual removal. Transitions that involve
//! other streams or the output live on the engine; this module only holds
//! what can be decided by looking at a single stream.

use crate::fade::{Envelope, FadeDirection, FadeSpec};
use crate::graph::{MixerSlot, StreamGraph, StreamId};
use crate::hooks::PlayerHooks;
use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, MutexGuard};
use segue_core::{PlayType, TagField, TagValue};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Decoding up to the first buffer.
    Prerolling,
    /// Prerolling, and the caller has already asked to play it.
    PrerollPlay,
    /// Prerolled and suspended, waiting for play().
    Waiting,
    /// Waiting for the stream in front of it to end.
    WaitingEos,
    FadingIn,
    Playing,
    /// A seek is being performed before resuming playback.
    Seeking,
    /// Unlinked, waiting for suspension so a seek can be performed.
    SeekingPaused,
    /// Seeking a stream that had already ended.
    SeekingEos,
    Paused,
    /// Fading out to make room for another stream.
    FadingOut,
    /// Fading out because of pause().
    FadingOutPaused,
    /// Will continue into a new URI without being rebuilt.
    Reusing,
    /// Waiting for the reaper.
    PendingRemove,
}

impl StreamState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Prerolling => "prerolling",
            Self::PrerollPlay => "preroll->play",
            Self::Waiting => "waiting",
            Self::WaitingEos => "waiting for EOS",
            Self::FadingIn => "fading in",
            Self::Playing => "playing",
            Self::Seeking => "seeking",
            Self::SeekingPaused => "seeking->paused",
            Self::SeekingEos => "seeking post EOS",
            Self::Paused => "paused",
            Self::FadingOut => "fading out",
            Self::FadingOutPaused => "fading->paused",
            Self::Reusing => "reusing",
            Self::PendingRemove => "pending remove",
        }
    }

    /// Audible and counted as "playing" by the facade.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Playing | Self::FadingIn)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::PendingRemove)
    }

    pub const fn is_prerolling(self) -> bool {
        matches!(self, Self::Prerolling | Self::PrerollPlay)
    }

    /// States that make `opened()` true.
    pub const fn counts_as_opened(self) -> bool {
        matches!(
            self,
            Self::Prerolling
                | Self::PrerollPlay
                | Self::WaitingEos
                | Self::Waiting
                | Self::FadingIn
                | Self::Playing
                | Self::Paused
        )
    }

    /// States consulted for `seekable()`.
    pub const fn answers_seekable(self) -> bool {
        matches!(self, Self::FadingIn | Self::Paused | Self::Playing)
    }

    /// States a time query or tick can report on.
    pub const fn can_be_current(self) -> bool {
        matches!(
            self,
            Self::FadingIn
                | Self::Playing
                | Self::FadingOutPaused
                | Self::Paused
                | Self::PendingRemove
                | Self::Reusing
        )
    }

    /// States from which a stream may be reused for a new URI.
    pub const fn can_reuse_from(self) -> bool {
        matches!(
            self,
            Self::Playing
                | Self::FadingIn
                | Self::FadingOut
                | Self::FadingOutPaused
                | Self::WaitingEos
                | Self::Paused
        )
    }

    /// States that can be the target of set_time().
    pub const fn accepts_seek(self) -> bool {
        matches!(
            self,
            Self::FadingIn
                | Self::Playing
                | Self::Paused
                | Self::FadingOutPaused
                | Self::PendingRemove
        )
    }

    /// Something the listener can hear, including a stream on its way out.
    pub const fn is_audible(self) -> bool {
        matches!(self, Self::Playing | Self::FadingIn | Self::FadingOut)
    }

    pub const fn is_fading_out(self) -> bool {
        matches!(self, Self::FadingOut | Self::FadingOutPaused)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata received before the stream announced itself.
#[derive(Debug, Clone)]
pub(crate) enum PendingInfo {
    Tag(TagField, TagValue),
    Image(Bytes),
}

/// URI and data a reused stream continues into.
pub(crate) struct Continuation<D> {
    pub uri: String,
    pub data: Arc<D>,
}

/// Result of checking the live gain against a running fade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FadeProgress {
    Running,
    Done(FadeDirection),
}

/// Mutable state of a stream, guarded by the stream's lock.
pub(crate) struct StreamInner<D> {
    pub uri: String,
    pub data: Arc<D>,
    /// Queued reuse target.
    pub next: Option<Continuation<D>>,
    /// Decoder waiting to hear whether it can continue gaplessly.
    pub continuation_waiter: Option<Sender<Option<String>>>,
    /// The decoder was told to continue into `next`.
    pub continuation_handed_off: bool,
    pub graph: Box<dyn StreamGraph>,
    pub state: StreamState,
    pub play_type: PlayType,
    pub crossfade: Duration,
    pub play_requested: bool,
    pub seek_target: Duration,

    /// A fade is running (or deferred) towards `fade_end`.
    pub fading: bool,
    pub fade_end: f64,
    pub deferred_fade: Option<FadeSpec>,
    pub replaygain_scale: f64,

    /// Mixer slot while linked.
    pub slot: Option<MixerSlot>,
    /// The suspend point is holding data back.
    pub suspended: bool,
    pub needs_unlink: bool,
    /// Mixer running time minus stream time, in nanoseconds.
    pub base_time: Option<i128>,

    pub emitted_playing: bool,
    pub emitted_fake_playing: bool,
    pub emitted_error: bool,
    pub buffering: bool,
    pub resume_after_buffering: bool,
    pub pending_info: Vec<PendingInfo>,
    pub missing_plugins: Vec<(String, String)>,
}

fn nanos(d: Duration) -> i128 {
    i128::try_from(d.as_nanos()).unwrap_or(i128::MAX)
}

fn from_nanos(n: i128) -> Duration {
    Duration::from_nanos(u64::try_from(n.max(0)).unwrap_or(u64::MAX))
}

impl<D> StreamInner<D> {
    fn new(uri: String, data: Arc<D>, graph: Box<dyn StreamGraph>) -> Self {
        Self {
            uri,
            data,
            next: None,
            continuation_waiter: None,
            continuation_handed_off: false,
            graph,
            state: StreamState::Prerolling,
            play_type: PlayType::default(),
            crossfade: Duration::ZERO,
            play_requested: false,
            seek_target: Duration::ZERO,
            fading: false,
            fade_end: 1.0,
            deferred_fade: None,
            replaygain_scale: 1.0,
            slot: None,
            suspended: false,
            needs_unlink: false,
            base_time: None,
            emitted_playing: false,
            emitted_fake_playing: false,
            emitted_error: false,
            buffering: false,
            resume_after_buffering: false,
            pending_info: Vec::new(),
            missing_plugins: Vec::new(),
        }
    }

    pub const fn is_linked(&self) -> bool {
        self.slot.is_some()
    }

    /// State to enter once the stream is flowing into the mixer again.
    pub const fn resumed_state(&self) -> StreamState {
        if self.fading {
            StreamState::FadingIn
        } else {
            StreamState::Playing
        }
    }

    /// Live gain with replaygain scaling removed.
    pub fn relative_gain(&self) -> f64 {
        if self.replaygain_scale > 0.0 {
            self.graph.gain() / self.replaygain_scale
        } else {
            self.graph.gain()
        }
    }

    /// Start a fade from `start` to `end` (both before replaygain).
    ///
    /// The envelope is anchored at the stream's current position when it
    /// is linked and has a known base time; otherwise the fade is kept
    /// until the base time can be computed.
    pub fn start_fade(&mut self, start: f64, end: f64, length: Duration) {
        let start = start * self.replaygain_scale;
        let end = end * self.replaygain_scale;

        self.fade_end = end;
        self.fading = true;
        self.graph.set_gain(start);

        match self.fade_anchor() {
            Some(at) => {
                debug!(
                    "Fading {} from {start:.3} to {end:.3} over {length:?} at {at:?}",
                    self.uri
                );
                self.deferred_fade = None;
                self.graph
                    .set_envelope(Envelope::slide(start, end, at, length));
            }
            None => {
                debug!(
                    "Deferring fade of {} from {start:.3} to {end:.3} until base time is known",
                    self.uri
                );
                self.deferred_fade = Some(FadeSpec { start, end, length });
            }
        }
    }

    fn fade_anchor(&self) -> Option<Duration> {
        if self.slot.is_none() || self.suspended || self.base_time.is_none() {
            return None;
        }
        self.graph.position()
    }

    /// Drop any running or deferred fade.
    pub fn cancel_fade(&mut self) {
        self.fading = false;
        self.deferred_fade = None;
    }

    /// Recompute the base time from the mixer position.
    ///
    /// Starts a deferred fade on success. Returns false when either clock
    /// is unavailable, in which case the caller retries on the next buffer.
    pub fn adjust_base_time(&mut self, mixer_position: Option<Duration>) -> bool {
        if self.slot.is_none() {
            return false;
        }
        let (Some(mixer), Some(position)) = (mixer_position, self.graph.position()) else {
            trace!("Base time for {} not available yet", self.uri);
            self.base_time = None;
            return false;
        };

        let base = nanos(mixer) - nanos(position);
        trace!("Base time for {} is {base}ns", self.uri);
        self.base_time = Some(base);

        if let Some(fade) = self.deferred_fade.take() {
            debug!(
                "Starting deferred fade of {} from {:.3} to {:.3} at {position:?}",
                self.uri, fade.start, fade.end
            );
            self.graph
                .set_envelope(Envelope::slide(fade.start, fade.end, position, fade.length));
        }
        true
    }

    /// Position reported to the caller.
    pub fn position(&self, mixer_position: Option<Duration>) -> Option<Duration> {
        if self.state == StreamState::Paused {
            return self.graph.position();
        }
        match (mixer_position, self.base_time) {
            (Some(mixer), Some(base)) => Some(from_nanos(nanos(mixer) - base)),
            _ => self.graph.position(),
        }
    }

    /// Check a new live gain against the running fade.
    pub fn fade_progress(&mut self, gain: f64) -> FadeProgress {
        if !self.fading || self.deferred_fade.is_some() {
            return FadeProgress::Running;
        }
        match self.state {
            StreamState::FadingIn if FadeDirection::In.reached(gain, self.fade_end) => {
                debug!("Stream {} fully faded in (gain {gain:.3})", self.uri);
                self.fading = false;
                self.state = StreamState::Playing;
                FadeProgress::Done(FadeDirection::In)
            }
            StreamState::FadingOut | StreamState::FadingOutPaused
                if FadeDirection::Out.reached(gain, self.fade_end) =>
            {
                debug!("Stream {} fully faded out (gain {gain:.3})", self.uri);
                self.fading = false;
                FadeProgress::Done(FadeDirection::Out)
            }
            _ => FadeProgress::Running,
        }
    }

    /// Switch to the queued continuation. Returns the released data.
    pub fn swap_in_continuation(&mut self, hooks: &dyn PlayerHooks) -> Option<Arc<D>> {
        let next = self.next.take()?;
        hooks.reuse_stream(&next.uri, &self.uri, self.graph.as_mut());
        info!("Reusing stream for {} -> {}", self.uri, next.uri);

        self.uri = next.uri;
        self.cancel_fade();
        self.replaygain_scale = 1.0;
        self.graph.set_gain(1.0);
        self.continuation_waiter = None;
        self.emitted_playing = false;
        self.emitted_fake_playing = false;
        self.emitted_error = false;
        self.continuation_handed_off = false;
        self.pending_info.clear();
        Some(std::mem::replace(&mut self.data, next.data))
    }

    /// Answer a waiting decoder, if any.
    pub fn answer_continuation(&mut self) {
        let Some(waiter) = self.continuation_waiter.take() else {
            return;
        };
        let uri = self.next.as_ref().map(|next| next.uri.clone());
        self.continuation_handed_off = uri.is_some();
        debug!("Answering about-to-finish for {} with {uri:?}", self.uri);
        // the decoder may already have given up waiting
        let _ = waiter.send(uri);
    }
}

/// A stream and its lock.
pub struct Stream<D> {
    id: StreamId,
    inner: Mutex<StreamInner<D>>,
}

impl<D> Stream<D> {
    pub(crate) fn new(id: StreamId, uri: String, data: Arc<D>, graph: Box<dyn StreamGraph>) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner::new(uri, data, graph)),
        }
    }

    pub const fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamInner<D>> {
        self.inner.lock()
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn uri(&self) -> String {
        self.inner.lock().uri.clone()
    }

    pub fn data(&self) -> Arc<D> {
        Arc::clone(&self.inner.lock().data)
    }

    pub fn is_linked(&self) -> bool {
        self.inner.lock().is_linked()
    }

    /// Copy of the externally interesting state.
    pub fn snapshot(&self) -> StreamSnapshot {
        let inner = self.inner.lock();
        StreamSnapshot {
            id: self.id,
            uri: inner.uri.clone(),
            state: inner.state,
            linked: inner.is_linked(),
        }
    }
}

impl<D> Drop for Stream<D> {
    fn drop(&mut self) {
        trace!("Stream {} destroyed", self.id);
    }
}

impl<D> fmt::Debug for Stream<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("uri", &inner.uri)
            .field("state", &inner.state)
            .field("linked", &inner.is_linked())
            .finish()
    }
}

/// Point-in-time view of a stream for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub id: StreamId,
    pub uri: String,
    pub state: StreamState,
    pub linked: bool,
}
