//! Transitions that move streams in and out of the mixer.
//!
//! Linking attaches a stream to a mixer slot and lets data flow; unlinking
//! suspends the stream first and only releases the slot once the
//! suspension is confirmed. Everything here runs on the control context.

use crate::engine::Shared;
use crate::events::PlayerEvent;
use crate::fade::scaled_fade_length;
use crate::graph::{EventSource, FlushScope, GraphEvent, GraphEventKind, PrerollOutcome, StreamId};
use crate::stream::{PendingInfo, Stream, StreamInner, StreamState};
use segue_core::{Error, PlayType, PlayerErrorKind, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl<D: Send + Sync + 'static> Shared<D> {
    /// Start prerolling a freshly created stream.
    pub(crate) fn preroll(&self, stream: &Arc<Stream<D>>) -> Result<()> {
        let mut s = stream.lock();
        s.state = StreamState::Prerolling;
        s.emitted_playing = false;

        match s.graph.preroll()? {
            PrerollOutcome::Pending => debug!("Prerolling {}", s.uri),
            PrerollOutcome::Ready => {
                debug!("Stream {} prerolled synchronously -> waiting", s.uri);
                s.suspended = true;
                s.state = StreamState::Waiting;
            }
            PrerollOutcome::NoPreroll => {
                debug!("Stream {} is live, no preroll -> waiting", s.uri);
                s.suspended = false;
                s.state = StreamState::Waiting;
            }
        }
        Ok(())
    }

    /// Start a fade and have the dispatcher check it against the current
    /// gain, so a fade that is already at its target completes.
    pub(crate) fn start_stream_fade(
        &self,
        id: StreamId,
        s: &mut StreamInner<D>,
        start: f64,
        end: f64,
        length: Duration,
    ) {
        s.start_fade(start, end, length);
        if s.deferred_fade.is_none() {
            // the receiver lives in `self`, so this only fails during teardown
            let _ = self.event_tx.send(GraphEvent {
                source: EventSource::Stream(id),
                kind: GraphEventKind::GainChanged(s.graph.gain()),
            });
        }
    }

    /// Put a stream into the mixer and let data flow.
    pub(crate) fn link_and_unblock(&self, stream: &Arc<Stream<D>>) -> Result<()> {
        self.start_sink()?;

        let mut s = stream.lock();
        if s.is_linked() {
            if s.needs_unlink {
                debug!("Cancelling pending unlink of {}", s.uri);
                s.needs_unlink = false;
                s.state = s.resumed_state();
            } else {
                debug!("Stream {} is already linked", s.uri);
            }
            return Ok(());
        }
        s.needs_unlink = false;

        let slot = self.sink.acquire_slot()?;
        if let Err(e) = s.graph.attach(slot) {
            self.sink.release_slot(slot);
            return Err(Error::Link(format!("{}: {e}", s.uri)));
        }
        s.slot = Some(slot);
        let linked = self.linked.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.cancel_idle_stop();
        debug!("Linked {} to mixer slot {}, {linked} linked streams", s.uri, slot.0);

        if s.suspended {
            debug!("Unblocking {}", s.uri);
            s.graph.unblock();
            return Ok(());
        }

        debug!("Stream {} was not blocked -> {}", s.uri, s.resumed_state());
        s.state = s.resumed_state();
        let mixer = self.sink.mixer_position();
        s.adjust_base_time(mixer);
        let played = s.graph.play();
        drop(s);

        self.announce_playing(stream, false);
        played.map_err(|e| Error::Link(e.to_string()))
    }

    /// A requested unblock took effect.
    pub(crate) fn on_resumed(&self, stream: &Arc<Stream<D>>) {
        let mut s = stream.lock();
        s.suspended = false;
        if !s.is_linked() {
            debug!("Stream {} resumed while unlinked", s.uri);
            return;
        }
        if s.state.is_fading_out() || s.state.is_terminal() {
            debug!("Stream {} resumed in state {}", s.uri, s.state);
            return;
        }

        s.state = s.resumed_state();
        debug!("Stream {} unblocked -> {}", s.uri, s.state);
        let mixer = self.sink.mixer_position();
        s.adjust_base_time(mixer);
        if let Err(e) = s.graph.play() {
            warn!("Failed to start stream {}: {e}", s.uri);
        }
        drop(s);

        self.announce_playing(stream, false);
    }

    /// Tell the shell a stream is now playing, then flush buffered metadata.
    ///
    /// A `fake` announcement is used while a stream the caller asked to
    /// play is still buffering.
    pub(crate) fn announce_playing(&self, stream: &Arc<Stream<D>>, fake: bool) {
        let (data, pending) = {
            let mut s = stream.lock();
            if s.emitted_playing || (fake && s.emitted_fake_playing) {
                return;
            }
            if fake {
                s.emitted_fake_playing = true;
                (Arc::clone(&s.data), Vec::new())
            } else {
                s.emitted_playing = true;
                (Arc::clone(&s.data), std::mem::take(&mut s.pending_info))
            }
        };

        debug!("Stream {} is playing{}", stream.id(), if fake { " (buffering)" } else { "" });
        self.emit(PlayerEvent::PlayingStream(Arc::clone(&data)));
        for info in pending {
            self.emit(match info {
                PendingInfo::Tag(field, value) => PlayerEvent::Info {
                    data: Arc::clone(&data),
                    field,
                    value,
                },
                PendingInfo::Image(image) => PlayerEvent::Image {
                    data: Arc::clone(&data),
                    image,
                },
            });
        }
    }

    /// Take a stream out of the mixer once it is suspended.
    pub(crate) fn unlink_and_block(&self, stream: &Arc<Stream<D>>) {
        let mut s = stream.lock();
        if !s.is_linked() {
            debug!("Stream {} is not linked", s.uri);
            return;
        }
        s.needs_unlink = true;
        if s.suspended {
            drop(s);
            self.finish_unlink(stream);
        } else {
            debug!("Blocking {} for unlink", s.uri);
            s.graph.block();
        }
    }

    /// A requested block took effect.
    pub(crate) fn on_suspended(&self, stream: &Arc<Stream<D>>) {
        let mut s = stream.lock();
        let state = s.state;
        match state {
            StreamState::Prerolling | StreamState::PrerollPlay => {
                if s.suspended {
                    debug!("Stream {} already blocked", s.uri);
                    return;
                }
                s.suspended = true;
                if s.state == StreamState::Prerolling {
                    debug!("Stream {} prerolled -> waiting", s.uri);
                    s.state = StreamState::Waiting;
                    return;
                }
                debug!("Stream {} prerolled, starting playback", s.uri);
                drop(s);
                if let Err(e) = self.actually_start(stream) {
                    self.fail_stream_with(stream, &e);
                }
            }
            StreamState::SeekingEos => {
                debug!("Stream {} blocked after post-EOS seek, relinking", s.uri);
                s.suspended = true;
                drop(s);
                if let Err(e) = self.link_and_unblock(stream) {
                    self.fail_stream_with(stream, &e);
                }
            }
            _ if s.needs_unlink => {
                drop(s);
                self.finish_unlink(stream);
            }
            StreamState::Seeking if !s.is_linked() => {
                s.suspended = true;
                drop(s);
                if let Err(e) = self.link_and_unblock(stream) {
                    self.fail_stream_with(stream, &e);
                }
            }
            StreamState::SeekingPaused if !s.is_linked() => {
                debug!("Stream {} blocked after seek -> paused", s.uri);
                s.suspended = true;
                s.state = StreamState::Paused;
            }
            _ if s.is_linked() && state.is_active() => {
                // the unlink this block was for got cancelled
                debug!("Stale block on {}, unblocking again", s.uri);
                s.suspended = true;
                s.graph.unblock();
            }
            _ => s.suspended = true,
        }
    }

    /// Release the mixer slot of a suspended stream.
    fn finish_unlink(&self, stream: &Arc<Stream<D>>) {
        let (state, slot) = {
            let mut s = stream.lock();
            s.needs_unlink = false;
            let Some(slot) = s.slot.take() else {
                debug!("Stream {} doesn't need to be unlinked", s.uri);
                return;
            };
            s.graph.detach(slot);
            s.suspended = true;
            s.emitted_playing = false;
            s.base_time = None;
            if s.state == StreamState::Seeking && s.fading {
                // play() came in before the pause block landed; restart the
                // fade in from the position the seek moves to
                let gain = s.relative_gain();
                let length = scaled_fade_length(self.config.pause_fade(), 1.0 - gain);
                s.start_fade(gain, 1.0, length);
            }
            (s.state, slot)
        };

        self.sink.release_slot(slot);
        let remaining = self.linked.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Unlinked stream {}, {remaining} linked streams left", stream.id());

        match state {
            StreamState::Reusing => self.reuse_and_relink(stream),
            StreamState::Seeking => {
                // the seek relinks it
                debug!("Queueing seek for {} before relinking", stream.id());
                self.pending_seeks.lock().push(stream.id());
            }
            StreamState::SeekingPaused => {
                debug!("Queueing seek for {}", stream.id());
                self.pending_seeks.lock().push(stream.id());
                if remaining == 0 {
                    self.maybe_stop_sink();
                }
            }
            _ if remaining == 0 => self.maybe_stop_sink(),
            _ => {}
        }
    }

    /// Unlink a stream right away, without waiting for a suspension.
    ///
    /// Only valid once the stream has stopped producing data.
    pub(crate) fn unlink_now(&self, stream: &Arc<Stream<D>>) {
        let mut s = stream.lock();
        s.needs_unlink = true;
        s.suspended = true;
        drop(s);
        self.finish_unlink(stream);
    }

    /// Switch a suspended, unlinked stream to its queued URI and relink it.
    pub(crate) fn reuse_and_relink(&self, stream: &Arc<Stream<D>>) {
        let released = stream.lock().swap_in_continuation(self.hooks.as_ref());
        // release the old data outside the stream lock
        drop(released);

        if let Err(e) = self.link_and_unblock(stream) {
            self.fail_stream_with(stream, &e);
        }
    }

    /// Start a prerolled stream according to its play type.
    pub(crate) fn actually_start(&self, stream: &Arc<Stream<D>>) -> Result<()> {
        let (play_type, crossfade) = {
            let s = stream.lock();
            (s.play_type, s.crossfade)
        };
        let others: Vec<_> = self
            .registry
            .lock()
            .all()
            .into_iter()
            .filter(|other| other.id() != stream.id())
            .collect();

        let mut need_reap = false;
        let result = match play_type {
            PlayType::Crossfade => {
                let mut fading = false;
                for other in &others {
                    let mut o = other.lock();
                    match o.state {
                        StreamState::FadingIn | StreamState::Playing => {
                            let (start, length) = if o.state == StreamState::FadingIn {
                                let gain = o.relative_gain();
                                (gain, scaled_fade_length(crossfade, gain))
                            } else {
                                (1.0, crossfade)
                            };
                            debug!("Fading out {} over {length:?} for crossfade", o.uri);
                            o.state = StreamState::FadingOut;
                            self.start_stream_fade(other.id(), &mut o, start, 0.0, length);
                            fading = true;
                        }
                        StreamState::Paused
                        | StreamState::WaitingEos
                        | StreamState::Seeking
                        | StreamState::SeekingPaused
                        | StreamState::Prerolling
                        | StreamState::PrerollPlay => {
                            debug!("Stream {} ({}) replaced -> pending remove", o.uri, o.state);
                            o.state = StreamState::PendingRemove;
                            need_reap = true;
                        }
                        StreamState::PendingRemove => need_reap = true,
                        _ => {}
                    }
                }

                {
                    let mut s = stream.lock();
                    if fading {
                        self.start_stream_fade(stream.id(), &mut s, 0.0, 1.0, crossfade);
                    } else {
                        debug!("Nothing to crossfade {} with", s.uri);
                        s.cancel_fade();
                        let gain = s.replaygain_scale;
                        s.graph.set_gain(gain);
                    }
                }
                self.link_and_unblock(stream)
            }

            PlayType::AfterEos => {
                let mut playing = false;
                for other in &others {
                    let mut o = other.lock();
                    match o.state {
                        state if state.is_audible() => {
                            debug!("Stream {} is still playing", o.uri);
                            playing = true;
                        }
                        StreamState::Paused => {
                            debug!("Stream {} (paused) replaced -> pending remove", o.uri);
                            o.state = StreamState::PendingRemove;
                            need_reap = true;
                        }
                        StreamState::PendingRemove => need_reap = true,
                        _ => {}
                    }
                }

                if playing {
                    let mut s = stream.lock();
                    debug!("Stream {} will start after EOS -> waiting for EOS", s.uri);
                    s.state = StreamState::WaitingEos;
                    Ok(())
                } else {
                    debug!("Nothing playing, starting {} now", stream.id());
                    self.link_and_unblock(stream)
                }
            }

            PlayType::Replace => {
                for other in &others {
                    let mut o = other.lock();
                    match o.state {
                        StreamState::Playing
                        | StreamState::Paused
                        | StreamState::FadingIn
                        | StreamState::PendingRemove => {
                            debug!("Stream {} replaced -> pending remove", o.uri);
                            o.state = StreamState::PendingRemove;
                            need_reap = true;
                        }
                        _ => {}
                    }
                }
                self.link_and_unblock(stream)
            }
        };

        if need_reap {
            self.schedule_reap();
        }
        result
    }

    /// Seek to the stream's seek target.
    pub(crate) fn perform_seek(&self, stream: &Arc<Stream<D>>) {
        let relink = {
            let mut s = stream.lock();
            let scope = if s.is_linked() {
                FlushScope::Stream
            } else {
                FlushScope::Downstream
            };
            let target = s.seek_target;
            debug!("Seeking {} to {target:?} ({scope:?})", s.uri);
            s.graph.seek(target, scope);

            match s.state {
                StreamState::Seeking if s.is_linked() => {
                    s.state = s.resumed_state();
                    false
                }
                StreamState::Seeking => true,
                StreamState::SeekingPaused => {
                    s.state = StreamState::Paused;
                    false
                }
                // post-EOS seeks relink once the block lands
                _ => false,
            }
        };

        if relink {
            if let Err(e) = self.link_and_unblock(stream) {
                self.fail_stream_with(stream, &e);
            }
        }
    }

    /// Perform seeks queued by unlinks.
    pub(crate) fn run_pending_seeks(&self) {
        let ids = std::mem::take(&mut *self.pending_seeks.lock());
        for id in ids {
            let stream = self.registry.lock().get(id);
            match stream {
                Some(stream) => self.perform_seek(&stream),
                None => debug!("Dropping seek for destroyed stream {id}"),
            }
        }
    }

    /// A fade out ran to completion.
    pub(crate) fn fade_out_done(&self, stream: &Arc<Stream<D>>) {
        let mut s = stream.lock();
        let state = s.state;
        match state {
            StreamState::FadingOut => {
                debug!("Stream {} faded out -> pending remove", s.uri);
                s.state = StreamState::PendingRemove;
                drop(s);
                self.schedule_reap();
            }
            StreamState::FadingOutPaused => {
                // seek back a little so the resume fade doesn't skip audio
                match s.graph.position() {
                    Some(position) => {
                        s.seek_target = position.saturating_sub(self.config.pause_fade());
                        s.state = StreamState::SeekingPaused;
                        debug!("Stream {} paused, seeking back to {:?}", s.uri, s.seek_target);
                    }
                    None => {
                        debug!("Stream {} paused, position unknown", s.uri);
                        s.state = StreamState::Paused;
                    }
                }
                drop(s);
                self.unlink_and_block(stream);
            }
            _ => {}
        }
    }

    /// Report a stream failure and mark it for removal.
    pub(crate) fn fail_stream(&self, stream: &Arc<Stream<D>>, kind: PlayerErrorKind, message: String) {
        let (data, announce) = {
            let mut s = stream.lock();
            s.emitted_error = true;
            s.continuation_waiter = None;
            s.cancel_fade();
            let announce = s.play_requested && !s.emitted_playing;
            if !s.state.is_terminal() {
                s.state = StreamState::PendingRemove;
            }
            (Arc::clone(&s.data), announce)
        };

        // let the shell show which stream failed
        if announce {
            self.announce_playing(stream, false);
        }
        warn!("Stream {} failed: {message}", stream.id());
        self.emit(PlayerEvent::Error {
            data,
            kind,
            message,
        });
        self.schedule_reap();
    }

    pub(crate) fn fail_stream_with(&self, stream: &Arc<Stream<D>>, err: &Error) {
        self.fail_stream(stream, err.player_kind(), err.to_string());
    }

    /// A stream ran out of data.
    pub(crate) fn on_eos(&self, stream: &Arc<Stream<D>>) {
        let waiting: Vec<_> = self
            .registry
            .lock()
            .in_state(|state| state == StreamState::WaitingEos)
            .into_iter()
            .filter(|w| w.id() != stream.id())
            .collect();
        for next in &waiting {
            info!("Starting {} on EOS from previous", next.uri());
            if let Err(e) = self.link_and_unblock(next) {
                self.fail_stream_with(next, &e);
            }
        }

        let mut s = stream.lock();
        s.continuation_waiter = None;
        let state = s.state;
        match state {
            StreamState::Reusing if s.continuation_handed_off => {
                // the decoder already moved on to the next URI
                debug!("EOS for {} while continuing gaplessly", s.uri);
                let released = s.swap_in_continuation(self.hooks.as_ref());
                s.state = s.resumed_state();
                drop(s);
                drop(released);
                self.announce_playing(stream, false);
            }
            StreamState::Reusing => {
                debug!("EOS for {} in reusing state", s.uri);
                drop(s);
                self.unlink_now(stream);
            }
            _ => {
                debug!("EOS for {} -> pending remove", s.uri);
                s.state = StreamState::PendingRemove;
                s.cancel_fade();
                let data = Arc::clone(&s.data);
                drop(s);

                self.emit(PlayerEvent::EndOfStream(data));
                // keep it around so it can still be seeked back into
                self.unlink_now(stream);
                if !waiting.is_empty() {
                    self.schedule_reap();
                }
            }
        }
    }
}
