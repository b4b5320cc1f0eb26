//! Event dispatch: applies graph notifications on the control context.

use crate::engine::Shared;
use crate::events::PlayerEvent;
use crate::fade::FadeDirection;
use crate::graph::{EventSource, GraphErrorKind, GraphEvent, GraphEventKind};
use crate::sink::SinkState;
use crate::stream::{FadeProgress, PendingInfo, Stream, StreamState};
use crossbeam_channel::Sender;
use segue_core::PlayerErrorKind;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

impl<D: Send + Sync + 'static> Shared<D> {
    /// Run one dispatch pass: re-queued events, then the channel, then
    /// queued seeks, missing plugin reports, the reaper and due timers.
    pub(crate) fn dispatch_pending(&self) -> usize {
        let _control = self.control.lock();
        let mut handled = 0;

        loop {
            let queued = self.requeued.lock().pop_front();
            let event = match queued {
                Some(event) => event,
                None => match self.event_rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            self.handle_event(event);
            self.run_pending_seeks();
            handled += 1;
        }

        self.run_pending_seeks();
        self.flush_missing_plugins();
        if self.registry.lock().take_reap_flag() {
            self.reap_streams();
        }
        self.service_timers(Instant::now());
        handled
    }

    fn handle_event(&self, event: GraphEvent) {
        match event.source {
            EventSource::Output => self.handle_output_event(event.kind),
            EventSource::Stream(id) => {
                let stream = self.registry.lock().get(id);
                match stream {
                    Some(stream) => self.handle_stream_event(&stream, event.kind),
                    None => trace!("Dropping {} event for unknown stream {id}", event.kind.name()),
                }
            }
        }
    }

    fn handle_output_event(&self, kind: GraphEventKind) {
        match kind {
            GraphEventKind::OutputReady => debug!("Ignoring late output ready notification"),
            GraphEventKind::OutputError(message) => {
                error!("Output error: {message}");
                match self.current_stream() {
                    Some((stream, _)) => self.emit(PlayerEvent::Error {
                        data: stream.data(),
                        kind: PlayerErrorKind::NoAudio,
                        message,
                    }),
                    None => warn!("Output error with no current stream"),
                }
            }
            GraphEventKind::OutputVolumeChanged(volume) => {
                debug!("Device volume changed to {volume:.3}");
                self.sink.device_volume_changed(volume);
                self.emit(PlayerEvent::VolumeChanged(volume));
            }
            GraphEventKind::ChainBlocked => {
                debug!("Output chain blocked");
                self.flush_output_chain();
            }
            other => warn!("Unexpected {} event from the output", other.name()),
        }
    }

    fn handle_stream_event(&self, stream: &Arc<Stream<D>>, kind: GraphEventKind) {
        trace!("Stream {}: {}", stream.id(), kind.name());
        match kind {
            GraphEventKind::Suspended => self.on_suspended(stream),
            GraphEventKind::Resumed => self.on_resumed(stream),
            GraphEventKind::EndOfStream => self.on_eos(stream),
            GraphEventKind::NewSegment => {
                debug!("New segment for {}", stream.id());
                let mixer = self.sink.mixer_position();
                stream.lock().adjust_base_time(mixer);
            }
            GraphEventKind::BufferFlowing => {
                let mixer = self.sink.mixer_position();
                let mut s = stream.lock();
                if s.is_linked() && s.base_time.is_none() {
                    s.adjust_base_time(mixer);
                }
            }
            GraphEventKind::GainChanged(gain) => {
                let progress = stream.lock().fade_progress(gain);
                if progress == FadeProgress::Done(FadeDirection::Out) {
                    self.fade_out_done(stream);
                }
            }
            GraphEventKind::Tag(field, value) => {
                self.deliver_info(stream, PendingInfo::Tag(field, value));
            }
            GraphEventKind::Image(image) => self.deliver_info(stream, PendingInfo::Image(image)),
            GraphEventKind::Buffering(percent) => self.on_buffering(stream, percent),
            GraphEventKind::Error { kind, message } => self.on_error(stream, kind, message),
            GraphEventKind::MissingPlugin {
                detail,
                description,
            } => {
                let mut s = stream.lock();
                if s.state.is_prerolling() {
                    debug!("Stream {} is missing {description}", s.uri);
                    s.missing_plugins.push((detail, description));
                } else {
                    debug!("Ignoring missing plugin {description} for {} ({})", s.uri, s.state);
                }
            }
            GraphEventKind::Application(name) => self.emit(PlayerEvent::Event {
                data: stream.data(),
                name,
            }),
            GraphEventKind::Redirect(uri) => {
                info!("Stream {} redirected to {uri}", stream.id());
                self.emit(PlayerEvent::Redirect {
                    data: stream.data(),
                    uri,
                });
            }
            GraphEventKind::AboutToFinish(reply) => self.on_about_to_finish(stream, reply),
            other => warn!("Unexpected {} event from stream {}", other.name(), stream.id()),
        }
    }

    fn deliver_info(&self, stream: &Arc<Stream<D>>, info: PendingInfo) {
        let data = {
            let mut s = stream.lock();
            if !s.emitted_playing {
                trace!("Holding metadata for {} until it plays", s.uri);
                s.pending_info.push(info);
                return;
            }
            Arc::clone(&s.data)
        };
        self.emit(match info {
            PendingInfo::Tag(field, value) => PlayerEvent::Info { data, field, value },
            PendingInfo::Image(image) => PlayerEvent::Image { data, image },
        });
    }

    fn on_error(&self, stream: &Arc<Stream<D>>, kind: GraphErrorKind, message: String) {
        {
            let s = stream.lock();
            if s.emitted_error && kind == GraphErrorKind::StreamFailed {
                debug!("Ignoring generic error for {}: {message}", s.uri);
                return;
            }
        }
        let player_kind = if kind.is_audio_failure() {
            PlayerErrorKind::NoAudio
        } else {
            PlayerErrorKind::General
        };
        self.fail_stream(stream, player_kind, message);
    }

    fn on_buffering(&self, stream: &Arc<Stream<D>>, percent: u8) {
        let percent = percent.min(100);
        self.emit(PlayerEvent::Buffering {
            data: stream.data(),
            percent,
        });

        let mut s = stream.lock();
        let state = s.state;
        if percent < 100 {
            match state {
                StreamState::Playing | StreamState::FadingIn => {
                    info!("Stream {} is buffering, pausing", s.uri);
                    s.buffering = true;
                    s.resume_after_buffering = true;
                    s.state = StreamState::Paused;
                    drop(s);
                    self.unlink_and_block(stream);
                }
                StreamState::FadingOut => {
                    debug!("Stream {} is buffering while fading out, dropping it", s.uri);
                    s.cancel_fade();
                    s.state = StreamState::PendingRemove;
                    drop(s);
                    self.schedule_reap();
                }
                StreamState::PrerollPlay => {
                    s.buffering = true;
                    drop(s);
                    self.announce_playing(stream, true);
                }
                _ => s.buffering = true,
            }
        } else {
            let resume = s.buffering && s.resume_after_buffering && state == StreamState::Paused;
            s.buffering = false;
            s.resume_after_buffering = false;
            if resume {
                info!("Stream {} finished buffering, resuming", s.uri);
                drop(s);
                if let Err(e) = self.link_and_unblock(stream) {
                    self.fail_stream_with(stream, &e);
                }
            }
        }
    }

    fn on_about_to_finish(&self, stream: &Arc<Stream<D>>, reply: Sender<Option<String>>) {
        let mut s = stream.lock();
        if s.state.is_terminal() || s.state.is_fading_out() {
            debug!("Got about-to-finish for {} already being shut down", s.uri);
            let _ = reply.send(None);
            return;
        }

        s.continuation_waiter = Some(reply);
        if s.state == StreamState::Reusing && s.next.is_some() {
            s.answer_continuation();
            return;
        }

        debug!("Got about-to-finish for {} with nothing queued", s.uri);
        let data = Arc::clone(&s.data);
        drop(s);
        self.emit(PlayerEvent::AboutToFinish(data));
    }

    fn flush_missing_plugins(&self) {
        let streams = self.registry.lock().all();
        for stream in streams {
            let (data, missing) = {
                let mut s = stream.lock();
                if s.missing_plugins.is_empty() {
                    continue;
                }
                (Arc::clone(&s.data), std::mem::take(&mut s.missing_plugins))
            };
            let (details, descriptions): (Vec<_>, Vec<_>) = missing.into_iter().unzip();
            info!(
                "Stream {} needs {} missing plugins: {}",
                stream.id(),
                details.len(),
                descriptions.join(", ")
            );
            self.hooks.missing_plugins(&details, &descriptions);
            self.emit(PlayerEvent::MissingPlugins {
                data,
                details,
                descriptions,
            });
        }
    }

    fn service_timers(&self, now: Instant) {
        if self.sink.take_due_idle_stop(now) && self.linked.load(Ordering::SeqCst) == 0 {
            info!("No streams linked, stopping output");
            if let Err(e) = self.sink.stop() {
                warn!("Failed to stop output: {e}");
            }
        }

        if self.sink.state() == SinkState::Playing
            && self.sink.take_due_tick(now, self.config.tick_interval())
        {
            if let Some((data, position, duration)) = self.current_times() {
                self.emit(PlayerEvent::Tick {
                    data,
                    position,
                    duration,
                });
            }
        }
    }

    /// Stream that time queries and ticks report on, and whether it is a
    /// buffering stream that only sent a fake playing notification.
    pub(crate) fn current_stream(&self) -> Option<(Arc<Stream<D>>, bool)> {
        let registry = self.registry.lock();
        if let Some(stream) =
            registry.find(|s| s.state.is_prerolling() && s.emitted_fake_playing)
        {
            return Some((stream, true));
        }
        registry
            .find_by_state(StreamState::can_be_current)
            .map(|stream| (stream, false))
    }

    pub(crate) fn current_times(&self) -> Option<(Arc<D>, Duration, Option<Duration>)> {
        let (stream, buffering) = self.current_stream()?;
        let mixer = self.sink.mixer_position();
        let s = stream.lock();
        let position = if buffering {
            Duration::ZERO
        } else {
            s.position(mixer)?
        };
        Some((Arc::clone(&s.data), position, s.graph.duration()))
    }

    /// Block on the event channel and dispatch until shut down.
    pub(crate) fn event_loop(&self) {
        info!("Dispatch loop started");
        while self.running.load(Ordering::SeqCst) {
            let wait = self.sink.next_deadline().map_or(MAX_LOOP_WAIT, |at| {
                at.saturating_duration_since(Instant::now()).min(MAX_LOOP_WAIT)
            });

            // holding the control lock while waiting keeps a sink start on
            // another thread from missing its readiness event
            let control = self.control.lock();
            match self.event_rx.recv_timeout(wait) {
                Ok(event) => self.requeued.lock().push_back(event),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
            self.dispatch_pending();
            parking_lot::ReentrantMutexGuard::unlock_fair(control);
        }
        info!("Dispatch loop stopped");
    }
}

/// Longest the dispatch loop holds the control lock while idle.
const MAX_LOOP_WAIT: Duration = Duration::from_millis(20);
