//! Output sink management: the shared mixer and audio device.
//!
//! The output path is created lazily on the first `open()` and started on
//! demand when a stream is linked. Starting waits inline for the device to
//! report readiness, bounded by a timeout. Once the last stream unlinks an
//! idle timer stops the device again.

use crate::chain::{ChainChange, ChainOp, OutputChain};
use crate::engine::Shared;
use crate::graph::{
    EventSender, EventSource, GraphEvent, GraphEventKind, MediaGraph, MixerSlot,
    OutputElementKind, OutputPath,
};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use segue_core::{Error, Result};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// State of the output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkState {
    #[default]
    Uninitialized,
    Stopped,
    Playing,
}

/// Which stage applies the caller's volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeControl {
    /// The device's own volume.
    Device,
    /// Gain on the mixer output.
    Mixer,
}

struct SinkInner {
    state: SinkState,
    output: Option<Box<dyn OutputPath>>,
    volume_control: Option<VolumeControl>,
    volume: f64,
    /// How many times the caller set the volume.
    volume_sets: u32,
    stop_at: Option<Instant>,
    next_tick: Option<Instant>,
    chain: OutputChain,
}

impl SinkInner {
    /// Push the current volume to the active control.
    fn apply_volume(&mut self) {
        let volume = self.volume;
        let skip_first = self.volume_sets <= 1;
        let (Some(control), Some(output)) = (self.volume_control, self.output.as_mut()) else {
            return;
        };
        match control {
            // the hardware remembers its volume; the first value set by
            // the caller is usually a restored default and doesn't win
            VolumeControl::Device if skip_first => {
                debug!("Leaving device volume alone");
            }
            VolumeControl::Device => output.set_device_volume(volume),
            VolumeControl::Mixer => output.set_mixer_volume(volume),
        }
    }
}

/// The shared output path and its lifecycle.
pub(crate) struct OutputSink {
    inner: Mutex<SinkInner>,
}

impl OutputSink {
    pub fn new(volume: f64) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                state: SinkState::Uninitialized,
                output: None,
                volume_control: None,
                volume,
                volume_sets: 0,
                stop_at: None,
                next_tick: None,
                chain: OutputChain::default(),
            }),
        }
    }

    pub fn state(&self) -> SinkState {
        self.inner.lock().state
    }

    /// Build the output path if it doesn't exist yet. Returns true if it
    /// was built by this call.
    pub fn ensure_created(&self, graph: &dyn MediaGraph, events: EventSender) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.state != SinkState::Uninitialized {
            return Ok(false);
        }
        let output = graph
            .create_output(events)
            .map_err(|e| Error::Construction(format!("output path: {e}")))?;
        inner.output = Some(output);
        inner.state = SinkState::Stopped;
        info!("Output path created");
        Ok(true)
    }

    /// Start the output and wait for it to become ready.
    ///
    /// Events that arrive on `events` while waiting and aren't about the
    /// output's readiness are handed to `requeue` in arrival order.
    pub fn start(
        &self,
        events: &Receiver<GraphEvent>,
        requeue: &mut dyn FnMut(GraphEvent),
        timeout: Duration,
        tick_interval: Duration,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SinkState::Playing => return Ok(()),
                SinkState::Uninitialized => {
                    return Err(Error::Internal("output path was never created".to_string()))
                }
                SinkState::Stopped => {}
            }
            debug!("Starting output");
            let output = inner
                .output
                .as_mut()
                .ok_or_else(|| Error::Internal("output path missing".to_string()))?;
            output.start().map_err(|e| Error::Output(e.to_string()))?;
        }

        if let Err(e) = Self::wait_ready(events, requeue, timeout) {
            error!("Output failed to start: {e}");
            let mut inner = self.inner.lock();
            if let Some(output) = inner.output.as_mut() {
                if let Err(stop_err) = output.stop() {
                    warn!("Failed to stop output after failed start: {stop_err}");
                }
            }
            return Err(e);
        }

        let mut inner = self.inner.lock();
        let output = inner
            .output
            .as_mut()
            .ok_or_else(|| Error::Internal("output path missing".to_string()))?;
        let control = if output.has_device_volume() {
            VolumeControl::Device
        } else {
            VolumeControl::Mixer
        };
        output.play().map_err(|e| Error::Output(e.to_string()))?;

        inner.volume_control = Some(control);
        inner.apply_volume();
        inner.state = SinkState::Playing;
        inner.next_tick = Some(Instant::now() + tick_interval);
        info!("Output started, volume via {control:?}");
        Ok(())
    }

    fn wait_ready(
        events: &Receiver<GraphEvent>,
        requeue: &mut dyn FnMut(GraphEvent),
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let timed_out = || Error::OutputTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            match events.recv_timeout(remaining) {
                Ok(GraphEvent {
                    source: EventSource::Output,
                    kind: GraphEventKind::OutputReady,
                }) => return Ok(()),
                Ok(GraphEvent {
                    source: EventSource::Output,
                    kind: GraphEventKind::OutputError(message),
                }) => return Err(Error::Output(message)),
                Ok(event) => requeue(event),
                Err(RecvTimeoutError::Timeout) => return Err(timed_out()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Internal("event channel closed".to_string()))
                }
            }
        }
    }

    /// Stop the output and forget the volume control.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stop_at = None;
        if inner.state != SinkState::Playing {
            return Ok(());
        }
        debug!("Stopping output");
        inner.state = SinkState::Stopped;
        inner.next_tick = None;
        inner.volume_control = None;
        if let Some(output) = inner.output.as_mut() {
            output.stop().map_err(|e| Error::Output(e.to_string()))?;
        }
        info!("Output stopped");
        Ok(())
    }

    /// Arm the idle-stop timer.
    pub fn arm_idle_stop(&self, delay: Duration) {
        let mut inner = self.inner.lock();
        if inner.state == SinkState::Playing && inner.stop_at.is_none() {
            debug!("Stopping output in {delay:?} unless something links");
            inner.stop_at = Some(Instant::now() + delay);
        }
    }

    pub fn cancel_idle_stop(&self) {
        if self.inner.lock().stop_at.take().is_some() {
            debug!("Idle stop cancelled");
        }
    }

    /// Returns true (and disarms the timer) if the idle stop is due.
    pub fn take_due_idle_stop(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.stop_at {
            Some(at) if at <= now => {
                inner.stop_at = None;
                true
            }
            _ => false,
        }
    }

    /// Returns true if a tick is due, scheduling the next one.
    pub fn take_due_tick(&self, now: Instant, interval: Duration) -> bool {
        let mut inner = self.inner.lock();
        match inner.next_tick {
            Some(at) if at <= now => {
                inner.next_tick = Some(now + interval);
                true
            }
            _ => false,
        }
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        match (inner.stop_at, inner.next_tick) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn mixer_position(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != SinkState::Playing {
            return None;
        }
        inner.output.as_ref().and_then(|output| output.position())
    }

    pub fn acquire_slot(&self) -> Result<MixerSlot> {
        let mut inner = self.inner.lock();
        let output = inner
            .output
            .as_mut()
            .ok_or_else(|| Error::Internal("output path missing".to_string()))?;
        output
            .request_slot()
            .map_err(|e| Error::Link(format!("no mixer slot available: {e}")))
    }

    pub fn release_slot(&self, slot: MixerSlot) {
        if let Some(output) = self.inner.lock().output.as_mut() {
            output.release_slot(slot);
        }
    }

    /// Store the caller's volume and apply it if a control is active.
    pub fn set_volume(&self, volume: f64) {
        let mut inner = self.inner.lock();
        inner.volume = volume;
        inner.volume_sets = inner.volume_sets.saturating_add(1);
        inner.apply_volume();
    }

    pub fn volume(&self) -> f64 {
        self.inner.lock().volume
    }

    /// The device reported a volume change of its own.
    pub fn device_volume_changed(&self, volume: f64) {
        self.inner.lock().volume = volume;
    }

    pub fn output_elements(&self) -> Vec<(OutputElementKind, String)> {
        self.inner.lock().chain.elements()
    }

    /// Add or remove an output element, right away if nothing is flowing
    /// through the chain.
    pub fn change_chain(&self, op: ChainOp, notify: &mut dyn FnMut(ChainChange)) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.chain.check(&op)?;

        let Some(output) = inner.output.as_mut() else {
            debug!("Output not built yet, queueing chain change");
            inner.chain.queue(op);
            return Ok(());
        };
        if inner.state == SinkState::Playing || inner.chain.blocking {
            inner.chain.queue(op);
            if !inner.chain.blocking {
                debug!("Blocking the output chain for a change");
                inner.chain.blocking = true;
                output.block_chain();
            }
            return Ok(());
        }
        inner.chain.apply(output.as_mut(), op, notify)
    }

    /// Apply queued chain changes and release a chain block.
    pub fn flush_chain(&self, notify: &mut dyn FnMut(ChainChange)) -> Vec<Error> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(output) = inner.output.as_mut() else {
            return Vec::new();
        };

        let mut failures = Vec::new();
        for op in inner.chain.take_queued() {
            if let Err(e) = inner.chain.apply(output.as_mut(), op, notify) {
                failures.push(e);
            }
        }
        if std::mem::take(&mut inner.chain.blocking) {
            debug!("Unblocking the output chain");
            output.unblock_chain();
        }
        failures
    }
}

impl<D: Send + Sync + 'static> Shared<D> {
    /// Start the output, re-queueing anything else that arrives meanwhile.
    pub(crate) fn start_sink(&self) -> Result<()> {
        let mut requeue = |event: GraphEvent| self.requeued.lock().push_back(event);
        self.sink.start(
            &self.event_rx,
            &mut requeue,
            self.config.sink_start_timeout(),
            self.config.tick_interval(),
        )
    }

    /// Arm the idle stop if nothing is linked.
    pub(crate) fn maybe_stop_sink(&self) {
        if self.linked.load(Ordering::SeqCst) == 0 {
            self.sink.arm_idle_stop(self.config.idle_stop_delay());
        }
    }
}
