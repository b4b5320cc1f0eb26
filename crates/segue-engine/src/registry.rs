//! Recency-ordered list of open streams and the reaper that disposes of them.

use crate::engine::Shared;
use crate::graph::StreamId;
use crate::stream::{Stream, StreamInner, StreamState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Open streams, most recently opened (or reused) first.
pub(crate) struct Registry<D> {
    streams: Vec<Arc<Stream<D>>>,
    next_id: u64,
    reap_scheduled: bool,
}

impl<D> Registry<D> {
    pub const fn new() -> Self {
        Self {
            streams: Vec::new(),
            next_id: 1,
            reap_scheduled: false,
        }
    }

    /// Allocate an id that is never handed out again.
    pub fn allocate_id(&mut self) -> StreamId {
        let id = StreamId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn push_front(&mut self, stream: Arc<Stream<D>>) {
        self.streams.insert(0, stream);
        self.dump("added");
    }

    pub fn move_to_front(&mut self, id: StreamId) {
        if let Some(index) = self.streams.iter().position(|s| s.id() == id) {
            let stream = self.streams.remove(index);
            self.streams.insert(0, stream);
            self.dump("reordered");
        }
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Arc<Stream<D>>> {
        let index = self.streams.iter().position(|s| s.id() == id)?;
        let stream = self.streams.remove(index);
        self.dump("removed");
        Some(stream)
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<Stream<D>>> {
        self.streams.iter().find(|s| s.id() == id).cloned()
    }

    pub fn head(&self) -> Option<Arc<Stream<D>>> {
        self.streams.first().cloned()
    }

    pub fn find_by_uri(&self, uri: &str) -> Option<Arc<Stream<D>>> {
        self.find(|s| s.uri == uri)
    }

    /// First stream whose state satisfies `pred`.
    pub fn find_by_state(&self, pred: impl Fn(StreamState) -> bool) -> Option<Arc<Stream<D>>> {
        self.find(|s| pred(s.state))
    }

    pub fn find(&self, pred: impl Fn(&StreamInner<D>) -> bool) -> Option<Arc<Stream<D>>> {
        self.streams.iter().find(|s| pred(&s.lock())).cloned()
    }

    /// Every stream whose state satisfies `pred`.
    pub fn in_state(&self, pred: impl Fn(StreamState) -> bool) -> Vec<Arc<Stream<D>>> {
        self.streams
            .iter()
            .filter(|s| pred(s.state()))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Stream<D>>> {
        self.streams.clone()
    }


    /// Returns true if a reap wasn't already scheduled.
    pub fn schedule_reap(&mut self) -> bool {
        !std::mem::replace(&mut self.reap_scheduled, true)
    }

    pub fn take_reap_flag(&mut self) -> bool {
        std::mem::take(&mut self.reap_scheduled)
    }

    fn dump(&self, why: &str) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        trace!("Stream registry {why}, {} streams:", self.streams.len());
        for stream in &self.streams {
            let s = stream.lock();
            trace!(
                "  {} [{}] {}{}",
                stream.id(),
                s.state,
                s.uri,
                if s.is_linked() { " (linked)" } else { "" }
            );
        }
    }
}

impl<D: Send + Sync + 'static> Shared<D> {
    pub(crate) fn schedule_reap(&self) {
        if self.registry.lock().schedule_reap() {
            debug!("Scheduling stream reap");
        }
    }

    /// Dispose of every stream marked for removal.
    pub(crate) fn reap_streams(&self) {
        let doomed = self.registry.lock().in_state(StreamState::is_terminal);
        for stream in doomed {
            debug!("Reaping stream {}", stream.uri());
            self.unlink_and_dispose(&stream);
        }
    }

    /// Tear a stream down: discard fades, force it out of the mixer, and
    /// drop it from the registry.
    pub(crate) fn unlink_and_dispose(&self, stream: &Arc<Stream<D>>) {
        let slot = {
            let mut s = stream.lock();
            s.cancel_fade();
            s.continuation_waiter = None;
            s.state = StreamState::PendingRemove;
            s.graph.stop();
            let slot = s.slot.take();
            if let Some(slot) = slot {
                s.graph.detach(slot);
            }
            s.needs_unlink = false;
            slot
        };

        if let Some(slot) = slot {
            self.sink.release_slot(slot);
            let remaining = self.linked.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!("Stream {} unlinked, {remaining} linked streams left", stream.id());
            if remaining == 0 {
                self.maybe_stop_sink();
            }
        }

        self.registry.lock().remove(stream.id());
    }
}
