//! Playlist driver on top of the playback engine.

use segue_core::{PlayType, PlayerErrorKind, Result};
use segue_engine::{Engine, PlayerEvent};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One playlist entry, used as the engine's stream data.
#[derive(Debug, Clone)]
pub struct Track {
    pub index: usize,
    pub uri: String,
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.index + 1, self.uri)
    }
}

/// Plays a list of URIs in order using one transition policy.
pub struct PlaylistService {
    engine: Engine<Track>,
    pending: VecDeque<Track>,
    total: usize,
    play_type: PlayType,
    crossfade: Duration,
    /// Index of the track announced last.
    current: Option<usize>,
    /// The track after the current one was already handed to the engine.
    next_queued: bool,
    finished: bool,
}

impl PlaylistService {
    pub fn new(
        engine: Engine<Track>,
        uris: Vec<String>,
        play_type: PlayType,
        crossfade: Duration,
    ) -> Self {
        let pending: VecDeque<_> = uris
            .into_iter()
            .enumerate()
            .map(|(index, uri)| Track { index, uri })
            .collect();
        Self {
            engine,
            total: pending.len(),
            pending,
            play_type,
            crossfade,
            current: None,
            next_queued: false,
            finished: false,
        }
    }

    pub const fn engine(&self) -> &Engine<Track> {
        &self.engine
    }

    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Start the first track.
    pub fn start(&mut self) -> Result<()> {
        info!(
            "Playing {} tracks ({}, crossfade {:?})",
            self.total, self.play_type, self.crossfade
        );
        if !self.advance(PlayType::Replace)? {
            self.finished = true;
        }
        Ok(())
    }

    /// Open the next track that opens successfully and play it.
    ///
    /// Returns false when the playlist is exhausted.
    fn advance(&mut self, play_type: PlayType) -> Result<bool> {
        while let Some(track) = self.pending.pop_front() {
            let uri = track.uri.clone();
            if let Err(e) = self.engine.open(&uri, track) {
                warn!("Skipping {uri}: {e}");
                continue;
            }
            self.engine.play(play_type, self.crossfade)?;
            self.next_queued = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// React to every queued engine notification.
    pub fn poll(&mut self) -> Result<()> {
        while let Some(event) = self.engine.try_recv_event() {
            self.handle(event)?;
        }
        Ok(())
    }

    fn handle(&mut self, event: PlayerEvent<Track>) -> Result<()> {
        match event {
            PlayerEvent::PlayingStream(track) => {
                info!("Now playing {track}");
                self.current = Some(track.index);
                self.next_queued = false;
                if self.play_type == PlayType::AfterEos {
                    // queue the follower right away so it starts gaplessly
                    self.advance(PlayType::AfterEos)?;
                }
            }
            PlayerEvent::Tick {
                data,
                position,
                duration,
            } => {
                debug!("{data}: {position:?} / {duration:?}");
                let remaining = duration.map(|d| d.saturating_sub(position));
                if self.play_type == PlayType::Crossfade
                    && !self.next_queued
                    && remaining.is_some_and(|r| r <= self.crossfade)
                {
                    info!("Crossfading out of {data}");
                    self.advance(PlayType::Crossfade)?;
                }
            }
            PlayerEvent::EndOfStream(track) => {
                info!("Finished {track}");
                // a track that was crossfaded out can still run into its end
                if self.current == Some(track.index)
                    && !self.next_queued
                    && !self.advance(PlayType::Replace)?
                {
                    self.finished = true;
                }
            }
            PlayerEvent::Error {
                data,
                kind,
                message,
            } => {
                error!("{data} failed ({kind:?}): {message}");
                if kind == PlayerErrorKind::NoAudio {
                    self.finished = true;
                } else if !self.next_queued && !self.advance(PlayType::Replace)? {
                    self.finished = true;
                }
            }
            PlayerEvent::AboutToFinish(track) => debug!("{track} is about to finish"),
            PlayerEvent::Buffering { data, percent } => info!("{data}: buffering {percent}%"),
            PlayerEvent::Info { data, field, value } => {
                info!("{data}: {field:?} = {value:?}");
            }
            PlayerEvent::Image { data, image } => {
                debug!("{data}: {} byte image", image.len());
            }
            PlayerEvent::Event { data, name } => debug!("{data}: {name}"),
            PlayerEvent::Redirect { data, uri } => info!("{data} redirected to {uri}"),
            PlayerEvent::VolumeChanged(volume) => info!("Volume changed to {volume:.2}"),
            PlayerEvent::MissingPlugins {
                data, descriptions, ..
            } => {
                warn!("{data} needs {}", descriptions.join(", "));
            }
            PlayerEvent::ElementInserted { kind, name } => debug!("Output {kind} {name} added"),
            PlayerEvent::ElementRemoving { kind, name } => debug!("Output {kind} {name} removed"),
        }
        Ok(())
    }
}
