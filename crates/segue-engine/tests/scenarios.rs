//! End-to-end transitions between streams.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

mod support;

use segue_core::PlayType;
use segue_engine::sim::SimGraph;
use segue_engine::{FlushScope, PlayerEvent, StreamState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::*;

const SECOND: Duration = Duration::from_secs(1);

#[test]
fn test_gapless_after_eos() {
    let sim = SimGraph::new();
    sim.set_duration("file:///a.ogg", Duration::from_secs(5));
    let engine = engine(&sim);

    start(&engine, &sim, "file:///a.ogg");
    open(&engine, &sim, "file:///b.ogg");
    assert_eq!(state_of(&engine, "file:///b.ogg"), Some(StreamState::Waiting));

    engine.play(PlayType::AfterEos, Duration::ZERO).unwrap();
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///b.ogg"),
        Some(StreamState::WaitingEos)
    );
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Playing)
    );
    assert_at_most_one_active(&engine);
    drain(&engine);

    sim.advance(Duration::from_secs(5));
    settle(&engine);

    let events = drain(&engine);
    let eos = events
        .iter()
        .position(|e| matches!(e, PlayerEvent::EndOfStream(d) if d.as_str() == "file:///a.ogg"))
        .unwrap();
    let playing = events
        .iter()
        .position(|e| matches!(e, PlayerEvent::PlayingStream(d) if d.as_str() == "file:///b.ogg"))
        .unwrap();
    assert!(eos < playing);

    let states = engine.stream_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].uri, "file:///b.ogg");
    assert_eq!(states[0].state, StreamState::Playing);
    assert_linked_consistent(&engine, &sim);
    assert_at_most_one_active(&engine);
}

#[test]
fn test_crossfade() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    sim.advance(Duration::from_secs(10));
    settle(&engine);

    let b = open(&engine, &sim, "file:///b.ogg");
    engine
        .play(PlayType::Crossfade, Duration::from_secs(2))
        .unwrap();
    settle(&engine);

    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::FadingOut)
    );
    assert_eq!(
        state_of(&engine, "file:///b.ogg"),
        Some(StreamState::FadingIn)
    );
    assert_eq!(engine.linked_stream_count(), 2);
    assert_linked_consistent(&engine, &sim);
    assert_at_most_one_active(&engine);

    sim.advance(SECOND);
    settle(&engine);
    assert!((a.gain() - 0.5).abs() < 1e-6);
    assert!((b.gain() - 0.5).abs() < 1e-6);
    assert_linked_consistent(&engine, &sim);
    assert_at_most_one_active(&engine);

    sim.advance(SECOND);
    settle(&engine);

    let states = engine.stream_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].uri, "file:///b.ogg");
    assert_eq!(states[0].state, StreamState::Playing);
    assert!(a.is_disposed());
    assert_eq!(engine.linked_stream_count(), 1);
    assert_linked_consistent(&engine, &sim);
    assert_at_most_one_active(&engine);

    let playing = playing_names(&drain(&engine));
    assert_eq!(playing, ["file:///a.ogg", "file:///b.ogg"]);
}

#[test]
fn test_crossfade_with_nothing_playing_starts_at_full_gain() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = open(&engine, &sim, "file:///a.ogg");
    engine
        .play(PlayType::Crossfade, Duration::from_secs(2))
        .unwrap();
    settle(&engine);

    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Playing)
    );
    assert!((a.gain() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn test_pause_and_resume() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    sim.advance(Duration::from_secs(10));
    settle(&engine);
    drain(&engine);

    engine.pause();
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::FadingOutPaused)
    );
    assert!(!engine.playing());
    assert_at_most_one_active(&engine);

    sim.advance(Duration::from_millis(500));
    settle(&engine);

    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Paused)
    );
    assert!(!a.is_linked());
    assert_eq!(engine.linked_stream_count(), 0);
    // backed up by the fade length so the resume doesn't skip audio
    assert_eq!(
        a.seeks().last().copied(),
        Some((Duration::from_secs(10), FlushScope::Downstream))
    );
    assert_eq!(engine.get_time(), Some(Duration::from_secs(10)));

    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::FadingIn)
    );
    assert!(a.is_linked());
    assert!(engine.playing());
    assert_at_most_one_active(&engine);

    sim.advance(Duration::from_millis(500));
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Playing)
    );
    assert_eq!(engine.get_time(), Some(Duration::from_millis(10_500)));
    assert_eq!(playing_names(&drain(&engine)), ["file:///a.ogg"]);
    assert_linked_consistent(&engine, &sim);
    assert_at_most_one_active(&engine);
}

#[test]
fn test_play_during_pause_fade_fades_back_in() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    sim.advance(Duration::from_secs(3));
    settle(&engine);

    engine.pause();
    sim.advance(Duration::from_millis(250));
    settle(&engine);
    assert!((a.gain() - 0.5).abs() < 1e-6);

    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::FadingIn)
    );

    sim.advance(Duration::from_millis(250));
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Playing)
    );
    assert!(a.is_linked());
}

#[test]
fn test_play_before_pause_block_lands_resumes() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    sim.advance(Duration::from_secs(10));
    settle(&engine);

    engine.pause();
    settle(&engine);
    a.set_manual_block(true);
    sim.advance(Duration::from_millis(500));
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::SeekingPaused)
    );
    assert!(a.is_linked());

    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Seeking)
    );

    a.confirm_block();
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::FadingIn)
    );
    assert!(a.is_linked());
    assert!(!a.is_blocked());
    assert_eq!(
        a.seeks().last().copied(),
        Some((Duration::from_secs(10), FlushScope::Downstream))
    );
    assert_linked_consistent(&engine, &sim);

    sim.advance(Duration::from_millis(500));
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Playing)
    );
    assert!(engine.playing());
    assert_eq!(engine.get_time(), Some(Duration::from_millis(10_500)));
    assert_at_most_one_active(&engine);
}

#[test]
fn test_reuse_releases_only_the_old_data() {
    let sim = SimGraph::new();
    let a_drops = Arc::new(AtomicUsize::new(0));
    let b_drops = Arc::new(AtomicUsize::new(0));
    let engine = engine_with::<Track>(
        &sim,
        Arc::new(RecordingHooks::reusing()),
        quiet_config(),
    );

    engine
        .open("file:///a.ogg", Track::new("a", &a_drops))
        .unwrap();
    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(&engine);
    drain(&engine);

    engine
        .open("file:///b.ogg", Track::new("b", &b_drops))
        .unwrap();
    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(&engine);

    let events = drain(&engine);
    let playing: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::PlayingStream(track) => Some(track.name),
            _ => None,
        })
        .collect();
    assert_eq!(playing, ["b"]);
    drop(events);

    assert_eq!(a_drops.load(Ordering::SeqCst), 1);
    assert_eq!(b_drops.load(Ordering::SeqCst), 0);
    assert_eq!(engine.stream_states().len(), 1);
    assert_at_most_one_active(&engine);

    drop(engine);
    assert_eq!(a_drops.load(Ordering::SeqCst), 1);
    assert_eq!(b_drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reuse_replaces_in_place() {
    let sim = SimGraph::new();
    let hooks = Arc::new(RecordingHooks::reusing());
    let engine = engine_with::<String>(&sim, hooks.clone(), quiet_config());

    let a = start(&engine, &sim, "file:///a.ogg");
    sim.advance(Duration::from_secs(2));
    settle(&engine);
    drain(&engine);

    engine
        .open("file:///b.ogg", "file:///b.ogg".to_string())
        .unwrap();
    let states = engine.stream_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].state, StreamState::Reusing);
    // reuse only counts once it plays
    assert!(!engine.opened());

    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(&engine);

    let states = engine.stream_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].uri, "file:///b.ogg");
    assert_eq!(states[0].state, StreamState::Playing);
    assert!(a.is_linked());
    assert_eq!(
        hooks.reused.lock().as_slice(),
        [("file:///a.ogg".to_string(), "file:///b.ogg".to_string())]
    );
    assert_eq!(playing_names(&drain(&engine)), ["file:///b.ogg"]);
    assert_linked_consistent(&engine, &sim);
    assert_at_most_one_active(&engine);
}

#[test]
fn test_gapless_continuation_through_about_to_finish() {
    let sim = SimGraph::new();
    let hooks = Arc::new(RecordingHooks::reusing());
    let engine = engine_with::<String>(&sim, hooks.clone(), quiet_config());

    let a = start(&engine, &sim, "file:///a.ogg");
    drain(&engine);

    let answer = a.request_continuation();
    settle(&engine);
    assert!(answer.try_recv().is_err());
    let events = drain(&engine);
    assert!(matches!(
        events.as_slice(),
        [PlayerEvent::AboutToFinish(d)] if d.as_str() == "file:///a.ogg"
    ));

    engine
        .open("file:///b.ogg", "file:///b.ogg".to_string())
        .unwrap();
    assert_eq!(answer.try_recv().unwrap().as_deref(), Some("file:///b.ogg"));

    engine.play(PlayType::AfterEos, Duration::ZERO).unwrap();
    a.continue_into("file:///b.ogg");
    settle(&engine);

    let events = drain(&engine);
    assert!(!events
        .iter()
        .any(|e| matches!(e, PlayerEvent::EndOfStream(_))));
    assert_eq!(playing_names(&events), ["file:///b.ogg"]);

    let states = engine.stream_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].uri, "file:///b.ogg");
    assert_eq!(states[0].state, StreamState::Playing);
    assert!(a.is_linked());
    assert_eq!(hooks.reused.lock().len(), 1);
}

#[test]
fn test_about_to_finish_answered_from_queued_reuse() {
    let sim = SimGraph::new();
    let engine = engine_with::<String>(
        &sim,
        Arc::new(RecordingHooks::reusing()),
        quiet_config(),
    );

    let a = start(&engine, &sim, "file:///a.ogg");
    engine
        .open("file:///b.ogg", "file:///b.ogg".to_string())
        .unwrap();
    drain(&engine);

    let answer = a.request_continuation();
    settle(&engine);
    assert_eq!(answer.try_recv().unwrap().as_deref(), Some("file:///b.ogg"));
    assert!(drain(&engine).is_empty());
}

#[test]
fn test_about_to_finish_unanswered_after_eos() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    let answer = a.request_continuation();
    settle(&engine);

    a.end_of_stream();
    settle(&engine);
    // the waiter was dropped, so the decoder stops waiting
    assert!(matches!(
        answer.try_recv(),
        Err(crossbeam_channel::TryRecvError::Disconnected)
    ));
}

#[test]
fn test_replace_removes_everything_playing() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    open(&engine, &sim, "file:///b.ogg");
    assert_at_most_one_active(&engine);
    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(&engine);

    let states = engine.stream_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].state, StreamState::Playing);
    assert!(a.is_disposed());
    assert_linked_consistent(&engine, &sim);
    assert_at_most_one_active(&engine);
}

#[test]
fn test_seek_back_after_eos() {
    let sim = SimGraph::new();
    sim.set_duration("file:///a.ogg", Duration::from_secs(4));
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    sim.advance(Duration::from_secs(4));
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::PendingRemove)
    );
    assert!(!a.is_linked());
    assert!(!engine.opened());

    engine.set_time(Duration::from_secs(1));
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Playing)
    );
    assert!(a.is_linked());
    assert_eq!(
        a.seeks().last().copied(),
        Some((SECOND, FlushScope::Downstream))
    );
    assert_linked_consistent(&engine, &sim);
}
