//! Notifications from streams and the output, and how they steer playback.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

mod support;

use bytes::Bytes;
use segue_core::{EngineConfig, PlayType, PlayerErrorKind, TagField, TagValue};
use segue_engine::sim::{SimGraph, SimPreroll};
use segue_engine::{FlushScope, GraphErrorKind, NoHooks, PlayerEvent, StreamState};
use std::sync::Arc;
use std::time::Duration;
use support::*;

#[test]
fn test_buffering_pauses_and_resumes() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    drain(&engine);

    a.buffering(40);
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Paused)
    );
    assert!(!a.is_linked());

    a.buffering(100);
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Playing)
    );
    assert!(a.is_linked());

    let events = drain(&engine);
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::Buffering { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents, [40, 100]);
    assert_eq!(playing_names(&events), ["file:///a.ogg"]);
    assert_linked_consistent(&engine, &sim);
}

#[test]
fn test_pause_while_buffering_stays_paused() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    a.buffering(10);
    settle(&engine);
    engine.pause();

    a.buffering(100);
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Paused)
    );
    assert!(!a.is_linked());
}

#[test]
fn test_buffering_while_fading_out_abandons_stream() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    let b = open(&engine, &sim, "file:///b.ogg");
    engine
        .play(PlayType::Crossfade, Duration::from_secs(4))
        .unwrap();
    settle(&engine);
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::FadingOut)
    );

    a.buffering(20);
    settle(&engine);
    assert!(a.is_disposed());
    assert_eq!(state_of(&engine, "file:///a.ogg"), None);
    assert_eq!(
        state_of(&engine, "file:///b.ogg"),
        Some(StreamState::FadingIn)
    );
    assert!(b.is_linked());
    assert_linked_consistent(&engine, &sim);
}

#[test]
fn test_buffering_before_preroll_reports_playing() {
    let sim = SimGraph::new();
    sim.set_preroll(SimPreroll::Manual);
    let engine = engine(&sim);

    engine
        .open("http://radio.example/stream", "radio".to_string())
        .unwrap();
    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    let radio = sim.stream("http://radio.example/stream").unwrap();

    radio.buffering(20);
    settle(&engine);
    let events = drain(&engine);
    assert!(matches!(
        events.as_slice(),
        [PlayerEvent::Buffering { percent: 20, .. }, PlayerEvent::PlayingStream(d)]
            if d.as_str() == "radio"
    ));
    // position is pinned while the fake stream buffers
    assert_eq!(engine.get_time(), Some(Duration::ZERO));

    radio.buffering(100);
    radio.finish_preroll();
    settle(&engine);
    assert_eq!(
        state_of(&engine, "http://radio.example/stream"),
        Some(StreamState::Playing)
    );
}

#[test]
fn test_repeated_errors_are_suppressed() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    drain(&engine);

    a.error(GraphErrorKind::Other, "bad data");
    a.error(GraphErrorKind::StreamFailed, "internal data stream error");
    settle(&engine);

    let events = drain(&engine);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        PlayerEvent::Error { kind: PlayerErrorKind::General, message, .. } if message == "bad data"
    ));
    assert!(a.is_disposed());
    assert!(engine.stream_states().is_empty());
    assert_eq!(engine.linked_stream_count(), 0);
}

#[test]
fn test_device_errors_map_to_no_audio() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    drain(&engine);

    a.error(GraphErrorKind::ResourceBusy, "device in use");
    settle(&engine);
    assert!(matches!(
        drain(&engine).as_slice(),
        [PlayerEvent::Error { kind: PlayerErrorKind::NoAudio, .. }]
    ));
}

#[test]
fn test_error_before_playing_identifies_stream() {
    let sim = SimGraph::new();
    sim.set_preroll(SimPreroll::Manual);
    let engine = engine(&sim);

    engine
        .open("file:///a.ogg", "file:///a.ogg".to_string())
        .unwrap();
    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    sim.stream("file:///a.ogg")
        .unwrap()
        .error(GraphErrorKind::Other, "no decoder");
    settle(&engine);

    let events = drain(&engine);
    assert!(matches!(
        events.as_slice(),
        [PlayerEvent::PlayingStream(_), PlayerEvent::Error { .. }]
    ));
}

#[test]
fn test_output_error_reported_against_current_stream() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    start(&engine, &sim, "file:///a.ogg");
    drain(&engine);

    sim.output().report_error("device unplugged");
    settle(&engine);
    assert!(matches!(
        drain(&engine).as_slice(),
        [PlayerEvent::Error { data, kind: PlayerErrorKind::NoAudio, message }]
            if data.as_str() == "file:///a.ogg" && message == "device unplugged"
    ));
}

#[test]
fn test_metadata_held_until_playing() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    engine
        .open("file:///a.ogg", "file:///a.ogg".to_string())
        .unwrap();
    let a = sim.stream("file:///a.ogg").unwrap();
    a.tag(TagField::Title, "Windowlicker");
    a.image(Bytes::from_static(b"\x89PNG"));
    settle(&engine);
    assert!(drain(&engine).is_empty());

    engine.play(PlayType::Replace, Duration::ZERO).unwrap();
    settle(&engine);
    let events = drain(&engine);
    assert!(matches!(
        events.as_slice(),
        [
            PlayerEvent::PlayingStream(_),
            PlayerEvent::Info { field: TagField::Title, value: TagValue::Text(title), .. },
            PlayerEvent::Image { .. },
        ] if title == "Windowlicker"
    ));

    a.tag(TagField::Bitrate, 320_000u64);
    settle(&engine);
    assert!(matches!(
        drain(&engine).as_slice(),
        [PlayerEvent::Info { value: TagValue::Number(320_000), .. }]
    ));
}

#[test]
fn test_application_and_redirect_events() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "http://radio.example/playlist");
    drain(&engine);

    a.application("stream-title-changed");
    a.redirect("http://radio.example/stream.ogg");
    settle(&engine);
    let events = drain(&engine);
    assert!(matches!(
        events.as_slice(),
        [PlayerEvent::Event { name, .. }, PlayerEvent::Redirect { uri, .. }]
            if name == "stream-title-changed" && uri == "http://radio.example/stream.ogg"
    ));
}

#[test]
fn test_missing_plugins_reported_once() {
    let sim = SimGraph::new();
    sim.set_preroll(SimPreroll::Manual);
    let hooks = Arc::new(RecordingHooks::default());
    let engine = engine_with::<String>(&sim, hooks.clone(), quiet_config());

    engine
        .open("file:///a.spc", "file:///a.spc".to_string())
        .unwrap();
    let a = sim.stream("file:///a.spc").unwrap();
    a.missing_plugin("decoder-audio/x-spc", "SPC decoder");
    settle(&engine);
    settle(&engine);

    let events = drain(&engine);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        PlayerEvent::MissingPlugins { details, descriptions, .. }
            if details == &["decoder-audio/x-spc"] && descriptions == &["SPC decoder"]
    ));
    assert_eq!(hooks.missing.lock().as_slice(), ["SPC decoder"]);
}

#[test]
fn test_seek_while_playing_stays_inside_stream() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    sim.advance(Duration::from_secs(5));
    settle(&engine);

    engine.set_time(Duration::from_secs(30));
    settle(&engine);
    assert_eq!(
        a.seeks(),
        [(Duration::from_secs(30), FlushScope::Stream)]
    );
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Playing)
    );
    assert!(a.is_linked());
    assert_eq!(engine.get_time(), Some(Duration::from_secs(30)));

    sim.advance(Duration::from_secs(1));
    settle(&engine);
    assert_eq!(engine.get_time(), Some(Duration::from_secs(31)));
}

#[test]
fn test_seek_while_paused() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    engine.pause();
    sim.advance(Duration::from_millis(500));
    settle(&engine);

    engine.set_time(Duration::from_secs(42));
    settle(&engine);
    assert_eq!(
        a.seeks().last().copied(),
        Some((Duration::from_secs(42), FlushScope::Downstream))
    );
    assert_eq!(
        state_of(&engine, "file:///a.ogg"),
        Some(StreamState::Paused)
    );
    assert_eq!(engine.get_time(), Some(Duration::from_secs(42)));
}

#[test]
fn test_replaygain_applies_to_steady_stream() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    let a = start(&engine, &sim, "file:///a.ogg");
    engine.set_replaygain("file:///a.ogg", -6.0, 0.0, 0.0, 0.0);
    assert!((a.gain() - 10f64.powf(-0.3)).abs() < 1e-9);

    // the album value wins and the peak keeps it from clipping
    engine.set_replaygain("file:///a.ogg", -6.0, 0.5, 6.0, 0.8);
    assert!((a.gain() - 1.25).abs() < 1e-9);

    // no gain at all leaves the stream alone
    engine.set_replaygain("file:///a.ogg", 0.0, 0.0, 0.0, 0.0);
    assert!((a.gain() - 1.25).abs() < 1e-9);
    engine.set_replaygain("file:///nope.ogg", -6.0, 0.0, 0.0, 0.0);
}

#[test]
fn test_replaygain_scales_crossfade_target() {
    let sim = SimGraph::new();
    let engine = engine(&sim);

    start(&engine, &sim, "file:///a.ogg");
    let b = open(&engine, &sim, "file:///b.ogg");
    engine.set_replaygain("file:///b.ogg", -6.0, 0.0, 0.0, 0.0);

    engine
        .play(PlayType::Crossfade, Duration::from_secs(2))
        .unwrap();
    settle(&engine);
    sim.advance(Duration::from_secs(2));
    settle(&engine);

    assert_eq!(
        state_of(&engine, "file:///b.ogg"),
        Some(StreamState::Playing)
    );
    assert!((b.gain() - 10f64.powf(-0.3)).abs() < 1e-9);
    assert_eq!(engine.stream_states().len(), 1);
}

#[test]
fn test_ticks_report_position() {
    let sim = SimGraph::new();
    let config = EngineConfig {
        tick_interval_ms: 1,
        ..quiet_config()
    };
    let engine = engine_with::<String>(&sim, Arc::new(NoHooks), config);

    start(&engine, &sim, "file:///a.ogg");
    sim.advance(Duration::from_secs(2));
    std::thread::sleep(Duration::from_millis(5));
    settle(&engine);
    std::thread::sleep(Duration::from_millis(5));
    engine.dispatch_pending();

    let tick = drain(&engine)
        .into_iter()
        .filter_map(|e| match e {
            PlayerEvent::Tick {
                position, duration, ..
            } => Some((position, duration)),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(tick, (Duration::from_secs(2), Some(Duration::from_secs(180))));
}
