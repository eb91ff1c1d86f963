mod common;

use std::time::Instant;

use common::{bends_on, forced_engine, ms, note_on_channels, play_phrase, rotation_engine, run_ticks};
use intonal_core::engine::{Degradation, EngineFeedback, KeySource, NoteOutcome, TuningSource};
use intonal_core::midi::{CaptureSink, Sent};
use intonal_core::protocol::BackendKind;
use intonal_types::Tonality;

#[test]
fn first_tick_moves_part_way_toward_just_intonation() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = rotation_engine(&sink);
    orch.set_key_override(Some(Tonality::C_MAJOR));
    orch.start(t0);

    // Nothing smoothed yet: C#4 starts equal-tempered
    let outcome = orch.note_on(61, 100, t0);
    assert!(matches!(
        outcome,
        NoteOutcome::Tuned {
            source: TuningSource::Reactive,
            ..
        }
    ));
    assert_eq!(outcome.cents(), Some(0.0));
    let channel = note_on_channels(&sink)[0];

    orch.tick(t0 + ms(20));
    let target = orch.target_table().for_note(61);
    assert!((target - 11.731).abs() < 0.001);

    let sent = orch.active_notes()[0].cents;
    let settings = orch.settings();
    assert!(sent > 0.0 && sent < target);
    assert!(target - sent <= target * (1.0 - settings.smoothing_min) + 1e-9);
    assert!(target - sent >= target * (1.0 - settings.smoothing_max) - 1e-9);
    assert!(bends_on(&sink, channel).last().is_some_and(|&b| b > 8192));
}

#[test]
fn smoothing_settles_on_the_target() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = rotation_engine(&sink);
    orch.set_key_override(Some(Tonality::C_MAJOR));
    orch.start(t0);
    orch.note_on(64, 100, t0);

    run_ticks(&mut orch, t0, 400);
    let target = orch.target_table().for_note(64);
    assert_eq!(orch.smoothed_table().for_note(64), target);
    assert!((orch.active_notes()[0].cents - target).abs() <= 0.05 + 1e-9);
}

#[test]
fn new_notes_after_settling_are_tuned_immediately() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = rotation_engine(&sink);
    orch.set_key_override(Some(Tonality::C_MAJOR));
    orch.start(t0);
    let now = run_ticks(&mut orch, t0, 400);

    let outcome = orch.note_on(71, 100, now);
    let cents = outcome.cents().unwrap_or(f64::NAN);
    assert!((cents + 11.731).abs() < 0.001, "B4 in C major got {}", cents);
}

#[test]
fn played_phrase_sets_a_detected_key() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = rotation_engine(&sink);
    orch.start(t0);
    let now = play_phrase(&mut orch, t0);
    play_phrase(&mut orch, now + ms(300));

    assert_eq!(orch.key_source(), Some(KeySource::Detected));
    assert!(orch.current_key().is_some());
    assert!(orch.take_feedback().iter().any(|f| matches!(
        f,
        EngineFeedback::KeyChanged {
            source: Some(KeySource::Detected),
            confidence: Some(_),
            ..
        }
    )));
}

#[test]
fn stop_flushes_every_held_note() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = rotation_engine(&sink);
    orch.start(t0);
    for (i, pitch) in [60u8, 64, 67].into_iter().enumerate() {
        orch.note_on(pitch, 100, t0 + ms(i as u64 * 10));
    }
    sink.clear();

    orch.stop();
    let offs = sink.count(|m| matches!(m.channel_message(), Some((0x80, _))));
    assert_eq!(offs, 3);
    assert!(orch.active_notes().is_empty());
    assert!(!orch.is_running());
    assert_eq!(orch.take_feedback().last(), Some(&EngineFeedback::Stopped));
    assert_eq!(orch.note_on(60, 100, t0 + ms(100)), NoteOutcome::Ignored);
}

#[test]
fn rejected_sysex_falls_back_to_pitch_bend() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = forced_engine(&sink, BackendKind::FineSysEx, t0);
    orch.set_key_override(Some(Tonality::C_MAJOR));
    let now = run_ticks(&mut orch, t0, 400);

    // E held with its SysEx tuning intact
    orch.note_on(64, 100, now);
    sink.fail_sysex(true);
    sink.clear();
    orch.take_feedback();

    let outcome = orch.note_on(61, 100, now + ms(10));
    assert!((outcome.cents().unwrap_or(0.0) - 11.731).abs() < 0.001);
    assert!(orch.take_feedback().contains(&EngineFeedback::Degraded {
        pitch: 61,
        reason: Degradation::Fallback,
    }));

    assert!(bends_on(&sink, 0).is_empty());
    let bends = bends_on(&sink, 1);
    assert_eq!(bends.len(), 1);
    assert!(bends[0] > 8192);
    assert_eq!(note_on_channels(&sink), vec![1]);

    // Bend recentered once the fallback note is gone
    orch.note_off(61, now + ms(500));
    assert!(sink.messages().contains(&Sent::Bytes(vec![0x81, 61, 0])));
    assert_eq!(bends_on(&sink, 1).last(), Some(&8192));
    assert!(bends_on(&sink, 0).is_empty());
}
