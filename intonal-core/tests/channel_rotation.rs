mod common;

use std::collections::HashSet;
use std::time::Instant;

use common::{ms, note_on_channels, rotation_engine};
use intonal_core::engine::{Degradation, EngineFeedback, NoteOutcome, NoteState};
use intonal_core::midi::CaptureSink;
use intonal_core::protocol::BackendKind;

fn started(sink: &CaptureSink, t0: Instant) -> intonal_core::Orchestrator {
    let mut orch = rotation_engine(sink);
    orch.start(t0);
    assert_eq!(orch.backend_kind(), BackendKind::ChannelRotation);
    sink.clear();
    orch
}

#[test]
fn fifteen_notes_get_fifteen_member_channels() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = started(&sink, t0);

    for i in 0..15u8 {
        let outcome = orch.note_on(48 + i, 100, t0 + ms(i as u64));
        assert!(matches!(outcome, NoteOutcome::Tuned { .. }), "note {} not tuned", i);
    }

    let channels = note_on_channels(&sink);
    assert_eq!(channels.len(), 15);
    let distinct: HashSet<u8> = channels.iter().copied().collect();
    assert_eq!(distinct.len(), 15);
    assert!(channels.iter().all(|&c| (1..=15).contains(&c)));
}

#[test]
fn sixteenth_note_steals_the_oldest() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = started(&sink, t0);

    let mut first_id = 0;
    for i in 0..15u8 {
        if let NoteOutcome::Tuned { id, .. } = orch.note_on(48 + i, 100, t0 + ms(i as u64)) {
            if i == 0 {
                first_id = id;
            }
        }
    }
    let first_channel = note_on_channels(&sink)[0];
    orch.take_feedback();

    let outcome = orch.note_on(72, 100, t0 + ms(200));
    assert!(matches!(outcome, NoteOutcome::Tuned { .. }));
    assert_eq!(note_on_channels(&sink).last(), Some(&first_channel));

    // The victim was cut on its own channel
    let cut = sink.count(|m| m.bytes() == Some(&[0x80 | first_channel, 48, 0][..]));
    assert_eq!(cut, 1);
    assert_eq!(orch.note(first_id).map(|n| n.state), Some(NoteState::Cut));
    assert!(orch.take_feedback().contains(&EngineFeedback::NoteDropped {
        pitch: 48,
        reason: Degradation::Stolen,
    }));

    // Releasing the cut note sends nothing further
    sink.clear();
    orch.note_off(48, t0 + ms(300));
    assert!(sink.messages().is_empty());
    assert!(orch.note(first_id).is_none());
}

#[test]
fn simultaneous_burst_exhausts_without_sharing() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = started(&sink, t0);

    let outcomes: Vec<NoteOutcome> = (0..17u8).map(|i| orch.note_on(40 + i, 90, t0)).collect();
    let dropped = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                NoteOutcome::Dropped {
                    reason: Degradation::ResourceExhausted,
                    ..
                }
            )
        })
        .count();
    assert_eq!(dropped, 2);

    let channels = note_on_channels(&sink);
    assert_eq!(channels.len(), 15);
    let distinct: HashSet<u8> = channels.iter().copied().collect();
    assert_eq!(distinct.len(), 15);
    assert!(channels.iter().all(|&c| (1..=15).contains(&c)));
    assert!(orch.take_feedback().iter().any(|f| matches!(
        f,
        EngineFeedback::NoteDropped {
            reason: Degradation::ResourceExhausted,
            ..
        }
    )));
}

#[test]
fn oldest_released_channel_is_reused_first() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = started(&sink, t0);

    for i in 0..15u8 {
        orch.note_on(48 + i, 100, t0 + ms(i as u64));
    }
    let channels = note_on_channels(&sink);

    // Release the third note, then the first
    orch.note_off(50, t0 + ms(100));
    orch.note_off(48, t0 + ms(110));
    sink.clear();

    orch.note_on(70, 100, t0 + ms(120));
    assert_eq!(note_on_channels(&sink), vec![channels[2]]);
}

#[test]
fn note_off_recenters_the_bend() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = started(&sink, t0);
    orch.note_on(60, 100, t0);
    let channel = note_on_channels(&sink)[0];
    sink.clear();

    orch.note_off(60, t0 + ms(500));
    let sent: Vec<Vec<u8>> = sink
        .messages()
        .iter()
        .filter_map(|m| m.bytes().map(<[u8]>::to_vec))
        .collect();
    assert_eq!(
        sent,
        vec![vec![0x80 | channel, 60, 0], vec![0xE0 | channel, 0x00, 0x40]]
    );
}
