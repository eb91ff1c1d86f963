mod common;

use std::time::Instant;

use common::{ms, note_on_channels, probing_engine, rotation_engine};
use intonal_core::engine::{EngineEvent, EngineFeedback, NoteState};
use intonal_core::midi::{CaptureSink, MidiEvent, MidiEventKind, Sent};
use intonal_core::protocol::mts::{identity_request, tuning_dump_request};
use intonal_core::protocol::{BackendKind, ProtocolMode};

const IDENTITY_REPLY: [u8; 7] = [0xF0, 0x7E, 0x22, 0x06, 0x02, 0x41, 0xF7];

fn sysex_event(data: &[u8]) -> EngineEvent {
    EngineEvent::Midi(MidiEvent::new(0, MidiEventKind::SysEx(data.to_vec())))
}

#[test]
fn start_sends_both_probes() {
    let sink = CaptureSink::new();
    let mut orch = probing_engine(&sink);
    orch.start(Instant::now());

    let sent = sink.messages();
    assert!(sent.contains(&Sent::Bytes(identity_request().to_vec())));
    assert!(sent.contains(&Sent::Bytes(tuning_dump_request(0).to_vec())));
    assert_eq!(orch.protocol_mode(), ProtocolMode::Detecting);
}

#[test]
fn silence_falls_back_to_channel_rotation() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = probing_engine(&sink);
    orch.start(t0);

    orch.tick(t0 + ms(399));
    assert_eq!(orch.protocol_mode(), ProtocolMode::Detecting);
    orch.tick(t0 + ms(400));
    assert_eq!(orch.protocol_mode(), ProtocolMode::ChannelRotation);
    assert_eq!(orch.backend_kind(), BackendKind::ChannelRotation);

    // A reply after the deadline changes nothing
    orch.handle_event(sysex_event(&IDENTITY_REPLY), t0 + ms(500));
    assert_eq!(orch.backend_kind(), BackendKind::ChannelRotation);
}

#[test]
fn reply_pins_device_and_rehomes_notes() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = probing_engine(&sink);
    orch.start(t0);

    // Routed through channel rotation while the probe is in flight
    orch.note_on(60, 100, t0 + ms(10));
    let member = note_on_channels(&sink)[0];
    assert!((1..=15).contains(&member));
    sink.clear();

    orch.handle_event(sysex_event(&IDENTITY_REPLY), t0 + ms(50));
    assert_eq!(orch.protocol_mode(), ProtocolMode::FineSysEx);
    assert!(orch
        .take_feedback()
        .contains(&EngineFeedback::ModeChanged(BackendKind::FineSysEx)));

    let sent = sink.messages();
    let cut = sent.iter().position(|m| m == &Sent::Bytes(vec![0x80 | member, 60, 0]));
    let resounded = sent.iter().position(|m| m == &Sent::Bytes(vec![0x90, 60, 100]));
    assert!(matches!((cut, resounded), (Some(c), Some(r)) if c < r));
    assert_eq!(orch.active_notes()[0].state, NoteState::Sounding);

    // Later retunes address the device that answered
    sink.clear();
    orch.note_on(64, 100, t0 + ms(100));
    let retune = sink
        .messages()
        .into_iter()
        .find(|m| matches!(m.bytes(), Some([0xF0, 0x7F, _, 0x08, 0x02, ..])));
    assert!(matches!(retune.as_ref().and_then(Sent::bytes), Some([_, _, 0x22, ..])));
}

#[test]
fn no_probe_without_sysex_permission() {
    let sink = CaptureSink::new();
    let mut orch = rotation_engine(&sink);
    orch.start(Instant::now());
    assert!(!sink.messages().iter().any(Sent::is_sysex));
    assert_eq!(orch.protocol_mode(), ProtocolMode::ChannelRotation);
}

#[test]
fn overrides() {
    let sink = CaptureSink::new();
    let t0 = Instant::now();
    let mut orch = rotation_engine(&sink);
    orch.start(t0);
    orch.note_on(67, 100, t0);

    assert!(!orch.set_backend_override(Some(BackendKind::HighResFormat), t0));
    assert_eq!(orch.backend_kind(), BackendKind::ChannelRotation);

    assert!(orch.set_backend_override(Some(BackendKind::FineSysEx), t0 + ms(10)));
    assert_eq!(orch.backend_kind(), BackendKind::FineSysEx);
    assert_eq!(orch.forced_backend(), Some(BackendKind::FineSysEx));
    assert_eq!(orch.active_notes().len(), 1);

    // Clearing goes back to negotiation, which without SysEx is rotation
    assert!(orch.set_backend_override(None, t0 + ms(20)));
    assert_eq!(orch.backend_kind(), BackendKind::ChannelRotation);
    assert_eq!(orch.forced_backend(), None);
}
