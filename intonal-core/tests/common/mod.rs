#![allow(dead_code)]
//! Shared harness for intonal-core integration tests.

use std::time::{Duration, Instant};

use intonal_core::engine::{EngineSettings, Orchestrator};
use intonal_core::midi::{CaptureSink, Sent};
use intonal_core::protocol::BackendKind;

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// External engine whose output is captured. SysEx is not permitted, so it
/// settles on channel rotation without probing.
pub fn rotation_engine(sink: &CaptureSink) -> Orchestrator {
    let mut orch = Orchestrator::new(EngineSettings::default(), Box::new(sink.clone()));
    orch.set_sysex_permission(false);
    orch
}

/// External engine that will probe the device when started.
pub fn probing_engine(sink: &CaptureSink) -> Orchestrator {
    Orchestrator::new(EngineSettings::default(), Box::new(sink.clone()))
}

/// External engine pinned to `kind`, already started.
pub fn forced_engine(sink: &CaptureSink, kind: BackendKind, t0: Instant) -> Orchestrator {
    let mut orch = probing_engine(sink);
    assert!(orch.set_backend_override(Some(kind), t0));
    orch.start(t0);
    assert_eq!(orch.backend_kind(), kind);
    orch
}

/// Channels (0-15) of every captured note-on, in send order.
pub fn note_on_channels(sink: &CaptureSink) -> Vec<u8> {
    sink.messages()
        .iter()
        .filter_map(Sent::channel_message)
        .filter(|(status, _)| *status == 0x90)
        .map(|(_, channel)| channel)
        .collect()
}

/// 14-bit pitch bend values sent on `channel`.
pub fn bends_on(sink: &CaptureSink, channel: u8) -> Vec<u16> {
    sink.messages()
        .iter()
        .filter_map(|m| match m.bytes() {
            Some(&[status, lsb, msb]) if status == 0xE0 | channel => {
                Some(((msb as u16) << 7) | lsb as u16)
            }
            _ => None,
        })
        .collect()
}

/// Tick at the engine's tick rate for `ticks` ticks after `from`. Returns
/// the time of the last tick.
pub fn run_ticks(orch: &mut Orchestrator, from: Instant, ticks: u32) -> Instant {
    let interval = orch.settings().tick_interval;
    let mut now = from;
    for _ in 0..ticks {
        now += interval;
        orch.tick(now);
    }
    now
}

/// A C major phrase, played legato-ish at 300 ms per note.
pub const C_MAJOR_PHRASE: [u8; 13] = [60, 64, 67, 72, 62, 65, 69, 71, 67, 60, 64, 67, 60];

/// Play `C_MAJOR_PHRASE` starting at `t0`. Returns the time after the last note-off.
pub fn play_phrase(orch: &mut Orchestrator, t0: Instant) -> Instant {
    let mut now = t0;
    for (i, &pitch) in C_MAJOR_PHRASE.iter().enumerate() {
        now = t0 + ms(i as u64 * 300);
        orch.note_on(pitch, 100, now);
        now += ms(250);
        orch.note_off(pitch, now);
    }
    now
}
