//! MIDI 2.0 high-resolution backend.
//!
//! Emits Universal MIDI Packets: 64-bit channel-voice messages (type 4).
//! Each note is retuned through the Registered Per-Note Controller
//! "Pitch 7.25" so tuning is addressed by note number, not by channel.

use std::collections::BTreeSet;

use intonal_types::tuning::bend::note_pitch_7_25;
use intonal_types::Tonality;

use crate::midi::{MidiSink, OutputResult};

use super::{Applied, ApplyError, NoteRef};

const MT_CHANNEL_VOICE_2: u32 = 0x4;

const OP_REGISTERED_PER_NOTE: u32 = 0x0;
const OP_NOTE_OFF: u32 = 0x8;
const OP_NOTE_ON: u32 = 0x9;
const OP_CONTROL_CHANGE: u32 = 0xB;
const OP_PER_NOTE_MANAGEMENT: u32 = 0xF;

/// Registered per-note controller index for absolute pitch.
pub const PITCH_7_25: u8 = 3;

/// Per-note management flags: detach controllers, reset to defaults.
const PNM_DETACH: u8 = 0b10;
const PNM_RESET: u8 = 0b01;

fn header(group: u8, opcode: u32, channel: u8, byte3: u8, byte4: u8) -> u32 {
    (MT_CHANNEL_VOICE_2 << 28)
        | ((group as u32 & 0xF) << 24)
        | (opcode << 20)
        | ((channel as u32 & 0xF) << 16)
        | ((byte3 as u32 & 0x7F) << 8)
        | byte4 as u32
}

/// Min-center-max upscaling of a 7-bit value to 16 bits.
pub fn scale_7_to_16(velocity: u8) -> u16 {
    let v = (velocity & 0x7F) as u16;
    let mut scaled = v << 9;
    if v <= 64 {
        return scaled;
    }
    let mut repeat = (v & 0x3F) << 3;
    while repeat != 0 {
        scaled |= repeat;
        repeat >>= 6;
    }
    scaled
}

pub fn note_on_ump(group: u8, channel: u8, note: u8, velocity: u8) -> [u32; 2] {
    [
        header(group, OP_NOTE_ON, channel, note, 0),
        (scale_7_to_16(velocity) as u32) << 16,
    ]
}

pub fn note_off_ump(group: u8, channel: u8, note: u8) -> [u32; 2] {
    [header(group, OP_NOTE_OFF, channel, note, 0), 0]
}

/// Pitch 7.25 for `note`: 7-bit semitone, 25-bit fraction.
pub fn pitch_ump(group: u8, channel: u8, note: u8, pitch: u32) -> [u32; 2] {
    [
        header(group, OP_REGISTERED_PER_NOTE, channel, note, PITCH_7_25),
        pitch,
    ]
}

pub fn per_note_reset_ump(group: u8, channel: u8, note: u8) -> [u32; 2] {
    [
        header(group, OP_PER_NOTE_MANAGEMENT, channel, note, PNM_DETACH | PNM_RESET),
        0,
    ]
}

/// 32-bit controller value upscaled from 7 bits.
pub fn control_change_ump(group: u8, channel: u8, controller: u8, value: u8) -> [u32; 2] {
    let value = (scale_7_to_16(value) as u32) << 16 | scale_7_to_16(value) as u32;
    [header(group, OP_CONTROL_CHANGE, channel, controller, 0), value]
}

pub struct HighResBackend {
    group: u8,
    channel: u8,
    /// Note numbers carrying a per-note pitch.
    tuned: BTreeSet<u8>,
}

impl HighResBackend {
    pub fn new(group: u8, channel: u8) -> Self {
        Self {
            group: group & 0xF,
            channel: channel & 0xF,
            tuned: BTreeSet::new(),
        }
    }

    /// Tuning is per note; a key change on its own sends nothing.
    pub fn apply_key_change(&mut self, _out: &mut dyn MidiSink, key: Tonality) -> OutputResult {
        log::debug!("high-res key change to {} applies per note", key);
        Ok(())
    }

    pub fn apply_note(
        &mut self,
        out: &mut dyn MidiSink,
        note: &NoteRef,
        cents: f64,
    ) -> Result<Applied, ApplyError> {
        let pitch = note_pitch_7_25(note.pitch, cents);
        out.send_ump(&pitch_ump(self.group, self.channel, note.pitch, pitch.value))?;
        self.tuned.insert(note.pitch);
        Ok(Applied::exact(cents).with_clamped(pitch.clamped))
    }

    pub fn note_on(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        out.send_ump(&note_on_ump(self.group, self.channel, note.pitch, note.velocity))
    }

    pub fn note_off(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        out.send_ump(&note_off_ump(self.group, self.channel, note.pitch))
    }

    pub fn release_note(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        if self.tuned.remove(&note.pitch) {
            out.send_ump(&per_note_reset_ump(self.group, self.channel, note.pitch))?;
        }
        Ok(())
    }

    pub fn control_change(&mut self, out: &mut dyn MidiSink, controller: u8, value: u8) -> OutputResult {
        out.send_ump(&control_change_ump(self.group, self.channel, controller, value))
    }

    pub fn reset(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        let mut result = Ok(());
        for note in std::mem::take(&mut self.tuned) {
            result = result.and(out.send_ump(&per_note_reset_ump(self.group, self.channel, note)));
        }
        result
    }

    pub fn all_notes_off(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        out.send_ump(&control_change_ump(
            self.group,
            self.channel,
            crate::midi::CC_ALL_NOTES_OFF,
            0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{CaptureSink, Sent};
    use intonal_types::tuning::bend::pitch_7_25_to_semitones;
    use std::time::Instant;

    #[test]
    fn velocity_scaling_hits_endpoints() {
        assert_eq!(scale_7_to_16(0), 0);
        assert_eq!(scale_7_to_16(64), 0x8000);
        assert_eq!(scale_7_to_16(127), 0xFFFF);
        assert!(scale_7_to_16(100) > scale_7_to_16(99));
    }

    #[test]
    fn note_on_layout() {
        let [w0, w1] = note_on_ump(0, 2, 60, 127);
        assert_eq!(w0, 0x4092_3C00);
        assert_eq!(w1, 0xFFFF_0000);
    }

    #[test]
    fn pitch_controller_layout() {
        let pitch = note_pitch_7_25(61, 11.731).value;
        let [w0, w1] = pitch_ump(0, 0, 61, pitch);
        assert_eq!(w0, 0x4000_3D03);
        assert_eq!(w1 >> 25, 61);
        assert!((pitch_7_25_to_semitones(w1) - 61.11731).abs() < 1e-6);
    }

    #[test]
    fn per_note_reset_layout() {
        let [w0, w1] = per_note_reset_ump(0, 0, 64);
        assert_eq!(w0, 0x40F0_4003);
        assert_eq!(w1, 0);
    }

    #[test]
    fn note_lifecycle_emits_packets() {
        let sink = CaptureSink::with_ump();
        let mut out = sink.clone();
        let mut backend = HighResBackend::new(0, 0);
        let note = NoteRef {
            id: 7,
            pitch: 64,
            velocity: 90,
            started_at: Instant::now(),
        };
        backend.apply_note(&mut out, &note, -13.686).unwrap();
        backend.note_on(&mut out, &note).unwrap();
        backend.note_off(&mut out, &note).unwrap();
        backend.release_note(&mut out, &note).unwrap();
        let sent = sink.messages();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|m| matches!(m, Sent::Ump(w) if w.len() == 2)));

        // Nothing left to reset
        sink.clear();
        backend.reset(&mut out).unwrap();
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn realtime_transport_without_ump_fails() {
        let mut out = CaptureSink::new();
        let mut backend = HighResBackend::new(0, 0);
        let note = NoteRef {
            id: 1,
            pitch: 60,
            velocity: 100,
            started_at: Instant::now(),
        };
        assert!(matches!(
            backend.apply_note(&mut out, &note, 0.0),
            Err(ApplyError::Transport(_))
        ));
    }
}
