//! MIDI Tuning Standard ("fine SysEx") backend.
//!
//! Key changes go out as one realtime Scale/Octave 2-byte message carrying
//! all twelve pitch-class offsets. Each sounding note is additionally
//! retuned to its absolute target with a realtime Single Note Tuning Change,
//! so smoothing can move notes individually.

use std::collections::{BTreeSet, HashMap, HashSet};

use intonal_types::tuning::bend::{
    cents_to_bend, cents_to_scale_octave, note_position_14, u14_bytes, BendRange, BEND_CENTER,
};
use intonal_types::{PitchClass, Tonality, TuningTable};

use crate::midi::{self, MidiSink, OutputResult};

use super::{Applied, ApplyError, NoteRef};

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;
pub const SYSEX_NON_RT: u8 = 0x7E;
pub const SYSEX_RT: u8 = 0x7F;
/// Device id addressing every receiver.
pub const BROADCAST_DEVICE: u8 = 0x7F;

const MIDI_TUNING_STANDARD: u8 = 0x08;
const BULK_DUMP_REQUEST: u8 = 0x00;
const BULK_DUMP_REPLY: u8 = 0x01;
const SINGLE_NOTE_TUNING_CHANGE: u8 = 0x02;
const SCALE_OCTAVE_TUNING_2_BYTE_FORMAT: u8 = 0x09;

const GENERAL_INFORMATION: u8 = 0x06;
const IDENTITY_REQUEST: u8 = 0x01;
const IDENTITY_REPLY: u8 = 0x02;

/// The three channel-mask bytes of a Scale/Octave message selecting only
/// `channel` (0-15).
fn channel_mask(channel: u8) -> [u8; 3] {
    let bits = 1u16 << (channel & 0x0F);
    [
        ((bits >> 14) & 0b0000_0011) as u8, // channels 15-16
        ((bits >> 7) & 0b0111_1111) as u8,  // channels 8-14
        (bits & 0b0111_1111) as u8,         // channels 1-7
    ]
}

/// Realtime Scale/Octave tuning for one channel. Each pitch class is clamped
/// to ±100 cents; the flag reports whether any had to be.
pub fn scale_octave_message(device_id: u8, channel: u8, table: &TuningTable) -> (Vec<u8>, bool) {
    let mut clamped = false;
    let mut msg = vec![
        SYSEX_START,
        SYSEX_RT,
        device_id & 0x7F,
        MIDI_TUNING_STANDARD,
        SCALE_OCTAVE_TUNING_2_BYTE_FORMAT,
    ];
    msg.extend_from_slice(&channel_mask(channel));
    for pc in PitchClass::ALL {
        let value = cents_to_scale_octave(table.cents(pc));
        clamped |= value.clamped;
        let (lsb, msb) = u14_bytes(value.value);
        msg.push(msb);
        msg.push(lsb);
    }
    msg.push(SYSEX_END);
    (msg, clamped)
}

/// Realtime Single Note Tuning Change retuning `key` to its equal-tempered
/// pitch shifted by `cents`.
pub fn single_note_message(device_id: u8, program: u8, key: u8, cents: f64) -> (Vec<u8>, bool) {
    let target = note_position_14(key, cents);
    let (lsb, msb) = u14_bytes(target.value.fraction);
    let msg = vec![
        SYSEX_START,
        SYSEX_RT,
        device_id & 0x7F,
        MIDI_TUNING_STANDARD,
        SINGLE_NOTE_TUNING_CHANGE,
        program & 0x7F,
        1,
        key & 0x7F,
        target.value.semitone & 0x7F,
        msb,
        lsb,
        SYSEX_END,
    ];
    (msg, target.clamped)
}

pub fn identity_request() -> [u8; 6] {
    [
        SYSEX_START,
        SYSEX_NON_RT,
        BROADCAST_DEVICE,
        GENERAL_INFORMATION,
        IDENTITY_REQUEST,
        SYSEX_END,
    ]
}

pub fn tuning_dump_request(program: u8) -> [u8; 7] {
    [
        SYSEX_START,
        SYSEX_NON_RT,
        BROADCAST_DEVICE,
        MIDI_TUNING_STANDARD,
        BULK_DUMP_REQUEST,
        program & 0x7F,
        SYSEX_END,
    ]
}

/// A reply to one of the capability probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReply {
    Identity { device_id: u8 },
    TuningDump { device_id: u8 },
}

impl ProbeReply {
    pub fn device_id(&self) -> u8 {
        match self {
            ProbeReply::Identity { device_id } | ProbeReply::TuningDump { device_id } => *device_id,
        }
    }
}

/// Recognize an identity reply or bulk tuning dump.
pub fn parse_probe_reply(data: &[u8]) -> Option<ProbeReply> {
    match data {
        [SYSEX_START, SYSEX_NON_RT, dev, GENERAL_INFORMATION, IDENTITY_REPLY, .., SYSEX_END] => {
            Some(ProbeReply::Identity { device_id: *dev })
        }
        [SYSEX_START, SYSEX_NON_RT, dev, MIDI_TUNING_STANDARD, BULK_DUMP_REPLY, .., SYSEX_END] => {
            Some(ProbeReply::TuningDump { device_id: *dev })
        }
        _ => None,
    }
}

/// Channels above the base channel that carry pitch-bend fallback notes.
const FALLBACK_CHANNELS: u8 = 4;

pub struct MtsBackend {
    device_id: u8,
    program: u8,
    channel: u8,
    bend_range: BendRange,
    /// Keys that currently carry a non-ET single-note tuning.
    retuned: BTreeSet<u8>,
    /// Notes whose SysEx failed, each bent on a fallback channel of its own.
    bent: HashMap<u64, u8>,
    /// Notes already sounding on the base channel; they can't move.
    on_base: HashSet<u64>,
}

impl MtsBackend {
    pub fn new(device_id: u8, program: u8, channel: u8, bend_range: BendRange) -> Self {
        Self {
            device_id,
            program,
            channel: channel & 0x0F,
            bend_range,
            retuned: BTreeSet::new(),
            bent: HashMap::new(),
            on_base: HashSet::new(),
        }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn set_device_id(&mut self, device_id: u8) {
        self.device_id = device_id & 0x7F;
    }

    /// Channel a note sounds on: its fallback channel, else the base channel.
    pub fn channel_for(&self, note_id: u64) -> u8 {
        self.bent.get(&note_id).copied().unwrap_or(self.channel)
    }

    pub fn apply_key_change(&mut self, out: &mut dyn MidiSink, key: Tonality) -> OutputResult {
        let (msg, clamped) = scale_octave_message(self.device_id, self.channel, &TuningTable::for_key(key));
        if clamped {
            log::warn!(target: "mts", "scale/octave offsets for {} clamped to ±100 cents", key);
        }
        out.send(&msg)
    }

    pub fn apply_note(
        &mut self,
        out: &mut dyn MidiSink,
        note: &NoteRef,
        cents: f64,
    ) -> Result<Applied, ApplyError> {
        // Once bent, a note stays on its fallback channel until released
        if self.bent.contains_key(&note.id) {
            return self.bend_fallback(out, note, cents);
        }
        let (msg, clamped) = single_note_message(self.device_id, self.program, note.pitch, cents);
        if clamped {
            log::warn!(target: "mts", "note {} at {:+.2} cents clamped to keyboard range", note.pitch, cents);
        }
        match out.send(&msg) {
            Ok(()) => {
                self.retuned.insert(note.pitch);
                Ok(Applied::exact(cents).with_clamped(clamped))
            }
            Err(e) if self.on_base.contains(&note.id) => {
                log::debug!(target: "mts", "retune of sounding note {} failed: {}", note.pitch, e);
                Err(ApplyError::Transport(e))
            }
            Err(e) => {
                log::warn!(
                    target: "mts",
                    "SysEx send failed for note {} ({}), falling back to pitch bend",
                    note.pitch,
                    e
                );
                self.bend_fallback(out, note, cents).map_err(|fallback| match fallback {
                    ApplyError::ResourceExhausted => ApplyError::Transport(e),
                    other => other,
                })
            }
        }
    }

    fn free_fallback_channel(&self) -> Option<u8> {
        (1..=FALLBACK_CHANNELS)
            .map(|offset| (self.channel + offset) & 0x0F)
            .find(|ch| !self.bent.values().any(|used| used == ch))
    }

    /// Bend `note` on a fallback channel of its own so held notes keep their
    /// tuning.
    fn bend_fallback(&mut self, out: &mut dyn MidiSink, note: &NoteRef, cents: f64) -> Result<Applied, ApplyError> {
        let bend = cents_to_bend(cents, self.bend_range);
        if bend.clamped {
            return Err(ApplyError::OutOfRange { cents });
        }
        let channel = match self.bent.get(&note.id) {
            Some(&channel) => channel,
            None => self.free_fallback_channel().ok_or(ApplyError::ResourceExhausted)?,
        };
        out.send(&midi::pitch_bend(channel, bend.value))?;
        self.bent.insert(note.id, channel);
        Ok(Applied {
            fallback: true,
            ..Applied::exact(cents)
        })
    }

    pub fn note_on(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        if !self.bent.contains_key(&note.id) {
            self.on_base.insert(note.id);
        }
        out.send(&midi::note_on(self.channel_for(note.id), note.pitch, note.velocity))
    }

    pub fn note_off(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        out.send(&midi::note_off(self.channel_for(note.id), note.pitch))
    }

    pub fn release_note(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        self.on_base.remove(&note.id);
        match self.bent.remove(&note.id) {
            Some(channel) => out.send(&midi::pitch_bend(channel, BEND_CENTER)),
            None => Ok(()),
        }
    }

    /// Sent on the base channel and every fallback channel in use.
    pub fn control_change(&mut self, out: &mut dyn MidiSink, controller: u8, value: u8) -> OutputResult {
        let mut channels: BTreeSet<u8> = self.bent.values().copied().collect();
        channels.insert(self.channel);
        let mut result = Ok(());
        for channel in channels {
            result = result.and(out.send(&midi::control_change(channel, controller, value)));
        }
        result
    }

    /// Every retuned key back to equal temperament, scale offsets zeroed,
    /// fallback bends centered.
    pub fn reset(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        let mut result = Ok(());
        for key in std::mem::take(&mut self.retuned) {
            let (msg, _) = single_note_message(self.device_id, self.program, key, 0.0);
            result = result.and(out.send(&msg));
        }
        let (msg, _) = scale_octave_message(self.device_id, self.channel, &TuningTable::EQUAL);
        result = result.and(out.send(&msg));
        self.on_base.clear();
        let channels: BTreeSet<u8> = self.bent.drain().map(|(_, ch)| ch).collect();
        for channel in channels {
            result = result.and(out.send(&midi::pitch_bend(channel, BEND_CENTER)));
        }
        result
    }

    /// All Notes Off on all 16 channels, not just the one this backend plays on.
    pub fn all_notes_off(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        let mut result = Ok(());
        for channel in 0..16 {
            result = result.and(out.send(&midi::control_change(channel, midi::CC_ALL_NOTES_OFF, 0)));
        }
        result
    }
}
