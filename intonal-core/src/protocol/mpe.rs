//! MPE channel-rotation backend: master channel 0, members 1-15, one
//! sounding note per member channel carrying its own pitch bend.

use std::time::{Duration, Instant};

use intonal_types::tuning::bend::{cents_to_bend, BendRange, BEND_CENTER};
use intonal_types::Tonality;

use crate::midi::{self, MidiSink, OutputResult};

use super::channel_pool::ChannelPool;
use super::{Applied, ApplyError, NoteRef};

pub const MASTER_CHANNEL: u8 = 0;
const MCM_RPN: u8 = 6;
const BEND_RANGE_RPN: u8 = 0;

/// Registered parameter write: select, data entry, then deselect (RPN null).
fn rpn(channel: u8, param: u8, msb: u8, lsb: Option<u8>) -> Vec<[u8; 3]> {
    let mut msgs = vec![
        midi::control_change(channel, 101, 0),
        midi::control_change(channel, 100, param),
        midi::control_change(channel, 6, msb),
    ];
    if let Some(lsb) = lsb {
        msgs.push(midi::control_change(channel, 38, lsb));
    }
    msgs.push(midi::control_change(channel, 101, 127));
    msgs.push(midi::control_change(channel, 100, 127));
    msgs
}

pub struct MpeBackend {
    pool: ChannelPool,
    bend_range: BendRange,
}

impl MpeBackend {
    pub fn new(bend_range: BendRange, steal_guard: Duration) -> Self {
        Self {
            pool: ChannelPool::new(MASTER_CHANNEL + 1, steal_guard),
            bend_range,
        }
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Declare a 15-member lower zone and set every member's bend range.
    pub fn activate(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        for msg in rpn(MASTER_CHANNEL, MCM_RPN, 15, None) {
            out.send(&msg)?;
        }
        let whole = self.bend_range.whole_semitones();
        let cents = self.bend_range.remainder_cents();
        let channels: Vec<u8> = self.pool.channels().collect();
        for channel in channels {
            for msg in rpn(channel, BEND_RANGE_RPN, whole, Some(cents)) {
                out.send(&msg)?;
            }
        }
        log::info!(
            target: "mpe",
            "MPE zone active: 15 members, bend range {} semitones",
            self.bend_range.semitones()
        );
        Ok(())
    }

    /// Per-note bends carry everything; there is no zone-wide tuning to send.
    pub fn apply_key_change(&mut self, _out: &mut dyn MidiSink, key: Tonality) -> OutputResult {
        log::debug!(target: "mpe", "key change to {} applies per note", key);
        Ok(())
    }

    /// Assign (or reuse) the note's member channel and bend it. A stolen
    /// note is cut off on the spot. Bends beyond the range are not sent.
    pub fn apply_note(
        &mut self,
        out: &mut dyn MidiSink,
        note: &NoteRef,
        cents: f64,
    ) -> Result<Applied, ApplyError> {
        let allocation = match self.pool.allocate(note.id, note.pitch, note.started_at) {
            Ok(a) => a,
            Err(e) => {
                log::warn!(target: "mpe", "no free channel for note {} (all 15 held)", note.pitch);
                return Err(e);
            }
        };
        let channel = allocation.channel;

        if let Some(victim) = allocation.stolen {
            log::warn!(
                target: "mpe",
                "stealing channel {} from note {} for note {}",
                channel + 1,
                victim.pitch,
                note.pitch
            );
            out.send(&midi::note_off(channel, victim.pitch))?;
        }

        let bend = cents_to_bend(cents, self.bend_range);
        if bend.clamped {
            log::warn!(
                target: "mpe",
                "{:+.2} cents exceeds ±{} semitone bend range, note {} left unbent",
                cents,
                self.bend_range.semitones(),
                note.pitch
            );
            out.send(&midi::pitch_bend(channel, BEND_CENTER))?;
            return Err(ApplyError::OutOfRange { cents });
        }
        out.send(&midi::pitch_bend(channel, bend.value))?;

        Ok(Applied {
            stolen: allocation.stolen,
            ..Applied::exact(cents)
        })
    }

    pub fn note_on(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        match self.pool.channel_of(note.id) {
            Some(channel) => out.send(&midi::note_on(channel, note.pitch, note.velocity)),
            None => Err(format!("note {} has no member channel", note.pitch).into()),
        }
    }

    /// Silently ignores notes that lost their channel to a steal.
    pub fn note_off(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        match self.pool.channel_of(note.id) {
            Some(channel) => out.send(&midi::note_off(channel, note.pitch)),
            None => Ok(()),
        }
    }

    /// Center the bend, then hand the channel back to the pool.
    pub fn release_note(&mut self, out: &mut dyn MidiSink, note: &NoteRef, now: Instant) -> OutputResult {
        let Some(channel) = self.pool.channel_of(note.id) else {
            return Ok(());
        };
        let result = out.send(&midi::pitch_bend(channel, BEND_CENTER));
        self.pool.release(note.id, now);
        result
    }

    /// Zone-wide controllers (sustain) go on the master channel.
    pub fn control_change(&mut self, out: &mut dyn MidiSink, controller: u8, value: u8) -> OutputResult {
        out.send(&midi::control_change(MASTER_CHANNEL, controller, value))
    }

    /// Cut every assigned note and center every member channel.
    pub fn reset(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        let mut result = Ok(());
        for (channel, owner) in self.pool.drain() {
            result = result.and(out.send(&midi::note_off(channel, owner.pitch)));
        }
        let channels: Vec<u8> = self.pool.channels().collect();
        for channel in channels {
            result = result.and(out.send(&midi::pitch_bend(channel, BEND_CENTER)));
        }
        result
    }

    pub fn all_notes_off(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        let mut result = out.send(&midi::control_change(MASTER_CHANNEL, midi::CC_ALL_NOTES_OFF, 0));
        let channels: Vec<u8> = self.pool.channels().collect();
        for channel in channels {
            result = result.and(out.send(&midi::control_change(channel, midi::CC_ALL_NOTES_OFF, 0)));
        }
        result
    }
}
