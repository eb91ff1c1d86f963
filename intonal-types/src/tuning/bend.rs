//! Conversions between cents and protocol units.
//!
//! Every conversion clamps to the representable range and reports whether it
//! had to, so callers can refuse to send a value instead of letting it wrap.

use serde::{Deserialize, Serialize};

/// Center (no bend) of a 14-bit pitch-bend value.
pub const BEND_CENTER: u16 = 8192;
/// Largest 14-bit value.
pub const U14_MAX: u16 = 16383;

const U14_STEPS: f64 = 16384.0;
const U25_STEPS: f64 = (1u32 << 25) as f64;

/// Result of a clamping conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converted<T> {
    pub value: T,
    /// True when the input fell outside the representable range.
    pub clamped: bool,
}

impl<T> Converted<T> {
    fn exact(value: T) -> Self {
        Self {
            value,
            clamped: false,
        }
    }

    fn clamped(value: T) -> Self {
        Self {
            value,
            clamped: true,
        }
    }
}

/// Pitch-bend sensitivity in semitones (the receiver's RPN 0 setting).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BendRange {
    semitones: f64,
}

impl BendRange {
    /// MPE's default member-channel range.
    pub const MPE_DEFAULT: BendRange = BendRange { semitones: 48.0 };

    /// Range clamped to 1..=96 semitones.
    pub fn new(semitones: f64) -> Self {
        let semitones = if semitones.is_finite() { semitones } else { 2.0 };
        Self {
            semitones: semitones.clamp(1.0, 96.0),
        }
    }

    pub fn semitones(&self) -> f64 {
        self.semitones
    }

    /// Whole semitones, as carried by the RPN 0 data-entry MSB.
    pub fn whole_semitones(&self) -> u8 {
        self.semitones.floor() as u8
    }

    /// Cents, as carried by the RPN 0 data-entry LSB.
    pub fn remainder_cents(&self) -> u8 {
        ((self.semitones - self.semitones.floor()) * 100.0).round().min(99.0) as u8
    }

    pub fn cents(&self) -> f64 {
        self.semitones * 100.0
    }

    /// Cents represented by one 14-bit bend step.
    pub fn step_cents(&self) -> f64 {
        self.cents() / BEND_CENTER as f64
    }
}

impl Default for BendRange {
    fn default() -> Self {
        Self::new(2.0)
    }
}

/// Cents to a 14-bit pitch-bend value (8192 = center).
pub fn cents_to_bend(cents: f64, range: BendRange) -> Converted<u16> {
    if !cents.is_finite() {
        return Converted::clamped(BEND_CENTER);
    }
    let raw = BEND_CENTER as f64 + (cents / range.step_cents()).round();
    if raw < 0.0 {
        Converted::clamped(0)
    } else if raw > U14_MAX as f64 {
        Converted::clamped(U14_MAX)
    } else {
        Converted::exact(raw as u16)
    }
}

/// 14-bit pitch-bend value back to cents.
pub fn bend_to_cents(value: u16, range: BendRange) -> f64 {
    (value.min(U14_MAX) as f64 - BEND_CENTER as f64) * range.step_cents()
}

/// Split a 14-bit value into (lsb, msb) 7-bit data bytes.
pub fn u14_bytes(value: u16) -> (u8, u8) {
    let value = value.min(U14_MAX);
    ((value & 0x7F) as u8, (value >> 7) as u8)
}

/// Cents to the MTS scale/octave 2-byte value: 8192 = 0 cents, 100/8192
/// cents per step, ±100 cents.
pub fn cents_to_scale_octave(cents: f64) -> Converted<u16> {
    if !cents.is_finite() {
        return Converted::clamped(BEND_CENTER);
    }
    let raw = BEND_CENTER as f64 + (cents * BEND_CENTER as f64 / 100.0).round();
    if raw < 0.0 {
        Converted::clamped(0)
    } else if raw > U14_MAX as f64 {
        Converted::clamped(U14_MAX)
    } else {
        Converted::exact(raw as u16)
    }
}

/// Absolute pitch as (semitone, 14-bit fraction), the MTS single-note format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemitonePosition {
    pub semitone: u8,
    pub fraction: u16,
}

impl SemitonePosition {
    pub fn as_semitones(&self) -> f64 {
        self.semitone as f64 + self.fraction as f64 / U14_STEPS
    }
}

/// Equal-tempered `note` shifted by `cents`, expressed as an MTS target.
/// The fraction always lies in [0, 100) cents above the semitone.
pub fn note_position_14(note: u8, cents: f64) -> Converted<SemitonePosition> {
    let top = SemitonePosition {
        semitone: 127,
        fraction: U14_MAX,
    };
    let position = note as f64 + cents / 100.0;
    if !position.is_finite() {
        return Converted::clamped(SemitonePosition {
            semitone: note.min(127),
            fraction: 0,
        });
    }
    if position < 0.0 {
        return Converted::clamped(SemitonePosition {
            semitone: 0,
            fraction: 0,
        });
    }
    if position > top.as_semitones() {
        return Converted::clamped(top);
    }

    let mut semitone = position.floor();
    let mut fraction = ((position - semitone) * U14_STEPS).round();
    if fraction >= U14_STEPS {
        semitone += 1.0;
        fraction = 0.0;
    }
    if semitone > 127.0 {
        return Converted::clamped(top);
    }
    Converted::exact(SemitonePosition {
        semitone: semitone as u8,
        fraction: fraction as u16,
    })
}

/// Equal-tempered `note` shifted by `cents` as a MIDI 2.0 Pitch 7.25 value:
/// 7-bit semitone in the top bits, 25-bit fraction below.
pub fn note_pitch_7_25(note: u8, cents: f64) -> Converted<u32> {
    let max = (127u32 << 25) | ((1u32 << 25) - 1);
    let position = note as f64 + cents / 100.0;
    if !position.is_finite() {
        return Converted::clamped((note.min(127) as u32) << 25);
    }
    if position < 0.0 {
        return Converted::clamped(0);
    }
    let raw = (position * U25_STEPS).round();
    if raw > max as f64 {
        return Converted::clamped(max);
    }
    Converted::exact(raw as u32)
}

/// Pitch 7.25 value back to fractional semitones.
pub fn pitch_7_25_to_semitones(value: u32) -> f64 {
    value as f64 / U25_STEPS
}
