//! Just-intonation tuning math: per-key cents tables and protocol-unit
//! conversions.
//!
//! Pure functions only; nothing here touches MIDI I/O.

pub mod bend;
pub mod ratios;
pub mod smoothing;

use serde::{Deserialize, Serialize};

use crate::music::{Mode, PitchClass, Tonality};

/// Cents in one equal-tempered semitone.
pub const CENTS_PER_SEMITONE: f64 = 100.0;

/// Convert a frequency ratio to cents.
pub fn ratio_to_cents(ratio: f64) -> f64 {
    1200.0 * ratio.log2()
}

/// Cents deviation from 12-TET of `pitch_class` in the key (`root`, `mode`).
///
/// Looks up the scale degree `(pitch_class - root) mod 12` in the five-limit
/// table and returns `1200·log2(ratio) − 100·interval`. The tonic is always 0.
/// A degree missing from the table is left equal-tempered (0 cents).
pub fn deviation(pitch_class: PitchClass, root: PitchClass, mode: Mode) -> f64 {
    let interval = pitch_class.interval_from(root);
    ratios::scale_ratios(mode)
        .get(interval as usize)
        .map(|&ratio| ratio_to_cents(ratio) - CENTS_PER_SEMITONE * interval as f64)
        .unwrap_or(0.0)
}

/// Deviation for a JI ratio sitting `scale_degree` semitones above its tonic.
/// Used for predictive entries that carry a ratio instead of cents.
pub fn ratio_deviation(ratio: f64, scale_degree: u8) -> Option<f64> {
    if !(ratio.is_finite() && ratio > 0.0) || scale_degree > 11 {
        return None;
    }
    Some(ratio_to_cents(ratio) - CENTS_PER_SEMITONE * scale_degree as f64)
}

/// Standard 12-TET formula
pub fn et_freq(note: u8, tuning_a4: f64) -> f64 {
    tuning_a4 * 2.0_f64.powf((note as f64 - 69.0) / 12.0)
}

/// Frequency of `note` shifted by `cents` from its equal-tempered pitch.
pub fn tuned_freq(note: u8, cents: f64, tuning_a4: f64) -> f64 {
    et_freq(note, tuning_a4) * 2.0_f64.powf(cents / 1200.0)
}

/// 12 cents deviations indexed by pitch class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningTable {
    cents: [f64; 12],
}

impl TuningTable {
    /// Equal temperament: every deviation zero.
    pub const EQUAL: TuningTable = TuningTable { cents: [0.0; 12] };

    pub fn from_cents(cents: [f64; 12]) -> Self {
        Self { cents }
    }

    /// Five-limit table for a key.
    pub fn for_key(tonality: Tonality) -> Self {
        table_for(tonality.root, tonality.mode)
    }

    pub fn cents(&self, pitch_class: PitchClass) -> f64 {
        self.cents[pitch_class.semitone() as usize]
    }

    /// Deviation for a MIDI note number.
    pub fn for_note(&self, note: u8) -> f64 {
        self.cents(PitchClass::of_note(note))
    }

    pub fn set(&mut self, pitch_class: PitchClass, cents: f64) {
        self.cents[pitch_class.semitone() as usize] = cents;
    }

    pub fn as_array(&self) -> &[f64; 12] {
        &self.cents
    }

    /// Largest per-pitch-class difference between two tables.
    pub fn max_difference(&self, other: &TuningTable) -> f64 {
        self.cents
            .iter()
            .zip(other.cents.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

impl Default for TuningTable {
    fn default() -> Self {
        Self::EQUAL
    }
}

/// Apply [`deviation`] across all 12 pitch classes.
pub fn table_for(root: PitchClass, mode: Mode) -> TuningTable {
    let mut cents = [0.0; 12];
    for pc in PitchClass::ALL {
        cents[pc.semitone() as usize] = deviation(pc, root, mode);
    }
    TuningTable { cents }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A4: f64 = 440.0;

    #[test]
    fn tonic_is_always_zero() {
        for root in PitchClass::ALL {
            for mode in Mode::ALL {
                assert_eq!(deviation(root, root, mode), 0.0, "{:?} {:?}", root, mode);
            }
        }
    }

    #[test]
    fn deviation_is_deterministic() {
        for root in PitchClass::ALL {
            for mode in Mode::ALL {
                for pc in PitchClass::ALL {
                    assert_eq!(deviation(pc, root, mode), deviation(pc, root, mode));
                }
            }
        }
    }

    #[test]
    fn c_sharp_in_c_major() {
        let cents = deviation(PitchClass::Cs, PitchClass::C, Mode::Major);
        assert!((cents - 11.731).abs() < 0.001, "got {}", cents);
    }

    #[test]
    fn known_five_limit_deviations() {
        // Pure major third is ~13.7 cents flat, pure fifth ~2 cents sharp
        let third = deviation(PitchClass::E, PitchClass::C, Mode::Major);
        let fifth = deviation(PitchClass::G, PitchClass::C, Mode::Major);
        assert!((third + 13.686).abs() < 0.001, "third {}", third);
        assert!((fifth - 1.955).abs() < 0.001, "fifth {}", fifth);
    }

    #[test]
    fn minor_seventh_differs_by_mode() {
        let major = deviation(PitchClass::As, PitchClass::C, Mode::Major);
        let minor = deviation(PitchClass::As, PitchClass::C, Mode::Minor);
        assert!((major - 17.596).abs() < 0.001, "major {}", major);
        assert!((minor + 3.910).abs() < 0.001, "minor {}", minor);
    }

    #[test]
    fn table_rotates_with_root() {
        let c = table_for(PitchClass::C, Mode::Major);
        let d = table_for(PitchClass::D, Mode::Major);
        for pc in PitchClass::ALL {
            assert!((c.cents(pc) - d.cents(pc.transpose(2))).abs() < 1e-12);
        }
        assert_eq!(d.cents(PitchClass::D), 0.0);
    }

    #[test]
    fn table_for_note_uses_pitch_class() {
        let table = TuningTable::for_key(Tonality::C_MAJOR);
        assert_eq!(table.for_note(61), table.for_note(73));
        assert_eq!(table.for_note(60), 0.0);
    }

    #[test]
    fn ratio_deviation_matches_table() {
        let from_ratio = ratio_deviation(16.0 / 15.0, 1).unwrap();
        let from_table = deviation(PitchClass::Cs, PitchClass::C, Mode::Major);
        assert!((from_ratio - from_table).abs() < 1e-12);
        assert!(ratio_deviation(0.0, 1).is_none());
        assert!(ratio_deviation(1.5, 12).is_none());
    }

    #[test]
    fn et_a4_is_440() {
        assert!((et_freq(69, A4) - 440.0).abs() < 1e-10);
        assert!((et_freq(81, A4) - 880.0).abs() < 1e-6);
    }

    #[test]
    fn tuned_freq_applies_cents() {
        let up = tuned_freq(69, 1200.0, A4);
        assert!((up - 880.0).abs() < 1e-6);
        assert!((tuned_freq(69, 0.0, A4) - 440.0).abs() < 1e-10);
    }

    #[test]
    fn max_difference_between_tables() {
        let ji = table_for(PitchClass::C, Mode::Major);
        let diff = ji.max_difference(&TuningTable::EQUAL);
        // Largest deviation in the five-limit major table is the minor 7th (9/5)
        assert!((diff - 17.596).abs() < 0.001, "diff {}", diff);
    }
}
