//! Five-limit JI ratio tables, one per mode.

use crate::music::Mode;

/// 12 ratios relative to tonic, indexed by semitone offset (0..12).
pub type RatioTable = [f64; 12];

/// Get the five-limit ratio table for a mode.
pub fn scale_ratios(mode: Mode) -> &'static RatioTable {
    match mode {
        Mode::Major => &FIVE_LIMIT_MAJOR,
        Mode::Minor => &FIVE_LIMIT_MINOR,
    }
}

const FIVE_LIMIT_MAJOR: RatioTable = [
    1.0,          // Unison      1/1
    16.0 / 15.0,  // Minor 2nd   16/15
    9.0 / 8.0,    // Major 2nd   9/8
    6.0 / 5.0,    // Minor 3rd   6/5
    5.0 / 4.0,    // Major 3rd   5/4
    4.0 / 3.0,    // Perfect 4th 4/3
    45.0 / 32.0,  // Tritone     45/32
    3.0 / 2.0,    // Perfect 5th 3/2
    8.0 / 5.0,    // Minor 6th   8/5
    5.0 / 3.0,    // Major 6th   5/3
    9.0 / 5.0,    // Minor 7th   9/5
    15.0 / 8.0,   // Major 7th   15/8
];

// Same as major except the minor 7th (16/9 instead of 9/5).
const FIVE_LIMIT_MINOR: RatioTable = [
    1.0,          // Unison      1/1
    16.0 / 15.0,  // Minor 2nd   16/15
    9.0 / 8.0,    // Major 2nd   9/8
    6.0 / 5.0,    // Minor 3rd   6/5
    5.0 / 4.0,    // Major 3rd   5/4
    4.0 / 3.0,    // Perfect 4th 4/3
    45.0 / 32.0,  // Tritone     45/32
    3.0 / 2.0,    // Perfect 5th 3/2
    8.0 / 5.0,    // Minor 6th   8/5
    5.0 / 3.0,    // Major 6th   5/3
    16.0 / 9.0,   // Minor 7th   16/9
    15.0 / 8.0,   // Major 7th   15/8
];
