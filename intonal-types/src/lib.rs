//! # intonal-types
//!
//! Shared data types and pure tuning math for the intonal just-intonation
//! engine. Nothing in this crate touches MIDI ports, threads, or the
//! filesystem; everything is deterministic and cheap to test.
//!
//! - [`music`]: pitch classes, modes, keys, key signatures, detection
//!   sensitivity and the `KeyEstimate` produced by key detection
//! - [`tuning`]: five-limit ratio tables, per-key cents tables, and the
//!   conversions between cents and the protocol units (pitch bend, MTS 14-bit,
//!   MIDI 2.0 Pitch 7.25)

pub mod music;
pub mod tuning;

pub use music::{KeyEstimate, KeySignature, Mode, PitchClass, Sensitivity, Tonality};
pub use tuning::{deviation, table_for, TuningTable};
