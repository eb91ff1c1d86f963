use std::fmt;

use serde::{Deserialize, Serialize};

/// Pitch class, C = 0 through B = 11
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PitchClass {
    C,
    Cs,
    D,
    Ds,
    E,
    F,
    Fs,
    G,
    Gs,
    A,
    As,
    B,
}

impl PitchClass {
    pub const ALL: [PitchClass; 12] = [
        PitchClass::C,
        PitchClass::Cs,
        PitchClass::D,
        PitchClass::Ds,
        PitchClass::E,
        PitchClass::F,
        PitchClass::Fs,
        PitchClass::G,
        PitchClass::Gs,
        PitchClass::A,
        PitchClass::As,
        PitchClass::B,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PitchClass::C => "C",
            PitchClass::Cs => "C#",
            PitchClass::D => "D",
            PitchClass::Ds => "D#",
            PitchClass::E => "E",
            PitchClass::F => "F",
            PitchClass::Fs => "F#",
            PitchClass::G => "G",
            PitchClass::Gs => "G#",
            PitchClass::A => "A",
            PitchClass::As => "A#",
            PitchClass::B => "B",
        }
    }

    /// Semitone above C (0-11)
    pub fn semitone(&self) -> u8 {
        *self as u8
    }

    /// Pitch class for any semitone count, wrapping into 0-11.
    pub fn from_semitone(semitone: i32) -> PitchClass {
        Self::ALL[semitone.rem_euclid(12) as usize]
    }

    /// Pitch class of a MIDI note number.
    pub fn of_note(note: u8) -> PitchClass {
        Self::ALL[(note % 12) as usize]
    }

    pub fn transpose(self, semitones: i32) -> PitchClass {
        Self::from_semitone(self.semitone() as i32 + semitones)
    }

    /// Interval in semitones (0-11) from `root` up to `self`.
    pub fn interval_from(self, root: PitchClass) -> u8 {
        (self.semitone() + 12 - root.semitone()) % 12
    }
}

/// Major or minor mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Major,
    Minor,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Major, Mode::Minor];

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Major => "major",
            Mode::Minor => "minor",
        }
    }
}

/// A musical key: tonic plus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tonality {
    pub root: PitchClass,
    pub mode: Mode,
}

impl Tonality {
    pub const C_MAJOR: Tonality = Tonality {
        root: PitchClass::C,
        mode: Mode::Major,
    };

    pub fn new(root: PitchClass, mode: Mode) -> Self {
        Self { root, mode }
    }

    /// Parse a key name as spelled by the score-following service and the
    /// config file: `C`, `F#`, `Bb`, `Cs`, `C#m`, `Ebm`, `A minor`, `D major`.
    pub fn parse(s: &str) -> Option<Tonality> {
        let s = s.trim();
        let mut chars = s.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        let base: i32 = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };

        let rest = chars.as_str();
        let mut offset = 0i32;
        let mut consumed = 0usize;
        for c in rest.chars() {
            match c {
                '#' | 's' => offset += 1,
                'b' => offset -= 1,
                _ => break,
            }
            consumed += c.len_utf8();
        }

        let mode = match rest[consumed..].trim().to_ascii_lowercase().as_str() {
            "" | "maj" | "major" => Mode::Major,
            "m" | "min" | "minor" => Mode::Minor,
            _ => return None,
        };

        Some(Tonality::new(PitchClass::from_semitone(base + offset), mode))
    }
}

impl fmt::Display for Tonality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.root.name(), self.mode.name())
    }
}

/// Key signature as carried by MusicXML / standard MIDI file metadata:
/// number of sharps (positive) or flats (negative) plus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySignature {
    pub fifths: i8,
    pub minor: bool,
}

impl KeySignature {
    pub fn new(fifths: i8, minor: bool) -> Self {
        Self { fifths, minor }
    }

    /// Tonic and mode implied by the signature. `None` outside -7..=7.
    pub fn tonality(&self) -> Option<Tonality> {
        if !(-7..=7).contains(&self.fifths) {
            return None;
        }
        let major_tonic = PitchClass::from_semitone(self.fifths as i32 * 7);
        Some(if self.minor {
            Tonality::new(major_tonic.transpose(9), Mode::Minor)
        } else {
            Tonality::new(major_tonic, Mode::Major)
        })
    }
}

/// Key-detection sensitivity. Higher sensitivity accepts weaker evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl Sensitivity {
    pub const ALL: [Sensitivity; 3] = [Sensitivity::Low, Sensitivity::Medium, Sensitivity::High];

    /// Minimum weighted score against mean-centred key profiles before an
    /// estimate is reported. Diatonic material lands around 0.05, a flat
    /// chromatic histogram at 0.
    pub fn score_threshold(&self) -> f64 {
        match self {
            Sensitivity::Low => 0.03,
            Sensitivity::Medium => 0.022,
            Sensitivity::High => 0.012,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Sensitivity> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Sensitivity::Low),
            "medium" | "med" => Some(Sensitivity::Medium),
            "high" => Some(Sensitivity::High),
            _ => None,
        }
    }
}

/// Result of ensemble key detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyEstimate {
    pub tonality: Tonality,
    /// 0-100
    pub confidence: f64,
    /// How many profile sources voted for `tonality` (0-3)
    pub agreement: u8,
}

impl KeyEstimate {
    /// Builds an estimate, clamping confidence into 0-100 and agreement into 0-3.
    pub fn new(tonality: Tonality, confidence: f64, agreement: u8) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            tonality,
            confidence,
            agreement: agreement.min(3),
        }
    }
}
