//! Key profiles for the ensemble: three published sources, major and minor each.
//!
//! Profiles are indexed by interval above the tonic. They are normalized to
//! sum 1 when a `ProfileSet` is built, so scores from different sources are
//! comparable.

use intonal_types::Mode;

use super::window::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSource {
    KrumhanslKessler,
    Temperley,
    AardenEssen,
}

impl ProfileSource {
    pub const ALL: [ProfileSource; 3] = [
        ProfileSource::KrumhanslKessler,
        ProfileSource::Temperley,
        ProfileSource::AardenEssen,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProfileSource::KrumhanslKessler => "krumhansl-kessler",
            ProfileSource::Temperley => "temperley",
            ProfileSource::AardenEssen => "aarden-essen",
        }
    }

    /// Blend weight in the ensemble vote.
    pub fn weight(&self) -> f64 {
        match self {
            ProfileSource::KrumhanslKessler => 0.40,
            ProfileSource::Temperley => 0.35,
            ProfileSource::AardenEssen => 0.25,
        }
    }

    fn raw(&self, mode: Mode) -> [f64; 12] {
        match (self, mode) {
            // Krumhansl & Kessler (1982) probe-tone ratings
            (ProfileSource::KrumhanslKessler, Mode::Major) => [
                6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
            ],
            (ProfileSource::KrumhanslKessler, Mode::Minor) => [
                6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
            ],
            // Temperley, Kostka-Payne corpus
            (ProfileSource::Temperley, Mode::Major) => [
                0.748, 0.060, 0.488, 0.082, 0.670, 0.460, 0.096, 0.715, 0.104, 0.366, 0.057, 0.400,
            ],
            (ProfileSource::Temperley, Mode::Minor) => [
                0.712, 0.084, 0.474, 0.618, 0.049, 0.460, 0.105, 0.747, 0.404, 0.067, 0.133, 0.330,
            ],
            // Aarden, Essen folksong collection
            (ProfileSource::AardenEssen, Mode::Major) => [
                17.7661, 0.145624, 14.9265, 0.160186, 19.8049, 11.3587, 0.291248, 22.062,
                0.145624, 8.15494, 0.232998, 4.95122,
            ],
            (ProfileSource::AardenEssen, Mode::Minor) => [
                18.2648, 0.737619, 14.0499, 16.8599, 0.702494, 14.4362, 0.702494, 18.6161,
                4.56621, 1.93186, 7.37619, 1.75623,
            ],
        }
    }
}

/// One source's normalized major and minor profiles.
#[derive(Debug, Clone)]
pub struct PitchClassProfile {
    pub source: ProfileSource,
    pub weight: f64,
    major: [f64; 12],
    minor: [f64; 12],
}

impl PitchClassProfile {
    fn load(source: ProfileSource) -> Self {
        let mut major = source.raw(Mode::Major);
        let mut minor = source.raw(Mode::Minor);
        normalize(&mut major);
        normalize(&mut minor);
        Self {
            source,
            weight: source.weight(),
            major,
            minor,
        }
    }

    pub fn for_mode(&self, mode: Mode) -> &[f64; 12] {
        match mode {
            Mode::Major => &self.major,
            Mode::Minor => &self.minor,
        }
    }

    /// Dot product of a normalized histogram with this profile rotated to `root`.
    pub fn score(&self, histogram: &[f64; 12], root: u8, mode: Mode) -> f64 {
        let profile = self.for_mode(mode);
        (0..12)
            .map(|pc| {
                let interval = (pc + 12 - root as usize % 12) % 12;
                histogram[pc] * profile[interval]
            })
            .sum()
    }
}

/// The six profiles, immutable after construction.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    profiles: Vec<PitchClassProfile>,
}

impl ProfileSet {
    pub fn standard() -> Self {
        Self {
            profiles: ProfileSource::ALL
                .iter()
                .map(|&s| PitchClassProfile::load(s))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PitchClassProfile> {
        self.profiles.iter()
    }
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self::standard()
    }
}
