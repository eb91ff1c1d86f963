//! Ensemble key detection.
//!
//! Each profile source picks its best (root, mode) by correlating the
//! windowed pitch-class histogram against all 24 rotations. The sources then
//! vote with their blend weights, and the winner has to survive hysteresis
//! before it is reported.

pub mod profiles;
pub mod window;

use std::time::{Duration, Instant};

use intonal_types::{KeyEstimate, Mode, PitchClass, Sensitivity, Tonality};

use profiles::{ProfileSet, ProfileSource};
use window::{normalize, ObservationWindow};

/// Confidence is the agreeing sources' mean score times this.
const CONFIDENCE_SCALE: f64 = 400.0;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// Notes required in the window before detection runs.
    pub min_notes: usize,
    pub window_min_ms: f64,
    pub window_max_ms: f64,
    /// Confidence (0-100) a new key needs before it can replace the stable one.
    pub min_confidence: f64,
    /// Consecutive wins a new key needs before it replaces the stable one.
    pub confirmations: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            min_notes: 8,
            window_min_ms: 4000.0,
            window_max_ms: 12000.0,
            min_confidence: 30.0,
            confirmations: 2,
        }
    }
}

/// One source's best key for a histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceVote {
    pub source: ProfileSource,
    pub tonality: Tonality,
    pub score: f64,
}

/// Raw ensemble result, before hysteresis.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub estimate: KeyEstimate,
    /// Weighted sum of each source's best score against its mean-centred
    /// profile. Gated by [`Sensitivity::score_threshold`].
    pub evidence: f64,
    pub votes: Vec<SourceVote>,
}

fn agreement_bonus(agreement: u8) -> f64 {
    match agreement {
        3 => 1.2,
        2 => 1.0,
        _ => 0.8,
    }
}

/// Run the ensemble over a normalized histogram. `None` for an empty histogram.
pub fn classify(histogram: &[f64; 12], profiles: &ProfileSet) -> Option<Classification> {
    if histogram.iter().all(|&v| v <= 0.0) {
        return None;
    }

    let votes: Vec<SourceVote> = profiles
        .iter()
        .map(|profile| {
            let mut best = SourceVote {
                source: profile.source,
                tonality: Tonality::C_MAJOR,
                score: f64::NEG_INFINITY,
            };
            for mode in Mode::ALL {
                for root in 0..12u8 {
                    let score = profile.score(histogram, root, mode);
                    if score > best.score {
                        best.tonality = Tonality::new(PitchClass::from_semitone(root as i32), mode);
                        best.score = score;
                    }
                }
            }
            best
        })
        .collect();

    // Weighted vote, first-seen order breaks ties
    let mut tally: Vec<(Tonality, f64)> = Vec::with_capacity(3);
    for vote in &votes {
        match tally.iter_mut().find(|(t, _)| *t == vote.tonality) {
            Some((_, w)) => *w += vote.source.weight(),
            None => tally.push((vote.tonality, vote.source.weight())),
        }
    }
    let mut winner = tally.first()?.0;
    let mut winner_weight = f64::NEG_INFINITY;
    for (tonality, weight) in &tally {
        if *weight > winner_weight {
            winner = *tonality;
            winner_weight = *weight;
        }
    }

    let agreeing: Vec<&SourceVote> = votes.iter().filter(|v| v.tonality == winner).collect();
    let agreement = agreeing.len() as u8;
    let agreeing_weight: f64 = agreeing.iter().map(|v| v.source.weight()).sum();
    let mean_score = if agreeing_weight > 0.0 {
        agreeing
            .iter()
            .map(|v| v.score * v.source.weight())
            .sum::<f64>()
            / agreeing_weight
    } else {
        0.0
    };

    let confidence = mean_score * CONFIDENCE_SCALE * agreement_bonus(agreement);
    let mass: f64 = histogram.iter().sum();
    let evidence = votes
        .iter()
        .map(|v| (v.score - mass / 12.0) * v.source.weight())
        .sum();

    Some(Classification {
        estimate: KeyEstimate::new(winner, confidence, agreement),
        evidence,
        votes,
    })
}

/// Keeps a stable key and only lets a different one through after it has won
/// `confirmations` times in a row with enough confidence.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    stable: Option<Tonality>,
    candidate: Option<(Tonality, u32)>,
    confirmations: u32,
    min_confidence: f64,
}

impl Hysteresis {
    pub fn new(confirmations: u32, min_confidence: f64) -> Self {
        Self {
            stable: None,
            candidate: None,
            confirmations: confirmations.max(1),
            min_confidence,
        }
    }

    /// Returns the estimate if it changes the stable key.
    pub fn offer(&mut self, estimate: KeyEstimate) -> Option<KeyEstimate> {
        if self.stable == Some(estimate.tonality) {
            self.candidate = None;
            return None;
        }
        if estimate.confidence < self.min_confidence {
            return None;
        }
        if self.stable.is_none() {
            return self.accept(estimate);
        }

        let count = match self.candidate {
            Some((t, n)) if t == estimate.tonality => n + 1,
            _ => 1,
        };
        if count >= self.confirmations {
            self.accept(estimate)
        } else {
            self.candidate = Some((estimate.tonality, count));
            None
        }
    }

    fn accept(&mut self, estimate: KeyEstimate) -> Option<KeyEstimate> {
        self.stable = Some(estimate.tonality);
        self.candidate = None;
        Some(estimate)
    }

    pub fn stable(&self) -> Option<Tonality> {
        self.stable
    }

    pub fn reset(&mut self) {
        self.stable = None;
        self.candidate = None;
    }
}

pub struct KeyDetector {
    settings: DetectorSettings,
    sensitivity: Sensitivity,
    profiles: ProfileSet,
    window: ObservationWindow,
    hysteresis: Hysteresis,
}

impl KeyDetector {
    pub fn new(settings: DetectorSettings, sensitivity: Sensitivity) -> Self {
        Self {
            window: ObservationWindow::new(settings.window_min_ms, settings.window_max_ms),
            hysteresis: Hysteresis::new(settings.confirmations, settings.min_confidence),
            profiles: ProfileSet::standard(),
            sensitivity,
            settings,
        }
    }

    pub fn set_sensitivity(&mut self, sensitivity: Sensitivity) {
        self.sensitivity = sensitivity;
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    pub fn note_on(&mut self, pitch: u8, velocity: u8, now: Instant) {
        self.window.note_on(pitch, velocity, now);
    }

    pub fn note_off(&mut self, pitch: u8, now: Instant) {
        self.window.note_off(pitch, now);
    }

    pub fn horizon_ms(&self) -> f64 {
        self.window.horizon_ms()
    }

    pub fn ioi_ms(&self) -> f64 {
        self.window.ioi_ms()
    }

    pub fn note_count(&self) -> usize {
        self.window.len()
    }

    /// The last key reported by [`detect`](Self::detect).
    pub fn stable_key(&self) -> Option<Tonality> {
        self.hysteresis.stable()
    }

    /// Run detection over the current window. Returns an estimate only when
    /// the stable key changes.
    pub fn detect(&mut self, now: Instant) -> Option<KeyEstimate> {
        self.window.prune(now);
        if self.window.len() < self.settings.min_notes {
            return None;
        }

        let histogram = self.window.histogram(now);
        let result = classify(&histogram, &self.profiles)?;
        if result.evidence < self.sensitivity.score_threshold() {
            log::debug!(
                "key evidence too weak: {:.4} < {:.4}",
                result.evidence,
                self.sensitivity.score_threshold()
            );
            return None;
        }

        let changed = self.hysteresis.offer(result.estimate)?;
        log::debug!(
            "key detected: {} ({:.0}%, {}/3 sources)",
            changed.tonality,
            changed.confidence,
            changed.agreement
        );
        Some(changed)
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.hysteresis.reset();
    }
}

/// One-shot estimate over a whole note list, no hysteresis. Used for offline
/// tuning when a file carries no key signature.
pub fn estimate_notes<I>(notes: I, sensitivity: Sensitivity) -> Option<KeyEstimate>
where
    I: IntoIterator<Item = (u8, Duration, u8)>,
{
    let mut histogram = [0.0; 12];
    let mut count = 0usize;
    for (pitch, duration, velocity) in notes {
        let secs = duration.as_secs_f64().max(0.05);
        histogram[(pitch % 12) as usize] += secs * (velocity.max(1) as f64 / 127.0);
        count += 1;
    }
    if count == 0 {
        return None;
    }
    normalize(&mut histogram);

    let result = classify(&histogram, &ProfileSet::standard())?;
    (result.evidence >= sensitivity.score_threshold()).then_some(result.estimate)
}
