//! Sliding observation window with a tempo-adaptive horizon.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use intonal_types::tuning::smoothing::{by_tempo, smooth_toward};

/// Upper bound on retained observations regardless of horizon.
const MAX_OBSERVATIONS: usize = 512;
/// Gaps longer than this are pauses, not tempo.
const MAX_IOI_MS: f64 = 3000.0;
const IOI_SMOOTHING: f64 = 0.3;
const HORIZON_SMOOTHING: f64 = 0.2;
/// Shortest duration counted for a note; staccato notes still register.
const MIN_WEIGHT_SECS: f64 = 0.05;
/// Longest duration counted for a note; one held pedal tone can't swamp the window.
const MAX_WEIGHT_SECS: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct Observation {
    pub pitch: u8,
    pub velocity: u8,
    pub onset: Instant,
    /// `None` while the note is still held.
    pub duration: Option<Duration>,
}

impl Observation {
    /// Histogram weight: duration scaled by velocity. Held notes count up to `now`.
    pub fn weight(&self, now: Instant) -> f64 {
        let held = self
            .duration
            .unwrap_or_else(|| now.saturating_duration_since(self.onset));
        let secs = held.as_secs_f64().clamp(MIN_WEIGHT_SECS, MAX_WEIGHT_SECS);
        secs * (self.velocity.max(1) as f64 / 127.0)
    }
}

pub struct ObservationWindow {
    observations: VecDeque<Observation>,
    last_onset: Option<Instant>,
    ioi_ms: f64,
    horizon_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl ObservationWindow {
    pub fn new(min_ms: f64, max_ms: f64) -> Self {
        let max_ms = max_ms.max(min_ms);
        Self {
            observations: VecDeque::new(),
            last_onset: None,
            // Start out assuming slow playing: widest window
            ioi_ms: MAX_IOI_MS,
            horizon_ms: max_ms,
            min_ms,
            max_ms,
        }
    }

    pub fn note_on(&mut self, pitch: u8, velocity: u8, now: Instant) {
        if let Some(last) = self.last_onset {
            let ioi = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
            if ioi <= MAX_IOI_MS {
                self.ioi_ms = smooth_toward(self.ioi_ms, ioi, IOI_SMOOTHING);
            }
        }
        self.last_onset = Some(now);

        let target = by_tempo(self.ioi_ms, self.min_ms, self.max_ms);
        self.horizon_ms = smooth_toward(self.horizon_ms, target, HORIZON_SMOOTHING);

        self.observations.push_back(Observation {
            pitch,
            velocity,
            onset: now,
            duration: None,
        });
        while self.observations.len() > MAX_OBSERVATIONS {
            self.observations.pop_front();
        }
    }

    /// Close the oldest still-open observation of `pitch`.
    pub fn note_off(&mut self, pitch: u8, now: Instant) {
        if let Some(obs) = self
            .observations
            .iter_mut()
            .find(|o| o.pitch == pitch && o.duration.is_none())
        {
            obs.duration = Some(now.saturating_duration_since(obs.onset));
        }
    }

    /// Drop observations whose onset fell out of the horizon.
    pub fn prune(&mut self, now: Instant) {
        let horizon = Duration::from_secs_f64(self.horizon_ms / 1000.0);
        while let Some(front) = self.observations.front() {
            if now.saturating_duration_since(front.onset) > horizon {
                self.observations.pop_front();
            } else {
                break;
            }
        }
    }

    /// Weighted pitch-class histogram, normalized to sum 1. All zeros when empty.
    pub fn histogram(&self, now: Instant) -> [f64; 12] {
        let mut bins = [0.0; 12];
        for obs in &self.observations {
            bins[(obs.pitch % 12) as usize] += obs.weight(now);
        }
        normalize(&mut bins);
        bins
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn horizon_ms(&self) -> f64 {
        self.horizon_ms
    }

    /// Smoothed inter-onset interval in milliseconds.
    pub fn ioi_ms(&self) -> f64 {
        self.ioi_ms
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.last_onset = None;
    }
}

pub(crate) fn normalize(bins: &mut [f64; 12]) {
    let total: f64 = bins.iter().sum();
    if total > 0.0 && total.is_finite() {
        for b in bins.iter_mut() {
            *b /= total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    #[test]
    fn fast_playing_shrinks_horizon() {
        let t0 = Instant::now();
        let mut window = ObservationWindow::new(4000.0, 12000.0);
        for i in 0..40 {
            window.note_on(60, 100, ms(t0, i * 100));
        }
        assert!(window.horizon_ms() < 5000.0, "horizon {}", window.horizon_ms());
        assert!(window.horizon_ms() >= 4000.0);
    }

    #[test]
    fn horizon_moves_gradually() {
        let t0 = Instant::now();
        let mut window = ObservationWindow::new(4000.0, 12000.0);
        window.note_on(60, 100, t0);
        window.note_on(62, 100, ms(t0, 100));
        // One fast interval cannot collapse the horizon at once
        assert!(window.horizon_ms() > 10000.0);
    }

    #[test]
    fn prune_drops_old_onsets() {
        let t0 = Instant::now();
        let mut window = ObservationWindow::new(4000.0, 4000.0);
        window.note_on(60, 100, t0);
        window.note_on(64, 100, ms(t0, 3000));
        window.prune(ms(t0, 5000));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn histogram_weights_duration_and_velocity() {
        let t0 = Instant::now();
        let mut window = ObservationWindow::new(4000.0, 12000.0);
        window.note_on(60, 127, t0);
        window.note_on(67, 127, t0);
        window.note_off(60, ms(t0, 1000));
        window.note_off(67, ms(t0, 500));
        let hist = window.histogram(ms(t0, 2000));
        assert!((hist[0] - 2.0 / 3.0).abs() < 1e-9);
        assert!((hist[7] - 1.0 / 3.0).abs() < 1e-9);
        assert!((hist.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_histogram_is_zero() {
        let window = ObservationWindow::new(4000.0, 12000.0);
        assert_eq!(window.histogram(Instant::now()), [0.0; 12]);
    }
}
