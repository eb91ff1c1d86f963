//! Tick timing, kept in a fixed ring so recording never allocates.

use std::time::Duration;

const RING_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickSummary {
    pub avg_us: u32,
    pub max_us: u32,
    pub p95_us: u32,
    /// Ticks that took longer than their interval, since startup.
    pub overruns: u64,
}

pub struct TickTelemetry {
    samples_us: [u32; RING_LEN],
    next: usize,
    filled: usize,
    window_max_us: u32,
    overruns: u64,
}

impl TickTelemetry {
    pub fn new() -> Self {
        Self {
            samples_us: [0; RING_LEN],
            next: 0,
            filled: 0,
            window_max_us: 0,
            overruns: 0,
        }
    }

    pub fn record(&mut self, took: Duration, budget: Duration) {
        let us = u32::try_from(took.as_micros()).unwrap_or(u32::MAX);
        self.samples_us[self.next] = us;
        self.next = (self.next + 1) % RING_LEN;
        self.filled = (self.filled + 1).min(RING_LEN);
        self.window_max_us = self.window_max_us.max(us);
        if took > budget {
            self.overruns += 1;
        }
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Summarize the ring and start a new max window.
    pub fn take_summary(&mut self) -> TickSummary {
        if self.filled == 0 {
            return TickSummary {
                overruns: self.overruns,
                ..TickSummary::default()
            };
        }
        let mut sorted = self.samples_us;
        let samples = &mut sorted[..self.filled];
        let sum: u64 = samples.iter().map(|&us| us as u64).sum();
        samples.sort_unstable();
        let p95 = samples[(self.filled * 95 / 100).min(self.filled - 1)];

        let summary = TickSummary {
            avg_us: (sum / self.filled as u64) as u32,
            max_us: self.window_max_us,
            p95_us: p95,
            overruns: self.overruns,
        };
        self.window_max_us = 0;
        summary
    }
}

impl Default for TickTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
