//! Predictive tuning from the score-following service: per-pitch FIFO queues
//! of upcoming deviations, consumed by note-ons.

pub mod message;

use std::collections::{HashMap, VecDeque};

pub use message::{
    decode_predictions, resolve_key, NoteId, PredictiveEntry, RawPrediction, ScoreMessage,
    ScoreOutbound, UpcomingKeyChange,
};

/// Predictions older than this (seconds) are discarded at consumption.
pub const DEFAULT_STALE_AFTER_SECS: f64 = 60.0;

/// Entries kept per pitch; the oldest are dropped beyond this.
const MAX_PER_PITCH: usize = 64;

/// Result of consuming the queue for one pitch.
#[derive(Debug, Clone, PartialEq)]
pub struct Consumed {
    pub entry: Option<PredictiveEntry>,
    /// Stale entries thrown away on the way to `entry`.
    pub stale: usize,
}

#[derive(Debug)]
pub struct PredictiveQueue {
    queues: HashMap<u8, VecDeque<PredictiveEntry>>,
    stale_after: f64,
}

impl PredictiveQueue {
    pub fn new(stale_after_secs: f64) -> Self {
        Self {
            queues: HashMap::new(),
            stale_after: stale_after_secs,
        }
    }

    pub fn push(&mut self, entry: PredictiveEntry) {
        let queue = self.queues.entry(entry.pitch).or_default();
        if queue.len() >= MAX_PER_PITCH {
            queue.pop_front();
        }
        queue.push_back(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = PredictiveEntry>) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Pop the oldest fresh entry for `pitch`, discarding stale ones ahead of it.
    pub fn consume(&mut self, pitch: u8, now_secs: f64) -> Consumed {
        let mut stale = 0;
        let Some(queue) = self.queues.get_mut(&pitch) else {
            return Consumed { entry: None, stale };
        };
        let mut entry = None;
        while let Some(front) = queue.pop_front() {
            let age = now_secs - front.timestamp_secs;
            if age > self.stale_after {
                log::debug!(
                    target: "predictive",
                    "discarding stale prediction for pitch {} ({:.1}s old)",
                    pitch,
                    age
                );
                stale += 1;
                continue;
            }
            entry = Some(front);
            break;
        }
        if queue.is_empty() {
            self.queues.remove(&pitch);
        }
        Consumed { entry, stale }
    }

    pub fn pending(&self, pitch: u8) -> usize {
        self.queues.get(&pitch).map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }

    pub fn set_stale_after(&mut self, secs: f64) {
        self.stale_after = secs;
    }
}

impl Default for PredictiveQueue {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pitch: u8, cents: f64, timestamp_secs: f64) -> PredictiveEntry {
        PredictiveEntry {
            note_id: None,
            pitch,
            cents,
            timestamp_secs,
            source: "test".into(),
            key: None,
        }
    }

    #[test]
    fn fifo_per_pitch() {
        let mut q = PredictiveQueue::default();
        q.push(entry(61, 11.7, 100.0));
        q.push(entry(61, -29.3, 100.0));
        q.push(entry(64, -13.7, 100.0));
        assert_eq!(q.len(), 3);
        assert_eq!(q.consume(61, 101.0).entry.map(|e| e.cents), Some(11.7));
        assert_eq!(q.consume(61, 101.0).entry.map(|e| e.cents), Some(-29.3));
        assert_eq!(q.consume(61, 101.0).entry, None);
        assert_eq!(q.pending(64), 1);
    }

    #[test]
    fn sixty_one_seconds_is_stale() {
        let mut q = PredictiveQueue::default();
        q.push(entry(61, 11.7, 1000.0));
        let consumed = q.consume(61, 1061.0);
        assert_eq!(consumed.entry, None);
        assert_eq!(consumed.stale, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn fifty_nine_seconds_is_applied() {
        let mut q = PredictiveQueue::default();
        q.push(entry(61, 11.7, 1000.0));
        let consumed = q.consume(61, 1059.0);
        assert_eq!(consumed.entry.map(|e| e.cents), Some(11.7));
        assert_eq!(consumed.stale, 0);
    }

    #[test]
    fn stale_entries_are_skipped_to_fresh_one() {
        let mut q = PredictiveQueue::default();
        q.push(entry(60, 1.0, 0.0));
        q.push(entry(60, 2.0, 10.0));
        q.push(entry(60, 3.0, 50.0));
        let consumed = q.consume(60, 100.0);
        assert_eq!(consumed.stale, 2);
        assert_eq!(consumed.entry.map(|e| e.cents), Some(3.0));
    }

    #[test]
    fn queue_is_bounded() {
        let mut q = PredictiveQueue::default();
        for i in 0..(MAX_PER_PITCH + 5) {
            q.push(entry(60, i as f64, 0.0));
        }
        assert_eq!(q.pending(60), MAX_PER_PITCH);
        assert_eq!(q.consume(60, 1.0).entry.map(|e| e.cents), Some(5.0));
    }
}
