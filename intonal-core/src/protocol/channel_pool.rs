use std::time::{Duration, Instant};

use super::ApplyError;

/// Member channels in an MPE lower zone (1..=15, master on 0).
pub const MEMBER_CHANNELS: usize = 15;

/// The note currently owning a member channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotOwner {
    pub note_id: u64,
    pub pitch: u8,
    pub assigned_at: Instant,
}

#[derive(Debug, Clone)]
struct ChannelSlot {
    channel: u8,
    owner: Option<SlotOwner>,
    released_at: Option<Instant>,
}

/// Result of a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub channel: u8,
    /// Note evicted to make room. The caller must cut it off.
    pub stolen: Option<SlotOwner>,
}

/// Fixed pool of member channels with least-recently-used stealing.
///
/// The pool owns channel lifecycle data but does not send MIDI messages;
/// the MPE backend turns allocations into note-offs and bends.
pub struct ChannelPool {
    slots: Vec<ChannelSlot>,
    /// Notes younger than this are never stolen.
    steal_guard: Duration,
}

impl ChannelPool {
    pub fn new(first_channel: u8, steal_guard: Duration) -> Self {
        let slots = (0..MEMBER_CHANNELS as u8)
            .map(|i| ChannelSlot {
                channel: (first_channel + i) & 0x0F,
                owner: None,
                released_at: None,
            })
            .collect();
        Self { slots, steal_guard }
    }

    pub fn channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots.iter().map(|s| s.channel)
    }

    pub fn channel_of(&self, note_id: u64) -> Option<u8> {
        self.slots
            .iter()
            .find(|s| s.owner.is_some_and(|o| o.note_id == note_id))
            .map(|s| s.channel)
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_some()).count()
    }

    /// Assign a channel to `note_id`.
    ///
    /// Prefers the free channel released longest ago so release tails keep
    /// ringing. With no free channel, steals the oldest assignment unless it
    /// is younger than the steal guard, in which case the pool is exhausted.
    pub fn allocate(&mut self, note_id: u64, pitch: u8, now: Instant) -> Result<Allocation, ApplyError> {
        if let Some(channel) = self.channel_of(note_id) {
            return Ok(Allocation {
                channel,
                stolen: None,
            });
        }

        let owner = SlotOwner {
            note_id,
            pitch,
            assigned_at: now,
        };

        let free = self
            .slots
            .iter_mut()
            .filter(|s| s.owner.is_none())
            // Never-used slots (None) sort before any release time
            .min_by_key(|s| s.released_at);
        if let Some(slot) = free {
            slot.owner = Some(owner);
            return Ok(Allocation {
                channel: slot.channel,
                stolen: None,
            });
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.owner.map(|o| (i, o)))
            .min_by_key(|(_, o)| o.assigned_at);
        let Some((index, previous)) = victim else {
            return Err(ApplyError::ResourceExhausted);
        };
        if now.saturating_duration_since(previous.assigned_at) < self.steal_guard {
            return Err(ApplyError::ResourceExhausted);
        }

        let slot = &mut self.slots[index];
        slot.owner = Some(owner);
        Ok(Allocation {
            channel: slot.channel,
            stolen: Some(previous),
        })
    }

    /// Return the note's channel to the free pool.
    pub fn release(&mut self, note_id: u64, now: Instant) -> Option<u8> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.owner.is_some_and(|o| o.note_id == note_id))?;
        slot.owner = None;
        slot.released_at = Some(now);
        Some(slot.channel)
    }

    /// Free every channel, returning the owners that were still assigned.
    pub fn drain(&mut self) -> Vec<(u8, SlotOwner)> {
        let mut drained = Vec::new();
        for slot in &mut self.slots {
            if let Some(owner) = slot.owner.take() {
                drained.push((slot.channel, owner));
            }
            slot.released_at = None;
        }
        drained
    }

    pub fn set_steal_guard(&mut self, guard: Duration) {
        self.steal_guard = guard;
    }
}
