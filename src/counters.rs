// Range counters (component C, spec §4.2) and the admission predicate's
// per-degree compatibility checks.

use crate::common::DEGREE_COUNT;
use crate::registry::LockMode;

/// Per-degree reader/writer tallies.
///
/// `active_writers` is 0 or 1 at every degree (invariant I1); `waiting_writers`
/// may be arbitrarily large.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DegreeCounter {
    pub active_readers: u32,
    pub active_writers: u32,
    pub waiting_writers: u32,
}

/// Fixed array of 360 [`DegreeCounter`] records, one per degree.
///
/// Only ever touched while the admission engine holds its manager-wide
/// lock `M`; this type carries no locking of its own.
pub struct DegreeCounters {
    counters: [DegreeCounter; DEGREE_COUNT as usize],
}

/// Returns the sequence of degrees covered by `[low, high]` on the circular
/// domain `0..360`: `low..=high` if `low <= high`, else the wraparound
/// `low..=359` followed by `0..=high`.
pub fn degree_range(low: u16, high: u16) -> impl Iterator<Item = u16> {
    let (first, second) = if low <= high {
        (low..=high, 1..=0) // empty second range
    } else {
        (low..=(DEGREE_COUNT - 1), 0..=high)
    };
    first.chain(second)
}

/// Returns whether `orientation` falls within the circular range `[low, high]`.
pub fn orientation_in_range(orientation: u16, low: u16, high: u16) -> bool {
    if low <= high {
        orientation >= low && orientation <= high
    } else {
        orientation >= low || orientation <= high
    }
}

impl DegreeCounters {
    pub fn new() -> Self {
        Self {
            counters: [DegreeCounter::default(); DEGREE_COUNT as usize],
        }
    }

    pub fn get(&self, degree: u16) -> DegreeCounter {
        self.counters[degree as usize]
    }

    /// Evaluates the admission predicate (spec §4.4.1) for a request over
    /// `[low, high]` in `mode`, given the current `orientation`.
    pub fn can_admit(&self, orientation: u16, low: u16, high: u16, mode: LockMode) -> bool {
        if !orientation_in_range(orientation, low, high) {
            return false;
        }
        degree_range(low, high).all(|d| {
            let c = self.counters[d as usize];
            match mode {
                LockMode::Read => c.active_writers == 0 && c.waiting_writers == 0,
                LockMode::Write => c.active_readers == 0 && c.active_writers == 0,
            }
        })
    }

    /// Adds `delta` active readers/writers (per `mode`) over `[low, high]`.
    /// `delta` is `1` on grant, `-1` on release; callers never pass any
    /// other value.
    pub fn adjust_active(&mut self, low: u16, high: u16, mode: LockMode, delta: i64) {
        for d in degree_range(low, high) {
            let c = &mut self.counters[d as usize];
            match mode {
                LockMode::Read => c.active_readers = apply_delta(c.active_readers, delta),
                LockMode::Write => c.active_writers = apply_delta(c.active_writers, delta),
            }
        }
    }

    /// Adds `delta` to `waiting_writers` over `[low, high]`.
    pub fn adjust_waiting_writers(&mut self, low: u16, high: u16, delta: i64) {
        for d in degree_range(low, high) {
            let c = &mut self.counters[d as usize];
            c.waiting_writers = apply_delta(c.waiting_writers, delta);
        }
    }

    /// Sum of `active_readers` (if `mode == Read`) or `active_writers`
    /// (if `mode == Write`) over all 360 degrees. Used by property tests
    /// (P2, counter accuracy).
    pub fn total_active(&self, mode: LockMode) -> u64 {
        self.counters
            .iter()
            .map(|c| match mode {
                LockMode::Read => c.active_readers as u64,
                LockMode::Write => c.active_writers as u64,
            })
            .sum()
    }
}

impl Default for DegreeCounters {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_delta(value: u32, delta: i64) -> u32 {
    let next = value as i64 + delta;
    debug_assert!(next >= 0, "counter underflow");
    next.max(0) as u32
}
