//! Hashed timing wheel (millisecond resolution) driving read-idle timeouts,
//! keepalive, reliable-datagram driver ticks and reconnect backoff.
//!
//! One bucket per millisecond-slot modulo `WHEEL_SIZE`; an event whose
//! deadline is further out than one full revolution records how many extra
//! revolutions ("steps") it must wait through before it's actually due,
//! the classic hashed/hierarchical-wheel trick for handling a deadline
//! range much larger than the bucket count without a huge flat array.

use std::collections::HashMap;

pub type TimerId = u64;

const WHEEL_SIZE: usize = 8192; // power of two: cheap `& (WHEEL_SIZE - 1)` indexing

struct Entry {
    id: TimerId,
    steps_remaining: u32,
}

pub struct TimerWheel {
    buckets: Vec<Vec<Entry>>,
    cursor: usize,
    /// id -> (bucket index, steps at insertion) for O(1)-ish cancellation.
    index: HashMap<TimerId, usize>,
    next_id: TimerId,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            buckets: (0..WHEEL_SIZE).map(|_| Vec::new()).collect(),
            cursor: 0,
            index: HashMap::new(),
            next_id: 1,
        }
    }

    /// Schedules a new timer to fire after `delay_ms` milliseconds from now
    /// (i.e. after `delay_ms` future calls to [`TimerWheel::tick`]).
    /// Returns an id usable with [`TimerWheel::cancel`].
    pub fn schedule(&mut self, delay_ms: u64) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        let delay_ms = delay_ms.max(1);
        let steps = (delay_ms / WHEEL_SIZE as u64) as u32;
        let offset = (delay_ms % WHEEL_SIZE as u64) as usize;
        let bucket = (self.cursor + offset) % WHEEL_SIZE;

        self.buckets[bucket].push(Entry { id, steps_remaining: steps });
        self.index.insert(id, bucket);
        id
    }

    /// Removes a pending timer before it fires. No-op if already fired or
    /// unknown (cancelling a just-fired id is a safe race, not a bug).
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(bucket) = self.index.remove(&id) {
            self.buckets[bucket].retain(|e| e.id != id);
        }
    }

    /// Advances the wheel by one millisecond slot, returning the ids that
    /// fired this tick. Callers are expected to invoke this once per
    /// millisecond of wall-clock elapsed, typically driven off the
    /// reactor's `poll` timeout.
    pub fn tick(&mut self) -> Vec<TimerId> {
        let mut fired = Vec::new();
        let bucket = &mut self.buckets[self.cursor];
        let mut remaining = Vec::with_capacity(bucket.len());
        for mut entry in bucket.drain(..) {
            if entry.steps_remaining == 0 {
                fired.push(entry.id);
            } else {
                entry.steps_remaining -= 1;
                remaining.push(entry);
            }
        }
        *bucket = remaining;
        for id in &fired {
            self.index.remove(id);
        }
        self.cursor = (self.cursor + 1) % WHEEL_SIZE;
        fired
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_exact_delay() {
        let mut w = TimerWheel::new();
        let id = w.schedule(5);
        for _ in 0..4 {
            assert!(w.tick().is_empty());
        }
        assert_eq!(w.tick(), vec![id]);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut w = TimerWheel::new();
        let id = w.schedule(3);
        w.cancel(id);
        for _ in 0..10 {
            assert!(w.tick().is_empty());
        }
    }

    #[test]
    fn handles_delays_spanning_multiple_revolutions() {
        let mut w = TimerWheel::new();
        let delay = WHEEL_SIZE as u64 * 2 + 7;
        let id = w.schedule(delay);
        for _ in 0..delay - 1 {
            assert!(w.tick().is_empty());
        }
        assert_eq!(w.tick(), vec![id]);
    }

    #[test]
    fn multiple_timers_in_same_bucket_fire_independently() {
        let mut w = TimerWheel::new();
        let a = w.schedule(10);
        let b = w.schedule(10);
        for _ in 0..9 {
            assert!(w.tick().is_empty());
        }
        let fired = w.tick();
        assert_eq!(fired.len(), 2);
        assert!(fired.contains(&a) && fired.contains(&b));
    }
}
