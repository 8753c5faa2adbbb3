//! Hierarchical-ish timing wheel for per-slot retransmission scheduling
//! ("a hierarchical wheel with the finest granularity matching
//! the per-packet RTT resolution (≈ 1 µs buckets at the lowest level)").
//!
//! This is a single-level hashed wheel with a `rounds` counter standing in
//! for the upper tiers: a timer whose delay spans more than one full
//! revolution waits out the extra revolutions in its bucket rather than
//! being re-inserted, keeping insertion and per-tick drain both O(1).

use std::time::{Duration, Instant};

struct TimerEntry {
    session_num: u16,
    slot_idx: usize,
    rounds: u32,
}

pub struct TimerWheel {
    buckets: Vec<Vec<TimerEntry>>,
    resolution: Duration,
    current_tick: u64,
    last_advance: Instant,
}

impl TimerWheel {
    pub fn new(num_buckets: usize, resolution: Duration, now: Instant) -> Self {
        assert!(num_buckets > 0);
        Self {
            buckets: (0..num_buckets).map(|_| Vec::new()).collect(),
            resolution,
            current_tick: 0,
            last_advance: now,
        }
    }

    /// Schedules a retransmission check for `(session_num, slot_idx)` after
    /// `delay`.
    pub fn schedule(&mut self, session_num: u16, slot_idx: usize, delay: Duration) {
        let ticks = ((delay.as_nanos() / self.resolution.as_nanos().max(1)) as u64).max(1);
        let len = self.buckets.len() as u64;
        // `ticks` ticks from now lands on the bucket `ticks % len` visits on
        // its `ticks / len`-th pass if `ticks` isn't a multiple of `len`, but
        // a bucket is first revisited after exactly `len` ticks, not after
        // `len + 1`: an entry due in exactly `len` ticks must fire on that
        // first visit (`rounds == 0`), so round count off the visit index.
        let rounds = ((ticks - 1) / len) as u32;
        let bucket = ((self.current_tick + ticks) % len) as usize;
        self.buckets[bucket].push(TimerEntry { session_num, slot_idx, rounds });
    }

    /// Advances the wheel to `now`, returning every `(session_num,
    /// slot_idx)` whose timer has expired.
    pub fn advance(&mut self, now: Instant) -> Vec<(u16, usize)> {
        let elapsed = now.saturating_duration_since(self.last_advance);
        let ticks = (elapsed.as_nanos() / self.resolution.as_nanos().max(1)) as u64;
        if ticks == 0 {
            return Vec::new();
        }
        let mut fired = Vec::new();
        let len = self.buckets.len() as u64;
        for _ in 0..ticks {
            self.current_tick += 1;
            let idx = (self.current_tick % len) as usize;
            let due: Vec<TimerEntry> = self.buckets[idx].drain(..).collect();
            for entry in due {
                if entry.rounds == 0 {
                    fired.push((entry.session_num, entry.slot_idx));
                } else {
                    self.buckets[idx].push(TimerEntry {
                        session_num: entry.session_num,
                        slot_idx: entry.slot_idx,
                        rounds: entry.rounds - 1,
                    });
                }
            }
        }
        self.last_advance += self.resolution * ticks as u32;
        fired
    }
}
