//! Adaptive polling order.
//!
//! Round-robin over all 64 short addresses, interrupted by priority
//! requests (a device the sniffer saw change, an explicit sync) and by
//! deferred requests that mature into priority ones.
//!
//! Pure state machine: time is passed in, nothing here touches the bus.

use embassy_time::{Duration, Instant};

use crate::addressing::short::SHORT_ADDRESS_COUNT;
use crate::addressing::ShortAddress;

/// Capacity of the priority queue
pub const PRIORITY_CAPACITY: usize = 64;
/// Capacity of the deferred list
pub const DEFERRED_CAPACITY: usize = 32;

/// What to poll next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollStep {
    Priority(ShortAddress),
    RoundRobin {
        short: ShortAddress,
        /// Last address of a full pass
        wrapped: bool,
    },
}

impl PollStep {
    pub fn short(self) -> ShortAddress {
        match self {
            PollStep::Priority(short) | PollStep::RoundRobin { short, .. } => short,
        }
    }
}

/// Polling scheduler state
#[derive(Debug, Clone)]
pub struct Scheduler {
    priority: heapless::Deque<ShortAddress, PRIORITY_CAPACITY>,
    deferred: heapless::Vec<(ShortAddress, Instant), DEFERRED_CAPACITY>,
    cursor: u8,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            priority: heapless::Deque::new(),
            deferred: heapless::Vec::new(),
            cursor: 0,
        }
    }

    /// Ask for `short` to be polled no earlier than `now + delay`.
    pub fn request_sync(&mut self, short: ShortAddress, delay: Duration, now: Instant) {
        if delay == Duration::from_ticks(0) {
            self.push_priority(short);
            return;
        }
        let due = now + delay;
        if let Some(entry) = self.deferred.iter_mut().find(|(s, _)| *s == short) {
            // Keep the earlier of the two deadlines
            entry.1 = entry.1.min(due);
            return;
        }
        if self.deferred.push((short, due)).is_err() {
            dali_log!(debug, "Deferred poll list full, polling {} immediately", short.value());
            self.push_priority(short);
        }
    }

    fn push_priority(&mut self, short: ShortAddress) {
        if self.priority.iter().any(|s| *s == short) {
            return;
        }
        if self.priority.push_back(short).is_err() {
            dali_log!(warn, "Priority poll queue full, dropping {}", short.value());
        }
    }

    /// Pick the next device to poll.
    pub fn next_step(&mut self, now: Instant) -> PollStep {
        if let Some(short) = self.next_priority(now) {
            return PollStep::Priority(short);
        }
        self.next_round_robin()
    }

    /// Pop the next priority request, promoting matured deferred ones first.
    pub fn next_priority(&mut self, now: Instant) -> Option<ShortAddress> {
        let mut index = 0;
        while index < self.deferred.len() {
            if self.deferred[index].1 <= now {
                let (short, _) = self.deferred.swap_remove(index);
                self.push_priority(short);
            } else {
                index += 1;
            }
        }
        self.priority.pop_front()
    }

    /// Advance the round-robin cursor.
    pub fn next_round_robin(&mut self) -> PollStep {
        let short = ShortAddress::from_masked(self.cursor);
        let wrapped = self.cursor == SHORT_ADDRESS_COUNT - 1;
        self.cursor = (self.cursor + 1) % SHORT_ADDRESS_COUNT;
        PollStep::RoundRobin { short, wrapped }
    }

    /// Earliest deadline of a deferred request.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deferred.iter().map(|(_, due)| *due).min()
    }

    pub fn pending_priority(&self) -> usize {
        self.priority.len()
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(n: u8) -> ShortAddress {
        ShortAddress::new(n).unwrap()
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn test_round_robin_wraps_once_per_pass() {
        let mut scheduler = Scheduler::new();
        let mut wraps = 0;
        for expected in 0..128u32 {
            match scheduler.next_step(at(0)) {
                PollStep::RoundRobin { short: s, wrapped } => {
                    assert_eq!(u32::from(s.value()), expected % 64);
                    assert_eq!(wrapped, s.value() == 63);
                    wraps += u32::from(wrapped);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(wraps, 2);
    }

    #[test]
    fn test_priority_preempts_round_robin() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.next_step(at(0)).short(), short(0));

        scheduler.request_sync(short(40), Duration::from_ticks(0), at(0));
        scheduler.request_sync(short(40), Duration::from_ticks(0), at(0));
        assert_eq!(scheduler.pending_priority(), 1);

        assert_eq!(scheduler.next_step(at(0)), PollStep::Priority(short(40)));
        // Cursor did not move
        assert_eq!(scheduler.next_step(at(0)).short(), short(1));
    }

    #[test]
    fn test_deferred_matures() {
        let mut scheduler = Scheduler::new();
        scheduler.request_sync(short(9), Duration::from_millis(10), at(100));
        scheduler.request_sync(short(7), Duration::from_millis(5), at(100));

        assert!(matches!(scheduler.next_step(at(104)), PollStep::RoundRobin { .. }));
        assert_eq!(scheduler.next_step(at(105)), PollStep::Priority(short(7)));
        assert_eq!(scheduler.next_step(at(111)), PollStep::Priority(short(9)));
        assert_eq!(scheduler.pending_deferred(), 0);
    }

    #[test]
    fn test_deferred_keeps_earliest_deadline() {
        let mut scheduler = Scheduler::new();
        scheduler.request_sync(short(3), Duration::from_millis(50), at(0));
        scheduler.request_sync(short(3), Duration::from_millis(5), at(0));
        assert_eq!(scheduler.pending_deferred(), 1);
        assert_eq!(scheduler.next_step(at(5)), PollStep::Priority(short(3)));
    }

    #[test]
    fn test_next_deadline_and_priority_only() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.next_deadline(), None);
        scheduler.request_sync(short(2), Duration::from_millis(30), at(0));
        scheduler.request_sync(short(4), Duration::from_millis(20), at(0));
        assert_eq!(scheduler.next_deadline(), Some(at(20)));

        // Nothing due: the round-robin cursor must not move
        assert_eq!(scheduler.next_priority(at(10)), None);
        assert_eq!(scheduler.next_step(at(10)).short(), short(0));
        assert_eq!(scheduler.next_priority(at(20)), Some(short(4)));
    }

    #[test]
    fn test_full_deferred_list_falls_back_to_priority() {
        let mut scheduler = Scheduler::new();
        for n in 0..DEFERRED_CAPACITY as u8 {
            scheduler.request_sync(short(n), Duration::from_secs(1), at(0));
        }
        scheduler.request_sync(short(50), Duration::from_secs(1), at(0));
        assert_eq!(scheduler.next_step(at(0)), PollStep::Priority(short(50)));
    }
}
