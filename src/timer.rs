// src/timer.rs - Deadline queue for timer watchers

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::watcher::WatcherToken;

/// One scheduled expiry: a deadline plus the token of the watcher slot
/// that owns it.
///
/// Ordering is reversed so a `BinaryHeap` of entries behaves as a
/// min-heap and pops the earliest deadline first.
pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) token: WatcherToken,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending expiries.
///
/// Cancellation is lazy: unwatching a timer leaves its entry in the heap,
/// and the stale token fails generation validation when the entry finally
/// pops. Keeps the hot path free of heap surgery.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub(crate) fn push(&mut self, deadline: Instant, token: WatcherToken) {
        self.heap.push(TimerEntry { deadline, token });
    }

    /// Time until the earliest deadline, saturating to zero for overdue
    /// entries. `None` when no timers are scheduled.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    /// Pop the earliest entry if its deadline has passed.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        if self.heap.peek()?.deadline <= now {
            self.heap.pop()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(slot: usize) -> WatcherToken {
        WatcherToken {
            slot,
            generation: 1,
        }
    }

    #[test]
    fn test_pops_earliest_deadline_first() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.push(now + Duration::from_millis(30), token(1));
        queue.push(now + Duration::from_millis(10), token(2));
        queue.push(now + Duration::from_millis(20), token(3));

        let later = now + Duration::from_millis(50);
        assert_eq!(queue.pop_due(later).map(|e| e.token.slot), Some(2));
        assert_eq!(queue.pop_due(later).map(|e| e.token.slot), Some(3));
        assert_eq!(queue.pop_due(later).map(|e| e.token.slot), Some(1));
        assert!(queue.pop_due(later).is_none());
    }

    #[test]
    fn test_not_due_entries_stay_queued() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.push(now + Duration::from_secs(10), token(1));

        assert!(queue.pop_due(now).is_none());
        let timeout = queue.next_timeout(now).expect("timer scheduled");
        assert!(timeout <= Duration::from_secs(10));
        assert!(timeout > Duration::from_secs(9));
    }

    #[test]
    fn test_overdue_timeout_saturates_to_zero() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.push(now, token(1));

        let later = now + Duration::from_millis(5);
        assert_eq!(queue.next_timeout(later), Some(Duration::ZERO));
    }

    #[test]
    fn test_empty_queue_has_no_timeout() {
        let queue = TimerQueue::new();
        assert_eq!(queue.next_timeout(Instant::now()), None);
    }
}
