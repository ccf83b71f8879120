// src/watcher.rs - Reusable watcher slots and token encoding

use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness direction of an IO watcher.
///
/// A watcher observes exactly one direction; register a second key to
/// observe the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Token carried through the poll primitive and the timer queue - slot
/// index plus a generation counter.
///
/// Slots are recycled, so an event raised for a previous occupant can
/// arrive after the slot was re-armed for a different key. The generation
/// lets such stale events be detected and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WatcherToken {
    pub slot: usize,
    pub generation: u32,
}

impl WatcherToken {
    /// Layout: [generation: 32 bits][slot: 32 bits]
    #[cfg(target_pointer_width = "64")]
    pub(crate) fn to_raw(self) -> usize {
        ((self.generation as usize) << 32) | (self.slot & 0xFFFF_FFFF)
    }

    #[cfg(target_pointer_width = "64")]
    pub(crate) fn from_raw(raw: usize) -> Self {
        Self {
            slot: raw & 0xFFFF_FFFF,
            generation: (raw >> 32) as u32,
        }
    }

    /// Fallback for 32-bit targets - no room for the generation, stale
    /// events are only caught when the slot is idle or re-typed.
    #[cfg(target_pointer_width = "32")]
    pub(crate) fn to_raw(self) -> usize {
        self.slot
    }

    #[cfg(target_pointer_width = "32")]
    pub(crate) fn from_raw(raw: usize) -> Self {
        Self {
            slot: raw,
            generation: 0,
        }
    }

    /// Whether a raw-decoded token still addresses the current occupant
    /// of its slot. On 32-bit targets the raw form has no room for the
    /// generation, so stale events are only caught by the idle-slot
    /// check.
    pub(crate) fn matches(self, generation: u32) -> bool {
        if cfg!(target_pointer_width = "64") {
            self.generation == generation
        } else {
            true
        }
    }
}

/// What a slot is currently armed as.
pub(crate) enum WatcherKind {
    /// Retired: fields cleared, slot retained for reuse.
    Idle,
    Io {
        fd: RawFd,
        direction: Direction,
        oneshot: bool,
    },
    /// The deadline lives in the timer queue, not here. A zero interval
    /// means oneshot.
    Timer { interval: Duration },
}

/// One pooled watcher slot.
///
/// The struct itself is never deallocated while the loop lives; arming
/// rebinds it to a key and bumps the generation, retiring clears it back
/// to [`WatcherKind::Idle`].
pub(crate) struct Watcher<K> {
    key: Option<K>,
    generation: u32,
    kind: WatcherKind,
}

impl<K: Clone> Watcher<K> {
    pub(crate) fn new() -> Self {
        Self {
            key: None,
            generation: 0,
            kind: WatcherKind::Idle,
        }
    }

    /// Bind the slot to an IO interest. Returns the new generation.
    pub(crate) fn arm_io(&mut self, key: K, fd: RawFd, direction: Direction, oneshot: bool) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.key = Some(key);
        self.kind = WatcherKind::Io {
            fd,
            direction,
            oneshot,
        };
        self.generation
    }

    /// Bind the slot to a timer. Returns the new generation.
    pub(crate) fn arm_timer(&mut self, key: K, interval: Duration) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.key = Some(key);
        self.kind = WatcherKind::Timer { interval };
        self.generation
    }

    /// Clear back to idle. The generation is left as is; the next arm
    /// bumps it, which is what invalidates events still in flight.
    pub(crate) fn retire(&mut self) {
        self.key = None;
        self.kind = WatcherKind::Idle;
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn kind(&self) -> &WatcherKind {
        &self.kind
    }

    /// The key to deliver when this watcher fires. `None` once retired,
    /// which is how a stale event for a freshly released slot is dropped.
    pub(crate) fn fired_key(&self) -> Option<K> {
        self.key.clone()
    }

    pub(crate) fn is_oneshot(&self) -> bool {
        match self.kind {
            WatcherKind::Idle => false,
            WatcherKind::Io { oneshot, .. } => oneshot,
            WatcherKind::Timer { interval } => interval.is_zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_token_roundtrip() {
        let token = WatcherToken {
            slot: 42,
            generation: 7,
        };
        assert_eq!(WatcherToken::from_raw(token.to_raw()), token);

        let max = WatcherToken {
            slot: 0xFFFF_FFFF,
            generation: u32::MAX - 1,
        };
        assert_eq!(WatcherToken::from_raw(max.to_raw()), max);
    }

    #[test]
    fn test_arm_bumps_generation() {
        let mut watcher: Watcher<&str> = Watcher::new();
        let first = watcher.arm_io("a", 0, Direction::Read, false);
        watcher.retire();
        let second = watcher.arm_timer("b", Duration::ZERO);
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn test_retire_clears_key_but_keeps_generation() {
        let mut watcher: Watcher<String> = Watcher::new();
        let generation = watcher.arm_timer("t".to_string(), Duration::from_secs(1));
        assert_eq!(watcher.fired_key().as_deref(), Some("t"));
        assert!(!watcher.is_oneshot());

        watcher.retire();
        assert!(watcher.fired_key().is_none());
        assert_eq!(watcher.generation(), generation);
        assert!(matches!(watcher.kind(), WatcherKind::Idle));
    }

    #[test]
    fn test_oneshot_derivation() {
        let mut watcher: Watcher<u32> = Watcher::new();
        watcher.arm_timer(1, Duration::ZERO);
        assert!(watcher.is_oneshot());

        watcher.arm_timer(1, Duration::from_millis(10));
        assert!(!watcher.is_oneshot());

        watcher.arm_io(2, 0, Direction::Write, true);
        assert!(watcher.is_oneshot());
    }
}
