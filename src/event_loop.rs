// src/event_loop.rs - Single-threaded key-indexed event loop
//
// Core features:
// - Caller-chosen keys mapped to pooled watcher slots (slab + free list)
// - Fired keys buffered into a pending queue, delivered in batches
// - Batch swapped out before delivery so callbacks can re-register freely
// - Cross-thread emit/signal/stop through a Handle (channel + atomics +
//   wake channel; no locks)

use crossbeam_channel::{Receiver, Sender};
use log::debug;
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::poller::{Interest, Poller, Waker};
use crate::timer::TimerQueue;
use crate::watcher::{Direction, Watcher, WatcherKind, WatcherToken};

/// State reachable from other threads. Everything here is touched only
/// with atomics or the wake write, so a signal handler can use it too.
///
/// Flag accesses are SeqCst: the wake-then-check protocol needs the
/// `polling` store in `run_step` and the flag loads in `emit`/`stop` to
/// agree on a single order, or an update could slip between the loop's
/// last re-check and the blocking wait.
struct Shared<K> {
    stopped: AtomicBool,
    /// True only while the loop thread is blocked inside the poll call.
    polling: AtomicBool,
    waker: Arc<Waker>,
    stop_key: Option<K>,
}

/// Cross-thread control surface for an [`EventLoop`].
///
/// Cheap to clone. A handle can only inject events and flip flags - it
/// never touches the loop's registries, so no locking is involved.
pub struct Handle<K> {
    injected: Sender<K>,
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        Self {
            injected: self.injected.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<K: PartialEq> Handle<K> {
    /// Inject a synthetic event. The reserved stop key, if one was
    /// configured, stops the loop instead of queuing.
    pub fn emit(&self, key: K) {
        if self.shared.stop_key.as_ref() == Some(&key) {
            self.shared.stopped.store(true, Ordering::SeqCst);
        } else {
            let _ = self.injected.send(key);
        }
        self.signal();
    }

    /// Interrupt a blocked wait without queuing anything. A no-op when
    /// the loop is not currently blocked.
    pub fn signal(&self) {
        if self.shared.polling.load(Ordering::SeqCst) {
            self.shared.waker.wake();
        }
    }

    /// Request loop termination. The batch currently being delivered, if
    /// any, still completes.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.signal();
    }
}

/// A single-threaded IO and timer event loop.
///
/// Callers register interest in file descriptors or timers under a
/// caller-chosen key; the loop hands back the keys of fired watchers as
/// a batched, ordered sequence. Watcher slots are pooled and recycled,
/// and registering an already-active key is an error until the key is
/// unwatched or its oneshot watcher fires.
///
/// All methods take `&mut self`: exactly one thread drives the loop.
/// Other threads interact through [`EventLoop::handle`].
pub struct EventLoop<K> {
    poller: Poller,
    /// Every slot ever created, armed or idle. Slots are never removed
    /// while the loop lives.
    watchers: Slab<Watcher<K>>,
    /// Key -> slot for each live registration.
    active: HashMap<K, usize>,
    /// Idle slots available for reuse.
    free: Vec<usize>,
    timers: TimerQueue,
    /// Keys fired since the last delivery, in firing order.
    pending: VecDeque<K>,
    injected: Receiver<K>,
    injected_tx: Sender<K>,
    shared: Arc<Shared<K>>,
}

impl<K: Clone + Eq + Hash> EventLoop<K> {
    /// Create a loop with no reserved stop key: every emitted key is
    /// delivered as an event and stopping goes through [`stop`].
    ///
    /// [`stop`]: EventLoop::stop
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Create a loop that treats `stop_key` as a stop request when
    /// emitted, mirroring [`stop`].
    ///
    /// [`stop`]: EventLoop::stop
    pub fn with_stop_key(stop_key: K) -> Result<Self> {
        Self::build(Some(stop_key))
    }

    fn build(stop_key: Option<K>) -> Result<Self> {
        let poller = Poller::new()?;
        let waker = poller.waker();
        let (injected_tx, injected) = crossbeam_channel::unbounded();

        Ok(Self {
            poller,
            watchers: Slab::with_capacity(16),
            active: HashMap::new(),
            free: Vec::new(),
            timers: TimerQueue::new(),
            pending: VecDeque::new(),
            injected,
            injected_tx,
            shared: Arc::new(Shared {
                stopped: AtomicBool::new(false),
                polling: AtomicBool::new(false),
                waker,
                stop_key,
            }),
        })
    }

    /// A clonable control surface usable from any thread.
    pub fn handle(&self) -> Handle<K> {
        Handle {
            injected: self.injected_tx.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Watch a raw file descriptor for readiness in one direction.
    ///
    /// With `oneshot`, the watcher disarms itself and releases the key
    /// after its first firing. Fails with [`Error::DuplicateKey`] if the
    /// key is already active, and with [`Error::Io`] if the poll
    /// primitive rejects the descriptor; neither leaves a partial
    /// registration behind.
    pub fn watch_fd(
        &mut self,
        key: K,
        fd: RawFd,
        direction: Direction,
        oneshot: bool,
    ) -> Result<()> {
        if self.active.contains_key(&key) {
            return Err(Error::DuplicateKey);
        }

        let slot = self.acquire_slot();
        let generation = self.watchers[slot].arm_io(key.clone(), fd, direction, oneshot);
        let token = WatcherToken { slot, generation };
        let interest = match direction {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };

        if let Err(e) = self.poller.register(fd, token.to_raw(), interest) {
            self.watchers[slot].retire();
            self.free.push(slot);
            return Err(e.into());
        }

        self.active.insert(key, slot);
        debug!("armed io watcher for fd {fd} (slot {slot}, generation {generation})");
        Ok(())
    }

    /// [`watch_fd`] for anything that exposes a raw descriptor.
    ///
    /// [`watch_fd`]: EventLoop::watch_fd
    pub fn watch_io<T: AsRawFd>(
        &mut self,
        key: K,
        io: &T,
        direction: Direction,
        oneshot: bool,
    ) -> Result<()> {
        self.watch_fd(key, io.as_raw_fd(), direction, oneshot)
    }

    /// Watch a timer firing once after `delay`, then every `interval`.
    ///
    /// A zero `interval` makes the timer oneshot. A zero `delay` fires on
    /// the next loop step.
    pub fn watch_timer(&mut self, key: K, delay: Duration, interval: Duration) -> Result<()> {
        if self.active.contains_key(&key) {
            return Err(Error::DuplicateKey);
        }

        let slot = self.acquire_slot();
        let generation = self.watchers[slot].arm_timer(key.clone(), interval);
        self.timers
            .push(Instant::now() + delay, WatcherToken { slot, generation });

        self.active.insert(key, slot);
        debug!("armed timer watcher (slot {slot}, generation {generation})");
        Ok(())
    }

    /// Cancel a registration. A no-op, not an error, when the key is not
    /// active. Safe to call from a delivery callback for another key -
    /// the batch in flight was already swapped out of the queue.
    pub fn unwatch(&mut self, key: &K) {
        let Some(slot) = self.active.remove(key) else {
            return;
        };
        self.release_slot(slot);
        debug!("released watcher (slot {slot})");
    }

    /// Run at most one poll cycle.
    ///
    /// Returns without polling when events are already queued. Otherwise
    /// blocks until at least one watcher fires or a wake signal arrives;
    /// with nothing armed at all the wait collapses to a single
    /// non-blocking sweep, so an idle loop never hangs on its own wake
    /// channel.
    pub fn run_step(&mut self) -> Result<()> {
        self.drain_injected();
        if !self.pending.is_empty() {
            return Ok(());
        }

        let timeout = if self.active.is_empty() {
            Some(Duration::ZERO)
        } else {
            self.timers.next_timeout(Instant::now())
        };

        // Wake-then-check: emits and stops that land after this store see
        // `polling` set and wake the wait; those that landed before are
        // picked up by the re-check below. Either way nothing sleeps
        // through an update.
        self.shared.polling.store(true, Ordering::SeqCst);
        self.drain_injected();
        if !self.pending.is_empty() || self.shared.stopped.load(Ordering::SeqCst) {
            self.shared.polling.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let polled = self.poller.poll(timeout);
        self.shared.polling.store(false, Ordering::SeqCst);
        let events = polled?;

        // Drain injections ahead of dispatch: an emit that interrupted
        // the wait is ordered before the readiness it raced with.
        self.drain_injected();
        for event in events {
            if event.readable || event.writable {
                self.fire_io(event.token);
            }
        }
        self.fire_due_timers();
        Ok(())
    }

    /// Remove and return the oldest queued key, running one poll cycle
    /// first if the queue is empty.
    ///
    /// `None` means the wait was interrupted (by [`signal`], or a wake
    /// with nothing to deliver) - not that the loop is drained forever.
    ///
    /// [`signal`]: EventLoop::signal
    pub fn next_event(&mut self) -> Result<Option<K>> {
        if self.pending.is_empty() {
            self.run_step()?;
        }
        Ok(self.pending.pop_front())
    }

    /// Run the loop until stopped, handing every fired key to `deliver`
    /// in firing order.
    ///
    /// Each iteration swaps the queue out before delivering, so a
    /// callback may watch, unwatch and emit freely: new events land in
    /// the fresh queue and are neither lost nor merged into the batch in
    /// flight. A stop request takes effect between batches; the current
    /// batch always completes.
    pub fn each_batch<F>(&mut self, mut deliver: F) -> Result<()>
    where
        F: FnMut(&mut Self, K),
    {
        self.shared.stopped.store(false, Ordering::SeqCst);
        while !self.shared.stopped.load(Ordering::SeqCst) {
            if self.pending.is_empty() {
                self.run_step()?;
            }
            let batch = std::mem::take(&mut self.pending);
            for key in batch {
                deliver(&mut *self, key);
            }
        }
        Ok(())
    }

    /// Inject a synthetic event from the loop thread. The reserved stop
    /// key, if configured, stops the loop instead of queuing.
    pub fn emit(&mut self, key: K) {
        if self.shared.stop_key.as_ref() == Some(&key) {
            self.shared.stopped.store(true, Ordering::SeqCst);
        } else {
            self.pending.push_back(key);
        }
        self.signal();
    }

    /// Interrupt a blocked [`run_step`] without queuing anything. A
    /// no-op when nobody is blocked.
    ///
    /// [`run_step`]: EventLoop::run_step
    pub fn signal(&self) {
        if self.shared.polling.load(Ordering::SeqCst) {
            self.shared.waker.wake();
        }
    }

    /// Request loop termination; delivery of the current batch completes
    /// first.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.signal();
    }

    fn acquire_slot(&mut self) -> usize {
        match self.free.pop() {
            Some(slot) => slot,
            None => self.watchers.insert(Watcher::new()),
        }
    }

    /// Disarm a slot and return it to the free list. Timer heap entries
    /// are left behind; they fail generation validation when they pop.
    fn release_slot(&mut self, slot: usize) {
        if let WatcherKind::Io { fd, .. } = *self.watchers[slot].kind() {
            if let Err(e) = self.poller.deregister(fd) {
                debug!("failed to deregister fd {fd} (slot {slot}): {e:?}");
            }
        }
        self.watchers[slot].retire();
        self.free.push(slot);
    }

    fn drain_injected(&mut self) {
        while let Ok(key) = self.injected.try_recv() {
            self.pending.push_back(key);
        }
    }

    fn fire_io(&mut self, raw_token: usize) {
        let token = WatcherToken::from_raw(raw_token);
        let (key, oneshot) = match self.watchers.get(token.slot) {
            Some(watcher) if token.matches(watcher.generation()) => {
                match watcher.fired_key() {
                    Some(key) => (key, watcher.is_oneshot()),
                    // Slot released since the event was raised
                    None => return,
                }
            }
            _ => {
                debug!(
                    "dropping stale event for slot {} (generation {})",
                    token.slot, token.generation
                );
                return;
            }
        };

        self.pending.push_back(key.clone());
        if oneshot {
            self.active.remove(&key);
            self.release_slot(token.slot);
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.timers.pop_due(now) {
            let token = entry.token;
            let (key, interval) = match self.watchers.get(token.slot) {
                Some(watcher) if watcher.generation() == token.generation => {
                    match (watcher.fired_key(), watcher.kind()) {
                        (Some(key), WatcherKind::Timer { interval }) => (key, *interval),
                        // Canceled since the entry was queued
                        _ => continue,
                    }
                }
                _ => continue,
            };

            self.pending.push_back(key.clone());
            if interval.is_zero() {
                self.active.remove(&key);
                self.release_slot(token.slot);
            } else {
                // Repeat relative to the previous deadline so the cadence
                // does not drift under dispatch latency.
                self.timers.push(entry.deadline + interval, token);
            }
        }
    }

    #[cfg(test)]
    fn is_active(&self, key: &K) -> bool {
        self.active.contains_key(key)
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
