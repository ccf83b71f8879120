//! **keyloop** is a single-threaded IO and timer event loop: callers register
//! interest in file descriptors or timers under a caller-chosen key, and the
//! loop delivers the keys of fired watchers back as a batched, ordered
//! sequence. It is the event-dispatch core for servers and embedders that
//! want readiness plumbing without an async runtime.
//!
//! # Architecture
//!
//! The loop runs a single-thread reactor over native IO multiplexing:
//! - **Linux**: epoll (edge-triggered)
//! - **macOS/BSD**: kqueue (EV_CLEAR edge-triggered)
//!
//! ## Key Components
//!
//! - [`EventLoop`]: registries, watcher pool and the batched pending queue
//! - [`Handle`]: cross-thread emit/signal/stop (channel + atomics + wake
//!   channel; no locks, safe from signal handlers)
//! - `Poller`: cross-platform single-iteration readiness wait with an
//!   internal wake channel (eventfd / self-pipe)
//! - Watcher slots: pooled and recycled; a generation counter drops events
//!   that arrive for a previous occupant of a reused slot
//!
//! ## Semantics
//!
//! | Aspect | Behavior |
//! |--------|----------|
//! | Key uniqueness | Registering an active key fails; unwatch first |
//! | Oneshot watchers | Auto-disarm on first firing, slot recycled |
//! | Persistent watchers | Fire per readiness edge until unwatched |
//! | Timers | `interval == 0` means oneshot, else repeating |
//! | Batching | Queue swapped out before delivery; callbacks may re-register |
//! | Stop | Takes effect between batches, never mid-batch |
//!
//! # Example
//!
//! ```rust,ignore
//! let mut lp = EventLoop::new()?;
//! lp.watch_io("conn", &stream, Direction::Read, false)?;
//! lp.watch_timer("tick", Duration::from_millis(100), Duration::from_millis(100))?;
//!
//! lp.each_batch(|lp, key| match key {
//!     "conn" => { /* stream is readable; drain it */ }
//!     "tick" => { /* periodic housekeeping */ }
//!     _ => lp.stop(),
//! })?;
//! ```
//!
//! Exactly one thread drives the loop; other threads interact through
//! [`EventLoop::handle`], whose `emit` and `stop` interrupt a blocked wait
//! promptly instead of waiting for the next readiness or timer.

mod error;
mod event_loop;
mod poller;
mod timer;
mod watcher;

pub use error::{Error, Result};
pub use event_loop::{EventLoop, Handle};
pub use watcher::Direction;
