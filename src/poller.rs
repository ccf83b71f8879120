// src/poller.rs - Cross-platform IO multiplexer with a wake channel
//
// Provides a unified single-iteration readiness wait:
// - Linux: epoll (edge-triggered)
// - macOS/BSD: kqueue (EV_CLEAR edge-triggered)
//
// Design principles:
// - Edge-triggered mode: one notification per readiness edge
// - EINTR auto-retry
// - A wake channel (eventfd / self-pipe) is registered under a reserved
//   token and drained internally, so a blocked wait can be interrupted
//   from another thread (or a signal handler) without ever surfacing an
//   event to the caller

use std::os::unix::io::RawFd;

/// Token reserved for the internal wake channel.
///
/// Watcher tokens are slab-indexed and cannot reach this value.
const WAKE_TOKEN: usize = usize::MAX;

/// Event interest flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub(crate) const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub(crate) const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
}

/// IO readiness event.
///
/// Error and hangup conditions are folded into `readable`, so EOF and
/// failed descriptors still deliver to whoever watches them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Handle used to interrupt a blocked wait from another thread.
///
/// `wake` is a single `write(2)` on the wake channel, which makes it safe
/// to call from any thread and from signal-handler context. Waking a loop
/// that is not blocked is harmless: the next wait drains the channel and
/// returns without surfacing anything.
pub(crate) struct Waker(RawFd);

impl Waker {
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        // SAFETY: self.0 is the write side of the wake channel, owned by
        // this Waker for its whole life; buf is a valid 8-byte source.
        unsafe {
            libc::write(self.0, &buf as *const u64 as *const _, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        // SAFETY: self.0 is owned exclusively by this Waker and closed
        // exactly once.
        unsafe {
            libc::close(self.0);
        }
    }
}

// ============================================================================
// Platform-specific implementations
// ============================================================================

#[cfg(target_os = "linux")]
mod linux {
    use super::{Event, Interest, Waker, WAKE_TOKEN};

    use libc::{
        epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN,
        EPOLLOUT, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
    };
    use std::io;
    use std::os::unix::io::RawFd;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) struct Poller {
        epfd: RawFd,
        // The eventfd is owned by the waker; the last Arc clone closes it.
        waker: Arc<Waker>,
    }

    impl Poller {
        pub(crate) fn new() -> io::Result<Self> {
            // SAFETY: epoll_create1 takes no pointers; the result is
            // checked immediately.
            let epfd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: eventfd takes no pointers; the result is checked
            // immediately. Non-blocking so draining never stalls the loop.
            let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if eventfd < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: epfd was just created and is not shared yet.
                unsafe { libc::close(epfd) };
                return Err(err);
            }

            let mut event = epoll_event {
                events: EPOLLIN as u32,
                u64: WAKE_TOKEN as u64,
            };
            // SAFETY: epfd and eventfd are valid descriptors created above;
            // event is a properly initialized epoll_event on the stack.
            let ret = unsafe { epoll_ctl(epfd, EPOLL_CTL_ADD, eventfd, &mut event) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: both descriptors were just created and are not
                // shared yet.
                unsafe {
                    libc::close(eventfd);
                    libc::close(epfd);
                }
                return Err(err);
            }

            Ok(Poller {
                epfd,
                waker: Arc::new(Waker(eventfd)),
            })
        }

        pub(crate) fn waker(&self) -> Arc<Waker> {
            self.waker.clone()
        }

        pub(crate) fn register(
            &mut self,
            fd: RawFd,
            token: usize,
            interest: Interest,
        ) -> io::Result<()> {
            let mut event = epoll_event {
                events: interest_to_epoll(interest) | EPOLLET as u32,
                u64: token as u64,
            };
            // SAFETY: self.epfd is valid (created in new(), owned by self);
            // fd validity is the caller's contract and errors (EBADF)
            // propagate; event is properly initialized on the stack.
            let ret = unsafe { epoll_ctl(self.epfd, EPOLL_CTL_ADD, fd, &mut event) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            // SAFETY: self.epfd is valid; a null event pointer is allowed
            // for EPOLL_CTL_DEL since kernel 2.6.9.
            let ret = unsafe { epoll_ctl(self.epfd, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timeout_ms = timeout.map(duration_to_ms).unwrap_or(-1);

            // SAFETY: epoll_event is a POD type; all-zero bytes are a valid
            // (empty) event, and the array is only read up to the count
            // returned by epoll_wait.
            let mut events: [epoll_event; 256] = unsafe { std::mem::zeroed() };

            loop {
                // SAFETY: self.epfd is valid; events points to writable
                // memory for 256 entries; timeout_ms is -1 or >= 0.
                let ret = unsafe {
                    epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
                };

                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue; // EINTR - retry
                    }
                    return Err(err);
                }

                let mut result = Vec::with_capacity(ret as usize);
                for ev in &events[..ret as usize] {
                    let token = ev.u64 as usize;
                    if token == WAKE_TOKEN {
                        self.drain_wake();
                        continue;
                    }
                    result.push(Event {
                        token,
                        readable: ev.events & (EPOLLIN | EPOLLERR | EPOLLHUP) as u32 != 0,
                        writable: ev.events & EPOLLOUT as u32 != 0,
                    });
                }
                return Ok(result);
            }
        }

        fn drain_wake(&self) {
            let mut buf = 0u64;
            // SAFETY: the waker fd is valid for the poller's lifetime; one
            // 8-byte read resets the eventfd counter. The fd is
            // non-blocking, so a racing drain cannot stall.
            unsafe {
                libc::read(self.waker.0, &mut buf as *mut u64 as *mut _, 8);
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: self.epfd is owned exclusively by this poller and
            // closed exactly once. The eventfd is closed by the Waker.
            unsafe {
                libc::close(self.epfd);
            }
        }
    }

    fn interest_to_epoll(interest: Interest) -> u32 {
        let mut events = 0;
        if interest.readable {
            events |= EPOLLIN as u32;
        }
        if interest.writable {
            events |= EPOLLOUT as u32;
        }
        events
    }

    fn duration_to_ms(d: Duration) -> i32 {
        // Round up so a wait never expires before the requested deadline.
        let ms = d.as_millis().min(i32::MAX as u128) as i32;
        if Duration::from_millis(ms as u64) < d {
            ms.saturating_add(1)
        } else {
            ms
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
mod bsd {
    use super::{Event, Interest, Waker, WAKE_TOKEN};

    use libc::{EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR};
    use std::collections::HashMap;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) struct Poller {
        kq: RawFd,
        pipe_read: RawFd,
        // Holds the pipe write side; the last Arc clone closes it.
        waker: Arc<Waker>,
    }

    impl Poller {
        pub(crate) fn new() -> io::Result<Self> {
            // SAFETY: kqueue takes no pointers; the result is checked
            // immediately.
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut fds = [0 as RawFd; 2];
            // SAFETY: fds points to space for the two pipe descriptors.
            let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: kq was just created and is not shared yet.
                unsafe { libc::close(kq) };
                return Err(err);
            }
            let (pipe_read, pipe_write) = (fds[0], fds[1]);
            for fd in [pipe_read, pipe_write] {
                set_nonblocking_cloexec(fd);
            }

            let change = make_kevent(
                pipe_read as usize,
                EVFILT_READ,
                EV_ADD | EV_ENABLE | EV_CLEAR,
                WAKE_TOKEN,
            );
            // SAFETY: kq is valid; change points to one initialized kevent;
            // the event list is empty so nothing is written back.
            let ret = unsafe {
                libc::kevent(kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null())
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: all three descriptors were just created and are
                // not shared yet.
                unsafe {
                    libc::close(pipe_read);
                    libc::close(pipe_write);
                    libc::close(kq);
                }
                return Err(err);
            }

            Ok(Poller {
                kq,
                pipe_read,
                waker: Arc::new(Waker(pipe_write)),
            })
        }

        pub(crate) fn waker(&self) -> Arc<Waker> {
            self.waker.clone()
        }

        pub(crate) fn register(
            &mut self,
            fd: RawFd,
            token: usize,
            interest: Interest,
        ) -> io::Result<()> {
            let filter = if interest.readable {
                EVFILT_READ
            } else {
                EVFILT_WRITE
            };
            let change = make_kevent(fd as usize, filter, EV_ADD | EV_ENABLE | EV_CLEAR, token);
            // SAFETY: self.kq is valid; change points to one initialized
            // kevent; fd validity is the caller's contract and errors
            // (EBADF) propagate.
            let ret = unsafe {
                libc::kevent(self.kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null())
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            let changes = [
                make_kevent(fd as usize, EVFILT_READ, EV_DELETE, 0),
                make_kevent(fd as usize, EVFILT_WRITE, EV_DELETE, 0),
            ];
            // Only one of the two filters is registered per fd; EV_DELETE
            // on the missing one is expected to fail and is ignored.
            // SAFETY: self.kq is valid; changes points to two initialized
            // kevents; the event list is empty.
            unsafe {
                libc::kevent(self.kq, changes.as_ptr(), 2, std::ptr::null_mut(), 0, std::ptr::null());
            }
            Ok(())
        }

        pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timespec = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as _,
                tv_nsec: d.subsec_nanos() as _,
            });
            let timeout_ptr = timespec
                .as_ref()
                .map(|t| t as *const _)
                .unwrap_or(std::ptr::null());

            // SAFETY: kevent is a POD type; all-zero bytes are a valid
            // (empty) event, and the array is only read up to the count
            // returned by kevent().
            let mut events: [libc::kevent; 256] = unsafe { std::mem::zeroed() };

            loop {
                // SAFETY: self.kq is valid; the change list is empty;
                // events points to writable memory for 256 entries;
                // timeout_ptr is null or points to a valid timespec.
                let ret = unsafe {
                    libc::kevent(
                        self.kq,
                        std::ptr::null(),
                        0,
                        events.as_mut_ptr(),
                        events.len() as i32,
                        timeout_ptr,
                    )
                };

                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue; // EINTR - retry
                    }
                    return Err(err);
                }

                // Read and write filters arrive as separate kevents;
                // aggregate them by token.
                let mut event_map: HashMap<usize, Event> = HashMap::new();
                for ev in &events[..ret as usize] {
                    let token = ev.udata as usize;
                    if token == WAKE_TOKEN {
                        self.drain_wake();
                        continue;
                    }

                    let entry = event_map.entry(token).or_insert(Event {
                        token,
                        readable: false,
                        writable: false,
                    });
                    match ev.filter {
                        EVFILT_READ => entry.readable = true,
                        EVFILT_WRITE => entry.writable = true,
                        _ => {}
                    }
                    if ev.flags & (EV_ERROR | EV_EOF) != 0 {
                        entry.readable = true;
                    }
                }
                return Ok(event_map.into_values().collect());
            }
        }

        fn drain_wake(&self) {
            let mut buf = [0u8; 64];
            loop {
                // SAFETY: pipe_read is valid for the poller's lifetime and
                // non-blocking; buf is a valid 64-byte destination.
                let n = unsafe {
                    libc::read(self.pipe_read, buf.as_mut_ptr() as *mut _, buf.len())
                };
                if n <= 0 {
                    return;
                }
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: kq and pipe_read are owned exclusively by this poller
            // and closed exactly once. The pipe write side is closed by the
            // Waker.
            unsafe {
                libc::close(self.pipe_read);
                libc::close(self.kq);
            }
        }
    }

    /// Field-by-field assignment keeps this portable across BSDs whose
    /// kevent structs differ in padding and extension fields.
    fn make_kevent(ident: usize, filter: i16, flags: u16, udata: usize) -> libc::kevent {
        // SAFETY: kevent is a POD type; all-zero bytes are a valid value
        // and every field the kernel reads is assigned below.
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = ident as _;
        ev.filter = filter as _;
        ev.flags = flags as _;
        ev.udata = udata as *mut _;
        ev
    }

    fn set_nonblocking_cloexec(fd: RawFd) {
        // SAFETY: fd was just created by pipe() and is valid; fcntl with
        // F_GETFL/F_SETFL/F_SETFD takes no pointers.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
}

// ============================================================================
// Re-export platform-specific implementation
// ============================================================================

#[cfg(target_os = "linux")]
pub(crate) use linux::Poller;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
pub(crate) use bsd::Poller;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::{Duration, Instant};

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let (server, _) = listener.accept().expect("Failed to accept");
        client.set_nonblocking(true).expect("Failed to set nonblocking");
        server.set_nonblocking(true).expect("Failed to set nonblocking");
        (client, server)
    }

    #[test]
    fn test_poller_basic() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let (client, mut server) = tcp_pair();

        // Register client for readable, server for writable
        poller
            .register(client.as_raw_fd(), 1, Interest::READABLE)
            .expect("Failed to register");
        poller
            .register(server.as_raw_fd(), 2, Interest::WRITABLE)
            .expect("Failed to register");

        // Server should be immediately writable
        let events = poller
            .poll(Some(Duration::from_millis(100)))
            .expect("Failed to poll");
        assert!(events.iter().any(|e| e.token == 2 && e.writable));

        // Write some data from server
        server.write_all(b"hello").expect("Failed to write");

        // Client should become readable
        let events = poller
            .poll(Some(Duration::from_millis(100)))
            .expect("Failed to poll");
        assert!(events.iter().any(|e| e.token == 1 && e.readable));

        poller.deregister(client.as_raw_fd()).expect("Failed to deregister");
        poller.deregister(server.as_raw_fd()).expect("Failed to deregister");
    }

    #[test]
    fn test_deregister_no_events() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let (client, mut server) = tcp_pair();

        poller
            .register(client.as_raw_fd(), 1, Interest::READABLE)
            .expect("Failed to register");
        poller.deregister(client.as_raw_fd()).expect("Failed to deregister");

        server.write_all(b"hello").expect("Failed to write");

        // After deregister, no events should be reported for this fd
        let events = poller
            .poll(Some(Duration::from_millis(50)))
            .expect("Failed to poll");
        assert!(!events.iter().any(|e| e.token == 1));
    }

    #[test]
    fn test_register_bad_fd_fails() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let err = poller
            .register(-1, 1, Interest::READABLE)
            .expect_err("registering an invalid fd must fail");
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_wake_interrupts_blocking_poll() {
        let mut poller = Poller::new().expect("Failed to create poller");
        // Keep one registration armed so the wait genuinely blocks
        let (client, _server) = tcp_pair();
        poller
            .register(client.as_raw_fd(), 1, Interest::READABLE)
            .expect("Failed to register");

        let waker = poller.waker();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let t0 = Instant::now();
        let events = poller.poll(Some(Duration::from_secs(5))).expect("Failed to poll");
        let elapsed = t0.elapsed();

        // The wake is drained internally and never surfaces
        assert!(events.is_empty());
        assert!(elapsed < Duration::from_secs(1), "poll was not interrupted: {elapsed:?}");
        t.join().expect("wake thread panicked");
    }

    #[test]
    fn test_wake_before_poll_is_sticky() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let (client, _server) = tcp_pair();
        poller
            .register(client.as_raw_fd(), 1, Interest::READABLE)
            .expect("Failed to register");

        // Wake while nobody is blocked; the next poll must return at once
        poller.waker().wake();

        let t0 = Instant::now();
        let events = poller.poll(Some(Duration::from_secs(5))).expect("Failed to poll");
        assert!(events.is_empty());
        assert!(t0.elapsed() < Duration::from_secs(1));
    }
}
