//! The epoll-backed reactor: a [`crate::scheduler::Scheduler`]
//! specialized to resume fibers and callbacks when file descriptors
//! become ready.
//!
//! Grounded on sylar's `IOManager` (`iomanager.h`/`iomanager.cpp`) for
//! the FdContext/EventContext bookkeeping and the idle-loop epoll
//! drain, and on the teacher's `coio` module (`coio.rs`) for the
//! naming register around "wait for readiness, then resume" — though
//! the teacher delegates all of this to Tarantool's own C event loop
//! via FFI, whereas this module owns the epoll descriptor itself, the
//! way sylar's from-scratch implementation does.
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber};
use crate::scheduler::{ANY_THREAD, Reactor, Scheduler, SchedulableWork};
use crate::sync::{Latch, RwLatch};

bitflags! {
    /// Readiness bits this reactor understands. Matches the subset of
    /// `epoll` event bits sylar's `IOManager::Event` exposes
    /// (`EPOLLIN`/`EPOLLOUT`); error/hangup bits are folded into both
    /// at delivery time (spec.md §4.3, idle routine step 3).
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

enum Continuation {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

#[derive(Default)]
struct EventContext {
    scheduler: Option<Arc<Scheduler>>,
    continuation: Option<Continuation>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.continuation.is_none()
    }

    fn take(&mut self) -> Option<(Arc<Scheduler>, Continuation)> {
        let continuation = self.continuation.take()?;
        let scheduler = self.scheduler.take()?;
        Some((scheduler, continuation))
    }
}

struct FdState {
    registered: Event,
    read: EventContext,
    write: EventContext,
}

struct FdContext {
    fd: RawFd,
    state: Latch<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            state: Latch::new(FdState {
                registered: Event::empty(),
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }

    fn event_ctx_mut(state: &mut FdState, event: Event) -> &mut EventContext {
        if event.contains(Event::READ) { &mut state.read } else { &mut state.write }
    }
}

fn dispatch(scheduler: &Arc<Scheduler>, continuation: Continuation) {
    match continuation {
        Continuation::Fiber(f) => scheduler.schedule(SchedulableWork::from(f), ANY_THREAD),
        Continuation::Callback(cb) => scheduler.schedule(SchedulableWork::from(cb), ANY_THREAD),
    }
}

const PREALLOC_FD_SLOTS: usize = 32;
const EPOLL_EVENT_BATCH: usize = 64;
const IDLE_TIMEOUT_MS: i32 = 5000;

/// The epoll-based reactor. Wraps a [`Scheduler`] the way sylar's
/// `IOManager` extends `Scheduler` by C++ inheritance — here via plain
/// composition, installing itself as that scheduler's [`Reactor`]
/// strategy (see [`crate::scheduler`]'s module docs).
pub struct IOManager {
    scheduler: Arc<Scheduler>,
    epoll_fd: RawFd,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
    fd_contexts: RwLatch<Vec<Arc<FdContext>>>,
    pending_event_count: AtomicUsize,
}

struct IOManagerReactor {
    inner: Weak<IOManager>,
}

impl Reactor for IOManagerReactor {
    fn tickle(&self, scheduler: &Scheduler) {
        let io = match self.inner.upgrade() {
            Some(io) => io,
            None => return,
        };
        if scheduler.idle_count() > 0 {
            let byte = [1u8];
            // Safety: `wakeup_write` stays open for `io`'s lifetime; a
            // one-byte write to a pipe never partially completes.
            unsafe { libc::write(io.wakeup_write, byte.as_ptr() as *const c_void, 1) };
        }
    }

    fn idle(&self, scheduler: &Scheduler) {
        if let Some(io) = self.inner.upgrade() {
            io.idle_loop(scheduler);
        }
    }

    fn stopping_extra(&self) -> bool {
        match self.inner.upgrade() {
            Some(io) => io.pending_event_count.load(Ordering::SeqCst) == 0,
            None => true,
        }
    }
}

impl IOManager {
    /// Builds and starts an IOManager-backed scheduler (spec.md §4.3,
    /// "Initialization").
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<IOManager> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            crate::error::fatal_invariant("epoll_create1 failed");
        }

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            crate::error::fatal_invariant("pipe2 failed");
        }
        let (wakeup_read, wakeup_write) = (pipe_fds[0], pipe_fds[1]);

        let mut initial = Vec::with_capacity(PREALLOC_FD_SLOTS);
        for i in 0..PREALLOC_FD_SLOTS {
            initial.push(Arc::new(FdContext::new(i as RawFd)));
        }

        let name = name.into();
        let manager = Arc::new_cyclic(|weak| {
            let reactor = Box::new(IOManagerReactor { inner: weak.clone() });
            IOManager {
                scheduler: Scheduler::with_reactor(threads, use_caller, name, reactor),
                epoll_fd,
                wakeup_read,
                wakeup_write,
                fd_contexts: RwLatch::new(initial),
                pending_event_count: AtomicUsize::new(0),
            }
        });

        let mut wakeup_event = libc::epoll_event {
            events: libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            u64: 0,
        };
        if unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wakeup_read, &mut wakeup_event)
        } != 0
        {
            crate::error::fatal_invariant("epoll_ctl failed registering wakeup pipe");
        }

        manager.scheduler.start();
        manager
    }

    pub fn run_on_caller(self: &Arc<Self>) {
        self.scheduler.run_on_caller();
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_event_count.load(Ordering::SeqCst)
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let read = self.fd_contexts.read();
            if (fd as usize) < read.len() {
                return read[fd as usize].clone();
            }
        }
        let mut write = self.fd_contexts.write();
        if (fd as usize) >= write.len() {
            let new_len = ((fd as f64) * 1.5).ceil() as usize + 1;
            for i in write.len()..new_len {
                write.push(Arc::new(FdContext::new(i as RawFd)));
            }
        }
        write[fd as usize].clone()
    }

    /// Registers interest in `event` for `fd`, resuming either `cb` (if
    /// given) or the calling fiber when it becomes ready. Returns an
    /// error if the underlying `epoll_ctl` call fails; aborts if
    /// `event` is already registered for `fd` (spec.md §4.3).
    pub fn add_event(
        self: &Arc<Self>,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        let ctx = self.fd_context(fd);
        let mut state = ctx.state.lock();

        if state.registered.contains(event) {
            crate::error::fatal_invariant(&format!("add_event: fd {fd} already has event {event:?} registered"));
        }

        let op = if state.registered.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let new_mask = state.registered | event;
        let mut epoll_event = libc::epoll_event {
            events: new_mask.bits() | libc::EPOLLET as u32,
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut epoll_event) } != 0 {
            return Err(Error::Os(std::io::Error::last_os_error()));
        }

        state.registered = new_mask;
        self.pending_event_count.fetch_add(1, Ordering::SeqCst);

        let current_scheduler = Scheduler::get_this().unwrap_or_else(|| self.scheduler.clone());
        let continuation = match cb {
            Some(cb) => Continuation::Callback(cb),
            None => Continuation::Fiber(Fiber::get_this()),
        };
        let event_ctx = FdContext::event_ctx_mut(&mut state, event);
        if !event_ctx.is_empty() {
            crate::error::fatal_invariant("add_event: EventContext already populated");
        }
        event_ctx.scheduler = Some(current_scheduler);
        event_ctx.continuation = Some(continuation);

        Ok(())
    }

    /// Deregisters `event` for `fd` without triggering its
    /// continuation. Returns `false` if `fd` is out of range or the
    /// event was not registered (spec.md §4.3).
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.rewire(fd, event, false)
    }

    /// Deregisters `event` for `fd` and triggers its continuation
    /// exactly once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.rewire(fd, event, true)
    }

    fn rewire(&self, fd: RawFd, event: Event, trigger: bool) -> bool {
        if (fd as usize) >= self.fd_contexts.read().len() {
            return false;
        }
        let ctx = self.fd_context(fd);
        let mut state = ctx.state.lock();
        if !state.registered.contains(event) {
            return false;
        }

        let residual = state.registered - event;
        self.rewire_kernel(ctx.fd, Arc::as_ptr(&ctx) as u64, residual);
        state.registered = residual;
        self.pending_event_count.fetch_sub(1, Ordering::SeqCst);

        let event_ctx = FdContext::event_ctx_mut(&mut state, event);
        let fired = event_ctx.take();
        drop(state);

        if trigger {
            if let Some((scheduler, continuation)) = fired {
                dispatch(&scheduler, continuation);
            }
        }
        true
    }

    fn rewire_kernel(&self, fd: RawFd, user_data: u64, residual: Event) {
        let op = if residual.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        let mut epoll_event = libc::epoll_event {
            events: residual.bits() | libc::EPOLLET as u32,
            u64: user_data,
        };
        unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut epoll_event) };
    }

    /// Deregisters every event on `fd` and triggers both continuations
    /// that were armed.
    pub fn cancel_all(&self, fd: RawFd) {
        if (fd as usize) >= self.fd_contexts.read().len() {
            return;
        }
        let ctx = self.fd_context(fd);
        let mut state = ctx.state.lock();

        // Snapshot before triggering: testing the mask after each
        // trigger would misbehave once the first trigger has already
        // cleared overlapping bits (spec.md §9, open questions).
        let had_read = state.registered.contains(Event::READ);
        let had_write = state.registered.contains(Event::WRITE);

        if !state.registered.is_empty() {
            self.rewire_kernel(ctx.fd, 0, Event::empty());
        }
        state.registered = Event::empty();

        let read_fired = if had_read { state.read.take() } else { None };
        let write_fired = if had_write { state.write.take() } else { None };
        drop(state);

        if let Some((scheduler, continuation)) = read_fired {
            self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
            dispatch(&scheduler, continuation);
        }
        if let Some((scheduler, continuation)) = write_fired {
            self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
            dispatch(&scheduler, continuation);
        }
    }

    /// Clears `event` from the registered mask and schedules its
    /// continuation on its bound scheduler; decrements
    /// `pending_event_count`. Does not touch the kernel registration —
    /// the caller (the idle loop) has already re-armed the residual
    /// mask with `epoll_ctl` before calling this.
    fn trigger_event(ctx: &FdContext, event: Event, pending: &AtomicUsize) {
        let mut state = ctx.state.lock();
        state.registered -= event;
        let event_ctx = FdContext::event_ctx_mut(&mut state, event);
        let fired = event_ctx.take();
        drop(state);

        if let Some((scheduler, continuation)) = fired {
            pending.fetch_sub(1, Ordering::SeqCst);
            dispatch(&scheduler, continuation);
        }
    }

    fn drain_wakeup_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            // Safety: `wakeup_read` is non-blocking; a non-positive
            // return just means the pipe is currently empty.
            let n = unsafe {
                libc::read(self.wakeup_read, buf.as_mut_ptr() as *mut c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn idle_loop(&self, scheduler: &Scheduler) {
        let mut events: Box<[libc::epoll_event]> =
            vec![unsafe { std::mem::zeroed() }; EPOLL_EVENT_BATCH].into_boxed_slice();

        loop {
            if scheduler.stopping() && self.pending_event_count.load(Ordering::SeqCst) == 0 {
                break;
            }

            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    EPOLL_EVENT_BATCH as i32,
                    IDLE_TIMEOUT_MS,
                )
            };

            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                crate::error::fatal_invariant("epoll_wait failed");
            }

            for raw in events.iter().take(n.max(0) as usize) {
                if raw.u64 == 0 {
                    self.drain_wakeup_pipe();
                    continue;
                }

                let ctx_ptr = raw.u64 as *const FdContext;
                // Safety: the pointer stored with epoll is
                // `Arc::as_ptr` of an `FdContext` owned by
                // `fd_contexts`, which this `IOManager` never shrinks
                // or reallocates elements out of; it outlives this call.
                let ctx: &FdContext = unsafe { &*ctx_ptr };

                let mut raw_events = Event::from_bits_truncate(raw.events);
                if raw.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    raw_events |= Event::READ | Event::WRITE;
                }

                let (real_events, residual) = {
                    let state = ctx.state.lock();
                    let real = raw_events & state.registered;
                    (real, state.registered - real)
                };
                if real_events.is_empty() {
                    continue;
                }

                self.rewire_kernel(ctx.fd, ctx_ptr as u64, residual);

                if real_events.contains(Event::READ) {
                    Self::trigger_event(ctx, Event::READ, &self.pending_event_count);
                }
                if real_events.contains(Event::WRITE) {
                    Self::trigger_event(ctx, Event::WRITE, &self.pending_event_count);
                }
            }

            fiber::yield_to_ready();
        }
    }

    pub fn stop(self: &Arc<Self>) {
        self.scheduler.stop();
    }
}

impl Drop for IOManager {
    fn drop(&mut self) {
        self.scheduler.stop();
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wakeup_read);
            libc::close(self.wakeup_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

    // S4 from spec.md §8: IO wakeup.
    #[test]
    fn io_wakeup_triggers_callback() {
        LOG.lock().unwrap().clear();
        let io = IOManager::new(1, true, "test-s4");

        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        io.add_event(
            read_fd,
            Event::READ,
            Some(Box::new(|| {
                LOG.lock().unwrap().push("R".to_string());
            })),
        )
        .unwrap();

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const c_void, 1) };

        // The caller's dispatch loop only actually runs once `stop()`
        // invokes it (spec.md §4.2: "if a caller root fiber exists,
        // also invokes its context"); the readiness event that's
        // already pending on the fd gets drained during that one pass
        // before the idle loop observes `stopping()` and exits.
        io.stop();

        assert_eq!(*LOG.lock().unwrap(), vec!["R".to_string()]);
        assert_eq!(io.pending_event_count(), 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    // S5 from spec.md §8: cancel triggers once.
    #[test]
    fn cancel_event_triggers_once() {
        LOG.lock().unwrap().clear();
        let io = IOManager::new(1, true, "test-s5");

        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        io.add_event(
            read_fd,
            Event::READ,
            Some(Box::new(|| {
                LOG.lock().unwrap().push("R".to_string());
            })),
        )
        .unwrap();

        assert!(io.cancel_event(read_fd, Event::READ));

        io.stop();

        assert_eq!(*LOG.lock().unwrap(), vec!["R".to_string()]);
        assert_eq!(io.pending_event_count(), 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    // Round-trip law from spec.md §8: add then del leaves state as before.
    #[test]
    fn add_then_del_restores_pending_count() {
        let io = IOManager::new(1, true, "test-roundtrip");
        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        io.add_event(read_fd, Event::READ, Some(Box::new(|| {}))).unwrap();
        assert_eq!(io.pending_event_count(), 1);
        assert!(io.del_event(read_fd, Event::READ));
        assert_eq!(io.pending_event_count(), 0);

        io.stop();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
