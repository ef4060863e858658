//! Stackful coroutines.
//!
//! A fiber is a set of instructions executed with cooperative
//! multitasking: its own machine stack, its own saved register context,
//! and a user-supplied entry closure. Grounded on the teacher's
//! `fiber::Fiber` (an FFI handle around Tarantool's own fiber runtime)
//! for naming and documentation register, and on sylar's `fiber.h`/
//! `fiber.cpp` for the actual state machine and context-switch
//! semantics this crate implements from scratch (see [`context`]).
//!
//! A fiber has one of six states ([`State`]): it starts `Init`, becomes
//! `Exec` while it is the one running on its thread, `Ready` or `Hold`
//! when it has voluntarily yielded, and `Term`/`Except` when its entry
//! closure has returned or panicked. In terminal states its stack may
//! be reused via [`Fiber::reset`].
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub mod context;
use context::Context;

/// Default machine stack size for a fiber that doesn't request one
/// explicitly. Read from the `fiber.stack_size` config entry at
/// construction time, per spec.md §6.
pub use crate::config::DEFAULT_FIBER_STACK_SIZE;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A fiber's lifecycle state. See the module docs for the legal
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed (or reset), not yet run.
    Init,
    /// Suspended; will not be re-scheduled until something external
    /// (typically an I/O readiness event) re-schedules it.
    Hold,
    /// Currently running on some thread's machine stack.
    Exec,
    /// Suspended; the scheduler will re-enqueue it.
    Ready,
    /// Finished cleanly.
    Term,
    /// Finished because its entry closure panicked.
    Except,
}

impl State {
    fn is_terminal(self) -> bool {
        matches!(self, State::Term | State::Init | State::Except)
    }
}

struct Inner {
    state: State,
    context: Context,
    stack: Option<Box<[u8]>>,
    entry: Option<Box<dyn FnOnce() + Send + 'static>>,
    /// The fiber to resume when this one next swaps out. Set fresh by
    /// every `swap_in` to whichever fiber was current at that moment —
    /// ordinarily the thread-root, but the caller-hosted dispatch fiber
    /// (spec.md §3) makes itself current first, so fibers it swaps into
    /// correctly resume back into it rather than the true thread-root.
    resume_into: Option<Arc<Fiber>>,
}

/// A stackful coroutine. Always held behind an [`Arc`]: the scheduler
/// queue, `FdContext` registrations, and the thread-local "current
/// fiber" slot all need to refer to the same fiber without any one of
/// them being privileged to free it out from under the others (see
/// spec.md §9, "Cyclic ownership Fiber<->Scheduler").
pub struct Fiber {
    id: u64,
    self_weak: Weak<Fiber>,
    inner: UnsafeCell<Inner>,
}

// Safety: a `Fiber`'s interior state is touched by at most one thread at
// a time by construction (spec.md §5, "Fiber state ... owned by the one
// thread currently hosting it"): the thread that has it `Exec`, or the
// scheduler/IOManager thread that holds the only live reference while
// it's queued. Nothing ever reads `Inner` concurrently with a write.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

thread_local! {
    // Raw, non-owning pointer to whichever fiber is executing on this
    // thread right now (or the thread-root fiber if none is). Mirrors
    // sylar's `static thread_local Fiber* t_fiber`: ownership lives
    // elsewhere (the scheduler queue, an `FdContext`, or the thread-root
    // slot below), this is identity only.
    static CURRENT: Cell<*const Fiber> = Cell::new(std::ptr::null());
    // Owning handle to this thread's root fiber (the fiber representing
    // its native stack). Constructed lazily on first `Fiber::get_this`.
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

extern "C" fn trampoline() {
    // Safety: `swap_in` always sets `CURRENT` to the fiber being entered
    // before switching here, so `get_this` resolves to it.
    let fiber = Fiber::get_this();
    let entry = {
        let inner = unsafe { &mut *fiber.inner.get() };
        inner.entry.take()
    };

    match entry {
        Some(entry) => {
            let result = std::panic::catch_unwind(AssertUnwindSafe(entry));
            match result {
                Ok(()) => fiber.set_state(State::Term),
                Err(payload) => {
                    let backtrace = std::backtrace::Backtrace::force_capture();
                    log::error!(
                        target: "fibra::fiber",
                        "fiber {} panicked: {}\n{}",
                        fiber.id,
                        panic_message(&payload),
                        backtrace,
                    );
                    fiber.set_state(State::Except);
                }
            }
        }
        None => fiber.set_state(State::Term),
    }

    // Safety: drop our owning handle before switching away. This
    // fiber's machine stack is part of `fiber`'s own allocation; were we
    // to keep this `Arc` alive and let the refcount hit zero later
    // while resumed on the thread-root stack, that would still be fine,
    // but holding the *last* reference on this very stack while
    // `swap_out` runs risks the allocator reusing memory we haven't
    // fully unwound out of yet (spec.md §9, "self-reference hazard").
    // `CURRENT` still doesn't own a reference (see its definition
    // above), so whoever owns the scheduler-side handle (the worker's
    // local variable, or an `FdContext`) is what actually keeps this
    // fiber alive until the swap completes.
    let raw: *const Fiber = Arc::as_ptr(&fiber);
    drop(fiber);
    unsafe { (*raw).swap_out() };
    unreachable!("fiber trampoline must never return past swap_out");
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

impl Fiber {
    /// Creates a new fiber with a private machine stack, ready to run
    /// `entry` once switched into. `stack_size` of `0` reads
    /// `fiber.stack_size` from the config registry (spec.md §6).
    pub fn new<F>(entry: F, stack_size: u32) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            crate::config::fiber_stack_size()
        } else {
            stack_size
        } as usize;

        Arc::new_cyclic(|weak| {
            let mut stack = vec![0u8; stack_size].into_boxed_slice();
            let mut context = Context::new();
            // Safety: `stack` outlives `context` for the lifetime of this
            // `Fiber` (they're both fields of the same `Inner`), and is
            // never reused by any other context while this one is live.
            unsafe { context.prepare(&mut stack, trampoline) };
            Fiber {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                self_weak: weak.clone(),
                inner: UnsafeCell::new(Inner {
                    state: State::Init,
                    context,
                    stack: Some(stack),
                    entry: Some(Box::new(entry)),
                    resume_into: None,
                }),
            }
        })
    }

    fn new_thread_root() -> Arc<Fiber> {
        Arc::new_cyclic(|weak| Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            self_weak: weak.clone(),
            inner: UnsafeCell::new(Inner {
                state: State::Exec,
                context: Context::new(),
                stack: None,
                entry: None,
                resume_into: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        // Safety: see the `Send`/`Sync` justification above this struct.
        unsafe { (*self.inner.get()).state }
    }

    fn set_state(&self, state: State) {
        // Safety: see the `Send`/`Sync` justification above this struct.
        unsafe { (*self.inner.get()).state = state };
    }

    fn context_mut(&self) -> &mut Context {
        // Safety: see the `Send`/`Sync` justification above this struct.
        unsafe { &mut (*self.inner.get()).context }
    }

    /// `true` for every fiber except the thread-root fiber (spec.md §3,
    /// "stack is allocated iff the fiber has an entry").
    pub fn has_stack(&self) -> bool {
        unsafe { (*self.inner.get()).stack.is_some() }
    }

    /// Rebuilds this fiber's context to run `entry` from the start,
    /// reusing its existing stack allocation. Legal only from `Term`,
    /// `Init`, or `Except`, and only for fibers that own a stack
    /// (spec.md §4.1).
    pub fn reset<F>(self: &Arc<Self>, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = unsafe { &mut *self.inner.get() };
        if !inner.state.is_terminal() {
            crate::error::fatal_invariant("Fiber::reset called on a non-terminal fiber");
        }
        let stack = match inner.stack.as_mut() {
            Some(stack) => stack,
            None => crate::error::fatal_invariant("Fiber::reset called on a stackless fiber"),
        };
        // Safety: `stack` is the same allocation the fiber has always
        // used; no other context refers to it.
        unsafe { inner.context.prepare(stack, trampoline) };
        inner.entry = Some(Box::new(entry));
        inner.state = State::Init;
    }

    /// Returns the fiber currently executing on this thread, lazily
    /// constructing the thread-root fiber (no stack, captures the
    /// thread's native machine state) if this thread has never run one.
    pub fn get_this() -> Arc<Fiber> {
        let ptr = CURRENT.with(Cell::get);
        if !ptr.is_null() {
            // Safety: `ptr` was set by `swap_in`/`swap_out` to a
            // fiber kept alive by its owner (the scheduler, an
            // `FdContext`, or `THREAD_ROOT` below); it outlives this call.
            let fiber = unsafe { &*ptr };
            return fiber
                .self_weak
                .upgrade()
                .expect("current fiber dropped while executing");
        }

        let root = Fiber::new_thread_root();
        // Safety: called once, right after construction, before this
        // context is ever switched to.
        unsafe { root.context_mut().capture() };
        CURRENT.with(|c| c.set(Arc::as_ptr(&root)));
        THREAD_ROOT.with(|r| *r.borrow_mut() = Some(root.clone()));
        root
    }

    fn set_this(fiber: &Fiber) {
        CURRENT.with(|c| c.set(fiber as *const Fiber));
    }

    /// Switches the calling context into `fiber`, recording whoever is
    /// currently executing as the fiber to resume once `fiber` next
    /// swaps out. Precondition: `fiber.state() != Exec`.
    pub fn swap_in(fiber: &Arc<Fiber>) {
        if fiber.state() == State::Exec {
            crate::error::fatal_invariant("swap_in: fiber is already EXEC");
        }
        let caller = Fiber::get_this();
        // Safety: see the `Send`/`Sync` justification above this struct.
        unsafe { (*fiber.inner.get()).resume_into = Some(caller.clone()) };
        Fiber::set_this(fiber);
        fiber.set_state(State::Exec);
        // Safety: `caller`'s context is valid (either freshly captured as
        // a thread-root, or itself mid-flight as the target of some
        // earlier `swap_in`), and `fiber`'s context was built by
        // `new`/`reset`.
        unsafe { Context::swap(caller.context_mut(), fiber.context_mut()) };
    }

    /// Switches back to whichever context swapped this fiber in. Called
    /// by a currently-executing fiber on itself, either directly (the
    /// `Yield*` functions) or via the trampoline at exit. The caller
    /// must have already set this fiber's state to its next value
    /// (`Hold`, `Ready`, `Term`, or `Except`).
    fn swap_out(&self) {
        // Safety: see the `Send`/`Sync` justification above this struct.
        let target = unsafe { (*self.inner.get()).resume_into.clone() }
            .unwrap_or_else(|| crate::error::fatal_invariant("swap_out: fiber has no resume target"));
        Fiber::set_this(&target);
        // Safety: `target`'s context was captured by the `swap_in` that
        // entered this fiber and is restored here unchanged.
        unsafe { Context::swap(self.context_mut(), target.context_mut()) };
    }
}

/// Suspends the current fiber, marking it `Ready` so the scheduler will
/// re-enqueue it at the tail of the work queue.
pub fn yield_to_ready() {
    let cur = Fiber::get_this();
    cur.set_state(State::Ready);
    cur.swap_out();
}

/// Suspends the current fiber, marking it `Hold`. The scheduler will
/// not re-enqueue it; something external (an I/O readiness event, a
/// direct `schedule` call holding the fiber) must do so.
pub fn yield_to_hold() {
    let cur = Fiber::get_this();
    cur.set_state(State::Hold);
    cur.swap_out();
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.stack.is_some() && !inner.state.is_terminal() {
            log::error!(
                target: "fibra::fiber",
                "fiber {} dropped in non-terminal state {:?}",
                self.id,
                inner.state,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    static LOG: Mutex<Vec<&str>> = Mutex::new(Vec::new());

    fn log(tag: &'static str) {
        LOG.lock().unwrap().push(tag);
    }

    // S1 from spec.md §8: yield round-trip.
    #[test]
    fn yield_round_trip_order() {
        LOG.lock().unwrap().clear();
        let f = Fiber::new(
            || {
                log("A");
                yield_to_hold();
                log("B");
            },
            0,
        );

        Fiber::swap_in(&f);
        log("M");
        assert_eq!(f.state(), State::Hold);
        Fiber::swap_in(&f);
        log("N");

        assert_eq!(f.state(), State::Term);
        assert_eq!(*LOG.lock().unwrap(), vec!["A", "M", "B", "N"]);
    }

    #[test]
    fn panicking_entry_sets_except() {
        // Exercises the trampoline's error-logging path (spec.md §7.3);
        // initialize a backend so the captured backtrace is visible
        // under `--nocapture` instead of silently discarded.
        let _ = env_logger::try_init();
        let f = Fiber::new(|| panic!("boom"), 0);
        Fiber::swap_in(&f);
        assert_eq!(f.state(), State::Except);
    }

    // S6 from spec.md §8: reset reuses the stack.
    #[test]
    fn reset_reuses_stack_allocation() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let f = Fiber::new(
            || {
                HITS.fetch_add(1, Ordering::SeqCst);
            },
            4096,
        );
        let stack_ptr = unsafe { (*f.inner.get()).stack.as_ref().unwrap().as_ptr() };

        Fiber::swap_in(&f);
        assert_eq!(f.state(), State::Term);

        f.reset(|| {
            HITS.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(f.state(), State::Init);
        let stack_ptr_after_reset = unsafe { (*f.inner.get()).stack.as_ref().unwrap().as_ptr() };
        assert_eq!(stack_ptr, stack_ptr_after_reset);

        Fiber::swap_in(&f);
        assert_eq!(f.state(), State::Term);
        assert_eq!(HITS.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn yield_to_ready_leaves_fiber_ready() {
        let f = Fiber::new(
            || {
                yield_to_ready();
            },
            0,
        );
        Fiber::swap_in(&f);
        assert_eq!(f.state(), State::Ready);
    }
}
