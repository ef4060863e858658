//! The cooperative multi-threaded work scheduler.
//!
//! Grounded on sylar's `Scheduler` (`scheduler.h`/`scheduler.cpp`): an N
//! worker-thread pool, each running a dispatch loop that pops work
//! under one mutex and swaps into either a user fiber or a reusable
//! per-worker callback fiber. `IOManager` specializes it by overriding
//! `tickle`/`idle`/`stopping` (spec.md §4.2); sylar does this with C++
//! virtual methods, which this crate translates into composition: a
//! [`Reactor`] strategy trait that [`crate::io_manager::IOManager`]
//! implements and installs into the `Scheduler` it wraps, rather than
//! subclassing (idiomatic Rust has no implementation inheritance).
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::fiber::{self, Fiber, State};
use crate::sync::Latch;
use crate::thread::Thread;

/// Opaque OS-thread identity used for affinity (`thread_hint`). `-1`
/// means "any worker". Workers compare their own id against a
/// `WorkItem`'s hint with `==`; there is no ordering between ids.
pub type ThreadId = i64;

/// No affinity: any worker thread may run this item.
pub const ANY_THREAD: ThreadId = -1;

enum Work {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct WorkItem {
    work: Work,
    thread_hint: ThreadId,
}

/// A strategy a [`Scheduler`] delegates its three overridable behaviors
/// to. The base scheduler's own `tickle`/`idle`/`stopping` (used when
/// no reactor is installed) implement the defaults spec.md §4.2
/// describes directly on `Scheduler`.
pub(crate) trait Reactor: Send + Sync {
    /// Wakes one idle worker, or does nothing if none is idle.
    fn tickle(&self, scheduler: &Scheduler);
    /// Runs as the body of each worker's idle fiber.
    fn idle(&self, scheduler: &Scheduler);
    /// Extra quiescence condition a subclass-equivalent adds to the
    /// base `auto_stop ∧ stopping ∧ queue empty ∧ active_count==0`.
    fn stopping_extra(&self) -> bool {
        true
    }
}

struct DefaultReactor;

impl Reactor for DefaultReactor {
    fn tickle(&self, _scheduler: &Scheduler) {}

    fn idle(&self, scheduler: &Scheduler) {
        while !scheduler.stopping() {
            fiber::yield_to_hold();
        }
    }
}

thread_local! {
    static CURRENT_SCHEDULER: std::cell::Cell<*const Scheduler> = std::cell::Cell::new(std::ptr::null());
    static CURRENT_THREAD_ID: std::cell::Cell<ThreadId> = std::cell::Cell::new(ANY_THREAD);
    static CALLBACK_FIBER: std::cell::RefCell<Option<Arc<Fiber>>> = std::cell::RefCell::new(None);
    static IDLE_FIBER: std::cell::RefCell<Option<Arc<Fiber>>> = std::cell::RefCell::new(None);
}

static NEXT_THREAD_ID: AtomicI64 = AtomicI64::new(1);

/// The N-worker cooperative scheduler. See the module docs for the
/// relationship to [`crate::io_manager::IOManager`].
pub struct Scheduler {
    name: String,
    worker_count: usize,
    queue: Latch<VecDeque<WorkItem>>,
    threads: Latch<Vec<Thread>>,
    thread_ids: Latch<Vec<ThreadId>>,
    caller_thread_id: Option<ThreadId>,
    caller_root_fiber: Latch<Option<Arc<Fiber>>>,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    reactor: Box<dyn Reactor>,
}

impl Scheduler {
    /// Builds a scheduler with the default (no-op tickle, yield-until-
    /// stopping idle) reactor.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        Self::with_reactor(threads, use_caller, name, Box::new(DefaultReactor))
    }

    pub(crate) fn with_reactor(
        threads: usize,
        use_caller: bool,
        name: impl Into<String>,
        reactor: Box<dyn Reactor>,
    ) -> Arc<Scheduler> {
        assert!(threads >= 1, "Scheduler requires at least one worker thread");

        let caller_thread_id = if use_caller {
            Some(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
        } else {
            None
        };

        Arc::new(Scheduler {
            name: name.into(),
            worker_count: threads,
            queue: Latch::new(VecDeque::new()),
            threads: Latch::new(Vec::new()),
            thread_ids: Latch::new(Vec::new()),
            caller_thread_id,
            caller_root_fiber: Latch::new(None),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            reactor,
        })
    }

    /// Returns the scheduler currently installed on this thread, if
    /// any (spec.md §9, "current scheduler" thread-local slot).
    pub fn get_this() -> Option<Arc<Scheduler>> {
        // Safety: a scheduler only ever sets `CURRENT_SCHEDULER` to a
        // pointer into an `Arc` it keeps alive for the duration it's
        // installed (its own `self` behind an `Arc<Self>` held by
        // `start`'s caller and every worker thread).
        let ptr = CURRENT_SCHEDULER.with(|c| c.get());
        if ptr.is_null() {
            return None;
        }
        let arc = unsafe { Arc::from_raw(ptr) };
        let clone = arc.clone();
        std::mem::forget(arc);
        Some(clone)
    }

    fn install_this(self: &Arc<Self>, thread_id: ThreadId) {
        let raw = Arc::into_raw(self.clone());
        CURRENT_SCHEDULER.with(|c| c.set(raw));
        CURRENT_THREAD_ID.with(|c| c.set(thread_id));
    }

    fn uninstall_this() {
        let ptr = CURRENT_SCHEDULER.with(|c| c.replace(std::ptr::null()));
        if !ptr.is_null() {
            // Safety: balances the `Arc::into_raw` in `install_this`.
            unsafe { drop(Arc::from_raw(ptr)) };
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the worker pool: spawns `N` (or `N-1`, if `use_caller`)
    /// OS threads, each running the dispatch loop. If `use_caller`,
    /// also builds a dedicated fiber to host the dispatch loop on this
    /// thread (spec.md §3: "its dispatch loop runs inside a dedicated
    /// fiber, not on the thread-root") but does **not** swap into it —
    /// call [`Scheduler::run_on_caller`] separately afterwards (mirrors
    /// sylar's split between `start()` returning immediately and
    /// `run()` being invoked by the embedding application on the
    /// caller thread).
    pub fn start(self: &Arc<Self>) {
        let spawn_count = if self.caller_thread_id.is_some() {
            self.worker_count.saturating_sub(1)
        } else {
            self.worker_count
        };

        if let Some(id) = self.caller_thread_id {
            let this = self.clone();
            let root_fiber = Fiber::new(move || this.run(), 0);
            *self.caller_root_fiber.lock() = Some(root_fiber);
            self.thread_ids.lock().push(id);
        }

        let mut threads = Vec::with_capacity(spawn_count);
        for i in 0..spawn_count {
            let this = self.clone();
            let thread_id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            self.thread_ids.lock().push(thread_id);
            let name = format!("{}-{}", self.name, i);
            let handle = Thread::spawn(name, move || {
                this.install_this(thread_id);
                this.run();
                Scheduler::uninstall_this();
            })
            .expect("failed to spawn scheduler worker thread");
            threads.push(handle);
        }
        *self.threads.lock() = threads;
    }

    /// Runs the dispatch loop on the calling thread by swapping into
    /// the dedicated caller root fiber `start` constructed, rather than
    /// running it directly on the native stack — matching spec.md §3's
    /// "its dispatch loop runs inside a dedicated fiber, not on the
    /// thread-root". No-op if this scheduler was not built with
    /// `use_caller`.
    pub fn run_on_caller(self: &Arc<Self>) {
        if let Some(id) = self.caller_thread_id {
            let root_fiber = self.caller_root_fiber.lock().clone();
            if let Some(root_fiber) = root_fiber {
                self.install_this(id);
                Fiber::swap_in(&root_fiber);
                Scheduler::uninstall_this();
            }
        }
    }

    /// Returns the caller-hosted dispatch fiber, if this scheduler was
    /// built with `use_caller` and [`Scheduler::start`] has run. Mirrors
    /// sylar's `Scheduler::GetMainFiber()`.
    pub fn main_fiber(&self) -> Option<Arc<Fiber>> {
        self.caller_root_fiber.lock().clone()
    }

    /// Enqueues one item. `thread_hint` pins it to a specific worker's
    /// thread id, or [`ANY_THREAD`] for none.
    pub fn schedule(self: &Arc<Self>, work: SchedulableWork, thread_hint: ThreadId) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(WorkItem { work: work.0, thread_hint });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Enqueues a batch, issuing a single tickle if the queue
    /// transitioned from empty to non-empty.
    pub fn schedule_batch<I>(self: &Arc<Self>, items: I)
    where
        I: IntoIterator<Item = (SchedulableWork, ThreadId)>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let mut pushed_any = false;
            for (work, thread_hint) in items {
                queue.push_back(WorkItem { work: work.0, thread_hint });
                pushed_any = true;
            }
            was_empty && pushed_any
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn this_thread_id() -> ThreadId {
        CURRENT_THREAD_ID.with(|c| c.get())
    }

    fn pop_runnable(&self) -> (Option<WorkItem>, bool) {
        let my_id = Self::this_thread_id();
        let mut queue = self.queue.lock();
        let mut tickle_me = false;
        let mut chosen_index = None;
        for (i, item) in queue.iter().enumerate() {
            let affinity_ok = item.thread_hint == ANY_THREAD || item.thread_hint == my_id;
            if !affinity_ok {
                tickle_me = true;
                continue;
            }
            if let Work::Fiber(f) = &item.work {
                if f.state() == State::Exec {
                    continue;
                }
            }
            chosen_index = Some(i);
            break;
        }
        let item = chosen_index.map(|i| queue.remove(i).unwrap());
        (item, tickle_me)
    }

    /// The per-worker dispatch loop (spec.md §4.2).
    fn run(self: &Arc<Self>) {
        loop {
            let (item, tickle_me) = self.pop_runnable();
            if tickle_me {
                self.tickle();
            }

            match item {
                Some(item) => {
                    match item.work {
                        Work::Fiber(f) => {
                            self.active_count.fetch_add(1, Ordering::SeqCst);
                            Fiber::swap_in(&f);
                            self.active_count.fetch_sub(1, Ordering::SeqCst);
                            match f.state() {
                                State::Ready => {
                                    self.schedule(SchedulableWork(Work::Fiber(f)), ANY_THREAD);
                                }
                                State::Term | State::Except => {}
                                _ => {
                                    // Ownership now rests with whoever
                                    // registered this fiber elsewhere
                                    // (e.g. an FdContext); dropping our
                                    // local `Arc` here just releases our
                                    // share of it.
                                }
                            }
                        }
                        Work::Callback(cb) => self.run_callback(cb),
                    }
                    continue;
                }
                None => {
                    if self.run_idle() {
                        break;
                    }
                }
            }
        }
    }

    fn run_callback(self: &Arc<Self>, cb: Box<dyn FnOnce() + Send + 'static>) {
        let fiber = CALLBACK_FIBER.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.take() {
                Some(f) => {
                    f.reset(cb);
                    f
                }
                None => Fiber::new(cb, 0),
            }
        });

        self.active_count.fetch_add(1, Ordering::SeqCst);
        Fiber::swap_in(&fiber);
        self.active_count.fetch_sub(1, Ordering::SeqCst);

        match fiber.state() {
            State::Ready => {
                self.schedule(SchedulableWork(Work::Fiber(fiber)), ANY_THREAD);
            }
            State::Term | State::Except => {
                CALLBACK_FIBER.with(|slot| *slot.borrow_mut() = Some(fiber));
            }
            _ => {
                // Dropped: ownership passed elsewhere, same as the
                // fiber-item case above.
            }
        }
    }

    /// Runs this worker's idle fiber once. Returns `true` if the idle
    /// fiber reached TERM (shutdown complete for this worker).
    fn run_idle(self: &Arc<Self>) -> bool {
        let idle = IDLE_FIBER.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(f) = slot.as_ref() {
                if !matches!(f.state(), State::Term | State::Except) {
                    return f.clone();
                }
            }
            let this = self.clone();
            let f = Fiber::new(move || this.reactor.idle(&this), 0);
            *slot = Some(f.clone());
            f
        });

        self.idle_count.fetch_add(1, Ordering::SeqCst);
        Fiber::swap_in(&idle);
        self.idle_count.fetch_sub(1, Ordering::SeqCst);

        match idle.state() {
            State::Term => true,
            State::Except => true,
            _ => false,
        }
    }

    /// Wakes one idle worker via the installed reactor (no-op by
    /// default).
    fn tickle(self: &Arc<Self>) {
        self.reactor.tickle(self);
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::SeqCst)
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// `true` once this scheduler has been told to stop and has
    /// quiesced: empty queue, no active fibers, and (for subclass-
    /// equivalent reactors such as the IOManager) no pending events.
    pub fn stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue_is_empty()
            && self.active_count() == 0
            && self.reactor.stopping_extra()
    }

    /// Requests shutdown and blocks until every worker (and the caller
    /// dispatch loop, if any) has exited.
    pub fn stop(self: &Arc<Self>) {
        self.auto_stop.store(true, Ordering::SeqCst);
        self.stopping.store(true, Ordering::SeqCst);

        for _ in 0..self.thread_ids.lock().len() {
            self.tickle();
        }

        if self.caller_thread_id.is_some() {
            self.run_on_caller();
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            t.join();
        }
    }
}

/// A unit of work accepted by [`Scheduler::schedule`]: either a fiber
/// or a plain callback.
pub struct SchedulableWork(Work);

impl From<Arc<Fiber>> for SchedulableWork {
    fn from(fiber: Arc<Fiber>) -> Self {
        SchedulableWork(Work::Fiber(fiber))
    }
}

impl<F: FnOnce() + Send + 'static> From<F> for SchedulableWork {
    fn from(cb: F) -> Self {
        SchedulableWork(Work::Callback(Box::new(cb)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

    // S2 from spec.md §8: scheduler run-one.
    #[test]
    fn run_one_callback() {
        LOG.lock().unwrap().clear();
        let sched = Scheduler::new(1, false, "test-s2");
        sched.start();
        sched.schedule(
            (|| {
                LOG.lock().unwrap().push("X".to_string());
            })
            .into(),
            ANY_THREAD,
        );
        sched.stop();
        assert_eq!(*LOG.lock().unwrap(), vec!["X".to_string()]);
    }

    #[test]
    fn affinity_pins_to_requested_thread() {
        LOG.lock().unwrap().clear();
        let sched = Scheduler::new(2, false, "test-s3");
        sched.start();
        let ids = sched.thread_ids.lock().clone();
        assert_eq!(ids.len(), 2);

        sched.schedule(
            (move || {
                LOG.lock().unwrap().push(format!("A@{}", Scheduler::this_thread_id()));
            })
            .into(),
            ids[0],
        );
        sched.schedule(
            (move || {
                LOG.lock().unwrap().push(format!("B@{}", Scheduler::this_thread_id()));
            })
            .into(),
            ids[1],
        );
        sched.stop();

        let log = LOG.lock().unwrap();
        assert!(log.contains(&format!("A@{}", ids[0])));
        assert!(log.contains(&format!("B@{}", ids[1])));
    }

    // Batch `schedule` overload (spec.md §4.2).
    #[test]
    fn batch_schedule_runs_every_item() {
        LOG.lock().unwrap().clear();
        let sched = Scheduler::new(1, false, "test-batch");
        sched.start();

        let items: Vec<(SchedulableWork, ThreadId)> = (0..5)
            .map(|i| {
                let work: SchedulableWork = (move || {
                    LOG.lock().unwrap().push(format!("item{i}"));
                })
                .into();
                (work, ANY_THREAD)
            })
            .collect();
        sched.schedule_batch(items);
        sched.stop();

        let log = LOG.lock().unwrap();
        assert_eq!(log.len(), 5);
        for i in 0..5 {
            assert!(log.contains(&format!("item{i}")));
        }
    }
}
