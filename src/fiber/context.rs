//! The machine-context save/restore primitive fibers are built on.
//!
//! Grounded on sylar's use of POSIX `ucontext_t`/`getcontext`/
//! `makecontext`/`swapcontext` (`fiber.h`/`fiber.cpp`): "a context-save/
//! restore facility that can initialize a context to begin executing at
//! a given trampoline on a caller-provided stack" (spec.md §9). `libc`
//! (already a dependency of the teacher crate) exposes these directly,
//! so there's no need for inline assembly or a vendored context-switch
//! crate — the same tradeoff sylar made by picking `ucontext` over a
//! hand-rolled assembly switch.
use std::mem::MaybeUninit;
use std::os::raw::c_void;

/// A saved machine context: registers, stack pointer, signal mask.
/// Thin wrapper around `libc::ucontext_t` giving it a safe-ish
/// constructor and the two operations fibers need.
pub struct Context(libc::ucontext_t);

impl Context {
    /// A zeroed context. Must be populated by [`Context::capture`] or
    /// [`Context::prepare`] before it is ever switched to.
    pub fn new() -> Self {
        // Safety: `ucontext_t` is a plain-old-data struct; the kernel/libc
        // never inspects a zeroed one before `getcontext`/`makecontext`
        // fills it in.
        Self(unsafe { MaybeUninit::zeroed().assume_init() })
    }

    /// Captures the calling thread's current machine state into this
    /// context. Used once per thread to build its thread-root fiber.
    ///
    /// # Safety
    /// The caller must not have already entered a fiber's stack that is
    /// about to be deallocated out from under this call.
    pub unsafe fn capture(&mut self) {
        if libc::getcontext(&mut self.0) != 0 {
            crate::error::fatal_invariant("getcontext failed");
        }
    }

    /// Points this context at `entry`, to run on `stack` once switched
    /// to. `entry` takes no arguments; it recovers whatever state it
    /// needs via [`super::Fiber::get_this`].
    ///
    /// # Safety
    /// `stack` must outlive every switch into this context, and must
    /// not be reused by another live context at the same time.
    pub unsafe fn prepare(&mut self, stack: &mut [u8], entry: extern "C" fn()) {
        if libc::getcontext(&mut self.0) != 0 {
            crate::error::fatal_invariant("getcontext failed");
        }
        self.0.uc_link = std::ptr::null_mut();
        self.0.uc_stack.ss_sp = stack.as_mut_ptr() as *mut c_void;
        self.0.uc_stack.ss_size = stack.len();
        self.0.uc_stack.ss_flags = 0;
        libc::makecontext(&mut self.0, entry, 0);
    }

    /// Saves the currently-running machine state into `from`, then
    /// loads `to` and resumes it. Does not return until some other
    /// `swap` switches back into `from`.
    ///
    /// # Safety
    /// `to` must have been built by [`Context::capture`] or
    /// [`Context::prepare`] and its stack (if any) must still be valid
    /// memory.
    pub unsafe fn swap(from: &mut Context, to: &mut Context) {
        if libc::swapcontext(&mut from.0, &mut to.0) != 0 {
            crate::error::fatal_invariant("swapcontext failed");
        }
    }
}
