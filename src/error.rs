//! Error types returned by the fallible parts of this crate's public API.
//!
//! Most invariant violations described in the module docs (illegal fiber
//! state transitions, double event registration reached through internal
//! bookkeeping, a missing current-fiber where one must exist) are not
//! represented here: per the core's error taxonomy they are logged at
//! `error` level with a backtrace and the process aborts, the same way
//! an assertion failure would. This type is for the calls that are meant
//! to propagate a failure to the caller instead (OS call failures).
use std::io;

/// Errors returned by [`crate::scheduler::Scheduler`] and
/// [`crate::io_manager::IOManager`] operations that are expected to fail
/// under ordinary operation (as opposed to invariant violations, which
/// abort).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An OS call failed: `epoll_create1`, `epoll_ctl`, `pipe2`, thread
    /// spawn, or a `read`/`write` on the wakeup pipe.
    #[error("OS call failed: {0}")]
    Os(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Logs an invariant violation at `error` level with a captured
/// backtrace and aborts the process. Used for state-machine violations
/// that the core's error taxonomy (spec §7.1) treats as fatal rather
/// than recoverable.
#[doc(hidden)]
#[cold]
pub fn fatal_invariant(what: &str) -> ! {
    let backtrace = std::backtrace::Backtrace::force_capture();
    log::error!(target: "fibra", "invariant violation: {what}\n{backtrace}");
    std::process::abort();
}
