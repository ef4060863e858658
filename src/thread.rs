//! A thin named-thread wrapper.
//!
//! The core treats OS threads as a narrow external collaborator: spawn
//! with a name and an entry function, join. Grounded on sylar's
//! `Thread`/`Thread::SetName` (`thread.h`/`thread.cpp`), which spawns a
//! `pthread` and sets its name for debugging/`top`/`ps` visibility.
//! `std::thread::Builder::name` gives the same result up front, which is
//! the idiomatic Rust equivalent (no need to reach for `libc`'s
//! `pthread_setname_np` ourselves).
use std::io;
use std::thread::JoinHandle;

/// A named OS thread running a single `'static` entry closure.
pub struct Thread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns `entry` on a new OS thread named `name`.
    pub fn spawn<F>(name: impl Into<String>, entry: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(entry)?;
        Ok(Self { name, handle: Some(handle) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread to finish. Panics if the thread itself
    /// panicked, matching `std::thread::JoinHandle::join`'s contract;
    /// the core never expects worker threads to unwind past their
    /// dispatch loop (fiber-level failures are caught at the
    /// trampoline, see [`crate::fiber`]).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("worker thread panicked");
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
