//! Safepoint Management
//!
//! A safepoint is the global pause inside which the coordinator switches
//! the system to a new revision. Application threads poll at calls, returns
//! and backward branches and park while a pause is in progress. A thread
//! that is executing host code or waiting on a barrier is already safe and
//! is not waited for.
//!
//! ## Safepoint States
//!
//! ```text
//! SAFEPOINT_NONE (0) ─────┐
//!     │                   │
//!     ▼                   │
//! SAFEPOINT_REQUESTED (1) │
//!     │                   │
//!     ▼                   │
//! SAFEPOINT_REACHED (2) ──┘ (PauseGuard dropped)
//! ```
//!
//! ## Pause Mechanism
//!
//! 1. The coordinator requests a pause (state REQUESTED)
//! 2. Running threads reach a poll and park, threads in host code stay put
//! 3. The coordinator waits until every registered thread is safe
//! 4. State REACHED: the registry may be mutated
//! 5. Dropping the [`PauseGuard`] releases every parked thread
//!
//! A thread leaving a safe state while a pause is in progress blocks until
//! the pause ends, so no thread can start running metadata-dependent code
//! inside a pause.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use super::thread::{AppThread, ThreadRegistry, ThreadState};

/// Safepoint state constants
pub const SAFEPOINT_NONE: u8 = 0;
pub const SAFEPOINT_REQUESTED: u8 = 1;
pub const SAFEPOINT_REACHED: u8 = 2;

/// How often the coordinator re-checks thread states while waiting
const ARRIVAL_POLL: Duration = Duration::from_millis(1);

/// Safepoint - global pause coordination
///
/// # Thread Safety
///
/// The state word is read lock-free on the polling fast path. Every state
/// change happens under the internal mutex so parked threads cannot miss a
/// release.
pub struct Safepoint {
    /// Current safepoint state
    state: AtomicU8,

    lock: Mutex<()>,

    /// Signalled when a thread becomes safe
    arrived: Condvar,

    /// Signalled when a pause ends
    released: Condvar,
}

impl Safepoint {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SAFEPOINT_NONE),
            lock: Mutex::new(()),
            arrived: Condvar::new(),
            released: Condvar::new(),
        }
    }

    /// Current state
    ///
    /// # Memory Ordering
    /// Acquire, pairs with the Release stores of the coordinator.
    #[inline]
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.state() != SAFEPOINT_NONE
    }

    /// Request a pause and wait until every registered thread is safe
    ///
    /// Called by the coordinator only. Threads registering during the wait
    /// start out safe, so the wait terminates.
    pub fn begin_pause<'a>(&'a self, threads: &ThreadRegistry) -> PauseGuard<'a> {
        let started = Instant::now();
        let mut guard = self.lock.lock();
        self.state.store(SAFEPOINT_REQUESTED, Ordering::SeqCst);
        while !threads.all_safe() {
            self.arrived.wait_for(&mut guard, ARRIVAL_POLL);
        }
        self.state.store(SAFEPOINT_REACHED, Ordering::Release);
        log::trace!("safepoint reached after {:?}", started.elapsed());
        PauseGuard {
            safepoint: self,
            started,
        }
    }

    /// Safepoint poll
    ///
    /// Fast path is a single atomic load. When a pause is requested the
    /// thread parks until it ends.
    #[inline]
    pub fn poll(&self, thread: &AppThread) {
        if self.state() != SAFEPOINT_NONE {
            self.park(thread);
        }
    }

    #[cold]
    fn park(&self, thread: &AppThread) {
        let mut guard = self.lock.lock();
        if self.state() == SAFEPOINT_NONE {
            return;
        }
        thread.set_state(ThreadState::Parked);
        self.arrived.notify_all();
        while self.state() != SAFEPOINT_NONE {
            self.released.wait(&mut guard);
        }
        thread.set_state(ThreadState::Running);
    }

    /// Mark `thread` safe while it runs host code or waits
    pub fn enter_safe(&self, thread: &AppThread, state: ThreadState) {
        debug_assert!(state != ThreadState::Running);
        thread.set_state(state);
        let _guard = self.lock.lock();
        self.arrived.notify_all();
    }

    /// Return `thread` to running, waiting out a pause in progress
    pub fn leave_safe(&self, thread: &AppThread) {
        let mut guard = self.lock.lock();
        while self.state() != SAFEPOINT_NONE {
            self.released.wait(&mut guard);
        }
        thread.set_state(ThreadState::Running);
    }

    /// Wake the coordinator so it re-checks thread states
    pub(crate) fn notify_arrival(&self) {
        let _guard = self.lock.lock();
        self.arrived.notify_all();
    }

    fn end_pause(&self) {
        let _guard = self.lock.lock();
        self.state.store(SAFEPOINT_NONE, Ordering::SeqCst);
        self.released.notify_all();
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by the coordinator for the duration of a pause
pub struct PauseGuard<'a> {
    safepoint: &'a Safepoint,
    started: Instant,
}

impl PauseGuard<'_> {
    /// Time since the pause was requested
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.end_pause();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pause_without_threads() {
        let safepoint = Safepoint::new();
        let threads = ThreadRegistry::new();
        {
            let _pause = safepoint.begin_pause(&threads);
            assert_eq!(safepoint.state(), SAFEPOINT_REACHED);
        }
        assert_eq!(safepoint.state(), SAFEPOINT_NONE);
    }

    #[test]
    fn test_running_thread_parks_at_poll() {
        let safepoint = Arc::new(Safepoint::new());
        let threads = Arc::new(ThreadRegistry::new());
        let app = threads.register("worker");
        safepoint.leave_safe(&app);

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let (safepoint, app, stop) = (Arc::clone(&safepoint), Arc::clone(&app), Arc::clone(&stop));
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    safepoint.poll(&app);
                    thread::yield_now();
                }
                safepoint.enter_safe(&app, ThreadState::InNative);
            })
        };

        {
            let _pause = safepoint.begin_pause(&threads);
            assert_eq!(app.state(), ThreadState::Parked);
        }
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert_eq!(app.state(), ThreadState::InNative);
    }

    #[test]
    fn test_leave_safe_waits_for_pause_end() {
        let safepoint = Arc::new(Safepoint::new());
        let threads = ThreadRegistry::new();
        let app = threads.register("late");

        let pause = safepoint.begin_pause(&threads);
        let handle = {
            let (safepoint, app) = (Arc::clone(&safepoint), Arc::clone(&app));
            thread::spawn(move || {
                safepoint.leave_safe(&app);
                app.state()
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(app.state(), ThreadState::InNative, "must not run inside the pause");
        drop(pause);
        assert_eq!(handle.join().unwrap(), ThreadState::Running);
    }
}
