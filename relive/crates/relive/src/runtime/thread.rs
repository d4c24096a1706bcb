//! Application threads and their frames.
//!
//! Each registered thread owns a frame stack the quiescence protocol walks
//! inside a pause, a state word the safepoint reads, and a revision cursor:
//! the system revision whose class versions the thread's frames have been
//! checked against.

use parking_lot::{Mutex, MutexGuard, RwLock};
use relive_util::fx::FxIndexMap;
use relive_util::ids::{FrameId, MethodId, ThreadId};
use relive_util::IdGenerator;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// How a frame executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum FrameKind {
    Interpreted,
    /// Running code from the code cache; deoptimized before repair
    Compiled,
    /// Host function; never repaired
    Native,
}

/// One activation record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub method: MethodId,
    /// Index of the pending instruction
    pub bci: usize,
    pub kind: FrameKind,
    /// Return barrier: fires when a callee returns into this frame
    pub barrier: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code; must reach a poll before a pause proceeds
    Running = 0,
    /// Executing host code or idle outside the runtime
    InNative = 1,
    /// Parked at a safepoint poll
    Parked = 2,
    /// Waiting for an update to settle after a barrier fired
    Blocked = 3,
}

impl ThreadState {
    fn from_u8(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Running,
            1 => ThreadState::InNative,
            2 => ThreadState::Parked,
            _ => ThreadState::Blocked,
        }
    }

    #[inline]
    pub fn is_safe(self) -> bool {
        self != ThreadState::Running
    }
}

pub struct AppThread {
    id: ThreadId,
    name: String,
    state: AtomicU8,
    frames: Mutex<Vec<Frame>>,
    revision: AtomicU64,
}

impl AppThread {
    fn new(id: ThreadId, name: &str, revision: u64) -> Self {
        AppThread {
            id,
            name: name.to_string(),
            state: AtomicU8::new(ThreadState::InNative as u8),
            frames: Mutex::new(Vec::new()),
            revision: AtomicU64::new(revision),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Revision cursor
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub(crate) fn set_revision(&self, rn: u64) {
        self.revision.store(rn, Ordering::Release);
    }

    pub(crate) fn frames(&self) -> MutexGuard<'_, Vec<Frame>> {
        self.frames.lock()
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Copy of the frame stack, oldest first
    pub fn stack(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }
}

impl fmt::Debug for AppThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("revision", &self.revision())
            .field("depth", &self.depth())
            .finish()
    }
}

/// Every thread currently attached to the runtime
#[derive(Default)]
pub struct ThreadRegistry {
    threads: RwLock<FxIndexMap<ThreadId, Arc<AppThread>>>,
    ids: IdGenerator,
    revision_source: AtomicU64,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a thread; it starts safe and at the current system revision
    ///
    /// The revision is read under the same lock [`advance`](Self::advance)
    /// publishes it under, so a thread attaching during an update is either
    /// moved by that update or starts after it.
    pub fn register(&self, name: &str) -> Arc<AppThread> {
        let id: ThreadId = self.ids.next();
        let mut threads = self.threads.write();
        let thread = Arc::new(AppThread::new(
            id,
            name,
            self.revision_source.load(Ordering::Acquire),
        ));
        threads.insert(id, Arc::clone(&thread));
        thread
    }

    pub fn deregister(&self, id: ThreadId) -> Option<Arc<AppThread>> {
        self.threads.write().shift_remove(&id)
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<AppThread>> {
        self.threads.read().get(&id).cloned()
    }

    /// Registered threads in registration order
    pub fn snapshot(&self) -> Vec<Arc<AppThread>> {
        self.threads.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    pub fn all_safe(&self) -> bool {
        self.threads.read().values().all(|t| t.state().is_safe())
    }

    /// Run `f` over every thread, then publish `rn` as the revision newly
    /// registered threads start at, without letting a thread attach between
    /// the two
    pub(crate) fn advance(&self, rn: u64, mut f: impl FnMut(&AppThread) -> usize) -> usize {
        let threads = self.threads.write();
        let total = threads.values().map(|t| f(t)).sum();
        self.revision_source.store(rn, Ordering::Release);
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_states() {
        let registry = ThreadRegistry::new();
        registry.advance(4, |_| 0);
        let a = registry.register("a");
        let b = registry.register("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.revision(), 4);
        assert!(registry.all_safe(), "threads start outside managed code");

        b.set_state(ThreadState::Running);
        assert!(!registry.all_safe());
        b.set_state(ThreadState::Blocked);
        assert!(registry.all_safe());

        registry.deregister(a.id());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(a.id()).is_none());
    }

    #[test]
    fn test_attach_during_advance_starts_at_new_revision() {
        let registry = Arc::new(ThreadRegistry::new());
        let early = registry.register("early");
        let (entered_tx, entered_rx) = crossbeam::channel::bounded(0);
        let (proceed_tx, proceed_rx) = crossbeam::channel::bounded::<()>(0);

        let updater = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry.advance(1, |t| {
                    entered_tx.send(()).unwrap();
                    proceed_rx.recv().unwrap();
                    t.set_revision(1);
                    1
                })
            })
        };
        entered_rx.recv().unwrap();
        let attacher = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.register("late"))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        proceed_tx.send(()).unwrap();

        assert_eq!(updater.join().unwrap(), 1, "only the thread attached before is visited");
        let late = attacher.join().unwrap();
        assert_eq!(early.revision(), 1);
        assert_eq!(late.revision(), 1);
        assert_eq!(registry.len(), 2);
    }
}
