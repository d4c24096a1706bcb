//! Heap object representation
//!
//! Each instance is a primary byte area sized when it was allocated, plus an
//! optional phantom area that holds fields which outgrew the primary one
//! after an update. The header is a single atomic state word:
//!
//! ```text
//! 63          34   33     32    31                0
//! ┌────────────┬──────┬───────┬──────────────────┐
//! │  reserved  │ BUSY │ MIXED │   klass id       │
//! └────────────┴──────┴───────┴──────────────────┘
//! ```
//!
//! MIXED is set while a phantom area is attached. BUSY is held by the one
//! thread migrating the object; it is taken with a compare-and-swap and
//! other threads wait on the object's monitor until it clears.
//!
//! ## Field placement
//!
//! For a mixed object, a field whose byte range ends past `phantom.limit`
//! lives in the phantom area at the same offset; everything else lives in
//! the primary area.

use parking_lot::{Condvar, Mutex, RwLock};
use relive_util::ids::{ClassId, ObjectId, ThreadId};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::model::{BasicType, Value};

const KLASS_MASK: u64 = 0xFFFF_FFFF;
const MIXED_BIT: u64 = 1 << 32;
const BUSY_BIT: u64 = 1 << 33;

/// Secondary storage of a mixed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phantom {
    /// Fields ending past this offset live here
    pub limit: usize,
    pub data: Box<[u8]>,
}

/// Storage shape of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum InstanceShape {
    /// Storage matches one class layout exactly
    Direct,
    /// Primary storage plus phantom storage
    Forwarded,
}

/// Old field values kept for a transformer that has not succeeded yet
#[derive(Debug, Clone)]
pub struct PendingTransform {
    pub target: ClassId,
    pub old_values: Vec<Value>,
}

/// Decoded header word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderState(u64);

impl HeaderState {
    #[inline]
    pub fn klass(self) -> ClassId {
        ClassId((self.0 & KLASS_MASK) as u32)
    }

    #[inline]
    pub fn is_mixed(self) -> bool {
        self.0 & MIXED_BIT != 0
    }

    #[inline]
    pub fn is_busy(self) -> bool {
        self.0 & BUSY_BIT != 0
    }

    fn encode(klass: ClassId, mixed: bool) -> u64 {
        klass.0 as u64 | if mixed { MIXED_BIT } else { 0 }
    }
}

pub struct HeapObject {
    id: ObjectId,
    state: AtomicU64,
    /// Thread holding BUSY, 0 when free
    owner: AtomicU64,
    primary: RwLock<Box<[u8]>>,
    phantom: RwLock<Option<Phantom>>,
    monitor: Mutex<()>,
    released: Condvar,
    pending: Mutex<Option<PendingTransform>>,
    /// Surplus primary bytes given back as filler after shrinking in place
    filler: AtomicUsize,
}

impl HeapObject {
    pub fn new(id: ObjectId, klass: ClassId, size: usize) -> Self {
        HeapObject {
            id,
            state: AtomicU64::new(HeaderState::encode(klass, false)),
            owner: AtomicU64::new(0),
            primary: RwLock::new(vec![0u8; size].into_boxed_slice()),
            phantom: RwLock::new(None),
            monitor: Mutex::new(()),
            released: Condvar::new(),
            pending: Mutex::new(None),
            filler: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn header(&self) -> HeaderState {
        HeaderState(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn klass(&self) -> ClassId {
        self.header().klass()
    }

    #[inline]
    pub fn is_mixed(&self) -> bool {
        self.header().is_mixed()
    }

    pub fn shape(&self) -> InstanceShape {
        if self.is_mixed() {
            InstanceShape::Forwarded
        } else {
            InstanceShape::Direct
        }
    }

    pub fn primary_len(&self) -> usize {
        self.primary.read().len()
    }

    pub fn phantom_limit(&self) -> Option<usize> {
        self.phantom.read().as_ref().map(|p| p.limit)
    }

    pub fn phantom_len(&self) -> Option<usize> {
        self.phantom.read().as_ref().map(|p| p.data.len())
    }

    pub fn filler(&self) -> usize {
        self.filler.load(Ordering::Relaxed)
    }

    /// Try to take the migration lock
    ///
    /// Returns the header observed before locking, or the busy header when
    /// another thread holds it.
    pub fn try_lock(&self, thread: ThreadId) -> Result<HeaderState, HeaderState> {
        let current = self.state.load(Ordering::Acquire);
        if current & BUSY_BIT != 0 {
            return Err(HeaderState(current));
        }
        match self.state.compare_exchange(
            current,
            current | BUSY_BIT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) => {
                self.owner.store(thread.as_u64(), Ordering::Release);
                Ok(HeaderState(prev))
            },
            Err(actual) => Err(HeaderState(actual)),
        }
    }

    /// Thread currently holding the migration lock
    pub fn owner(&self) -> ThreadId {
        ThreadId(self.owner.load(Ordering::Acquire))
    }

    /// Point the locked object at `klass` without releasing the lock
    pub fn set_klass_locked(&self, klass: ClassId, mixed: bool) {
        self.state
            .store(HeaderState::encode(klass, mixed) | BUSY_BIT, Ordering::Release);
    }

    /// Release the migration lock, leaving the object at `klass`
    pub fn unlock(&self, klass: ClassId, mixed: bool) {
        self.owner.store(0, Ordering::Release);
        self.state
            .store(HeaderState::encode(klass, mixed), Ordering::Release);
        let _guard = self.monitor.lock();
        self.released.notify_all();
    }

    /// Block on the monitor until no thread holds the migration lock
    pub fn wait_unlocked(&self) {
        let mut guard = self.monitor.lock();
        while self.header().is_busy() {
            self.released.wait(&mut guard);
        }
    }

    /// Run `f` holding the migration lock, re-entrant for its owner
    ///
    /// A migration copies the storage while it holds the lock, so a field
    /// access done in here is never lost to, or torn by, a concurrent one.
    pub fn with_locked<R>(&self, thread: ThreadId, f: impl FnOnce(&Self) -> R) -> R {
        if self.header().is_busy() && self.owner() == thread {
            return f(self);
        }
        loop {
            match self.try_lock(thread) {
                Ok(seen) => {
                    let out = f(self);
                    self.unlock(seen.klass(), seen.is_mixed());
                    return out;
                },
                Err(_) => self.wait_unlocked(),
            }
        }
    }

    /// Read a field on behalf of `thread`, serialized with migrations
    pub fn load(&self, thread: ThreadId, offset: usize, ty: BasicType) -> Value {
        self.with_locked(thread, |o| o.read(offset, ty))
    }

    /// Write a field on behalf of `thread`, serialized with migrations
    pub fn store(&self, thread: ThreadId, offset: usize, ty: BasicType, value: Value) {
        self.with_locked(thread, |o| o.write(offset, ty, value))
    }

    /// Read a field using the placement rule
    pub fn read(&self, offset: usize, ty: BasicType) -> Value {
        let end = offset + ty.size();
        if self.is_mixed() {
            let phantom = self.phantom.read();
            if let Some(p) = phantom.as_ref() {
                if end > p.limit && end <= p.data.len() {
                    return Value::decode(ty, &p.data[offset..end]);
                }
            }
        }
        let primary = self.primary.read();
        match primary.get(offset..end) {
            Some(bytes) => Value::decode(ty, bytes),
            None => ty.zero(),
        }
    }

    /// Write a field using the placement rule
    pub fn write(&self, offset: usize, ty: BasicType, value: Value) {
        let end = offset + ty.size();
        if self.is_mixed() {
            let mut phantom = self.phantom.write();
            if let Some(p) = phantom.as_mut() {
                if end > p.limit && end <= p.data.len() {
                    value.encode(ty, &mut p.data[offset..end]);
                    return;
                }
            }
        }
        let mut primary = self.primary.write();
        if let Some(bytes) = primary.get_mut(offset..end) {
            value.encode(ty, bytes);
        }
    }

    /// Copy of the primary area
    pub fn primary_bytes(&self) -> Box<[u8]> {
        self.primary.read().clone()
    }

    /// Copy of the phantom area
    pub fn phantom(&self) -> Option<Phantom> {
        self.phantom.read().clone()
    }

    /// Overwrite the start of the primary area
    pub fn store_primary(&self, bytes: &[u8]) {
        let mut primary = self.primary.write();
        let n = bytes.len().min(primary.len());
        primary[..n].copy_from_slice(&bytes[..n]);
    }

    /// Overwrite the primary area with `bytes` and zero what follows
    pub(crate) fn reset_primary(&self, bytes: &[u8]) {
        let mut primary = self.primary.write();
        let n = bytes.len().min(primary.len());
        primary[..n].copy_from_slice(&bytes[..n]);
        primary[n..].fill(0);
    }

    /// Swap in a freshly allocated primary area
    pub(crate) fn replace_primary(&self, bytes: Box<[u8]>) -> Box<[u8]> {
        std::mem::replace(&mut *self.primary.write(), bytes)
    }

    /// Attach, replace or drop the phantom area, returning the previous one
    pub fn replace_phantom(&self, phantom: Option<Phantom>) -> Option<Phantom> {
        std::mem::replace(&mut *self.phantom.write(), phantom)
    }

    /// Update the phantom area in place
    pub fn with_phantom_mut<R>(&self, f: impl FnOnce(&mut Phantom) -> R) -> Option<R> {
        self.phantom.write().as_mut().map(f)
    }

    pub(crate) fn record_filler(&self, bytes: usize) {
        self.filler.store(bytes, Ordering::Relaxed);
    }

    pub fn pending(&self) -> Option<PendingTransform> {
        self.pending.lock().clone()
    }

    pub(crate) fn set_pending(&self, pending: Option<PendingTransform>) {
        *self.pending.lock() = pending;
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        f.debug_struct("HeapObject")
            .field("id", &self.id)
            .field("klass", &header.klass())
            .field("mixed", &header.is_mixed())
            .field("busy", &header.is_busy())
            .field("primary", &self.primary_len())
            .field("phantom", &self.phantom_len())
            .finish()
    }
}
