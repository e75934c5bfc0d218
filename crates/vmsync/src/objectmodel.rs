//! Minimal object model: the one lock-word cell every heap object carries,
//! and a copyable reference to it. Object layout past the header is the host
//! runtime's business.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::objectmodel::lock_word::LockWord;

pub mod lock_word;

/// The synchronization header embedded in every heap object. The host runtime
/// places one of these at a fixed offset inside each object it wants to be
/// lockable.
#[repr(C)]
pub struct ObjectHeader {
    lock: AtomicU32,
}

impl ObjectHeader {
    pub const fn new() -> Self {
        Self {
            lock: AtomicU32::new(0),
        }
    }

    pub fn lock_word(&self, order: Ordering) -> LockWord {
        LockWord::from_raw(self.lock.load(order))
    }

    /// Single attempt; callers loop on failure. Acquire on success so the
    /// previous owner's critical section is visible.
    pub fn cas_lock_word_acquire(&self, old: LockWord, new: LockWord) -> bool {
        self.lock
            .compare_exchange(old.raw(), new.raw(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release-store: publishes every write the current owner made before
    /// giving the word up (unlock) or fattening it (inflation).
    pub fn set_lock_word_release(&self, new: LockWord) {
        self.lock.store(new.raw(), Ordering::Release);
    }

    /// Plain store, valid only for owner-private updates of a thin word
    /// (recursion count), where lock ownership itself guards the word.
    pub fn set_lock_word_relaxed(&self, new: LockWord) {
        self.lock.store(new.raw(), Ordering::Relaxed);
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Address of an [`ObjectHeader`]. Copyable, hashable, and only valid while
/// the GC keeps the underlying object alive; the monitor subsystem never
/// extends an object's lifetime through one of these.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    pub fn from_header(header: &ObjectHeader) -> Self {
        // A reference is never null.
        Self(unsafe { NonZeroUsize::new_unchecked(header as *const _ as usize) })
    }

    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn to_raw(self) -> usize {
        self.0.get()
    }

    fn header<'a>(self) -> &'a ObjectHeader {
        // Liveness is the caller's contract: monitor operations only run
        // against objects the mutator is holding.
        unsafe { &*(self.0.get() as *const ObjectHeader) }
    }

    pub fn lock_word(self, order: Ordering) -> LockWord {
        self.header().lock_word(order)
    }

    pub fn cas_lock_word_acquire(self, old: LockWord, new: LockWord) -> bool {
        self.header().cas_lock_word_acquire(old, new)
    }

    pub fn set_lock_word_release(self, new: LockWord) {
        self.header().set_lock_word_release(new)
    }

    pub fn set_lock_word_relaxed(self, new: LockWord) {
        self.header().set_lock_word_relaxed(new)
    }
}

impl std::fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectReference({:#x})", self.0.get())
    }
}
