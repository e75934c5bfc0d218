//! Minimal host runtime used by the test suite and example code.

use std::sync::LazyLock;

use crate::runtime::threads::{Thread, ThreadSyncData, VMThread};
use crate::runtime::{Runtime, VMSync, VMSyncBuilder};

#[derive(Default)]
pub struct MockVM;

impl Runtime for MockVM {
    type Thread = MockThread;

    fn sync() -> &'static VMSync<MockVM> {
        static SYNC: LazyLock<VMSync<MockVM>> =
            LazyLock::new(|| VMSyncBuilder::from_env().build());
        &SYNC
    }
}

/// The mock's entire per-thread structure is just the sync data; the handle
/// is its address.
pub struct MockThread {
    sync: ThreadSyncData,
}

impl MockThread {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            sync: ThreadSyncData::new(),
        })
    }

    pub fn handle(&self) -> VMThread {
        VMThread::from_raw(self as *const MockThread as usize)
    }
}

impl Thread<MockVM> for MockThread {
    fn sync<'a>(thread: VMThread) -> &'a ThreadSyncData {
        // Handles are only minted by MockThread::handle and the backing
        // allocation outlives the attachment.
        unsafe { &(*(thread.to_raw() as *const MockThread)).sync }
    }
}

/// Attach a fresh mock thread on the calling OS thread, run `f` with its
/// handle, then detach.
pub fn run_attached<T>(f: impl FnOnce(VMThread) -> T) -> T {
    let thread = MockThread::new();
    let handle = thread.handle();
    MockVM::sync().threads.attach(handle);
    let result = f(handle);
    MockVM::sync().threads.detach(handle);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::threads::{vmsync_current_thread, ThreadState};

    #[test]
    fn attach_assigns_id_and_detach_recycles() {
        run_attached(|me| {
            assert!(me.is_initialized());
            assert_eq!(vmsync_current_thread(), me);
            let sync = MockThread::sync(me);
            assert_ne!(sync.thin_lock_id(), 0);
            assert_eq!(sync.state(), ThreadState::Runnable);
            assert!(MockVM::sync().threads.contains(me));
            assert_eq!(
                MockVM::sync().threads.find_by_id(sync.thin_lock_id()),
                Some(me)
            );
        });
        assert!(!vmsync_current_thread().is_initialized());
    }
}
