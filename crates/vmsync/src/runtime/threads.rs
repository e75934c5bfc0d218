//! VM thread handles and the GC-cooperation protocol the monitor code relies
//! on.
//!
//! A thread that is about to block or spin inside the monitor subsystem must
//! first publish a suspended-equivalent state ([`ThreadState::Blocked`],
//! [`ThreadState::Waiting`], [`ThreadState::TimedWaiting`]) so a collector
//! can treat it as stopped without waiting for it to reach a safepoint poll.
//! [`SuspendedScope`] does the bookkeeping on both ends and cooperates with a
//! pending stop-the-world request on the way back to runnable.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::objectmodel::lock_word::{MonitorId, MAX_THIN_LOCK_OWNER};
use crate::objectmodel::ObjectReference;
use crate::sync::contention::LockSite;
use crate::{Runtime, ThreadOf};

/// Opaque handle to a runtime thread: the address of whatever structure the
/// host runtime keeps per thread, from which [`Thread::sync`] can recover the
/// [`ThreadSyncData`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct VMThread(usize);

impl VMThread {
    pub const UNINITIALIZED: VMThread = VMThread(0);

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> usize {
        self.0
    }

    pub fn is_initialized(self) -> bool {
        self.0 != 0
    }
}

/// The per-thread surface the monitor subsystem consumes from the host
/// runtime.
pub trait Thread<R: Runtime>: 'static {
    /// Access the synchronization state embedded in the runtime's thread
    /// structure. The returned reference must stay valid for as long as the
    /// thread is attached.
    fn sync<'a>(thread: VMThread) -> &'a ThreadSyncData;

    /// Short human-readable description used in error messages and
    /// contention logs.
    fn describe(thread: VMThread) -> String {
        format!("thread #{}", Self::sync(thread).thin_lock_id())
    }

    /// Best-effort snapshot of where the thread is currently executing, fed
    /// into contention diagnostics. `None` disables the location part of the
    /// log record.
    fn lock_site(_thread: VMThread) -> Option<LockSite> {
        None
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    /// Executing managed code; must reach a safepoint before a collector can
    /// treat it as stopped.
    Runnable = 1,
    /// Blocked acquiring a contended monitor (or spinning on a thin lock).
    Blocked = 2,
    /// Parked in an untimed `Object.wait`.
    Waiting = 3,
    /// Parked in a timed `Object.wait`.
    TimedWaiting = 4,
    Terminated = 5,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::New,
            1 => ThreadState::Runnable,
            2 => ThreadState::Blocked,
            3 => ThreadState::Waiting,
            4 => ThreadState::TimedWaiting,
            5 => ThreadState::Terminated,
            _ => unreachable!(),
        }
    }
}

impl ThreadState {
    /// States a collector treats as already stopped: the thread cannot
    /// return to managed code without passing through
    /// `transition_to_runnable` and honoring a pending block request.
    pub fn is_suspended_equivalent(self) -> bool {
        matches!(
            self,
            ThreadState::Blocked | ThreadState::Waiting | ThreadState::TimedWaiting
        )
    }
}

pub(crate) struct WaitData {
    /// The interrupt flag. Set by any thread via [`ThreadSyncData::interrupt`],
    /// consumed (and cleared) by `Monitor::wait`.
    pub interrupted: bool,
    /// While `Some`, the thread is committed to parking on `wait_cond` for
    /// this monitor and a notifier must signal the condvar to wake it.
    pub wait_monitor: Option<MonitorId>,
}

/// Synchronization state embedded in every attached thread.
pub struct ThreadSyncData {
    thin_lock_id: AtomicU32,
    state: AtomicU8,
    should_block_for_gc: AtomicBool,
    is_blocked_for_gc: AtomicBool,
    suspend_lock: Mutex<()>,
    suspend_cond: Condvar,
    pub(crate) wait_lock: Mutex<WaitData>,
    pub(crate) wait_cond: Condvar,
    blocked_on: AtomicUsize,
}

impl ThreadSyncData {
    pub fn new() -> Self {
        Self {
            thin_lock_id: AtomicU32::new(0),
            state: AtomicU8::new(ThreadState::New as u8),
            should_block_for_gc: AtomicBool::new(false),
            is_blocked_for_gc: AtomicBool::new(false),
            suspend_lock: Mutex::new(()),
            suspend_cond: Condvar::new(),
            wait_lock: Mutex::new(WaitData {
                interrupted: false,
                wait_monitor: None,
            }),
            wait_cond: Condvar::new(),
            blocked_on: AtomicUsize::new(0),
        }
    }

    /// The 16-bit id this thread installs in thin lock words. 0 until the
    /// thread is attached.
    pub fn thin_lock_id(&self) -> u32 {
        self.thin_lock_id.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Set the interrupt flag; wakes the thread if it is parked in `wait`.
    pub fn interrupt(&self) {
        let mut wd = self.wait_lock.lock();
        wd.interrupted = true;
        if wd.wait_monitor.is_some() {
            self.wait_cond.notify_one();
        }
    }

    /// True while the interrupt flag is pending.
    pub fn interrupt_requested(&self) -> bool {
        self.wait_lock.lock().interrupted
    }

    /// Monitor this thread is parked in `wait` on, if any.
    pub fn waiting_on(&self) -> Option<MonitorId> {
        self.wait_lock.lock().wait_monitor
    }

    /// Object this thread is trying to enter, if it is currently blocked or
    /// spinning on a contended lock.
    pub fn blocked_on(&self) -> Option<ObjectReference> {
        ObjectReference::from_raw(self.blocked_on.load(Ordering::Relaxed))
    }

    pub(crate) fn set_blocked_on(&self, obj: Option<ObjectReference>) {
        self.blocked_on
            .store(obj.map_or(0, |o| o.to_raw()), Ordering::Relaxed);
    }

    /// Cheap check mutators should sprinkle through long-running managed
    /// code; blocks here if a collector requested a stop.
    pub fn safepoint_poll(&self) {
        if self.should_block_for_gc.load(Ordering::Relaxed) {
            let mut guard = self.suspend_lock.lock();
            self.acknowledge_gc_request_locked();
            while self.is_blocked_for_gc.load(Ordering::Relaxed) {
                self.suspend_cond.wait(&mut guard);
            }
        }
    }

    fn acknowledge_gc_request_locked(&self) {
        if self.should_block_for_gc.load(Ordering::Relaxed) {
            self.is_blocked_for_gc.store(true, Ordering::Relaxed);
            self.should_block_for_gc.store(false, Ordering::Relaxed);
            self.suspend_cond.notify_all();
        }
    }

    /// Leave the runnable world for good, acknowledging any pending block
    /// request so a collector never waits on a terminating thread.
    fn begin_terminate(&self) {
        let _guard = self.suspend_lock.lock();
        self.set_state(ThreadState::Terminated);
        self.acknowledge_gc_request_locked();
    }

    fn transition_to_suspended(&self, state: ThreadState) {
        debug_assert!(state.is_suspended_equivalent());
        let _guard = self.suspend_lock.lock();
        self.set_state(state);
        self.acknowledge_gc_request_locked();
    }

    fn transition_to_runnable(&self) {
        let mut guard = self.suspend_lock.lock();
        loop {
            self.acknowledge_gc_request_locked();
            if !self.is_blocked_for_gc.load(Ordering::Relaxed) {
                break;
            }
            self.suspend_cond.wait(&mut guard);
        }
        self.set_state(ThreadState::Runnable);
    }
}

impl Default for ThreadSyncData {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard around every blocking or spinning section: publishes a
/// suspended-equivalent state on entry and restores runnable on every exit
/// path, waiting out any collector that stopped the world in between.
pub struct SuspendedScope<'a> {
    sync: &'a ThreadSyncData,
}

impl<'a> SuspendedScope<'a> {
    pub fn new(sync: &'a ThreadSyncData, state: ThreadState) -> Self {
        sync.transition_to_suspended(state);
        Self { sync }
    }
}

impl Drop for SuspendedScope<'_> {
    fn drop(&mut self) {
        self.sync.transition_to_runnable();
    }
}

struct ThreadRegistry {
    list: Vec<VMThread>,
    free_ids: Vec<u32>,
    next_id: u32,
}

/// Registry of attached threads. Owns thin-lock id allocation; ids are
/// recycled on detach so the 16-bit lock-word field is never exhausted by
/// thread churn, only by concurrently attached threads.
pub struct Threads<R: Runtime> {
    registry: Mutex<ThreadRegistry>,
    marker: PhantomData<R>,
}

impl<R: Runtime> Threads<R> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(ThreadRegistry {
                list: Vec::new(),
                free_ids: Vec::new(),
                next_id: 1,
            }),
            marker: PhantomData,
        }
    }

    /// Attach the calling thread. Assigns its thin-lock id and makes it the
    /// current thread for this OS thread.
    ///
    /// Panics if more than 65535 threads are attached at once; the lock-word
    /// owner field cannot represent more.
    pub fn attach(&self, thread: VMThread) {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.free_ids.pop().unwrap_or_else(|| {
                let id = registry.next_id;
                registry.next_id += 1;
                id
            });
            assert!(
                id <= MAX_THIN_LOCK_OWNER,
                "thin-lock id space exhausted: more than {} attached threads",
                MAX_THIN_LOCK_OWNER
            );
            registry.list.push(thread);
            id
        };
        let sync = ThreadOf::<R>::sync(thread);
        sync.thin_lock_id.store(id, Ordering::Relaxed);
        sync.set_state(ThreadState::Runnable);
        set_current_thread(thread);
        log::debug!(target: "vmsync::threads", "attached {} with thin-lock id {}",
            ThreadOf::<R>::describe(thread), id);
    }

    /// Detach the calling thread, recycling its thin-lock id. The thread must
    /// not own any monitor or sit in any wait set.
    pub fn detach(&self, thread: VMThread) {
        let sync = ThreadOf::<R>::sync(thread);
        debug_assert!(sync.waiting_on().is_none());
        // Leave Runnable before touching the registry lock; a collector may
        // hold it through a handshake and must not wait on us.
        sync.begin_terminate();
        let id = sync.thin_lock_id.swap(0, Ordering::Relaxed);
        {
            let mut registry = self.registry.lock();
            registry.list.retain(|t| *t != thread);
            registry.free_ids.push(id);
        }
        set_current_thread(VMThread::UNINITIALIZED);
    }

    pub fn contains(&self, thread: VMThread) -> bool {
        self.registry.lock().list.contains(&thread)
    }

    /// Resolve a thin-lock id back to the attached thread carrying it.
    pub fn find_by_id(&self, id: u32) -> Option<VMThread> {
        if id == 0 {
            return None;
        }
        self.registry
            .lock()
            .list
            .iter()
            .copied()
            .find(|&t| ThreadOf::<R>::sync(t).thin_lock_id() == id)
    }

    pub fn attached_count(&self) -> usize {
        self.registry.lock().list.len()
    }

    /// Visit every attached thread under the registry lock. `f` must not
    /// attach or detach threads.
    pub fn for_each(&self, mut f: impl FnMut(VMThread)) {
        for &thread in self.registry.lock().list.iter() {
            f(thread);
        }
    }

    /// Stop-the-world handshake: returns once every attached thread except
    /// the caller is either parked in a suspended-equivalent state or has
    /// acknowledged the block request at a safepoint poll. Must be paired
    /// with [`unblock_all_after_gc`](Self::unblock_all_after_gc).
    pub fn block_all_for_gc(&self) {
        let current = R::current_thread();
        let registry = self.registry.lock();
        for &thread in registry.list.iter() {
            if thread == current {
                continue;
            }
            let sync = ThreadOf::<R>::sync(thread);
            let mut guard = sync.suspend_lock.lock();
            if sync.is_blocked_for_gc.load(Ordering::Relaxed) {
                continue;
            }
            sync.should_block_for_gc.store(true, Ordering::Relaxed);
            loop {
                if sync.state() != ThreadState::Runnable {
                    // Already GC-safe: it cannot go runnable without taking
                    // suspend_lock and honoring the block flag.
                    sync.is_blocked_for_gc.store(true, Ordering::Relaxed);
                    sync.should_block_for_gc.store(false, Ordering::Relaxed);
                    break;
                }
                if sync.is_blocked_for_gc.load(Ordering::Relaxed) {
                    break;
                }
                sync.suspend_cond.wait(&mut guard);
            }
        }
    }

    pub fn unblock_all_after_gc(&self) {
        let current = R::current_thread();
        let registry = self.registry.lock();
        for &thread in registry.list.iter() {
            if thread == current {
                continue;
            }
            let sync = ThreadOf::<R>::sync(thread);
            let _guard = sync.suspend_lock.lock();
            sync.should_block_for_gc.store(false, Ordering::Relaxed);
            sync.is_blocked_for_gc.store(false, Ordering::Relaxed);
            sync.suspend_cond.notify_all();
        }
    }
}

impl<R: Runtime> Default for Threads<R> {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static THREAD: Cell<VMThread> = const { Cell::new(VMThread::UNINITIALIZED) };
}

/// Handle of the thread attached on this OS thread, or
/// [`VMThread::UNINITIALIZED`].
pub fn vmsync_current_thread() -> VMThread {
    THREAD.with(|t| t.get())
}

fn set_current_thread(thread: VMThread) {
    THREAD.with(|t| t.set(thread));
}
