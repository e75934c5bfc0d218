//! Inflated (fat) monitors.
//!
//! A `Monitor` exists only for objects whose lock has seen contention,
//! recursion overflow, or a `wait()`. It pairs a raw mutex with explicit
//! owner/recursion bookkeeping and a FIFO wait set, so ownership can be
//! handed around the `wait` protocol without the mutex guard types getting
//! in the way.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{lock_api::RawMutex, Mutex};

use crate::objectmodel::lock_word::MonitorId;
use crate::objectmodel::ObjectReference;
use crate::runtime::threads::{SuspendedScope, Thread, ThreadState, VMThread};
use crate::sync::contention::{self, LockSite};
use crate::sync::MonitorError;
use crate::{Runtime, ThreadOf};

pub struct Monitor<R: Runtime> {
    id: MonitorId,
    obj: ObjectReference,
    lock: Mutex<()>,
    /// Raw [`VMThread`] of the owner, 0 when unowned. Only ever written by
    /// the thread acquiring or releasing `lock`.
    owner: AtomicUsize,
    /// Recursive acquisitions beyond the first. Only the owner touches it.
    lock_count: AtomicU32,
    /// Threads parked in `wait()`, in arrival order.
    wait_set: Mutex<VecDeque<VMThread>>,
    /// Where the current owner acquired the lock, for contention logs.
    locking_site: Mutex<Option<LockSite>>,
    marker: PhantomData<R>,
}

impl<R: Runtime> Monitor<R> {
    /// Create a monitor already owned by `owner`, taking over a thin lock
    /// with `thin_count` recursive acquisitions. The raw mutex is acquired
    /// here on behalf of the owner; the matching release happens in
    /// [`unlock`](Self::unlock) or [`wait`](Self::wait).
    pub(crate) fn new(
        id: MonitorId,
        owner: VMThread,
        obj: ObjectReference,
        thin_count: u32,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            id,
            obj,
            lock: Mutex::new(()),
            owner: AtomicUsize::new(0),
            lock_count: AtomicU32::new(0),
            wait_set: Mutex::new(VecDeque::new()),
            locking_site: Mutex::new(None),
            marker: PhantomData,
        });
        unsafe { monitor.lock.raw().lock() };
        monitor.install_owner(owner);
        monitor.lock_count.store(thin_count, Ordering::Relaxed);
        monitor
    }

    pub fn id(&self) -> MonitorId {
        self.id
    }

    pub fn object(&self) -> ObjectReference {
        self.obj
    }

    pub fn owner(&self) -> Option<VMThread> {
        let raw = self.owner.load(Ordering::Relaxed);
        (raw != 0).then(|| VMThread::from_raw(raw))
    }

    /// Recursion depth: 0 when unowned, 1 for a single acquisition.
    pub fn lock_depth(&self) -> u32 {
        if self.owner().is_some() {
            self.lock_count.load(Ordering::Relaxed) + 1
        } else {
            0
        }
    }

    fn install_owner(&self, thread: VMThread) {
        self.owner.store(thread.to_raw(), Ordering::Relaxed);
        self.lock_count.store(0, Ordering::Relaxed);
        *self.locking_site.lock() = ThreadOf::<R>::lock_site(thread);
    }

    /// Acquire the monitor for `current`, blocking in a GC-visible state if
    /// contended.
    pub fn lock(&self, current: VMThread) {
        if self.owner() == Some(current) {
            self.lock_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if unsafe { self.lock.raw().try_lock() } {
            self.install_owner(current);
            return;
        }

        let sync = ThreadOf::<R>::sync(current);
        let held_site = *self.locking_site.lock();
        sync.set_blocked_on(Some(self.obj));
        let started = Instant::now();
        {
            let _scope = SuspendedScope::new(sync, ThreadState::Blocked);
            unsafe { self.lock.raw().lock() };
        }
        sync.set_blocked_on(None);
        self.install_owner(current);

        let threshold = R::sync().options.contention_log_threshold;
        if !threshold.is_zero() {
            contention::log_contention::<R>(current, started.elapsed(), threshold, held_site, self.obj);
        }
    }

    /// Release one level of the monitor.
    pub fn unlock(&self, current: VMThread) -> Result<(), MonitorError> {
        if self.owner() != Some(current) {
            let found = self
                .owner()
                .map_or(0, |t| ThreadOf::<R>::sync(t).thin_lock_id());
            return Err(MonitorError::IllegalMonitorState(
                crate::sync::failed_unlock_message::<R>(self.obj, found),
            ));
        }
        if self.lock_count.load(Ordering::Relaxed) > 0 {
            self.lock_count.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.owner.store(0, Ordering::Relaxed);
            *self.locking_site.lock() = None;
            unsafe { self.lock.raw().unlock() };
        }
        Ok(())
    }

    /// Release the raw mutex from inside `wait`, after ownership bookkeeping
    /// has already been torn down.
    fn unlock_for_wait(&self) {
        debug_assert!(self.owner().is_none());
        debug_assert_eq!(self.lock_count.load(Ordering::Relaxed), 0);
        unsafe { self.lock.raw().unlock() };
    }

    /// `Object.wait`: release the monitor completely, park until notified,
    /// timed out, or interrupted, then reacquire at the saved depth.
    ///
    /// `ms`/`ns` of zero means wait without timeout. An interrupt always
    /// wakes the thread and consumes the flag; it surfaces as an error only
    /// when `interruptible` is true.
    pub fn wait(
        &self,
        current: VMThread,
        ms: i64,
        ns: i32,
        interruptible: bool,
    ) -> Result<(), MonitorError> {
        if self.owner() != Some(current) {
            return Err(MonitorError::IllegalMonitorState(format!(
                "object not locked by thread before wait() on {}",
                R::describe_object(self.obj)
            )));
        }
        if ms < 0 || ns < 0 || ns > 999_999 {
            return Err(MonitorError::IllegalArgument { ms, ns });
        }
        let timed = ms > 0 || ns > 0;
        // An unrepresentable deadline degrades to an untimed wait.
        let deadline = if timed {
            Instant::now().checked_add(Duration::from_millis(ms as u64) + Duration::new(0, ns as u32))
        } else {
            None
        };

        let sync = ThreadOf::<R>::sync(current);

        // Join the wait set while still owning the monitor, so a notify that
        // races with our release cannot miss us.
        self.wait_set.lock().push_back(current);

        let saved_count = self.lock_count.swap(0, Ordering::Relaxed);
        let saved_site = self.locking_site.lock().take();
        self.owner.store(0, Ordering::Relaxed);

        let was_interrupted;
        {
            let _scope = SuspendedScope::new(
                sync,
                if timed {
                    ThreadState::TimedWaiting
                } else {
                    ThreadState::Waiting
                },
            );
            let mut wd = sync.wait_lock.lock();
            debug_assert!(wd.wait_monitor.is_none());
            wd.wait_monitor = Some(self.id);
            // The monitor is released only after wait_monitor is published;
            // a notifier that pops us off the wait set will find it set and
            // signal our condvar.
            self.unlock_for_wait();

            if !wd.interrupted {
                match deadline {
                    Some(deadline) => {
                        let _ = sync.wait_cond.wait_until(&mut wd, deadline);
                    }
                    None => sync.wait_cond.wait(&mut wd),
                }
            }
            was_interrupted = wd.interrupted;
            wd.wait_monitor = None;
        }

        self.lock(current);
        self.lock_count.store(saved_count, Ordering::Relaxed);
        *self.locking_site.lock() = saved_site;

        // Unlink ourselves; on the notify path the notifier already did.
        self.wait_set.lock().retain(|t| *t != current);

        if was_interrupted {
            sync.wait_lock.lock().interrupted = false;
            if interruptible {
                return Err(MonitorError::Interrupted);
            }
        }
        Ok(())
    }

    /// Wake the longest-waiting thread still parked on this monitor.
    pub fn notify(&self, current: VMThread) -> Result<(), MonitorError> {
        self.check_notify_owner(current, "notify()")?;
        loop {
            let target = self.wait_set.lock().pop_front();
            let Some(target) = target else {
                return Ok(());
            };
            let sync = ThreadOf::<R>::sync(target);
            let wd = sync.wait_lock.lock();
            if wd.wait_monitor == Some(self.id) {
                sync.wait_cond.notify_one();
                return Ok(());
            }
            // Target already woke (timeout or interrupt) and will unlink
            // itself; spend the notification on the next waiter instead.
        }
    }

    /// Wake every thread parked on this monitor.
    pub fn notify_all(&self, current: VMThread) -> Result<(), MonitorError> {
        self.check_notify_owner(current, "notifyAll()")?;
        loop {
            let target = self.wait_set.lock().pop_front();
            let Some(target) = target else {
                return Ok(());
            };
            let sync = ThreadOf::<R>::sync(target);
            let wd = sync.wait_lock.lock();
            if wd.wait_monitor == Some(self.id) {
                sync.wait_cond.notify_one();
            }
        }
    }

    fn check_notify_owner(&self, current: VMThread, what: &str) -> Result<(), MonitorError> {
        if self.owner() != Some(current) {
            return Err(MonitorError::IllegalMonitorState(format!(
                "object not locked by thread before {what} on {}",
                R::describe_object(self.obj)
            )));
        }
        Ok(())
    }

    /// Threads currently in the wait set. Racy; for diagnostics and tests.
    pub fn waiter_count(&self) -> usize {
        self.wait_set.lock().len()
    }
}

impl<R: Runtime> Drop for Monitor<R> {
    fn drop(&mut self) {
        debug_assert!(self.owner().is_none(), "monitor dropped while owned");
        debug_assert!(
            self.wait_set.get_mut().is_empty(),
            "monitor dropped with parked waiters"
        );
    }
}
