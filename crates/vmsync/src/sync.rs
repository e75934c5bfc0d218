//! Object synchronization entry points.
//!
//! Every object starts with a thin lock packed into its header word; the
//! paths here handle the uncontended CAS fast path, recursion, saturation,
//! contention backoff, and the one-way inflation to a fat [`Monitor`] when
//! thin no longer suffices.

use std::time::Instant;

use thiserror::Error;

use crate::objectmodel::lock_word::{LockState, LockWord, MAX_THIN_LOCK_COUNT};
use crate::objectmodel::ObjectReference;
use crate::runtime::threads::{SuspendedScope, Thread, ThreadState, VMThread};
use crate::{Runtime, ThreadOf};

pub mod contention;
pub mod monitor;
pub mod monitor_list;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use monitor::Monitor;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// The calling thread does not own the lock required for the operation.
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(String),
    /// Negative or out-of-range wait timeout.
    #[error("timeout arguments out of range: ms={ms} ns={ns}")]
    IllegalArgument { ms: i64, ns: i32 },
    /// The thread was interrupted while waiting.
    #[error("thread interrupted while waiting")]
    Interrupted,
}

/// Acquire the object's monitor for the current thread, blocking until it is
/// available. Reentrant.
pub fn monitor_enter<R: Runtime>(obj: ObjectReference) {
    let current = R::current_thread();
    debug_assert!(current.is_initialized(), "monitor_enter from unattached thread");
    let sync = ThreadOf::<R>::sync(current);
    let thread_id = sync.thin_lock_id();

    loop {
        let word = obj.lock_word(Ordering::Relaxed);
        match word.state() {
            LockState::Unlocked => {
                let locked = LockWord::thin(thread_id, 0, word.hash_state());
                if obj.cas_lock_word_acquire(word, locked) {
                    return;
                }
                // Lost the race; reevaluate whatever won.
            }
            LockState::Thin { owner, count } if owner == thread_id => {
                if count == MAX_THIN_LOCK_COUNT {
                    // Recursion no longer fits the thin count field; go fat
                    // and let the monitor path record this acquisition.
                    inflate::<R>(current, obj, word);
                    continue;
                }
                // Only the owner mutates a thin word it holds, so a plain
                // store suffices here.
                obj.set_lock_word_relaxed(LockWord::thin(owner, count + 1, word.hash_state()));
                return;
            }
            LockState::Thin { .. } => {
                if spin_on_thin_lock::<R>(current, obj, thread_id) {
                    // We won the lock by CAS; inflate immediately so the
                    // other contenders stop spinning and queue on the mutex.
                    let word = obj.lock_word(Ordering::Relaxed);
                    inflate::<R>(current, obj, word);
                    return;
                }
                // Someone else inflated while we spun; take the fat path.
            }
            LockState::Fat { monitor } => {
                resolve_monitor::<R>(obj, monitor).lock(current);
                return;
            }
        }
    }
}

/// Backoff loop for a thin lock held by another thread. Returns true once
/// this thread owns the lock (thin, count 0), false if the lock went fat.
fn spin_on_thin_lock<R: Runtime>(
    current: VMThread,
    obj: ObjectReference,
    thread_id: u32,
) -> bool {
    let sync = ThreadOf::<R>::sync(current);
    let options = &R::sync().options;
    sync.set_blocked_on(Some(obj));
    let started = Instant::now();
    let mut sleep = options.min_spin_sleep;
    let mut iterations = 0u32;
    let acquired = {
        let _scope = SuspendedScope::new(sync, ThreadState::Blocked);
        loop {
            let word = obj.lock_word(Ordering::Relaxed);
            match word.state() {
                LockState::Unlocked => {
                    let locked = LockWord::thin(thread_id, 0, word.hash_state());
                    if obj.cas_lock_word_acquire(word, locked) {
                        break true;
                    }
                }
                LockState::Thin { .. } => {
                    if iterations == 0 {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(sleep);
                        sleep *= 2;
                        if sleep > options.max_spin_sleep {
                            sleep = options.min_spin_sleep;
                        }
                    }
                    iterations += 1;
                }
                LockState::Fat { .. } => break false,
            }
        }
    };
    sync.set_blocked_on(None);

    if acquired {
        let threshold = options.contention_log_threshold;
        if !threshold.is_zero() {
            contention::log_contention::<R>(current, started.elapsed(), threshold, None, obj);
        }
    }
    acquired
}

/// Release the object's monitor. Fails if the current thread does not own
/// it, with a message that reflects any owner races observed meanwhile.
pub fn monitor_exit<R: Runtime>(obj: ObjectReference) -> Result<(), MonitorError> {
    let current = R::current_thread();
    let thread_id = ThreadOf::<R>::sync(current).thin_lock_id();

    let word = obj.lock_word(Ordering::Relaxed);
    match word.state() {
        LockState::Unlocked => Err(MonitorError::IllegalMonitorState(
            failed_unlock_message::<R>(obj, 0),
        )),
        LockState::Thin { owner, count } => {
            if owner != thread_id {
                return Err(MonitorError::IllegalMonitorState(
                    failed_unlock_message::<R>(obj, owner),
                ));
            }
            if count == 0 {
                obj.set_lock_word_release(LockWord::unlocked(word.hash_state()));
            } else {
                // Still held by us afterwards; single-writer, no ordering
                // needed.
                obj.set_lock_word_relaxed(LockWord::thin(owner, count - 1, word.hash_state()));
            }
            Ok(())
        }
        LockState::Fat { monitor } => resolve_monitor::<R>(obj, monitor).unlock(current),
    }
}

/// `Object.wait`. A thin lock held by the caller is inflated first, since
/// waiting needs a wait set.
pub fn object_wait<R: Runtime>(
    obj: ObjectReference,
    ms: i64,
    ns: i32,
    interruptible: bool,
) -> Result<(), MonitorError> {
    with_owned_monitor::<R>(obj, "wait()", |monitor, current| {
        monitor.wait(current, ms, ns, interruptible)
    })
}

/// `Object.notify`. A thin lock held by the caller has no waiters yet the
/// protocol still inflates it, matching `wait`.
pub fn object_notify<R: Runtime>(obj: ObjectReference) -> Result<(), MonitorError> {
    with_owned_monitor::<R>(obj, "notify()", |monitor, current| monitor.notify(current))
}

/// `Object.notifyAll`.
pub fn object_notify_all<R: Runtime>(obj: ObjectReference) -> Result<(), MonitorError> {
    with_owned_monitor::<R>(obj, "notifyAll()", |monitor, current| {
        monitor.notify_all(current)
    })
}

/// Resolve the fat monitor for an object the current thread must own,
/// inflating a thin lock it holds.
fn with_owned_monitor<R: Runtime>(
    obj: ObjectReference,
    what: &str,
    f: impl FnOnce(&Monitor<R>, VMThread) -> Result<(), MonitorError>,
) -> Result<(), MonitorError> {
    let current = R::current_thread();
    let thread_id = ThreadOf::<R>::sync(current).thin_lock_id();

    let word = obj.lock_word(Ordering::Relaxed);
    let monitor = match word.state() {
        LockState::Thin { owner, .. } if owner == thread_id => inflate::<R>(current, obj, word),
        LockState::Fat { monitor } => resolve_monitor::<R>(obj, monitor),
        LockState::Unlocked | LockState::Thin { .. } => {
            return Err(MonitorError::IllegalMonitorState(format!(
                "object not locked by thread before {} on {}",
                what,
                R::describe_object(obj)
            )));
        }
    };
    f(&monitor, current)
}

/// The thread currently owning the object's lock, if any. Racy by nature;
/// intended for debuggers and diagnostics.
pub fn lock_owner_of<R: Runtime>(obj: ObjectReference) -> Option<VMThread> {
    match obj.lock_word(Ordering::Relaxed).state() {
        LockState::Unlocked => None,
        LockState::Thin { owner, .. } => R::sync().threads.find_by_id(owner),
        LockState::Fat { monitor } => R::sync().monitors.get(monitor)?.owner(),
    }
}

/// Replace a thin lock held by `current` with a fat monitor carrying the
/// same owner, recursion count, and hash bits. The monitor is registered in
/// the table before its id becomes visible in the lock word.
fn inflate<R: Runtime>(
    current: VMThread,
    obj: ObjectReference,
    word: LockWord,
) -> Arc<Monitor<R>> {
    let thin_count = match word.state() {
        LockState::Thin { owner, count } => {
            debug_assert_eq!(owner, ThreadOf::<R>::sync(current).thin_lock_id());
            count
        }
        _ => unreachable!("inflating a non-thin lock word"),
    };
    let monitor = R::sync()
        .monitors
        .register(|id| Monitor::new(id, current, obj, thin_count));
    // Only the thin owner reaches here, so no one else can write the word;
    // the release store publishes the fully initialized monitor.
    obj.set_lock_word_release(LockWord::fat(monitor.id(), word.hash_state()));
    log::debug!(target: "vmsync::monitor", "inflated {} to {}",
        R::describe_object(obj), monitor.id());
    monitor
}

fn resolve_monitor<R: Runtime>(
    obj: ObjectReference,
    id: crate::objectmodel::lock_word::MonitorId,
) -> Arc<Monitor<R>> {
    R::sync().monitors.get(id).unwrap_or_else(|| {
        panic!(
            "lock word of {} references swept {}",
            R::describe_object(obj),
            id
        )
    })
}

/// Compose the diagnostic for a failed unlock. The lock word is re-read so
/// the message can call out owners that changed while the failure was being
/// reported.
pub(crate) fn failed_unlock_message<R: Runtime>(obj: ObjectReference, found_owner: u32) -> String {
    let current_owner = owner_id_of::<R>(obj);
    let what = R::describe_object(obj);
    if found_owner == 0 {
        if current_owner == 0 {
            format!("unlock of unowned monitor on {what}")
        } else {
            format!(
                "unlock of monitor on {what} (originally believed unowned, now owned by {})",
                describe_thread_by_id::<R>(current_owner)
            )
        }
    } else if current_owner == 0 {
        format!(
            "unlock of monitor originally owned by {} on {what} (now unowned)",
            describe_thread_by_id::<R>(found_owner)
        )
    } else if current_owner != found_owner {
        format!(
            "unlock of monitor originally owned by {} on {what} (now owned by {})",
            describe_thread_by_id::<R>(found_owner),
            describe_thread_by_id::<R>(current_owner)
        )
    } else {
        format!(
            "unlock of monitor owned by {} on {what}",
            describe_thread_by_id::<R>(found_owner)
        )
    }
}

fn owner_id_of<R: Runtime>(obj: ObjectReference) -> u32 {
    match obj.lock_word(Ordering::Relaxed).state() {
        LockState::Unlocked => 0,
        LockState::Thin { owner, .. } => owner,
        LockState::Fat { monitor } => R::sync()
            .monitors
            .get(monitor)
            .and_then(|m| m.owner())
            .map_or(0, |t| ThreadOf::<R>::sync(t).thin_lock_id()),
    }
}

fn describe_thread_by_id<R: Runtime>(id: u32) -> String {
    match R::sync().threads.find_by_id(id) {
        Some(thread) => ThreadOf::<R>::describe(thread),
        None => format!("<defunct thread #{id}>"),
    }
}
