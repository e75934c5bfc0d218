use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use vmsync::lock_word::{LockState, MAX_THIN_LOCK_COUNT};
use vmsync::mock::{run_attached, MockThread, MockVM};
use vmsync::runtime::threads::{Thread, VMThread};
use vmsync::{
    lock_owner_of, monitor_enter, monitor_exit, object_notify, object_notify_all, object_wait,
    MonitorError, ObjectHeader, ObjectReference, Runtime,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_object() -> ObjectReference {
    ObjectReference::from_header(Box::leak(Box::new(ObjectHeader::new())))
}

fn waiter_count(obj: ObjectReference) -> usize {
    match obj.lock_word(Ordering::Relaxed).state() {
        LockState::Fat { monitor } => MockVM::sync()
            .monitors
            .get(monitor)
            .map_or(0, |m| m.waiter_count()),
        _ => 0,
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn thin_lock_recursion_and_release() {
    init_logs();
    let obj = new_object();
    run_attached(|me| {
        monitor_enter::<MockVM>(obj);
        monitor_enter::<MockVM>(obj);
        monitor_enter::<MockVM>(obj);
        match obj.lock_word(Ordering::Relaxed).state() {
            LockState::Thin { count, .. } => assert_eq!(count, 2),
            other => panic!("expected a thin lock, got {other:?}"),
        }
        assert_eq!(lock_owner_of::<MockVM>(obj), Some(me));
        for _ in 0..3 {
            monitor_exit::<MockVM>(obj).unwrap();
        }
        assert_eq!(obj.lock_word(Ordering::Relaxed).state(), LockState::Unlocked);
        assert!(lock_owner_of::<MockVM>(obj).is_none());
    });
}

#[test]
fn contended_increments_are_serialized() {
    init_logs();
    struct Guarded(UnsafeCell<usize>);
    unsafe impl Sync for Guarded {}

    let obj = new_object();
    let slot = &Guarded(UnsafeCell::new(0));
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(move || {
                run_attached(|_| {
                    for _ in 0..1000 {
                        monitor_enter::<MockVM>(obj);
                        // a non-atomic increment; only mutual exclusion keeps
                        // this value correct
                        unsafe { *slot.0.get() += 1 };
                        monitor_exit::<MockVM>(obj).unwrap();
                    }
                });
            });
        }
    });
    assert_eq!(unsafe { *slot.0.get() }, 8000);
    assert!(obj.lock_word(Ordering::Relaxed).is_fat());
}

#[test]
fn recursive_owner_excludes_until_last_exit() {
    init_logs();
    let obj = new_object();
    let b_acquired = &AtomicBool::new(false);
    std::thread::scope(|s| {
        run_attached(|_| {
            for _ in 0..3 {
                monitor_enter::<MockVM>(obj);
            }
            let b = s.spawn(move || {
                run_attached(|_| {
                    monitor_enter::<MockVM>(obj);
                    b_acquired.store(true, Ordering::SeqCst);
                    monitor_exit::<MockVM>(obj).unwrap();
                });
            });
            std::thread::sleep(Duration::from_millis(50));
            monitor_exit::<MockVM>(obj).unwrap();
            monitor_exit::<MockVM>(obj).unwrap();
            // two of three exits done; the lock is still ours
            std::thread::sleep(Duration::from_millis(50));
            assert!(!b_acquired.load(Ordering::SeqCst));
            monitor_exit::<MockVM>(obj).unwrap();
            b.join().unwrap();
            assert!(b_acquired.load(Ordering::SeqCst));
        });
    });
}

#[test]
fn recursion_overflow_inflates() {
    init_logs();
    let obj = new_object();
    run_attached(|me| {
        let depth = MAX_THIN_LOCK_COUNT as usize + 2;
        for _ in 0..depth {
            monitor_enter::<MockVM>(obj);
        }
        assert!(obj.lock_word(Ordering::Relaxed).is_fat());
        assert_eq!(lock_owner_of::<MockVM>(obj), Some(me));
        for _ in 0..depth {
            monitor_exit::<MockVM>(obj).unwrap();
        }
        // inflation is one-way
        assert!(obj.lock_word(Ordering::Relaxed).is_fat());
        assert!(lock_owner_of::<MockVM>(obj).is_none());
        monitor_enter::<MockVM>(obj);
        monitor_exit::<MockVM>(obj).unwrap();
    });
}

#[test]
fn notify_wakes_waiters_in_fifo_order() {
    init_logs();
    let obj = new_object();
    let order = &Mutex::new(Vec::new());
    std::thread::scope(|s| {
        for k in 0..3usize {
            s.spawn(move || {
                run_attached(|_| {
                    monitor_enter::<MockVM>(obj);
                    object_wait::<MockVM>(obj, 0, 0, true).unwrap();
                    order.lock().unwrap().push(k);
                    monitor_exit::<MockVM>(obj).unwrap();
                });
            });
            // make arrival order deterministic
            wait_until("waiter to join the wait set", || waiter_count(obj) == k + 1);
        }
        run_attached(|_| {
            for expected in 0..3usize {
                monitor_enter::<MockVM>(obj);
                object_notify::<MockVM>(obj).unwrap();
                monitor_exit::<MockVM>(obj).unwrap();
                wait_until("woken waiter to record itself", || {
                    order.lock().unwrap().len() == expected + 1
                });
                assert_eq!(order.lock().unwrap()[expected], expected);
            }
        });
    });
}

#[test]
fn notify_all_wakes_every_waiter() {
    init_logs();
    let obj = new_object();
    let order = &Mutex::new(Vec::new());
    std::thread::scope(|s| {
        for k in 0..4usize {
            s.spawn(move || {
                run_attached(|_| {
                    monitor_enter::<MockVM>(obj);
                    object_wait::<MockVM>(obj, 0, 0, true).unwrap();
                    order.lock().unwrap().push(k);
                    monitor_exit::<MockVM>(obj).unwrap();
                });
            });
            wait_until("waiter to join the wait set", || waiter_count(obj) == k + 1);
        }
        run_attached(|_| {
            monitor_enter::<MockVM>(obj);
            object_notify_all::<MockVM>(obj).unwrap();
            monitor_exit::<MockVM>(obj).unwrap();
        });
        wait_until("all waiters to wake", || order.lock().unwrap().len() == 4);
        assert_eq!(waiter_count(obj), 0);
    });
}

#[test]
fn timed_wait_expires_and_keeps_ownership() {
    init_logs();
    let obj = new_object();
    run_attached(|me| {
        monitor_enter::<MockVM>(obj);
        let started = Instant::now();
        object_wait::<MockVM>(obj, 50, 0, true).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(lock_owner_of::<MockVM>(obj), Some(me));
        monitor_exit::<MockVM>(obj).unwrap();
    });
}

#[test]
fn notify_beats_timeout() {
    init_logs();
    let obj = new_object();
    std::thread::scope(|s| {
        let waiter = s.spawn(move || {
            run_attached(|_| {
                monitor_enter::<MockVM>(obj);
                let started = Instant::now();
                object_wait::<MockVM>(obj, 10_000, 0, true).unwrap();
                let elapsed = started.elapsed();
                monitor_exit::<MockVM>(obj).unwrap();
                elapsed
            })
        });
        wait_until("waiter to park", || waiter_count(obj) == 1);
        run_attached(|_| {
            monitor_enter::<MockVM>(obj);
            object_notify::<MockVM>(obj).unwrap();
            monitor_exit::<MockVM>(obj).unwrap();
        });
        let elapsed = waiter.join().unwrap();
        assert!(elapsed < Duration::from_secs(5), "woke after {elapsed:?}");
    });
}

#[test]
fn illegal_states_are_reported() {
    init_logs();
    let obj = new_object();
    run_attached(|_| {
        // operations on an unlocked object
        assert!(matches!(
            monitor_exit::<MockVM>(obj),
            Err(MonitorError::IllegalMonitorState(_))
        ));
        assert!(matches!(
            object_wait::<MockVM>(obj, 0, 0, true),
            Err(MonitorError::IllegalMonitorState(_))
        ));
        assert!(matches!(
            object_notify::<MockVM>(obj),
            Err(MonitorError::IllegalMonitorState(_))
        ));
        assert!(matches!(
            object_notify_all::<MockVM>(obj),
            Err(MonitorError::IllegalMonitorState(_))
        ));

        // bad timeouts, reported before the lock is released
        monitor_enter::<MockVM>(obj);
        for (ms, ns) in [(-1i64, 0i32), (0, -1), (0, 1_000_000)] {
            assert!(matches!(
                object_wait::<MockVM>(obj, ms, ns, true),
                Err(MonitorError::IllegalArgument { .. })
            ));
        }
        // notify on a thin lock we own has no waiters; it succeeds but
        // inflates, like wait does
        object_notify::<MockVM>(obj).unwrap();
        assert!(obj.lock_word(Ordering::Relaxed).is_fat());
        monitor_exit::<MockVM>(obj).unwrap();
    });
}

#[test]
fn notify_errors_name_the_failing_operation() {
    init_logs();
    let obj = new_object();
    run_attached(|_| {
        // inflate, then release, so the ownership check happens on the
        // monitor itself
        monitor_enter::<MockVM>(obj);
        object_wait::<MockVM>(obj, 1, 0, true).unwrap();
        monitor_exit::<MockVM>(obj).unwrap();
        assert!(obj.lock_word(Ordering::Relaxed).is_fat());

        match object_notify::<MockVM>(obj).unwrap_err() {
            MonitorError::IllegalMonitorState(msg) => {
                assert!(msg.contains("notify()"), "got: {msg}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        match object_notify_all::<MockVM>(obj).unwrap_err() {
            MonitorError::IllegalMonitorState(msg) => {
                assert!(msg.contains("notifyAll()"), "got: {msg}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    });
}

#[test]
fn unlock_by_non_owner_is_rejected() {
    init_logs();
    let obj = new_object();
    std::thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        s.spawn(move || {
            run_attached(|_| {
                monitor_enter::<MockVM>(obj);
                tx.send(()).unwrap();
                done_rx.recv().unwrap();
                monitor_exit::<MockVM>(obj).unwrap();
            });
        });
        rx.recv().unwrap();
        run_attached(|_| {
            let err = monitor_exit::<MockVM>(obj).unwrap_err();
            match err {
                MonitorError::IllegalMonitorState(msg) => {
                    assert!(msg.contains("unlock of monitor owned by"), "got: {msg}");
                }
                other => panic!("unexpected error {other:?}"),
            }
        });
        done_tx.send(()).unwrap();
    });
}

#[test]
fn pending_interrupt_short_circuits_wait() {
    init_logs();
    let obj = new_object();
    run_attached(|me| {
        let sync = MockThread::sync(me);
        sync.interrupt();
        monitor_enter::<MockVM>(obj);
        let started = Instant::now();
        assert!(matches!(
            object_wait::<MockVM>(obj, 0, 0, true),
            Err(MonitorError::Interrupted)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        // the flag was consumed with the error
        assert!(!sync.interrupt_requested());
        assert_eq!(lock_owner_of::<MockVM>(obj), Some(me));
        monitor_exit::<MockVM>(obj).unwrap();
    });
}

#[test]
fn uninterruptible_wait_swallows_interrupt_but_clears_flag() {
    init_logs();
    let obj = new_object();
    run_attached(|me| {
        let sync = MockThread::sync(me);
        sync.interrupt();
        monitor_enter::<MockVM>(obj);
        // wakes immediately, reports nothing, consumes the flag
        object_wait::<MockVM>(obj, 0, 0, false).unwrap();
        assert!(!sync.interrupt_requested());
        monitor_exit::<MockVM>(obj).unwrap();
    });
}

#[test]
fn interrupt_wakes_parked_waiter() {
    init_logs();
    let obj = new_object();
    std::thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        s.spawn(move || {
            run_attached(|me| {
                monitor_enter::<MockVM>(obj);
                tx.send(me.to_raw()).unwrap();
                assert!(matches!(
                    object_wait::<MockVM>(obj, 0, 0, true),
                    Err(MonitorError::Interrupted)
                ));
                monitor_exit::<MockVM>(obj).unwrap();
            });
        });
        let handle = VMThread::from_raw(rx.recv().unwrap());
        let sync = MockThread::sync(handle);
        wait_until("waiter to park", || sync.waiting_on().is_some());
        sync.interrupt();
    });
}

#[test]
fn interrupt_wakes_parked_uninterruptible_waiter() {
    init_logs();
    let obj = new_object();
    std::thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        s.spawn(move || {
            run_attached(|me| {
                monitor_enter::<MockVM>(obj);
                tx.send(me.to_raw()).unwrap();
                // wakes without reporting the interrupt, but still consumes
                // the flag
                object_wait::<MockVM>(obj, 0, 0, false).unwrap();
                assert!(!MockThread::sync(me).interrupt_requested());
                monitor_exit::<MockVM>(obj).unwrap();
            });
        });
        let handle = VMThread::from_raw(rx.recv().unwrap());
        let sync = MockThread::sync(handle);
        wait_until("waiter to park", || sync.waiting_on().is_some());
        sync.interrupt();
    });
}

#[test]
fn sweep_drops_monitors_of_dead_objects() {
    init_logs();
    let dead = new_object();
    let live = new_object();
    run_attached(|_| {
        for obj in [dead, live] {
            monitor_enter::<MockVM>(obj);
            // a timed wait inflates the lock
            object_wait::<MockVM>(obj, 1, 0, true).unwrap();
            monitor_exit::<MockVM>(obj).unwrap();
        }
    });
    let dead_id = match dead.lock_word(Ordering::Relaxed).state() {
        LockState::Fat { monitor } => monitor,
        other => panic!("expected fat lock, got {other:?}"),
    };
    let live_id = match live.lock_word(Ordering::Relaxed).state() {
        LockState::Fat { monitor } => monitor,
        other => panic!("expected fat lock, got {other:?}"),
    };

    let vm = MockVM::sync();
    // everything except `dead` is treated as marked
    assert_eq!(vm.monitors.sweep(|obj| obj != dead), 1);
    assert!(vm.monitors.get(dead_id).is_none());
    assert!(vm.monitors.get(live_id).is_some());
    // sweeping again finds nothing new
    assert_eq!(vm.monitors.sweep(|obj| obj != dead), 0);
    // the live monitor keeps working
    run_attached(|_| {
        monitor_enter::<MockVM>(live);
        monitor_exit::<MockVM>(live).unwrap();
    });
}
