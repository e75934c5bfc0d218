//! Stop-the-world handshake, isolated in its own binary so no unrelated
//! runnable test thread can stall the collector side.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use vmsync::mock::{run_attached, MockThread, MockVM};
use vmsync::runtime::threads::{Thread, VMThread};
use vmsync::{
    monitor_enter, monitor_exit, object_notify, object_wait, ObjectHeader, ObjectReference,
    Runtime,
};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn stop_the_world_blocks_runnable_and_skips_parked_threads() {
    let _ = env_logger::builder().is_test(true).try_init();
    let vm = MockVM::sync();
    let obj =
        ObjectReference::from_header(Box::leak(Box::new(ObjectHeader::new())));
    let ticks = &AtomicUsize::new(0);
    let stop = &AtomicBool::new(false);

    std::thread::scope(|s| {
        let (mutator_tx, mutator_rx) = mpsc::channel::<usize>();
        let (waiter_tx, waiter_rx) = mpsc::channel::<usize>();

        // A mutator that only yields to the collector at safepoint polls.
        s.spawn(move || {
            run_attached(|me| {
                mutator_tx.send(me.to_raw()).unwrap();
                let sync = MockThread::sync(me);
                while !stop.load(Ordering::Relaxed) {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    sync.safepoint_poll();
                }
            });
        });
        // A waiter parked in wait(); GC-safe without ever polling.
        s.spawn(move || {
            run_attached(|me| {
                waiter_tx.send(me.to_raw()).unwrap();
                monitor_enter::<MockVM>(obj);
                object_wait::<MockVM>(obj, 0, 0, true).unwrap();
                monitor_exit::<MockVM>(obj).unwrap();
            });
        });

        let _mutator = VMThread::from_raw(mutator_rx.recv().unwrap());
        let waiter = VMThread::from_raw(waiter_rx.recv().unwrap());
        wait_until("waiter to park", || {
            MockThread::sync(waiter).waiting_on().is_some()
        });

        // This thread is unattached and plays the collector. The handshake
        // must return even though the waiter never polls.
        vm.threads.block_all_for_gc();

        let frozen = ticks.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            ticks.load(Ordering::Relaxed),
            frozen,
            "mutator made progress during stop-the-world"
        );

        vm.threads.unblock_all_after_gc();
        wait_until("mutator to resume", || {
            ticks.load(Ordering::Relaxed) > frozen
        });

        run_attached(|_| {
            monitor_enter::<MockVM>(obj);
            object_notify::<MockVM>(obj).unwrap();
            monitor_exit::<MockVM>(obj).unwrap();
        });
        stop.store(true, Ordering::Relaxed);
    });
}
