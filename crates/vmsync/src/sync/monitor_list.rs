//! Table of all inflated monitors.
//!
//! Lock words store a monitor's slot index rather than a pointer, so a stale
//! word can never be dereferenced; resolution goes through this table. The
//! collector calls [`MonitorList::sweep`] at a safepoint to drop monitors
//! whose objects died.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::objectmodel::lock_word::{MonitorId, MAX_MONITOR_ID};
use crate::objectmodel::ObjectReference;
use crate::sync::monitor::Monitor;
use crate::Runtime;

struct MonitorTable<R: Runtime> {
    entries: Vec<Option<Arc<Monitor<R>>>>,
    free: Vec<u32>,
}

pub struct MonitorList<R: Runtime> {
    table: Mutex<MonitorTable<R>>,
}

impl<R: Runtime> MonitorList<R> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(MonitorTable {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Allocate a slot and register the monitor `make` builds for it. The
    /// monitor is reachable through [`get`](Self::get) before this returns,
    /// which must happen before its id is published in any lock word.
    ///
    /// Panics if all 2^29 slots are occupied.
    pub fn register(&self, make: impl FnOnce(MonitorId) -> Arc<Monitor<R>>) -> Arc<Monitor<R>> {
        let mut table = self.table.lock();
        let slot = table.free.pop().unwrap_or_else(|| {
            table.entries.push(None);
            (table.entries.len() - 1) as u32
        });
        assert!(slot <= MAX_MONITOR_ID, "monitor table exhausted");
        let monitor = make(MonitorId(slot));
        debug_assert_eq!(monitor.id(), MonitorId(slot));
        table.entries[slot as usize] = Some(monitor.clone());
        monitor
    }

    pub fn get(&self, id: MonitorId) -> Option<Arc<Monitor<R>>> {
        self.table
            .lock()
            .entries
            .get(id.index())
            .and_then(|slot| slot.clone())
    }

    /// Drop every monitor whose object `is_marked` reports dead, freeing the
    /// slots for reuse. Must run at a safepoint: no mutator may hold or be
    /// acquiring a monitor whose object is dead. Returns the number of
    /// monitors swept.
    pub fn sweep(&self, mut is_marked: impl FnMut(ObjectReference) -> bool) -> usize {
        let mut table = self.table.lock();
        let MonitorTable { entries, free } = &mut *table;
        let mut swept = 0;
        for (slot, entry) in entries.iter_mut().enumerate() {
            let Some(monitor) = entry else { continue };
            if is_marked(monitor.object()) {
                continue;
            }
            log::debug!(target: "vmsync::monitor", "sweeping {} for dead {}",
                monitor.id(), R::describe_object(monitor.object()));
            *entry = None;
            free.push(slot as u32);
            swept += 1;
        }
        swept
    }

    /// Number of live monitors.
    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.entries.len() - table.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Runtime> Default for MonitorList<R> {
    fn default() -> Self {
        Self::new()
    }
}
