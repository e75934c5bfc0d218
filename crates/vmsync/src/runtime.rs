//! The seam between the host runtime and the synchronization subsystem.
//!
//! A host implements [`Runtime`] once, hands out `&'static VMSync<Self>`
//! through [`Runtime::sync`], and the monitor entry points in [`crate::sync`]
//! take it from there.

use crate::objectmodel::ObjectReference;
use crate::sync::monitor_list::MonitorList;

pub mod options;
pub mod threads;

use options::SyncOptions;
use threads::{Thread, Threads, VMThread};

pub trait Runtime: 'static + Default + Send + Sync {
    type Thread: Thread<Self>;

    /// The shared synchronization state for this runtime. Typically backed by
    /// a `LazyLock` static.
    fn sync() -> &'static VMSync<Self>;

    /// Handle of the thread executing the call. The default reads the
    /// thread-local set by [`Threads::attach`]; hosts with their own
    /// current-thread mechanism can override it.
    fn current_thread() -> VMThread {
        threads::vmsync_current_thread()
    }

    /// Description of an object for error messages and contention logs.
    fn describe_object(object: ObjectReference) -> String {
        format!("object@{:#x}", object.to_raw())
    }
}

/// Alias to shorten `<R as Runtime>::Thread` at call sites.
pub type ThreadOf<R> = <R as Runtime>::Thread;

/// Top-level synchronization state: the thread registry, the table of
/// inflated monitors, and the tunables.
pub struct VMSync<R: Runtime> {
    pub threads: Threads<R>,
    pub monitors: MonitorList<R>,
    pub options: SyncOptions,
}

impl<R: Runtime> VMSync<R> {
    pub fn builder() -> VMSyncBuilder {
        VMSyncBuilder::new()
    }
}

pub struct VMSyncBuilder {
    options: SyncOptions,
}

impl VMSyncBuilder {
    pub fn new() -> Self {
        Self {
            options: SyncOptions::default(),
        }
    }

    pub fn from_env() -> Self {
        Self {
            options: SyncOptions::from_env(),
        }
    }

    pub fn contention_log_threshold(mut self, threshold: std::time::Duration) -> Self {
        self.options.contention_log_threshold = threshold;
        self
    }

    pub fn build<R: Runtime>(self) -> VMSync<R> {
        VMSync {
            threads: Threads::new(),
            monitors: MonitorList::new(),
            options: self.options,
        }
    }
}

impl Default for VMSyncBuilder {
    fn default() -> Self {
        Self::new()
    }
}
