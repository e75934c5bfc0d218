//! Thin/fat object synchronization for language runtimes.
//!
//! Every object carries a 32-bit lock word in its header. Uncontended
//! locking is a single CAS installing a thin lock (owner id plus recursion
//! count); contention, recursion overflow, or `wait()` inflate it to a fat
//! [`sync::monitor::Monitor`] registered in a global table, and the word
//! then permanently holds the monitor's id. A host runtime plugs in by
//! implementing [`Runtime`] and embedding a
//! [`runtime::threads::ThreadSyncData`] in each of its threads.

pub mod mock;
pub mod objectmodel;
pub mod runtime;
pub mod sync;

pub use objectmodel::{lock_word, ObjectHeader, ObjectReference};
pub use runtime::{Runtime, ThreadOf, VMSync, VMSyncBuilder};
pub use sync::{
    lock_owner_of, monitor_enter, monitor_exit, object_notify, object_notify_all, object_wait,
    MonitorError,
};
