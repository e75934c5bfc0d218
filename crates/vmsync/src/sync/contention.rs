//! Sampled contention diagnostics.
//!
//! Every contended acquisition is a sampling candidate; the probability of
//! emitting a record scales with the stall length relative to the configured
//! threshold, reaching 100% at the threshold and never dropping below 1%.
//! This keeps log volume bounded on hot locks while still surfacing the
//! worst offenders reliably.

use std::fmt;
use std::time::Duration;

use crate::objectmodel::ObjectReference;
use crate::runtime::threads::{Thread, VMThread};
use crate::{Runtime, ThreadOf};

/// A source location a host runtime can attribute lock activity to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LockSite {
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for LockSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

pub(crate) fn log_contention<R: Runtime>(
    current: VMThread,
    waited: Duration,
    threshold: Duration,
    held_site: Option<LockSite>,
    obj: ObjectReference,
) {
    let wait_ms = waited.as_millis() as u64;
    let sample_percent = sample_percent(wait_ms, threshold.as_millis() as u64);
    let roll = (unsafe { libc::rand() } as u32) % 100;
    if roll >= sample_percent {
        return;
    }
    match held_site {
        Some(site) => log::info!(target: "vmsync::contention",
            "{} waited {}ms on {} (sampled at {}%, held from {})",
            ThreadOf::<R>::describe(current), wait_ms, R::describe_object(obj),
            sample_percent, site),
        None => log::info!(target: "vmsync::contention",
            "{} waited {}ms on {} (sampled at {}%)",
            ThreadOf::<R>::describe(current), wait_ms, R::describe_object(obj),
            sample_percent),
    }
}

/// Probability (in percent) of logging a contended wait: proportional to the
/// stall, 100% at or past the threshold, and never zero so even short stalls
/// have a chance of showing up.
fn sample_percent(wait_ms: u64, threshold_ms: u64) -> u32 {
    let percent = (100 * wait_ms / threshold_ms.max(1)).min(100) as u32;
    percent.max(1)
}
