use std::time::Duration;

/// Tunables for the synchronization subsystem.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Stall length at which a contended acquisition is always logged.
    /// Shorter stalls are sampled in proportion to this threshold. Zero
    /// disables sampling entirely.
    pub contention_log_threshold: Duration,
    /// First sleep interval of the thin-lock contention backoff.
    pub min_spin_sleep: Duration,
    /// Backoff cap; once reached the interval wraps back to the minimum.
    pub max_spin_sleep: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            contention_log_threshold: Duration::from_millis(100),
            min_spin_sleep: Duration::from_millis(1),
            max_spin_sleep: Duration::from_secs(1),
        }
    }
}

impl SyncOptions {
    /// Defaults overridden by `VMSYNC_CONTENTION_LOG_THRESHOLD_MS` when set.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(value) = std::env::var("VMSYNC_CONTENTION_LOG_THRESHOLD_MS") {
            if let Ok(ms) = value.parse::<u64>() {
                options.contention_log_threshold = Duration::from_millis(ms);
            }
        }
        options
    }
}
