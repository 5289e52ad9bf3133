//! Retention caps applied by `clean(grace)`.

use chrono::Duration;

/// How many completed/failed records to retain, applied when `clean` is
/// called. Older records beyond the grace window, and records beyond the
/// cap even within the grace window, are purged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub completed_cap: usize,
    pub failed_cap: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_cap: 100,
            failed_cap: 50,
        }
    }
}

/// The outcome of a `clean` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanReport {
    pub completed_removed: usize,
    pub failed_removed: usize,
}

/// Default grace period used when a caller does not specify one.
pub const DEFAULT_GRACE: Duration = Duration::hours(24);
