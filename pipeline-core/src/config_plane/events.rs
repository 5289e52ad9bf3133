//! Config plane lifecycle events, fanned out at-least-once and best-effort
//! ordered, on the same [`tokio::sync::broadcast`] drop-oldest channel
//! shape used by [`crate::queue::events`] and [`crate::gateway::events`].

use tokio::sync::broadcast;

use crate::domain::config::ConfigType;

/// A config plane lifecycle event, published as snapshots are loaded,
/// validated, applied, rolled back, or removed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    /// A new snapshot for `config_type` was validated, fanned out to every
    /// registered component, and committed.
    Applied { config_type: ConfigType, version: u64 },
    /// A file failed to parse, interpolate, or validate against its type
    /// schema; the previous snapshot remains authoritative.
    Rejected { config_type: ConfigType, reason: String },
    /// At least one component rejected the new value; the plane rolled the
    /// previous value back out to every component.
    RolledBack { config_type: ConfigType, reason: String },
    /// Rollback itself failed on at least one component after a rejected
    /// apply; that component may now be out of sync with the others.
    RollbackFailed { config_type: ConfigType, reason: String },
    /// A configuration file was deleted and `handleConfigRemoval` was
    /// fanned out (no rollback applies to removals).
    Removed { config_type: ConfigType },
    /// An error outside the per-type lifecycle (unreadable directory,
    /// watcher failure) that does not map to a single `config_type`.
    Error { message: String },
}

/// Default channel capacity before the oldest unread event is dropped for a
/// lagging subscriber.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Create a fresh event channel, returning the sender the config plane
/// retains and a receiver for the first subscriber.
#[must_use]
pub fn channel() -> (broadcast::Sender<ConfigEvent>, broadcast::Receiver<ConfigEvent>) {
    broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}
