//! Job lifecycle events, fanned out at-least-once and best-effort ordered.
//!
//! Subscribers receive events over a [`tokio::sync::broadcast`] channel. A
//! slow subscriber that falls behind the channel's capacity loses its
//! oldest unread events rather than stalling the publisher — the
//! drop-oldest backpressure policy this crate documents for every event
//! channel (job, provider, config).

use tokio::sync::broadcast;

/// A job lifecycle event, published by the job store.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Added { job_id: String },
    Started { job_id: String },
    Progress { job_id: String, percent: u8 },
    Completed { job_id: String },
    Failed { job_id: String, reason: String },
    Stalled { job_id: String },
    Removed { job_id: String },
    Retried { job_id: String },
    Paused,
    Resumed,
    Cleaned { completed_removed: usize, failed_removed: usize },
    Error { message: String },
}

/// Default channel capacity before the oldest unread event is dropped for a
/// lagging subscriber.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Create a fresh event channel, returning the sender the job store retains
/// and a receiver for the first subscriber.
#[must_use]
pub fn channel() -> (broadcast::Sender<JobEvent>, broadcast::Receiver<JobEvent>) {
    broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}
