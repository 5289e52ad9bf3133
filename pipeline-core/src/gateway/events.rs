//! Lifecycle events published by the provider gateway, mirroring how
//! [`crate::queue::events::JobEvent`] reports job lifecycle transitions on a
//! broadcast channel.

use tokio::sync::broadcast;

/// Bound on the gateway's event channel, matching the job store's.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A provider-gateway lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A completion call succeeded against `provider` for `model`.
    ExecutionSuccess { provider: String, model: String },
    /// A completion call against `provider` failed with `reason`.
    ProviderFailure { provider: String, reason: String },
    /// Every candidate provider was exhausted for a single `execute` call.
    AllProvidersFailed { reason: String },
    /// `provider`'s circuit breaker transitioned to open.
    CircuitBreakerOpened { provider: String },
    /// `provider`'s circuit breaker closed after a successful half-open
    /// probe.
    ProviderRecovered { provider: String },
}

/// Construct a gateway event channel with the default capacity.
#[must_use]
pub fn channel() -> (broadcast::Sender<ProviderEvent>, broadcast::Receiver<ProviderEvent>) {
    broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}
