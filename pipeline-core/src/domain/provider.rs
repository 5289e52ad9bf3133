//! Provider descriptors and the runtime/circuit-breaker state the gateway
//! maintains for each registered provider.
//!
//! These are plain data types; the state machine that mutates
//! [`ProviderRuntimeState`] and [`CircuitBreakerState`] lives in
//! [`crate::gateway::circuit_breaker`], mirroring how
//! `WorkerPolicyState` separates policy data from the transition logic that
//! operates on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// A registered enrichment provider: its identity, supported models, and
/// per-model pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub supported_models: Vec<String>,
    pub pricing: BTreeMap<String, ModelPricing>,
}

/// Per-1k-token pricing for a single model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Health status derived from recent call and probe outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Healthy,
    Unhealthy,
}

/// A bounded ring buffer of recent samples, dropping the oldest entry once
/// `capacity` is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedRing<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedRing<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A single response-time/cost sample recorded on success.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CallSample {
    pub response_time_ms: u32,
    pub cost: Option<f64>,
}

/// Per-provider counters and history the gateway uses for scoring.
///
/// # Invariants
/// - `total_failures <= total_requests`.
/// - `recent_samples` never exceeds its configured capacity (default 100).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRuntimeState {
    pub status: ProviderHealth,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub ema_response_time_ms: f64,
    pub recent_samples: BoundedRing<CallSample>,
}

impl ProviderRuntimeState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: ProviderHealth::Healthy,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            total_requests: 0,
            total_failures: 0,
            ema_response_time_ms: 0.0,
            recent_samples: BoundedRing::new(100),
        }
    }

    /// Fraction of recorded requests that succeeded, or `1.0` when no
    /// requests have been recorded yet.
    #[must_use]
    #[allow(
        clippy::float_arithmetic,
        reason = "success rate is inherently a floating-point ratio of integer counters"
    )]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        #[allow(
            clippy::cast_precision_loss,
            reason = "request counters are far below f64's exact-integer range in practice"
        )]
        let (successes, total) = (
            (self.total_requests - self.total_failures) as f64,
            self.total_requests as f64,
        );
        successes / total
    }
}

impl Default for ProviderRuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitMode {
    Closed,
    Open,
    HalfOpen,
}

/// Per-provider circuit breaker state.
///
/// # Invariants
/// - While `mode == Open`, no calls are admitted until `now >=
///   next_attempt_at`, at which point the breaker transitions to `HalfOpen`.
/// - A single success while `HalfOpen` closes the breaker and resets
///   `failure_count`.
/// - A failure while `HalfOpen` reopens the breaker with a fresh
///   `next_attempt_at`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub mode: CircuitMode,
    pub failure_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    #[must_use]
    pub const fn closed() -> Self {
        Self {
            mode: CircuitMode::Closed,
            failure_count: 0,
            next_attempt_at: None,
        }
    }
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::closed()
    }
}

/// A content-addressed reference to the prompt template used to produce an
/// [`crate::domain::source::EnrichedRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplateRef {
    pub template_id: String,
    pub template_name: String,
    pub template_version: u32,
    pub prompt_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_ring_drops_oldest() {
        let mut ring: BoundedRing<u32> = BoundedRing::new(2);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        let collected: Vec<_> = ring.iter().copied().collect();
        assert_eq!(collected, vec![2, 3]);
    }

    #[test]
    fn success_rate_defaults_to_one_with_no_requests() {
        let state = ProviderRuntimeState::new();
        assert!((state.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn success_rate_reflects_failures() {
        let mut state = ProviderRuntimeState::new();
        state.total_requests = 4;
        state.total_failures = 1;
        assert!((state.success_rate() - 0.75).abs() < 1e-9);
    }
}
