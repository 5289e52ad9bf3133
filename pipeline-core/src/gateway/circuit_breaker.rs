//! Per-provider circuit breaker state machine.
//!
//! A direct generalization of
//! `overpass_enrichment_worker::policy::WorkerPolicyState`'s embedded
//! `CircuitInternalState` to a registry keyed by provider name instead of
//! one breaker per worker: the closed/open/half-open transitions and the
//! `is_cooldown_elapsed` admission check are unchanged, only the storage
//! shape differs.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::domain::provider::{CircuitBreakerState, CircuitMode};

/// Circuit breaker tuning, sourced from `FailoverSettings`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub open_cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown: Duration::seconds(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Internal {
    Closed { consecutive_failures: u32 },
    Open { opened_at: DateTime<Utc> },
    HalfOpen { probe_in_flight: bool },
}

impl Default for Internal {
    fn default() -> Self {
        Self::Closed { consecutive_failures: 0 }
    }
}

fn is_cooldown_elapsed(opened_at: DateTime<Utc>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    now >= opened_at + cooldown
}

/// Tracks one circuit breaker per provider name.
pub struct CircuitBreakerRegistry {
    config: Mutex<CircuitConfig>,
    breakers: Mutex<HashMap<String, Internal>>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config: Mutex::new(config),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Rebind circuit breaker tuning. Applies to transitions computed after
    /// this call; existing breaker state is untouched.
    pub fn apply_config(&self, config: CircuitConfig) {
        *self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = config;
    }

    /// Whether a call to `provider` is admitted right now. A `true` result
    /// for a half-open breaker claims the single probe slot.
    pub fn admit(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let config = *self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut breakers = self.breakers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = breakers.entry(provider.to_owned()).or_default();
        match *state {
            Internal::Closed { .. } => true,
            Internal::Open { opened_at } if is_cooldown_elapsed(opened_at, now, config.open_cooldown) => {
                *state = Internal::HalfOpen { probe_in_flight: true };
                true
            }
            Internal::Open { .. } => false,
            Internal::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    false
                } else {
                    *state = Internal::HalfOpen { probe_in_flight: true };
                    true
                }
            }
        }
    }

    /// Record a successful call: closes the breaker and resets its failure
    /// count.
    pub fn record_success(&self, provider: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        breakers.insert(provider.to_owned(), Internal::Closed { consecutive_failures: 0 });
    }

    /// Record a failed call, possibly opening or reopening the breaker.
    pub fn record_failure(&self, provider: &str, now: DateTime<Utc>) {
        let config = *self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut breakers = self.breakers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = breakers.entry(provider.to_owned()).or_default();
        *state = match *state {
            Internal::Closed { consecutive_failures } => {
                let next = consecutive_failures.saturating_add(1);
                if next >= config.failure_threshold.max(1) {
                    Internal::Open { opened_at: now }
                } else {
                    Internal::Closed { consecutive_failures: next }
                }
            }
            Internal::HalfOpen { .. } => Internal::Open { opened_at: now },
            Internal::Open { opened_at } => Internal::Open { opened_at },
        };
    }

    /// A read-only snapshot of `provider`'s breaker, for scoring and
    /// observability.
    #[must_use]
    pub fn snapshot(&self, provider: &str) -> CircuitBreakerState {
        let config = *self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let breakers = self.breakers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match breakers.get(provider).copied().unwrap_or_default() {
            Internal::Closed { consecutive_failures } => CircuitBreakerState {
                mode: CircuitMode::Closed,
                failure_count: consecutive_failures,
                next_attempt_at: None,
            },
            Internal::Open { opened_at } => CircuitBreakerState {
                mode: CircuitMode::Open,
                failure_count: config.failure_threshold,
                next_attempt_at: Some(opened_at + config.open_cooldown),
            },
            Internal::HalfOpen { .. } => CircuitBreakerState {
                mode: CircuitMode::HalfOpen,
                failure_count: config.failure_threshold,
                next_attempt_at: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn registry(threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitConfig {
            failure_threshold: threshold,
            open_cooldown: Duration::seconds(30),
        })
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let registry = registry(2);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(registry.admit("openai", now));
        registry.record_failure("openai", now);
        assert_eq!(registry.snapshot("openai").mode, CircuitMode::Closed);
        registry.record_failure("openai", now);
        assert_eq!(registry.snapshot("openai").mode, CircuitMode::Open);
        assert!(!registry.admit("openai", now));
    }

    #[test]
    fn half_opens_after_cooldown_and_closes_on_success() {
        let registry = registry(1);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        registry.record_failure("openai", now);
        assert_eq!(registry.snapshot("openai").mode, CircuitMode::Open);

        let after_cooldown = now + Duration::seconds(31);
        assert!(registry.admit("openai", after_cooldown));
        assert_eq!(registry.snapshot("openai").mode, CircuitMode::HalfOpen);

        registry.record_success("openai");
        assert_eq!(registry.snapshot("openai").mode, CircuitMode::Closed);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_timeout() {
        let registry = registry(1);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        registry.record_failure("openai", now);
        let after_cooldown = now + Duration::seconds(31);
        assert!(registry.admit("openai", after_cooldown));
        registry.record_failure("openai", after_cooldown);
        let snapshot = registry.snapshot("openai");
        assert_eq!(snapshot.mode, CircuitMode::Open);
        assert_eq!(snapshot.next_attempt_at, Some(after_cooldown + Duration::seconds(30)));
    }

    #[test]
    fn half_open_admits_only_one_probe_at_a_time() {
        let registry = registry(1);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        registry.record_failure("openai", now);
        let after_cooldown = now + Duration::seconds(31);
        assert!(registry.admit("openai", after_cooldown));
        assert!(!registry.admit("openai", after_cooldown));
    }
}
