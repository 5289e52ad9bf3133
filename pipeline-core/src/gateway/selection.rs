//! Weighted provider selection scoring.
//!
//! A pure function over a provider's runtime counters — no I/O, no shared
//! state — keeping the arithmetic separable from orchestration, the same
//! split `backoff::exponential_base_delay` uses.

use chrono::{DateTime, Duration, Utc};

use crate::domain::provider::ProviderRuntimeState;

/// Scoring weights, sourced from `FailoverSettings`. `default_weight` is the
/// additive base the formula starts from in place of a bare `1`, so a
/// config-supplied value of `0` can fully neutralize unscored candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub default_weight: f64,
    pub performance_weight: f64,
    pub cost_weight: f64,
    pub reliability_weight: f64,
    /// Cost per call above which the cost term saturates at zero benefit.
    pub cost_cap: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            default_weight: 1.0,
            performance_weight: 0.3,
            cost_weight: 0.2,
            reliability_weight: 0.5,
            cost_cap: 0.1,
        }
    }
}

const RESPONSE_TIME_CAP_MS: f64 = 10_000.0;
const RECENT_FAILURE_PENALTY_WINDOW: Duration = Duration::minutes(1);

#[allow(
    clippy::float_arithmetic,
    reason = "cost averaging is inherently floating point; inputs are small per-call dollar amounts"
)]
fn average_cost(state: &ProviderRuntimeState) -> f64 {
    let (sum, count) = state
        .recent_samples
        .iter()
        .filter_map(|sample| sample.cost)
        .fold((0.0, 0u32), |(sum, count), cost| (sum + cost, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / f64::from(count)
    }
}

#[allow(
    clippy::float_arithmetic,
    reason = "reliability blends a success ratio with small bounded bonus/penalty terms, all floating point by nature"
)]
fn reliability(state: &ProviderRuntimeState, now: DateTime<Utc>) -> f64 {
    let stability = (1.0 - 0.2 * f64::from(state.consecutive_failures)).max(0.1);
    #[allow(
        clippy::cast_precision_loss,
        reason = "hour counts here are bounded by realistic outage durations, far below f64's exact range"
    )]
    let recency_bonus = state.last_failure_at.map_or(0.2, |at| {
        let hours_since = (now - at).num_seconds().max(0) as f64 / 3600.0;
        (hours_since * 0.01).min(0.2)
    });
    state.success_rate() * stability + recency_bonus
}

/// Compute a candidate's selection score. Higher is preferred. A failure in
/// the last minute halves the score, reflecting freshly-observed
/// instability even before the circuit breaker reacts.
#[must_use]
#[allow(
    clippy::float_arithmetic,
    reason = "the selection score is a weighted blend of floating-point terms by design"
)]
pub fn score(state: &ProviderRuntimeState, weights: &ScoreWeights, now: DateTime<Utc>) -> f64 {
    let performance_term = 1.0 - (state.ema_response_time_ms.min(RESPONSE_TIME_CAP_MS) / RESPONSE_TIME_CAP_MS);
    let cost_term = if weights.cost_cap > 0.0 {
        1.0 - (average_cost(state).min(weights.cost_cap) / weights.cost_cap)
    } else {
        0.0
    };

    let mut total = weights.default_weight
        + weights.performance_weight * performance_term
        + weights.reliability_weight * reliability(state, now)
        + weights.cost_weight * cost_term;

    let recently_failed = state
        .last_failure_at
        .is_some_and(|at| now - at <= RECENT_FAILURE_PENALTY_WINDOW);
    if recently_failed {
        total *= 0.5;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::provider::CallSample;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn fresh_provider_scores_at_the_default_weight_plus_bonuses() {
        let state = ProviderRuntimeState::new();
        let weights = ScoreWeights::default();
        let computed = score(&state, &weights, now());
        assert!(computed > weights.default_weight);
    }

    #[test]
    fn recent_failure_halves_the_score() {
        let mut with_recent_failure = ProviderRuntimeState::new();
        with_recent_failure.last_failure_at = Some(now() - Duration::seconds(10));
        with_recent_failure.consecutive_failures = 1;
        with_recent_failure.total_requests = 5;
        with_recent_failure.total_failures = 1;

        let mut without_recent_failure = with_recent_failure.clone();
        without_recent_failure.last_failure_at = Some(now() - Duration::hours(2));

        let weights = ScoreWeights::default();
        let penalized = score(&with_recent_failure, &weights, now());
        let unpenalized = score(&without_recent_failure, &weights, now());
        assert!(penalized < unpenalized);
    }

    #[test]
    fn lower_average_response_time_scores_higher() {
        let mut fast = ProviderRuntimeState::new();
        fast.ema_response_time_ms = 50.0;
        let mut slow = ProviderRuntimeState::new();
        slow.ema_response_time_ms = 9_000.0;

        let weights = ScoreWeights::default();
        assert!(score(&fast, &weights, now()) > score(&slow, &weights, now()));
    }

    #[test]
    fn higher_average_cost_scores_lower() {
        let mut cheap = ProviderRuntimeState::new();
        cheap.recent_samples.push(CallSample { response_time_ms: 100, cost: Some(0.01) });
        let mut expensive = ProviderRuntimeState::new();
        expensive.recent_samples.push(CallSample { response_time_ms: 100, cost: Some(0.09) });

        let weights = ScoreWeights::default();
        assert!(score(&cheap, &weights, now()) > score(&expensive, &weights, now()));
    }
}
