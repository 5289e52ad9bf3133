//! Jittered exponential backoff, shared by the job store's retry scheduling
//! and the gateway's per-candidate retry loop.
//!
//! A pure base-delay calculation guarded against overflow with saturating
//! arithmetic, plus a pluggable jitter source so tests can run
//! deterministically.

use chrono::Duration;
use rand::Rng;

/// Produces a jitter fraction in `[-1.0, 1.0]`, scaled by the caller to the
/// configured jitter band. Abstracted so tests can supply a fixed value.
pub trait BackoffJitter: Send + Sync {
    fn jitter_unit(&self) -> f64;
}

/// The default jitter source: a uniform sample over `[-1.0, 1.0]` from the
/// thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl BackoffJitter for RandomJitter {
    fn jitter_unit(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

/// A jitter source that always returns zero, for deterministic tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl BackoffJitter for NoJitter {
    fn jitter_unit(&self) -> f64 {
        0.0
    }
}

/// Compute `base * multiplier^attempt`, capped at `max_delay`, before
/// jitter is applied.
#[must_use]
#[allow(
    clippy::float_arithmetic,
    reason = "backoff scaling is inherently floating point; results are capped and truncated back to integer milliseconds"
)]
pub fn exponential_base_delay(base: Duration, multiplier: f64, max_delay: Duration, attempt: u32) -> Duration {
    let base_ms = base.num_milliseconds().max(0);
    #[allow(
        clippy::cast_precision_loss,
        reason = "base delays are configured in milliseconds, far below f64's exact range"
    )]
    let scaled = (base_ms as f64) * multiplier.max(0.0).powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let capped_ms = scaled.min(
        #[allow(clippy::cast_precision_loss, reason = "cap values are small, configured durations")]
        {
            max_delay.num_milliseconds().max(0) as f64
        },
    );
    #[allow(
        clippy::cast_possible_truncation,
        reason = "capped above by max_delay, a configured, bounded duration"
    )]
    Duration::milliseconds(capped_ms as i64)
}

/// Apply a uniform `+/- jitter_fraction` perturbation to `delay`, floored at
/// zero.
#[must_use]
#[allow(
    clippy::float_arithmetic,
    reason = "jitter is a fractional perturbation of a millisecond count; truncated back to integer milliseconds"
)]
pub fn apply_jitter(delay: Duration, jitter_fraction: f64, jitter: &dyn BackoffJitter) -> Duration {
    #[allow(clippy::cast_precision_loss, reason = "delays are small, configured durations")]
    let delay_ms = delay.num_milliseconds() as f64;
    let offset = delay_ms * jitter_fraction.clamp(0.0, 1.0) * jitter.jitter_unit();
    let jittered_ms = (delay_ms + offset).max(0.0);
    #[allow(
        clippy::cast_possible_truncation,
        reason = "jittered_ms is bounded by delay_ms plus a fractional offset of it"
    )]
    Duration::milliseconds(jittered_ms as i64)
}

/// Floor applied to gateway per-candidate retry delays (not used by the job
/// store, whose backoff has no floor beyond zero).
pub const RETRY_FLOOR: Duration = Duration::milliseconds(100);
