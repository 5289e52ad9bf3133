//! Job lifecycle records.
//!
//! A [`Job`] is the unit the queue leases to workers. Its fields mirror the
//! data model: identity and scheduling inputs are fixed at construction,
//! while state, progress, and outcome are mutated only by the queue as the
//! job moves through its lifecycle. Workers never mutate a `Job` directly —
//! they call back into the queue (`ack`/`fail`/`progress`), which applies
//! these transitions and enforces their invariants in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::domain::source::SourceSpec;

/// Distinguishes a job that ingests one source from one that fans out over
/// several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Single,
    Batch,
}

/// The payload a job carries, matching its [`JobKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "sources")]
pub enum JobPayload {
    Single(SourceSpec),
    Batch(Vec<SourceSpec>),
}

impl JobPayload {
    /// The [`JobKind`] this payload corresponds to.
    #[must_use]
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::Single(_) => JobKind::Single,
            Self::Batch(_) => JobKind::Batch,
        }
    }
}

/// A job's position in its lifecycle.
///
/// Transitions are monotonic within a run except `active -> waiting` on
/// stall or retryable failure, which restarts the run (and resets
/// [`Job::progress`] to zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
    Removed,
}

/// Exponential backoff parameters with a uniform jitter band.
///
/// `delay_n = base * multiplier^n`, capped at `max_delay`, then perturbed by
/// up to `jitter_fraction` in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: chrono::Duration,
    pub multiplier: f64,
    pub max_delay: chrono::Duration,
    pub jitter_fraction: f64,
}

impl BackoffPolicy {
    /// A conservative default: 1s base, doubling, capped at 5 minutes, ±25%
    /// jitter.
    #[must_use]
    pub fn default_policy() -> Self {
        Self {
            base: chrono::Duration::seconds(1),
            multiplier: 2.0,
            max_delay: chrono::Duration::minutes(5),
            jitter_fraction: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobValidationError {
    EmptyId,
    ZeroAttemptsMax,
    ProgressOutOfRange,
    ProgressWentBackwards,
    InvalidStateTransition { from: JobState, to: JobState },
}

impl fmt::Display for JobValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyId => write!(f, "job id must not be empty"),
            Self::ZeroAttemptsMax => write!(f, "attempts-max must be at least 1"),
            Self::ProgressOutOfRange => write!(f, "progress must be within 0..=100"),
            Self::ProgressWentBackwards => write!(f, "progress must not decrease within a run"),
            Self::InvalidStateTransition { from, to } => {
                write!(f, "cannot transition job from {from:?} to {to:?}")
            }
        }
    }
}

impl std::error::Error for JobValidationError {}

/// A job record as tracked by the job store.
///
/// # Invariants
/// - `state` transitions are monotonic within a run except `active ->
///   waiting` on stall or retryable failure.
/// - `progress` is non-decreasing within a run; a new run (after a retry)
///   resets it to zero.
/// - `attempts_remaining` decreases only on a retryable failure that
///   re-enqueues the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: String,
    kind: JobKind,
    payload: JobPayload,
    priority: i64,
    not_before: DateTime<Utc>,
    attempts_remaining: u32,
    attempts_max: u32,
    backoff: BackoffPolicy,
    state: JobState,
    progress: u8,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
    return_value: Option<Value>,
    consecutive_stalls: u32,
    trace_id: Option<String>,
}

impl Job {
    /// Construct a new, waiting job.
    #[allow(clippy::too_many_arguments, reason = "mirrors the full data model")]
    pub fn new(
        id: impl Into<String>,
        payload: JobPayload,
        priority: i64,
        not_before: DateTime<Utc>,
        attempts_max: u32,
        backoff: BackoffPolicy,
        created_at: DateTime<Utc>,
        trace_id: Option<String>,
    ) -> Result<Self, JobValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(JobValidationError::EmptyId);
        }
        if attempts_max == 0 {
            return Err(JobValidationError::ZeroAttemptsMax);
        }
        Ok(Self {
            id,
            kind: payload.kind(),
            payload,
            priority,
            not_before,
            attempts_remaining: attempts_max,
            attempts_max,
            backoff,
            state: JobState::Waiting,
            progress: 0,
            created_at,
            started_at: None,
            finished_at: None,
            last_failure_reason: None,
            return_value: None,
            consecutive_stalls: 0,
            trace_id,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> JobKind {
        self.kind
    }

    #[must_use]
    pub const fn payload(&self) -> &JobPayload {
        &self.payload
    }

    #[must_use]
    pub const fn priority(&self) -> i64 {
        self.priority
    }

    #[must_use]
    pub const fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    #[must_use]
    pub const fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    #[must_use]
    pub const fn attempts_max(&self) -> u32 {
        self.attempts_max
    }

    #[must_use]
    pub const fn attempts_used(&self) -> u32 {
        self.attempts_max - self.attempts_remaining
    }

    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    #[must_use]
    pub const fn progress(&self) -> u8 {
        self.progress
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub const fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    #[must_use]
    pub fn last_failure_reason(&self) -> Option<&str> {
        self.last_failure_reason.as_deref()
    }

    #[must_use]
    pub const fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    #[must_use]
    pub const fn consecutive_stalls(&self) -> u32 {
        self.consecutive_stalls
    }

    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Transition `waiting -> active` at lease time.
    pub(crate) fn mark_active(&mut self, started_at: DateTime<Utc>) -> Result<(), JobValidationError> {
        self.require_state(JobState::Waiting, JobState::Active)?;
        self.state = JobState::Active;
        self.started_at = Some(started_at);
        Ok(())
    }

    /// Record progress for the current run. Must be non-decreasing.
    pub(crate) fn set_progress(&mut self, percent: u8) -> Result<(), JobValidationError> {
        if percent > 100 {
            return Err(JobValidationError::ProgressOutOfRange);
        }
        if percent < self.progress {
            return Err(JobValidationError::ProgressWentBackwards);
        }
        self.progress = percent;
        Ok(())
    }

    /// Transition `active -> completed`.
    pub(crate) fn complete(
        &mut self,
        return_value: Option<Value>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), JobValidationError> {
        self.require_state(JobState::Active, JobState::Completed)?;
        self.state = JobState::Completed;
        self.progress = 100;
        self.return_value = return_value;
        self.finished_at = Some(finished_at);
        Ok(())
    }

    /// Transition `active -> failed` (attempts exhausted or non-retryable).
    pub(crate) fn fail(
        &mut self,
        reason: impl Into<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), JobValidationError> {
        self.require_state(JobState::Active, JobState::Failed)?;
        self.state = JobState::Failed;
        self.last_failure_reason = Some(reason.into());
        self.finished_at = Some(finished_at);
        Ok(())
    }

    /// Transition `active -> waiting` after a retryable failure, consuming
    /// one attempt and resetting progress for the next run.
    pub(crate) fn requeue_after_failure(
        &mut self,
        reason: impl Into<String>,
        next_not_before: DateTime<Utc>,
    ) -> Result<(), JobValidationError> {
        self.require_state(JobState::Active, JobState::Waiting)?;
        self.state = JobState::Waiting;
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        self.last_failure_reason = Some(reason.into());
        self.progress = 0;
        self.started_at = None;
        self.not_before = next_not_before;
        Ok(())
    }

    /// Transition `active -> waiting` on lease-visibility-timeout, tracking
    /// consecutive stalls for the threshold in [`Self::mark_stalled_terminal`].
    pub(crate) fn return_to_waiting_after_stall(
        &mut self,
        next_not_before: DateTime<Utc>,
    ) -> Result<(), JobValidationError> {
        self.require_state(JobState::Active, JobState::Waiting)?;
        self.state = JobState::Waiting;
        self.consecutive_stalls += 1;
        self.progress = 0;
        self.started_at = None;
        self.not_before = next_not_before;
        Ok(())
    }

    /// Terminal stall: beyond the stall threshold a stalled lease is a
    /// failed terminal state with reason `"stalled"`, not another
    /// `waiting` cycle.
    pub(crate) fn mark_stalled_terminal(
        &mut self,
        finished_at: DateTime<Utc>,
    ) -> Result<(), JobValidationError> {
        self.require_state(JobState::Active, JobState::Failed)?;
        self.state = JobState::Failed;
        self.last_failure_reason = Some("stalled".to_owned());
        self.finished_at = Some(finished_at);
        Ok(())
    }

    /// Mark the job removed. Valid from any non-terminal state.
    pub(crate) fn remove(&mut self) {
        self.state = JobState::Removed;
    }

    /// Manually re-queue a failed job, granting it at least one further
    /// attempt. Used by the job store's `retry` operation.
    pub(crate) fn reset_for_manual_retry(
        &mut self,
        not_before: DateTime<Utc>,
    ) -> Result<(), JobValidationError> {
        self.require_state(JobState::Failed, JobState::Waiting)?;
        self.state = JobState::Waiting;
        self.attempts_remaining = self.attempts_remaining.max(1);
        self.progress = 0;
        self.finished_at = None;
        self.not_before = not_before;
        Ok(())
    }

    fn require_state(&self, expected: JobState, to: JobState) -> Result<(), JobValidationError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(JobValidationError::InvalidStateTransition {
                from: self.state,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job(attempts_max: u32) -> Job {
        Job::new(
            "job-1",
            JobPayload::Single(SourceSpec::test_fixture()),
            0,
            Utc::now(),
            attempts_max,
            BackoffPolicy::default_policy(),
            Utc::now(),
            None,
        )
        .expect("valid job")
    }

    #[test]
    fn rejects_empty_id() {
        let result = Job::new(
            "   ",
            JobPayload::Single(SourceSpec::test_fixture()),
            0,
            Utc::now(),
            1,
            BackoffPolicy::default_policy(),
            Utc::now(),
            None,
        );
        assert!(matches!(result, Err(JobValidationError::EmptyId)));
    }

    #[test]
    fn rejects_zero_attempts_max() {
        let result = Job::new(
            "job-1",
            JobPayload::Single(SourceSpec::test_fixture()),
            0,
            Utc::now(),
            0,
            BackoffPolicy::default_policy(),
            Utc::now(),
            None,
        );
        assert!(matches!(result, Err(JobValidationError::ZeroAttemptsMax)));
    }

    #[test]
    fn progress_must_not_decrease() {
        let mut job = make_job(3);
        job.mark_active(Utc::now()).expect("lease");
        job.set_progress(50).expect("progress up");
        let result = job.set_progress(10);
        assert!(matches!(
            result,
            Err(JobValidationError::ProgressWentBackwards)
        ));
    }

    #[test]
    fn completing_sets_progress_to_100() {
        let mut job = make_job(3);
        job.mark_active(Utc::now()).expect("lease");
        job.complete(None, Utc::now()).expect("complete");
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.progress(), 100);
    }

    #[test]
    fn requeue_after_failure_decrements_attempts_and_resets_progress() {
        let mut job = make_job(3);
        job.mark_active(Utc::now()).expect("lease");
        job.set_progress(40).expect("progress");
        job.requeue_after_failure("network", Utc::now())
            .expect("requeue");
        assert_eq!(job.state(), JobState::Waiting);
        assert_eq!(job.attempts_remaining(), 2);
        assert_eq!(job.progress(), 0);
    }

    #[test]
    fn attempts_max_one_allows_no_retry() {
        let mut job = make_job(1);
        job.mark_active(Utc::now()).expect("lease");
        job.requeue_after_failure("network", Utc::now())
            .expect("requeue");
        assert_eq!(job.attempts_remaining(), 0);
    }
}
