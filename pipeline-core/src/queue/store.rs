//! Pure, synchronous job-store state machine.
//!
//! This module holds all queue book-keeping with no I/O and no concurrency
//! primitives, mirroring how
//! `domain::overpass_enrichment_worker::policy::WorkerPolicyState` separates
//! a small, independently testable state machine from the async facade
//! ([`crate::queue::JobStore`]) that wraps it in a mutex and wakes waiting
//! leasers.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::domain::job::{BackoffPolicy, Job, JobPayload, JobState};
use crate::domain::ports::define_port_error;
use crate::queue::backoff::{BackoffJitter, apply_jitter, exponential_base_delay};
use crate::queue::retention::{CleanReport, RetentionPolicy};

define_port_error! {
    #[derive(Clone)]
    pub enum JobStoreError {
        NotFound { job_id: String } => "job {job_id} was not found",
        InvalidState { job_id: String, reason: String } =>
            "job {job_id} cannot perform this operation: {reason}",
    }
}

/// Options accepted by [`JobStoreState::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub delay: Duration,
    pub attempts_max: u32,
    pub backoff: BackoffPolicy,
    pub trace_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::zero(),
            attempts_max: 3,
            backoff: BackoffPolicy::default_policy(),
            trace_id: None,
        }
    }
}

/// Point-in-time counts of jobs in each lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// A job that has just become eligible to lease, returned by
/// [`JobStoreState::lease`].
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
}

/// The outcome of [`JobStoreState::fail`]: whether the job was requeued for
/// another attempt or failed terminally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued { not_before: DateTime<Utc> },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct WaitingKey {
    priority: Reverse<i64>,
    eligible_at: DateTime<Utc>,
    seq: u64,
    job_id: String,
}

/// Per-lease book-keeping the store needs for stall detection; kept outside
/// [`Job`] since it is queue-internal and not part of the job's public
/// lifecycle data.
#[derive(Debug, Clone, Copy)]
struct LeaseInfo {
    last_seen_at: DateTime<Utc>,
}

/// The queue's in-memory state: job records, the waiting admission order,
/// and bounded completed/failed retention rings.
#[derive(Debug)]
pub struct JobStoreState {
    jobs: HashMap<String, Job>,
    waiting: BTreeSet<WaitingKey>,
    leases: HashMap<String, LeaseInfo>,
    completed_order: VecDeque<String>,
    failed_order: VecDeque<String>,
    next_seq: u64,
    paused: bool,
    retention: RetentionPolicy,
    stall_threshold: u32,
}

impl JobStoreState {
    #[must_use]
    pub fn new(retention: RetentionPolicy, stall_threshold: u32) -> Self {
        Self {
            jobs: HashMap::new(),
            waiting: BTreeSet::new(),
            leases: HashMap::new(),
            completed_order: VecDeque::new(),
            failed_order: VecDeque::new(),
            next_seq: 0,
            paused: false,
            retention,
            stall_threshold: stall_threshold.max(1),
        }
    }

    /// Insert a new, waiting job. The caller is responsible for allocating a
    /// unique `id` (opaque to the store).
    pub fn enqueue(
        &mut self,
        id: String,
        payload: JobPayload,
        options: EnqueueOptions,
        created_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let not_before = created_at + options.delay;
        let job = Job::new(
            id.clone(),
            payload,
            options.priority,
            not_before,
            options.attempts_max.max(1),
            options.backoff,
            created_at,
            options.trace_id,
        )
        .map_err(|err| JobStoreError::invalid_state(id.clone(), err.to_string()))?;

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.waiting.insert(WaitingKey {
            priority: Reverse(job.priority()),
            eligible_at: not_before,
            seq,
            job_id: id.clone(),
        });
        self.jobs.insert(id, job);
        Ok(())
    }

    /// Lease the highest-priority job whose eligible time has passed, if any.
    /// Returns `None` if paused or no job is currently ready.
    pub fn lease(&mut self, now: DateTime<Utc>) -> Option<Lease> {
        if self.paused {
            return None;
        }
        let ready_key = self
            .waiting
            .iter()
            .find(|key| key.eligible_at <= now)?
            .clone();
        self.waiting.remove(&ready_key);

        let job = self.jobs.get_mut(&ready_key.job_id)?;
        if job.mark_active(now).is_err() {
            // Invariant violation: a waiting-set entry always points at a
            // waiting job. Drop the stale entry rather than panic.
            return None;
        }
        self.leases
            .insert(ready_key.job_id.clone(), LeaseInfo { last_seen_at: now });
        Some(Lease { job: job.clone() })
    }

    /// Record progress for an active job. Touches the lease's stall clock.
    pub fn progress(
        &mut self,
        job_id: &str,
        percent: u8,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let job = self.require_job_mut(job_id)?;
        job.set_progress(percent)
            .map_err(|err| JobStoreError::invalid_state(job_id.to_owned(), err.to_string()))?;
        if let Some(lease) = self.leases.get_mut(job_id) {
            lease.last_seen_at = now;
        }
        Ok(())
    }

    /// Acknowledge successful completion of an active job.
    pub fn ack(
        &mut self,
        job_id: &str,
        return_value: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let job = self.require_job_mut(job_id)?;
        job.complete(return_value, now)
            .map_err(|err| JobStoreError::invalid_state(job_id.to_owned(), err.to_string()))?;
        self.leases.remove(job_id);
        self.completed_order.push_back(job_id.to_owned());
        self.enforce_cap(CapKind::Completed);
        Ok(())
    }

    /// Report failure of an active job, consuming an attempt and
    /// re-enqueuing it if `retryable` and attempts remain; otherwise the job
    /// fails terminally.
    pub fn fail(
        &mut self,
        job_id: &str,
        reason: impl Into<String>,
        retryable: bool,
        now: DateTime<Utc>,
        jitter: &dyn BackoffJitter,
    ) -> Result<FailOutcome, JobStoreError> {
        let reason = reason.into();
        let should_requeue = {
            let job = self.require_job(job_id)?;
            retryable && job.attempts_remaining() > 0
        };

        if should_requeue {
            let job = self.require_job_mut(job_id)?;
            let backoff = job.backoff();
            let attempt = job.attempts_max() - job.attempts_remaining();
            let base = exponential_base_delay(backoff.base, backoff.multiplier, backoff.max_delay, attempt);
            let jittered = apply_jitter(base, backoff.jitter_fraction, jitter);
            let not_before = now + jittered;
            job.requeue_after_failure(reason, not_before)
                .map_err(|err| JobStoreError::invalid_state(job_id.to_owned(), err.to_string()))?;
            self.leases.remove(job_id);
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.waiting.insert(WaitingKey {
                priority: Reverse(job.priority()),
                eligible_at: not_before,
                seq,
                job_id: job_id.to_owned(),
            });
            Ok(FailOutcome::Requeued { not_before })
        } else {
            let job = self.require_job_mut(job_id)?;
            job.fail(reason, now)
                .map_err(|err| JobStoreError::invalid_state(job_id.to_owned(), err.to_string()))?;
            self.leases.remove(job_id);
            self.failed_order.push_back(job_id.to_owned());
            self.enforce_cap(CapKind::Failed);
            Ok(FailOutcome::Failed)
        }
    }

    /// Scan active leases whose visibility timeout has elapsed, returning
    /// active jobs either back to `waiting` or, past the stall threshold, to
    /// a terminal `failed` state with reason `stalled`.
    pub fn sweep_stalled(
        &mut self,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
    ) -> Vec<StallOutcome> {
        let stalled_ids: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| now - lease.last_seen_at >= visibility_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut outcomes = Vec::with_capacity(stalled_ids.len());
        for job_id in stalled_ids {
            self.leases.remove(&job_id);
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.consecutive_stalls() + 1 >= self.stall_threshold {
                if job.mark_stalled_terminal(now).is_ok() {
                    self.failed_order.push_back(job_id.clone());
                    self.enforce_cap(CapKind::Failed);
                    outcomes.push(StallOutcome::FailedTerminally { job_id });
                }
            } else {
                let backoff = job.backoff();
                let not_before = now;
                if job.return_to_waiting_after_stall(not_before).is_ok() {
                    let seq = self.next_seq;
                    self.next_seq = self.next_seq.wrapping_add(1);
                    self.waiting.insert(WaitingKey {
                        priority: Reverse(job.priority()),
                        eligible_at: not_before,
                        seq,
                        job_id: job_id.clone(),
                    });
                    let _ = backoff;
                    outcomes.push(StallOutcome::ReturnedToWaiting { job_id });
                }
            }
        }
        outcomes
    }

    #[must_use]
    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    /// Remove a job unconditionally, from any non-removed state.
    ///
    /// Per spec §8, `enqueue(x)` then `remove(x)` must yield `get(x) = None`,
    /// so the record is purged rather than merely marked `Removed`.
    pub fn remove(&mut self, job_id: &str) -> Result<(), JobStoreError> {
        let job = self.require_job_mut(job_id)?;
        job.remove();
        self.waiting.retain(|key| key.job_id != job_id);
        self.leases.remove(job_id);
        self.completed_order.retain(|id| id != job_id);
        self.failed_order.retain(|id| id != job_id);
        self.jobs.remove(job_id);
        Ok(())
    }

    /// Re-queue a failed job for one more attempt.
    pub fn retry(&mut self, job_id: &str, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let job = self.require_job_mut(job_id)?;
        job.reset_for_manual_retry(now)
            .map_err(|err| JobStoreError::invalid_state(job_id.to_owned(), err.to_string()))?;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.waiting.insert(WaitingKey {
            priority: Reverse(job.priority()),
            eligible_at: now,
            seq,
            job_id: job_id.to_owned(),
        });
        self.failed_order.retain(|id| id != job_id);
        Ok(())
    }

    /// Rebind the retention caps applied by future [`Self::clean`] calls and
    /// future [`Self::enforce_cap`] evictions.
    pub const fn set_retention(&mut self, retention: RetentionPolicy) {
        self.retention = retention;
    }

    /// Rebind the consecutive-stall threshold applied by future
    /// [`Self::sweep_stalled`] calls.
    pub fn set_stall_threshold(&mut self, stall_threshold: u32) {
        self.stall_threshold = stall_threshold.max(1);
    }

    pub const fn pause(&mut self) {
        self.paused = true;
    }

    pub const fn resume(&mut self) {
        self.paused = false;
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Evict completed/failed records older than `grace`, beyond the
    /// retention caps.
    pub fn clean(&mut self, now: DateTime<Utc>, grace: Duration) -> CleanReport {
        let completed_removed = self.evict_aged(CapKind::Completed, now, grace);
        let failed_removed = self.evict_aged(CapKind::Failed, now, grace);
        CleanReport {
            completed_removed,
            failed_removed,
        }
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for job in self.jobs.values() {
            match job.state() {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed | JobState::Stalled => stats.failed += 1,
                JobState::Removed => {}
            }
        }
        stats
    }

    fn require_job(&self, job_id: &str) -> Result<&Job, JobStoreError> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| JobStoreError::not_found(job_id.to_owned()))
    }

    fn require_job_mut(&mut self, job_id: &str) -> Result<&mut Job, JobStoreError> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::not_found(job_id.to_owned()))
    }

    fn enforce_cap(&mut self, kind: CapKind) {
        let cap = match kind {
            CapKind::Completed => self.retention.completed_cap,
            CapKind::Failed => self.retention.failed_cap,
        };
        let order = match kind {
            CapKind::Completed => &mut self.completed_order,
            CapKind::Failed => &mut self.failed_order,
        };
        while order.len() > cap
            && let Some(oldest) = order.pop_front()
        {
            self.jobs.remove(&oldest);
        }
    }

    fn evict_aged(&mut self, kind: CapKind, now: DateTime<Utc>, grace: Duration) -> usize {
        let cap = match kind {
            CapKind::Completed => self.retention.completed_cap,
            CapKind::Failed => self.retention.failed_cap,
        };
        let order = match kind {
            CapKind::Completed => &mut self.completed_order,
            CapKind::Failed => &mut self.failed_order,
        };
        let mut removed = 0;
        let mut retained = VecDeque::with_capacity(order.len());
        while let Some(job_id) = order.pop_front() {
            let keep = self.jobs.get(&job_id).is_some_and(|job| {
                job.finished_at()
                    .is_some_and(|finished| now - finished < grace)
            });
            if keep && retained.len() < cap {
                retained.push_back(job_id);
            } else {
                self.jobs.remove(&job_id);
                removed += 1;
            }
        }
        *order = retained;
        removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapKind {
    Completed,
    Failed,
}

/// The outcome of one job's stall handling inside [`JobStoreState::sweep_stalled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallOutcome {
    ReturnedToWaiting { job_id: String },
    FailedTerminally { job_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::source::SourceSpec;
    use crate::queue::backoff::NoJitter;

    fn store() -> JobStoreState {
        JobStoreState::new(RetentionPolicy::default(), 3)
    }

    fn payload() -> JobPayload {
        JobPayload::Single(SourceSpec::test_fixture())
    }

    #[test]
    fn higher_priority_leases_first() {
        let mut state = store();
        let now = Utc::now();
        state
            .enqueue(
                "low".to_owned(),
                payload(),
                EnqueueOptions {
                    priority: -10,
                    ..Default::default()
                },
                now,
            )
            .expect("enqueue low");
        state
            .enqueue(
                "high".to_owned(),
                payload(),
                EnqueueOptions {
                    priority: 10,
                    ..Default::default()
                },
                now,
            )
            .expect("enqueue high");

        let leased = state.lease(now).expect("lease");
        assert_eq!(leased.job.id(), "high");
        let leased = state.lease(now).expect("lease");
        assert_eq!(leased.job.id(), "low");
    }

    #[test]
    fn ties_break_fifo_by_created_order() {
        let mut state = store();
        let now = Utc::now();
        state
            .enqueue("first".to_owned(), payload(), EnqueueOptions::default(), now)
            .expect("enqueue first");
        state
            .enqueue("second".to_owned(), payload(), EnqueueOptions::default(), now)
            .expect("enqueue second");

        let leased = state.lease(now).expect("lease");
        assert_eq!(leased.job.id(), "first");
    }

    #[test]
    fn not_yet_eligible_job_is_skipped_in_favor_of_ready_lower_priority() {
        let mut state = store();
        let now = Utc::now();
        state
            .enqueue(
                "delayed-high".to_owned(),
                payload(),
                EnqueueOptions {
                    priority: 10,
                    delay: Duration::seconds(60),
                    ..Default::default()
                },
                now,
            )
            .expect("enqueue delayed");
        state
            .enqueue(
                "ready-low".to_owned(),
                payload(),
                EnqueueOptions {
                    priority: -10,
                    ..Default::default()
                },
                now,
            )
            .expect("enqueue ready");

        let leased = state.lease(now).expect("lease");
        assert_eq!(leased.job.id(), "ready-low");
    }

    #[test]
    fn fail_without_attempts_remaining_terminates() {
        let mut state = store();
        let now = Utc::now();
        state
            .enqueue(
                "job-1".to_owned(),
                payload(),
                EnqueueOptions {
                    attempts_max: 1,
                    ..Default::default()
                },
                now,
            )
            .expect("enqueue");
        state.lease(now).expect("lease");
        let outcome = state
            .fail("job-1", "network", true, now, &NoJitter)
            .expect("fail");
        assert_eq!(outcome, FailOutcome::Failed);
        assert_eq!(state.get("job-1").expect("job").state(), JobState::Failed);
    }

    #[test]
    fn fail_with_attempts_remaining_requeues() {
        let mut state = store();
        let now = Utc::now();
        state
            .enqueue("job-1".to_owned(), payload(), EnqueueOptions::default(), now)
            .expect("enqueue");
        state.lease(now).expect("lease");
        let outcome = state
            .fail("job-1", "network", true, now, &NoJitter)
            .expect("fail");
        assert!(matches!(outcome, FailOutcome::Requeued { .. }));
        assert_eq!(state.get("job-1").expect("job").state(), JobState::Waiting);
    }

    #[test]
    fn enqueue_then_remove_makes_job_invisible_to_leasing() {
        let mut state = store();
        let now = Utc::now();
        state
            .enqueue("job-1".to_owned(), payload(), EnqueueOptions::default(), now)
            .expect("enqueue");
        state.remove("job-1").expect("remove");
        assert!(state.get("job-1").is_none());
        assert!(state.lease(now).is_none());
    }

    #[test]
    fn stall_sweep_returns_job_to_waiting_before_threshold() {
        let mut state = store();
        let now = Utc::now();
        state
            .enqueue("job-1".to_owned(), payload(), EnqueueOptions::default(), now)
            .expect("enqueue");
        state.lease(now).expect("lease");
        let outcomes = state.sweep_stalled(now + Duration::seconds(60), Duration::seconds(30));
        assert_eq!(
            outcomes,
            vec![StallOutcome::ReturnedToWaiting {
                job_id: "job-1".to_owned()
            }]
        );
    }

    #[test]
    fn stall_sweep_fails_terminally_past_threshold() {
        let mut state = JobStoreState::new(RetentionPolicy::default(), 1);
        let now = Utc::now();
        state
            .enqueue("job-1".to_owned(), payload(), EnqueueOptions::default(), now)
            .expect("enqueue");
        state.lease(now).expect("lease");
        let outcomes = state.sweep_stalled(now + Duration::seconds(60), Duration::seconds(30));
        assert_eq!(
            outcomes,
            vec![StallOutcome::FailedTerminally {
                job_id: "job-1".to_owned()
            }]
        );
    }

    #[test]
    fn stats_reflect_job_states() {
        let mut state = store();
        let now = Utc::now();
        state
            .enqueue("job-1".to_owned(), payload(), EnqueueOptions::default(), now)
            .expect("enqueue");
        let stats = state.stats();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.active, 0);
    }
}
