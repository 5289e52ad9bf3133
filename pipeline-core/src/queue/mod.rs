//! Durable-shaped priority queue: delay, retry-with-backoff, progress, and
//! lifecycle events over an in-memory job store.
//!
//! [`JobStoreState`] (in [`store`]) is the pure, synchronous state machine;
//! [`JobStore`] is the async-friendly facade around it, pairing a
//! `std::sync::Mutex` with a `tokio::sync::Notify` for lease wakeups —
//! mirroring how `OverpassEnrichmentWorker` pairs its `Mutex`-guarded
//! `WorkerPolicyState` with a `Semaphore` for admission control. Job
//! lifecycle transitions fan out as [`JobEvent`]s on a broadcast channel
//! with drop-oldest backpressure.

pub mod backoff;
pub mod events;
pub mod retention;
pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Duration;
use mockable::Clock;
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::config::{ConfigType, QueueSettings};
use crate::domain::job::{BackoffPolicy, Job, JobPayload};
use crate::domain::ports::config_component::{ConfigComponent, ConfigComponentError};
pub use crate::queue::backoff::{BackoffJitter, RandomJitter};
pub use crate::queue::events::JobEvent;
pub use crate::queue::retention::{CleanReport, RetentionPolicy};
pub use crate::queue::store::{EnqueueOptions, FailOutcome, JobStoreError, QueueStats, StallOutcome};

/// Default lease visibility timeout before a job is considered stalled.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::seconds(30);

/// Configuration the queue needs beyond what [`EnqueueOptions`] carries
/// per-job: retention caps, the stall threshold, and the lease visibility
/// timeout. Config-mutable per §4.B.
#[derive(Debug, Clone, Copy)]
pub struct JobStoreConfig {
    pub retention: RetentionPolicy,
    pub stall_threshold: u32,
    pub visibility_timeout: Duration,
    /// Attempts granted to a job submitted without an explicit override.
    pub default_attempts_max: u32,
    /// Backoff policy applied to a job submitted without an explicit
    /// override.
    pub default_backoff: BackoffPolicy,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            stall_threshold: 3,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            default_attempts_max: 3,
            default_backoff: BackoffPolicy::default_policy(),
        }
    }
}

/// Pick the `queue` config entry that governs store-wide defaults: the
/// entry named `"default"` if present, else the lexicographically first
/// entry of the (already sorted) `queues` map. Returns `None` for an empty
/// map, in which case the previous configuration is left untouched.
fn governing_queue_entry(settings: &QueueSettings) -> Option<&crate::domain::config::QueueOptions> {
    settings
        .queues
        .get("default")
        .or_else(|| settings.queues.values().next())
}

/// The async-facing job store: priority queue, retry scheduling, progress
/// tracking, and lifecycle events.
pub struct JobStore {
    state: Mutex<store::JobStoreState>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn BackoffJitter>,
    events: broadcast::Sender<JobEvent>,
    notify: Notify,
    config: Mutex<JobStoreConfig>,
    shutting_down: AtomicBool,
}

impl JobStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: JobStoreConfig) -> Self {
        let (events, _rx) = events::channel();
        Self {
            state: Mutex::new(store::JobStoreState::new(
                config.retention,
                config.stall_threshold,
            )),
            clock,
            jitter: Arc::new(RandomJitter),
            events,
            notify: Notify::new(),
            config: Mutex::new(config),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Build a store with an injectable jitter source, for deterministic
    /// tests of backoff timing.
    #[must_use]
    pub fn with_jitter(clock: Arc<dyn Clock>, config: JobStoreConfig, jitter: Arc<dyn BackoffJitter>) -> Self {
        let mut store = Self::new(clock, config);
        store.jitter = jitter;
        store
    }

    /// Subscribe to job lifecycle events. Lagging subscribers drop the
    /// oldest unread event rather than stalling the publisher.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: JobEvent) {
        // A broadcast channel with no subscribers errors on send; that is
        // not a fault condition for the store.
        let _ = self.events.send(event);
    }

    /// Enqueue a new job, returning its generated id.
    pub fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<String, JobStoreError> {
        let id = Uuid::new_v4().to_string();
        let now = self.clock.utc();
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.enqueue(id.clone(), payload, options, now)?;
        }
        self.publish(JobEvent::Added { job_id: id.clone() });
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Attempt to lease a job immediately, returning `None` if none is
    /// ready.
    pub fn lease(&self, _worker_id: &str) -> Option<Job> {
        let now = self.clock.utc();
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let leased = state.lease(now)?;
        drop(state);
        self.publish(JobEvent::Started {
            job_id: leased.job.id().to_owned(),
        });
        Some(leased.job)
    }

    /// Lease a job, waiting for one to become available. Returns `None` once
    /// [`Self::shutdown`] has been called and no job is ready.
    pub async fn lease_wait(&self, worker_id: &str) -> Option<Job> {
        loop {
            if let Some(job) = self.lease(worker_id) {
                return Some(job);
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return None;
            }
            let notified = self.notify.notified();
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
            }
        }
    }

    /// Record progress (0..=100) for a leased job. Touches its stall clock.
    pub fn progress(&self, job_id: &str, percent: u8) -> Result<(), JobStoreError> {
        let now = self.clock.utc();
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.progress(job_id, percent, now)?;
        }
        self.publish(JobEvent::Progress {
            job_id: job_id.to_owned(),
            percent,
        });
        Ok(())
    }

    /// Transition a leased job `active -> completed`, storing its return
    /// value.
    pub fn ack(&self, job_id: &str, return_value: Option<Value>) -> Result<(), JobStoreError> {
        let now = self.clock.utc();
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.ack(job_id, return_value, now)?;
        }
        self.publish(JobEvent::Completed {
            job_id: job_id.to_owned(),
        });
        Ok(())
    }

    /// Report failure of a leased job. `retryable` classifies whether the
    /// underlying error kind permits another attempt (see `domain::ErrorCode::is_retryable`).
    pub fn fail(&self, job_id: &str, reason: impl Into<String>, retryable: bool) -> Result<FailOutcome, JobStoreError> {
        let reason = reason.into();
        let now = self.clock.utc();
        let outcome = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.fail(job_id, reason.clone(), retryable, now, self.jitter.as_ref())?
        };
        match &outcome {
            FailOutcome::Requeued { .. } => {
                self.publish(JobEvent::Failed {
                    job_id: job_id.to_owned(),
                    reason,
                });
                self.notify.notify_waiters();
            }
            FailOutcome::Failed => {
                self.publish(JobEvent::Failed {
                    job_id: job_id.to_owned(),
                    reason,
                });
            }
        }
        Ok(outcome)
    }

    /// Fetch a snapshot of a job's current record, if it exists.
    #[must_use]
    pub fn get(&self, job_id: &str) -> Option<Job> {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.get(job_id).cloned()
    }

    /// Mark a job removed from any non-removed state.
    pub fn remove(&self, job_id: &str) -> Result<(), JobStoreError> {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.remove(job_id)?;
        }
        self.publish(JobEvent::Removed {
            job_id: job_id.to_owned(),
        });
        Ok(())
    }

    /// Re-queue a failed job for one more attempt.
    pub fn retry(&self, job_id: &str) -> Result<(), JobStoreError> {
        let now = self.clock.utc();
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.retry(job_id, now)?;
        }
        self.publish(JobEvent::Retried {
            job_id: job_id.to_owned(),
        });
        self.notify.notify_waiters();
        Ok(())
    }

    /// Stop admitting new leases until [`Self::resume`] is called.
    pub fn pause(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.pause();
        }
        self.publish(JobEvent::Paused);
    }

    /// Resume lease admission after [`Self::pause`].
    pub fn resume(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.resume();
        }
        self.publish(JobEvent::Resumed);
        self.notify.notify_waiters();
    }

    /// Evict completed/failed records older than `grace`, up to the
    /// configured retention caps.
    pub fn clean(&self, grace: Duration) -> CleanReport {
        let now = self.clock.utc();
        let report = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.clean(now, grace)
        };
        self.publish(JobEvent::Cleaned {
            completed_removed: report.completed_removed,
            failed_removed: report.failed_removed,
        });
        report
    }

    /// Point-in-time counts of waiting/active/completed/failed jobs.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.stats()
    }

    /// Sweep active leases for visibility-timeout expiry, transitioning
    /// stalled jobs back to `waiting` or, past the threshold, to terminal
    /// `failed`. Intended to be driven by a periodic background task.
    pub fn sweep_stalled(&self) {
        let now = self.clock.utc();
        let visibility_timeout = self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner).visibility_timeout;
        let outcomes = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.sweep_stalled(now, visibility_timeout)
        };
        let mut requeued_any = false;
        for outcome in outcomes {
            match outcome {
                StallOutcome::ReturnedToWaiting { job_id } => {
                    self.publish(JobEvent::Stalled { job_id });
                    requeued_any = true;
                }
                StallOutcome::FailedTerminally { job_id } => {
                    self.publish(JobEvent::Failed {
                        job_id,
                        reason: "stalled".to_owned(),
                    });
                }
            }
        }
        if requeued_any {
            self.notify.notify_waiters();
        }
    }

    /// Rebind concurrency-adjacent settings. Takes effect for subsequent
    /// leases and stall sweeps; in-flight leases are unaffected.
    pub fn apply_config(&self, config: JobStoreConfig) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.set_retention(config.retention);
            state.set_stall_threshold(config.stall_threshold);
        }
        *self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = config;
    }

    /// The priority/delay/attempts/backoff a job submitted without an
    /// explicit override receives, reflecting the most recently applied
    /// `queue` configuration.
    #[must_use]
    pub fn default_enqueue_options(&self) -> EnqueueOptions {
        let config = self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        EnqueueOptions {
            attempts_max: config.default_attempts_max,
            backoff: config.default_backoff,
            ..EnqueueOptions::default()
        }
    }

    /// Signal shutdown: pending [`Self::lease_wait`] calls return `None`
    /// once no job is immediately ready.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl ConfigComponent for JobStore {
    fn handles_config_type(&self, config_type: ConfigType) -> bool {
        config_type == ConfigType::Queue
    }

    async fn update_config(
        &self,
        _config_type: ConfigType,
        new_value: Value,
        _old_value: Option<Value>,
    ) -> Result<(), ConfigComponentError> {
        let settings: QueueSettings =
            serde_json::from_value(new_value).map_err(|err| ConfigComponentError::rejected(err.to_string()))?;
        let Some(governing) = governing_queue_entry(&settings) else {
            // An empty `queues` map carries no store-wide defaults to apply;
            // the previous configuration remains authoritative.
            return Ok(());
        };
        let previous = *self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let backoff_base = Duration::milliseconds(
            i64::try_from(governing.default_job_options.backoff.delay_ms).unwrap_or(i64::MAX),
        );
        let multiplier = match governing.default_job_options.backoff.backoff_type {
            crate::domain::config::BackoffType::Exponential => previous.default_backoff.multiplier,
            crate::domain::config::BackoffType::Fixed => 1.0,
        };
        self.apply_config(JobStoreConfig {
            retention: RetentionPolicy {
                completed_cap: usize::try_from(governing.default_job_options.remove_on_complete).unwrap_or(usize::MAX),
                failed_cap: usize::try_from(governing.default_job_options.remove_on_fail).unwrap_or(usize::MAX),
            },
            default_attempts_max: governing.default_job_options.attempts.max(1),
            default_backoff: BackoffPolicy {
                base: backoff_base,
                multiplier,
                ..previous.default_backoff
            },
            ..previous
        });
        Ok(())
    }
}

/// Spawn a background task that periodically sweeps stalled leases.
pub fn spawn_stall_sweeper(store: Arc<JobStore>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            store.sweep_stalled();
            if store.shutting_down.load(Ordering::Acquire) {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::source::SourceSpec;
    use crate::queue::backoff::NoJitter;
    use mockable::DefaultClock;

    fn new_store() -> JobStore {
        JobStore::with_jitter(Arc::new(DefaultClock), JobStoreConfig::default(), Arc::new(NoJitter))
    }

    fn payload() -> JobPayload {
        JobPayload::Single(SourceSpec::test_fixture())
    }

    #[test]
    fn enqueue_lease_ack_round_trips_return_value() {
        let store = new_store();
        let id = store.enqueue(payload(), EnqueueOptions::default()).expect("enqueue");
        let leased = store.lease("worker-1").expect("lease");
        assert_eq!(leased.id(), id);
        store
            .ack(&id, Some(serde_json::json!({"ok": true})))
            .expect("ack");
        let job = store.get(&id).expect("job");
        assert_eq!(job.return_value(), Some(&serde_json::json!({"ok": true})));
    }

    #[test]
    fn enqueue_then_remove_yields_null_on_get() {
        let store = new_store();
        let id = store.enqueue(payload(), EnqueueOptions::default()).expect("enqueue");
        store.remove(&id).expect("remove");
        assert!(store.get(&id).is_none());
        assert!(store.lease("worker-1").is_none());
    }

    #[tokio::test]
    async fn events_are_published_on_enqueue_and_completion() {
        let store = new_store();
        let mut events = store.subscribe();
        let id = store.enqueue(payload(), EnqueueOptions::default()).expect("enqueue");
        store.lease("worker-1").expect("lease");
        store.ack(&id, None).expect("ack");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.iter().any(|e| matches!(e, JobEvent::Added { .. })));
        assert!(seen.iter().any(|e| matches!(e, JobEvent::Started { .. })));
        assert!(seen.iter().any(|e| matches!(e, JobEvent::Completed { .. })));
    }

    #[test]
    fn stats_report_waiting_and_active_counts() {
        let store = new_store();
        store.enqueue(payload(), EnqueueOptions::default()).expect("enqueue");
        assert_eq!(store.stats().waiting, 1);
        store.lease("worker-1").expect("lease");
        assert_eq!(store.stats().active, 1);
    }
}
