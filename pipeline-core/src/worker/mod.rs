//! Bounded-concurrency worker pool: leases jobs from the [`crate::queue::JobStore`]
//! and dispatches them to a [`JobProcessor`].
//!
//! Concurrency is bounded by a `tokio::sync::Semaphore` rather than a
//! dedicated concurrency crate. A single supervisor task
//! acquires a permit, leases a job, and spawns a per-job task that releases
//! the permit on completion; this lets [`WorkerPool::set_concurrency`]
//! rebind the pool's width at runtime without restarting the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::domain::config::{ConfigType, IngestionSettings};
use crate::domain::job::Job;
use crate::domain::ports::config_component::{ConfigComponent, ConfigComponentError};
use crate::queue::JobStore;

/// The result a [`JobProcessor`] reports for one job attempt.
#[derive(Debug, Clone)]
pub enum ProcessorOutcome {
    /// The job completed; the value becomes the job's `return_value`.
    Completed(Option<Value>),
    /// The job attempt failed. `retryable` decides whether the store
    /// re-enqueues it (see `domain::ErrorCode::is_retryable`).
    Failed { reason: String, retryable: bool },
}

/// Executes one job to completion or failure, reporting progress through the
/// job store as it goes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Run `job`, using `store` to publish progress via `store.progress(..)`.
    /// Must not call `ack`/`fail` itself — the worker pool applies the
    /// returned [`ProcessorOutcome`] uniformly so every job's terminal
    /// transition goes through one place.
    async fn process(&self, store: &JobStore, job: &Job) -> ProcessorOutcome;
}

/// Bounded-concurrency consumer of the job store.
pub struct WorkerPool {
    store: Arc<JobStore>,
    processor: Arc<dyn JobProcessor>,
    semaphore: Arc<Semaphore>,
    concurrency: AtomicUsize,
    stopping: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Build a pool with the given initial concurrency. Call [`Self::start`]
    /// to begin leasing.
    #[must_use]
    pub fn new(store: Arc<JobStore>, processor: Arc<dyn JobProcessor>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            store,
            processor,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency: AtomicUsize::new(concurrency),
            stopping: Arc::new(AtomicBool::new(false)),
            supervisor: Mutex::new(None),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start the supervisor task. Calling this more than once without an
    /// intervening [`Self::shutdown`] is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock().await;
        if guard.is_some() {
            return;
        }
        let pool = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { pool.supervise().await }));
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                return;
            };
            let Some(job) = self.store.lease_wait("worker-pool").await else {
                drop(permit);
                if self.stopping.load(Ordering::Acquire) {
                    return;
                }
                continue;
            };

            let store = Arc::clone(&self.store);
            let processor = Arc::clone(&self.processor);
            let in_flight = Arc::clone(&self.in_flight);
            in_flight.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                let outcome = processor.process(&store, &job).await;
                match outcome {
                    ProcessorOutcome::Completed(value) => {
                        let _ = store.ack(job.id(), value);
                    }
                    ProcessorOutcome::Failed { reason, retryable } => {
                        let _ = store.fail(job.id(), reason, retryable);
                    }
                }
                in_flight.fetch_sub(1, Ordering::AcqRel);
                drop(permit);
            });
        }
    }

    /// Rebind the pool's concurrency. Takes effect for subsequent leases;
    /// in-flight leases are unaffected.
    pub fn set_concurrency(&self, concurrency: usize) {
        let concurrency = concurrency.max(1);
        let previous = self.concurrency.swap(concurrency, Ordering::AcqRel);
        match concurrency.cmp(&previous) {
            std::cmp::Ordering::Greater => self.semaphore.add_permits(concurrency - previous),
            std::cmp::Ordering::Less => self.semaphore.forget_permits(previous - concurrency),
            std::cmp::Ordering::Equal => {}
        }
    }

    /// Current number of jobs being processed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stop leasing, wait (up to `deadline`) for in-flight jobs to finish,
    /// then return. Jobs still running past the deadline are abandoned to
    /// their lease visibility timeout.
    pub async fn shutdown(&self, deadline: std::time::Duration) {
        self.stopping.store(true, Ordering::Release);
        self.store.shutdown();

        let mut guard = self.supervisor.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        drop(guard);

        let waited = tokio::time::timeout(deadline, async {
            while self.in_flight.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await;
        if waited.is_err() {
            tracing::warn!(
                in_flight = self.in_flight.load(Ordering::Acquire),
                "worker pool shutdown deadline elapsed with jobs still in flight"
            );
        }
    }
}

#[async_trait]
impl ConfigComponent for WorkerPool {
    fn handles_config_type(&self, config_type: ConfigType) -> bool {
        config_type == ConfigType::Ingestion
    }

    async fn update_config(
        &self,
        _config_type: ConfigType,
        new_value: Value,
        _old_value: Option<Value>,
    ) -> Result<(), ConfigComponentError> {
        let settings: IngestionSettings =
            serde_json::from_value(new_value).map_err(|err| ConfigComponentError::rejected(err.to_string()))?;
        self.set_concurrency(usize::try_from(settings.concurrency.max(1)).unwrap_or(usize::MAX));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobPayload;
    use crate::domain::source::SourceSpec;
    use crate::queue::{EnqueueOptions, JobStoreConfig};
    use mockable::DefaultClock;

    struct EchoProcessor;

    #[async_trait]
    impl JobProcessor for EchoProcessor {
        async fn process(&self, _store: &JobStore, job: &Job) -> ProcessorOutcome {
            ProcessorOutcome::Completed(Some(serde_json::json!({ "job_id": job.id() })))
        }
    }

    #[tokio::test]
    async fn processes_an_enqueued_job_to_completion() {
        let store = Arc::new(JobStore::new(Arc::new(DefaultClock), JobStoreConfig::default()));
        let id = store
            .enqueue(
                JobPayload::Single(SourceSpec::test_fixture()),
                EnqueueOptions::default(),
            )
            .expect("enqueue");

        let pool = Arc::new(WorkerPool::new(Arc::clone(&store), Arc::new(EchoProcessor), 2));
        pool.start().await;

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Some(job) = store.get(&id)
                && job.state() == crate::domain::job::JobState::Completed
            {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job did not complete in time");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        pool.shutdown(std::time::Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn set_concurrency_accepts_widening_and_narrowing() {
        let store = Arc::new(JobStore::new(Arc::new(DefaultClock), JobStoreConfig::default()));
        let pool = WorkerPool::new(store, Arc::new(EchoProcessor), 2);
        pool.set_concurrency(5);
        pool.set_concurrency(1);
        assert_eq!(pool.concurrency.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn update_config_rebinds_concurrency_from_ingestion_settings() {
        let store = Arc::new(JobStore::new(Arc::new(DefaultClock), JobStoreConfig::default()));
        let pool = WorkerPool::new(store, Arc::new(EchoProcessor), 2);
        let settings = serde_json::json!({
            "batchSize": 10,
            "maxRetries": 2,
            "timeoutMs": 1000,
            "concurrency": 7,
        });
        ConfigComponent::update_config(&pool, ConfigType::Ingestion, settings, None)
            .await
            .expect("update_config");
        assert_eq!(pool.concurrency.load(Ordering::Acquire), 7);
    }
}
