//! Thin façade over the job store: priority-tag resolution, delayed and
//! recurring submission, and overlap coalescing for recurring sources.
//!
//! Structured as a domain service holding an `Arc<JobStore>`, the way the
//! teacher's service-layer types hold an `Arc` to the repository they
//! orchestrate rather than owning storage themselves.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mockable::Clock;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::config::{ConfigType, SourcesConfig};
use crate::domain::job::{JobState, JobPayload};
use crate::domain::ports::config_component::{ConfigComponent, ConfigComponentError};
use crate::domain::ports::define_port_error;
use crate::domain::source::SourceSpec;
use crate::queue::{EnqueueOptions, JobEvent, JobStore, JobStoreError};
use crate::scheduler::cron::{CronError, CronSchedule};

define_port_error! {
    pub enum SchedulerError {
        EmptyBatch => "batch submission must include at least one source",
        UnknownSchedule { schedule_id: String } =>
            "no recurring schedule registered with id {schedule_id}",
        InvalidExpression { reason: String } => "invalid cron expression: {reason}",
        Queue { reason: String } => "queue operation failed: {reason}",
    }
}

impl From<JobStoreError> for SchedulerError {
    fn from(err: JobStoreError) -> Self {
        Self::queue(err.to_string())
    }
}

impl From<CronError> for SchedulerError {
    fn from(err: CronError) -> Self {
        Self::invalid_expression(err.to_string())
    }
}

/// Caller-chosen priority, either a named tag or a raw integer, per the
/// mapping `{high: +10, normal: 0, low: -10}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPriority {
    Tag(PriorityTag),
    Raw(i64),
}

/// A named priority tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityTag {
    High,
    Normal,
    Low,
}

impl PriorityTag {
    const fn offset(self) -> i64 {
        match self {
            Self::High => 10,
            Self::Normal => 0,
            Self::Low => -10,
        }
    }
}

impl SubmissionPriority {
    #[must_use]
    pub const fn resolve(self) -> i64 {
        match self {
            Self::Tag(tag) => tag.offset(),
            Self::Raw(value) => value,
        }
    }
}

impl Default for SubmissionPriority {
    fn default() -> Self {
        Self::Tag(PriorityTag::Normal)
    }
}

/// Options accepted by [`Scheduler::submit_single`] and
/// [`Scheduler::submit_batch`].
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub priority: SubmissionPriority,
    pub delay: Duration,
    pub attempts_max: Option<u32>,
    pub trace_id: Option<String>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: SubmissionPriority::default(),
            delay: Duration::zero(),
            attempts_max: None,
            trace_id: None,
        }
    }
}

fn enqueue_options_from(store: &JobStore, options: &SubmitOptions) -> EnqueueOptions {
    let mut enqueue = EnqueueOptions {
        priority: options.priority.resolve(),
        delay: options.delay,
        trace_id: options.trace_id.clone(),
        ..store.default_enqueue_options()
    };
    if let Some(attempts_max) = options.attempts_max {
        enqueue.attempts_max = attempts_max;
    }
    enqueue
}

/// A registered recurring submission for a single source.
#[derive(Debug, Clone)]
struct RecurringSchedule {
    source: SourceSpec,
    expression: CronSchedule,
    next_run: DateTime<Utc>,
    active: bool,
    allow_concurrent: bool,
}

/// Validates, prioritizes, and enqueues ingestion jobs; owns recurring
/// schedules and drives them forward on [`Scheduler::tick`].
pub struct Scheduler {
    store: Arc<JobStore>,
    clock: Arc<dyn Clock>,
    schedules: Mutex<HashMap<String, RecurringSchedule>>,
    tracked: Mutex<HashMap<String, String>>,
    known_sources: Mutex<HashMap<String, SourceSpec>>,
}

impl Scheduler {
    /// Build a scheduler over an existing job store.
    #[must_use]
    pub fn new(store: Arc<JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            schedules: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashMap::new()),
            known_sources: Mutex::new(HashMap::new()),
        }
    }

    /// Sources the scheduler currently knows about with `enabled: true`,
    /// as reconciled from the last applied `sources` configuration.
    #[must_use]
    pub fn active_sources(&self) -> Vec<SourceSpec> {
        self.known_sources
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|source| source.enabled)
            .cloned()
            .collect()
    }

    /// Reconcile the scheduler's known sources and recurring schedules
    /// against a freshly applied `sources` configuration: sources with a
    /// `schedule` expression are registered (or re-registered, if the
    /// expression changed); sources removed from the file, or turned
    /// `enabled: false`, have any existing schedule cancelled.
    fn reconcile_sources(&self, sources: &[SourceSpec]) -> Result<(), SchedulerError> {
        let incoming: HashMap<&str, &SourceSpec> = sources.iter().map(|s| (s.id.as_str(), s)).collect();

        let stale: Vec<String> = {
            let known = self.known_sources.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            known
                .keys()
                .filter(|id| !incoming.contains_key(id.as_str()))
                .cloned()
                .collect()
        };
        for id in stale {
            self.deactivate_source(&id);
        }

        for source in sources {
            if source.enabled {
                if let Some(expression) = &source.schedule {
                    self.ensure_schedule(source, expression)?;
                } else {
                    self.cancel_schedule_if_present(&source.id);
                }
            } else {
                self.deactivate_source(&source.id);
            }
            self.known_sources
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(source.id.clone(), source.clone());
        }
        Ok(())
    }

    fn ensure_schedule(&self, source: &SourceSpec, expression: &str) -> Result<(), SchedulerError> {
        let parsed = CronSchedule::parse(expression)?;
        let unchanged = self
            .schedules
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&source.id)
            .is_some_and(|existing| existing.active && existing.expression == parsed && existing.source == *source);
        if unchanged {
            return Ok(());
        }
        self.register_schedule(source.id.clone(), source.clone(), expression, false)
    }

    fn cancel_schedule_if_present(&self, source_id: &str) {
        let mut schedules = self.schedules.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(schedule) = schedules.get_mut(source_id) {
            schedule.active = false;
        }
    }

    fn deactivate_source(&self, source_id: &str) {
        self.cancel_schedule_if_present(source_id);
        self.known_sources
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(source_id);
    }

    /// Re-emit job lifecycle events from the underlying store.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.store.subscribe()
    }

    /// Submit a single source for ingestion. Coalesces with an existing
    /// active-or-waiting job for the same source id unless `allow_concurrent`
    /// submissions were explicitly requested for this source by a
    /// registered schedule.
    pub fn submit_single(&self, source: SourceSpec, options: &SubmitOptions) -> Result<Option<String>, SchedulerError> {
        self.submit_single_coalesced(source, options, false)
    }

    fn submit_single_coalesced(
        &self,
        source: SourceSpec,
        options: &SubmitOptions,
        allow_concurrent: bool,
    ) -> Result<Option<String>, SchedulerError> {
        if !allow_concurrent && self.has_pending_job(&source.id) {
            return Ok(None);
        }
        let enqueue_options = enqueue_options_from(&self.store, options);
        let job_id = self
            .store
            .enqueue(JobPayload::Single(source.clone()), enqueue_options)?;
        self.tracked
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(source.id.clone(), job_id.clone());
        Ok(Some(job_id))
    }

    /// Submit a batch of sources as one job. Rejects an empty batch.
    pub fn submit_batch(&self, sources: Vec<SourceSpec>, options: &SubmitOptions) -> Result<String, SchedulerError> {
        if sources.is_empty() {
            return Err(SchedulerError::empty_batch());
        }
        let enqueue_options = enqueue_options_from(&self.store, options);
        let job_id = self.store.enqueue(JobPayload::Batch(sources), enqueue_options)?;
        Ok(job_id)
    }

    fn has_pending_job(&self, source_id: &str) -> bool {
        let tracked = self.tracked.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(job_id) = tracked.get(source_id) else {
            return false;
        };
        matches!(
            self.store.get(job_id).map(|job| job.state()),
            Some(JobState::Waiting | JobState::Active)
        )
    }

    /// Register a recurring schedule for `source`, parsing its cron
    /// expression and computing its first `next_run`.
    pub fn register_schedule(
        &self,
        schedule_id: impl Into<String>,
        source: SourceSpec,
        expression: &str,
        allow_concurrent: bool,
    ) -> Result<(), SchedulerError> {
        let parsed = CronSchedule::parse(expression)?;
        let now = self.clock.utc();
        let next_run = parsed.next_after(now).unwrap_or(now);
        let schedule = RecurringSchedule {
            source,
            expression: parsed,
            next_run,
            active: true,
            allow_concurrent,
        };
        self.schedules
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(schedule_id.into(), schedule);
        Ok(())
    }

    /// Cooperatively deactivate a recurring schedule: it is skipped on the
    /// next and subsequent ticks, but the record is retained for inspection.
    pub fn cancel_schedule(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        let mut schedules = self.schedules.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let schedule = schedules
            .get_mut(schedule_id)
            .ok_or_else(|| SchedulerError::unknown_schedule(schedule_id.to_owned()))?;
        schedule.active = false;
        Ok(())
    }

    /// Re-activate a previously cancelled recurring schedule.
    pub fn resume_schedule(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        let mut schedules = self.schedules.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let schedule = schedules
            .get_mut(schedule_id)
            .ok_or_else(|| SchedulerError::unknown_schedule(schedule_id.to_owned()))?;
        schedule.active = true;
        Ok(())
    }

    /// Advance all active schedules whose `next_run` has arrived, submitting
    /// each (subject to coalescing) and recomputing its `next_run`. Returns
    /// the ids of jobs actually submitted this tick.
    pub fn tick(&self) -> Vec<String> {
        let now = self.clock.utc();
        let due: Vec<(String, SourceSpec, bool)> = {
            let schedules = self.schedules.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            schedules
                .iter()
                .filter(|(_, schedule)| schedule.active && now >= schedule.next_run)
                .map(|(id, schedule)| (id.clone(), schedule.source.clone(), schedule.allow_concurrent))
                .collect()
        };

        let mut submitted = Vec::new();
        for (schedule_id, source, allow_concurrent) in due {
            match self.submit_single_coalesced(source, &SubmitOptions::default(), allow_concurrent) {
                Ok(Some(job_id)) => submitted.push(job_id),
                Ok(None) => {}
                Err(err) => tracing::warn!(schedule_id = %schedule_id, error = %err, "recurring submission failed"),
            }
            self.advance_schedule(&schedule_id, now);
        }
        submitted
    }

    fn advance_schedule(&self, schedule_id: &str, now: DateTime<Utc>) {
        let mut schedules = self.schedules.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(schedule) = schedules.get_mut(schedule_id)
            && let Some(next_run) = schedule.expression.next_after(now)
        {
            schedule.next_run = next_run;
        }
    }
}

#[async_trait]
impl ConfigComponent for Scheduler {
    fn handles_config_type(&self, config_type: ConfigType) -> bool {
        config_type == ConfigType::Sources
    }

    async fn update_config(
        &self,
        _config_type: ConfigType,
        new_value: Value,
        _old_value: Option<Value>,
    ) -> Result<(), ConfigComponentError> {
        let settings: SourcesConfig =
            serde_json::from_value(new_value).map_err(|err| ConfigComponentError::rejected(err.to_string()))?;
        self.reconcile_sources(&settings.sources)
            .map_err(|err| ConfigComponentError::rejected(err.to_string()))
    }

    async fn handle_config_removal(
        &self,
        _config_type: ConfigType,
        _old_value: Value,
    ) -> Result<(), ConfigComponentError> {
        self.reconcile_sources(&[])
            .map_err(|err| ConfigComponentError::rejected(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockable::DefaultClock;

    fn source(id: &str) -> SourceSpec {
        SourceSpec {
            id: id.to_owned(),
            type_tag: "static".to_owned(),
            enabled: true,
            visibility: crate::domain::source::SourceVisibility::Private,
            config: serde_json::Value::Null,
            schedule: None,
        }
    }

    fn scheduler() -> Scheduler {
        let store = Arc::new(JobStore::new(Arc::new(DefaultClock), crate::queue::JobStoreConfig::default()));
        Scheduler::new(store, Arc::new(DefaultClock))
    }

    #[test]
    fn priority_tags_resolve_to_the_documented_offsets() {
        assert_eq!(SubmissionPriority::Tag(PriorityTag::High).resolve(), 10);
        assert_eq!(SubmissionPriority::Tag(PriorityTag::Normal).resolve(), 0);
        assert_eq!(SubmissionPriority::Tag(PriorityTag::Low).resolve(), -10);
        assert_eq!(SubmissionPriority::Raw(42).resolve(), 42);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let scheduler = scheduler();
        let result = scheduler.submit_batch(Vec::new(), &SubmitOptions::default());
        assert!(matches!(result, Err(SchedulerError::EmptyBatch)));
    }

    #[test]
    fn overlapping_submission_for_same_source_is_coalesced() {
        let scheduler = scheduler();
        let first = scheduler
            .submit_single(source("src-1"), &SubmitOptions::default())
            .expect("submit");
        assert!(first.is_some());
        let second = scheduler
            .submit_single(source("src-1"), &SubmitOptions::default())
            .expect("submit");
        assert!(second.is_none());
    }

    #[test]
    fn distinct_sources_do_not_coalesce() {
        let scheduler = scheduler();
        let first = scheduler
            .submit_single(source("src-1"), &SubmitOptions::default())
            .expect("submit");
        let second = scheduler
            .submit_single(source("src-2"), &SubmitOptions::default())
            .expect("submit");
        assert!(first.is_some());
        assert!(second.is_some());
    }

    #[test]
    fn register_and_cancel_schedule_round_trips() {
        let scheduler = scheduler();
        scheduler
            .register_schedule("sched-1", source("src-1"), "* * * * *", false)
            .expect("register");
        scheduler.cancel_schedule("sched-1").expect("cancel");
        assert!(scheduler.tick().is_empty());
    }

    #[test]
    fn unknown_schedule_cancellation_errors() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.cancel_schedule("missing"),
            Err(SchedulerError::UnknownSchedule { .. })
        ));
    }

    #[tokio::test]
    async fn hot_reloaded_sources_become_the_only_active_source() {
        let scheduler = scheduler();
        ConfigComponent::update_config(&scheduler, ConfigType::Sources, serde_json::json!({"sources": []}), None)
            .await
            .expect("apply empty sources");
        assert!(scheduler.active_sources().is_empty());

        let mut s1 = source("s1");
        s1.schedule = None;
        let settings = serde_json::json!({"sources": [s1]});
        ConfigComponent::update_config(&scheduler, ConfigType::Sources, settings, None)
            .await
            .expect("apply one source");

        let active = scheduler.active_sources();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "s1");
    }

    #[tokio::test]
    async fn disabling_a_source_removes_it_from_active_sources() {
        let scheduler = scheduler();
        let s1 = source("s1");
        ConfigComponent::update_config(
            &scheduler,
            ConfigType::Sources,
            serde_json::json!({"sources": [s1]}),
            None,
        )
        .await
        .expect("apply");
        assert_eq!(scheduler.active_sources().len(), 1);

        let mut disabled = source("s1");
        disabled.enabled = false;
        ConfigComponent::update_config(
            &scheduler,
            ConfigType::Sources,
            serde_json::json!({"sources": [disabled]}),
            None,
        )
        .await
        .expect("apply disabled");
        assert!(scheduler.active_sources().is_empty());
    }

    #[tokio::test]
    async fn scheduled_source_registers_a_recurring_schedule() {
        let scheduler = scheduler();
        let mut scheduled = source("s1");
        scheduled.schedule = Some("* * * * *".to_owned());
        ConfigComponent::update_config(
            &scheduler,
            ConfigType::Sources,
            serde_json::json!({"sources": [scheduled]}),
            None,
        )
        .await
        .expect("apply");
        assert_eq!(scheduler.schedules.lock().unwrap().len(), 1);
    }
}
