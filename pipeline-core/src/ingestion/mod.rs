//! Executes single-source and batch ingestion jobs leased by the worker
//! pool: discover documents via a registered [`SourceHandler`], extract and
//! transform each, and report progress along the way.
//!
//! Structured like `OverpassEnrichmentWorker`: a small synchronous progress
//! calculator (`progress`, analogous to `retry_base_delay`) kept apart from
//! the async orchestration, so the percentage mapping is unit-testable
//! without spinning up a runtime.

pub mod progress;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::config::{ConfigType, IngestionSettings};
use crate::domain::job::{Job, JobPayload};
use crate::domain::ports::config_component::{ConfigComponent, ConfigComponentError};
use crate::domain::ports::define_port_error;
use crate::domain::ports::source_handler::{SourceHandler, SourceHandlerError};
use crate::domain::source::{DocumentHandle, EnrichedRecord, SourceSpec};
use crate::queue::JobStore;
use crate::worker::{JobProcessor, ProcessorOutcome};

define_port_error! {
    pub enum IngestionError {
        UnknownSourceType { type_tag: String } =>
            "no source handler registered for source type {type_tag}",
    }
}

/// Per-document or per-source ingestion outcome, retained when
/// `stop_on_error` is false so soft failures don't abort the run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub failed: bool,
    pub error: Option<String>,
}

/// Controls result shape and failure tolerance. Config-mutable, mirroring
/// the queue store's config-mutable parameters.
#[derive(Debug, Clone, Copy)]
pub struct IngestionOptions {
    /// If true, the first per-document failure fails the whole job. If
    /// false, failures are captured per document and the run continues.
    pub stop_on_error: bool,
    /// Include raw document handles in the returned value.
    pub include_documents: bool,
    /// Include enriched record content in the returned value.
    pub include_results: bool,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            include_documents: false,
            include_results: true,
        }
    }
}

/// Tuning knobs sourced from the `ingestion` configuration file (see
/// `domain::config::IngestionSettings`), distinct from [`IngestionOptions`]
/// which shapes result content rather than timing and retry behavior.
#[derive(Debug, Clone, Copy)]
struct IngestionTuning {
    /// Maximum sources processed concurrently within one batch job.
    batch_size: usize,
    /// Extra attempts granted to a single document's extract/transform
    /// step on a retryable ([`SourceHandlerError::is_retryable`]) failure
    /// or per-attempt timeout, beyond the first.
    max_document_retries: u32,
    /// Per-attempt deadline for a document's `extract`/`transform` call.
    timeout: std::time::Duration,
    /// Whether `validate` is invoked on first registration of a source.
    enable_validation: bool,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_document_retries: 0,
            timeout: std::time::Duration::from_secs(30),
            enable_validation: true,
        }
    }
}

impl From<&IngestionSettings> for IngestionTuning {
    fn from(settings: &IngestionSettings) -> Self {
        Self {
            batch_size: usize::try_from(settings.batch_size.max(1)).unwrap_or(usize::MAX),
            max_document_retries: settings.max_retries,
            timeout: std::time::Duration::from_millis(settings.timeout_ms.max(1)),
            enable_validation: settings.enable_validation,
        }
    }
}

struct RunError {
    reason: String,
    retryable: bool,
}

impl RunError {
    fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }

    fn from_handler(err: &SourceHandlerError) -> Self {
        Self {
            reason: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Dispatches single-source and batch ingestion jobs to registered
/// [`SourceHandler`] implementations.
pub struct IngestionProcessor {
    handlers: Mutex<HashMap<String, Arc<dyn SourceHandler>>>,
    initialized: Mutex<HashSet<String>>,
    options: Mutex<IngestionOptions>,
    tuning: Mutex<IngestionTuning>,
}

impl Default for IngestionProcessor {
    fn default() -> Self {
        Self::new(IngestionOptions::default())
    }
}

impl IngestionProcessor {
    /// Build a processor with no handlers registered yet.
    #[must_use]
    pub fn new(options: IngestionOptions) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            initialized: Mutex::new(HashSet::new()),
            options: Mutex::new(options),
            tuning: Mutex::new(IngestionTuning::default()),
        }
    }

    /// Register the handler responsible for a `type_tag`. Replaces any
    /// previously registered handler for the same tag.
    pub fn register_handler(&self, type_tag: impl Into<String>, handler: Arc<dyn SourceHandler>) {
        let mut handlers = self.handlers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.insert(type_tag.into(), handler);
    }

    /// Rebind the options used for subsequent runs. Does not affect a run
    /// already in progress.
    pub fn apply_options(&self, options: IngestionOptions) {
        *self.options.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = options;
    }

    fn current_options(&self) -> IngestionOptions {
        *self.options.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn current_tuning(&self) -> IngestionTuning {
        *self.tuning.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn handler_for(&self, spec: &SourceSpec) -> Result<Arc<dyn SourceHandler>, RunError> {
        let handlers = self.handlers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.get(&spec.type_tag).cloned().ok_or_else(|| {
            RunError::fatal(IngestionError::unknown_source_type(spec.type_tag.clone()).to_string())
        })
    }

    fn ensure_registered(&self, spec: &SourceSpec, handler: &Arc<dyn SourceHandler>) -> bool {
        let mut initialized = self.initialized.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if initialized.contains(&spec.id) {
            return false;
        }
        initialized.insert(spec.id.clone());
        drop(initialized);
        let _ = handler;
        true
    }

    async fn run_single(
        &self,
        spec: &SourceSpec,
        options: IngestionOptions,
        mut report: impl FnMut(u8),
    ) -> Result<Value, RunError> {
        let handler = self.handler_for(spec)?;

        let tuning = self.current_tuning();
        if self.ensure_registered(spec, &handler) {
            if tuning.enable_validation {
                handler
                    .validate(spec)
                    .await
                    .map_err(|e| RunError::from_handler(&e))?;
            }
            handler
                .initialize(spec)
                .await
                .map_err(|e| RunError::from_handler(&e))?;
        }
        report(progress::REGISTRATION);

        let documents = match handler.discover(spec).await {
            Ok(docs) => docs,
            Err(err) => {
                let _ = handler.cleanup(spec).await;
                return Err(RunError::from_handler(&err));
            }
        };
        report(progress::DISCOVERY);

        let total = documents.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut records: Vec<EnrichedRecord> = Vec::new();
        let mut included_documents: Vec<DocumentHandle> = Vec::new();

        for (index, document) in documents.iter().enumerate() {
            let outcome = self.process_document(spec, &handler, document, options, tuning, &mut records).await;
            if let Some(fail) = outcome {
                if options.stop_on_error {
                    let _ = handler.cleanup(spec).await;
                    return Err(RunError {
                        reason: fail.error.clone().unwrap_or_default(),
                        retryable: false,
                    });
                }
                outcomes.push(fail);
            } else {
                outcomes.push(DocumentOutcome {
                    document_id: document.id.clone(),
                    failed: false,
                    error: None,
                });
            }
            if options.include_documents {
                included_documents.push(document.clone());
            }
            report(progress::per_document(index, total));
        }

        report(progress::FINALIZE);
        if let Err(err) = handler.cleanup(spec).await {
            tracing::warn!(source_id = %spec.id, error = %err, "source cleanup failed after ingestion");
        }
        report(progress::COMPLETE);

        Ok(build_result(&outcomes, &included_documents, &records, options))
    }

    async fn process_document(
        &self,
        spec: &SourceSpec,
        handler: &Arc<dyn SourceHandler>,
        document: &DocumentHandle,
        options: IngestionOptions,
        tuning: IngestionTuning,
        records: &mut Vec<EnrichedRecord>,
    ) -> Option<DocumentOutcome> {
        let attempts = 1 + tuning.max_document_retries;

        let extracted = match Self::with_retries(attempts, tuning.timeout, || handler.extract(spec, document)).await
        {
            Ok(record) => record,
            Err(err) => {
                return Some(DocumentOutcome {
                    document_id: document.id.clone(),
                    failed: true,
                    error: Some(err),
                });
            }
        };

        match Self::with_retries(attempts, tuning.timeout, || handler.transform(spec, &extracted)).await {
            Ok(enriched) => {
                if options.include_results {
                    records.push(enriched);
                }
                None
            }
            Err(err) => Some(DocumentOutcome {
                document_id: document.id.clone(),
                failed: true,
                error: Some(err),
            }),
        }
    }

    /// Runs `make_attempt` up to `attempts` times, retrying only on a
    /// [`SourceHandlerError::is_retryable`] failure or a per-attempt timeout
    /// elapsing. Returns the error string of the last attempt on exhaustion.
    async fn with_retries<T, F, Fut>(attempts: u32, timeout: std::time::Duration, mut make_attempt: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SourceHandlerError>>,
    {
        let mut last_error = String::from("no attempt was made");
        for attempt in 0..attempts.max(1) {
            match tokio::time::timeout(timeout, make_attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    let retryable = err.is_retryable();
                    last_error = err.to_string();
                    if !retryable || attempt + 1 >= attempts {
                        return Err(last_error);
                    }
                }
                Err(_elapsed) => {
                    last_error = format!("attempt timed out after {timeout:?}");
                    if attempt + 1 >= attempts {
                        return Err(last_error);
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn run_batch(
        &self,
        specs: &[SourceSpec],
        options: IngestionOptions,
        mut report: impl FnMut(u8),
    ) -> Result<Value, RunError> {
        if specs.is_empty() {
            return Err(RunError::fatal("batch job payload must contain at least one source"));
        }
        let total = specs.len();
        let chunk_size = self.current_tuning().batch_size.max(1);
        let mut per_source = Vec::with_capacity(total);
        let mut processed = 0usize;

        for chunk in specs.chunks(chunk_size) {
            let chunk_results = futures_util::future::join_all(
                chunk.iter().map(|spec| self.run_single(spec, options, |_inner| {})),
            )
            .await;

            for (spec, result) in chunk.iter().zip(chunk_results) {
                per_source.push(match result {
                    Ok(value) => serde_json::json!({
                        "source_id": spec.id,
                        "status": "completed",
                        "result": value,
                    }),
                    Err(err) => serde_json::json!({
                        "source_id": spec.id,
                        "status": "failed",
                        "error": err.reason,
                    }),
                });
                processed += 1;
            }
            report(progress::batch_slot(processed.saturating_sub(1), total, 100));
        }
        Ok(Value::Array(per_source))
    }
}

fn build_result(
    outcomes: &[DocumentOutcome],
    documents: &[DocumentHandle],
    records: &[EnrichedRecord],
    options: IngestionOptions,
) -> Value {
    let error_details: Vec<Value> = outcomes
        .iter()
        .filter(|outcome| outcome.failed)
        .map(|outcome| {
            serde_json::json!({
                "document": outcome.document_id,
                "error": outcome.error,
            })
        })
        .collect();
    let documents_processed = outcomes.len() - error_details.len();

    let mut value = serde_json::json!({
        "documentsProcessed": documents_processed,
        "errors": error_details.len(),
        "errorDetails": error_details,
        "outcomes": outcomes,
    });
    if options.include_documents {
        value["documents"] = serde_json::to_value(documents).unwrap_or(Value::Null);
    }
    if options.include_results {
        value["records"] = serde_json::to_value(records).unwrap_or(Value::Null);
    }
    value
}

#[async_trait]
impl ConfigComponent for IngestionProcessor {
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
        *self.tuning.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = IngestionTuning::from(&settings);
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobProcessor for IngestionProcessor {
    async fn process(&self, store: &JobStore, job: &Job) -> ProcessorOutcome {
        let options = self.current_options();
        let job_id = job.id().to_owned();
        let report = {
            let store = store;
            let job_id = job_id.clone();
            move |percent: u8| {
                let _ = store.progress(&job_id, percent);
            }
        };

        let outcome = match job.payload() {
            JobPayload::Single(spec) => self.run_single(spec, options, report).await,
            JobPayload::Batch(specs) => self.run_batch(specs, options, report).await,
        };

        match outcome {
            Ok(value) => ProcessorOutcome::Completed(Some(value)),
            Err(err) => ProcessorOutcome::Failed {
                reason: err.reason,
                retryable: err.retryable,
            },
        }
    }
}
