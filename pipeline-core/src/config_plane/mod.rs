//! Hot-reload configuration plane: loads a directory of typed configuration
//! files, interpolates `${NAME}` environment references, validates each
//! file against its type's schema, and fans out validated changes in
//! parallel to every registered [`ConfigComponent`].
//!
//! Structured like [`crate::queue::JobStore`] and [`crate::gateway::ProviderGateway`]:
//! a `Mutex`-guarded snapshot plus a broadcast event channel, wrapped by an
//! async-friendly facade. Unlike those two, the plane has no pure
//! synchronous state-machine counterpart to delegate to — its "state
//! machine" is simply the stored [`ConfigSnapshot`], since reconciliation
//! (interpolate → validate → diff → fan out → commit-or-rollback) is
//! inherently async all the way through (component updates are async
//! calls). Snapshot application is serialized end-to-end by `apply_lock`:
//! two concurrent changes to the same config type can never interleave,
//! since all changes serialize regardless of type.

pub mod events;
mod interpolate;
pub mod watcher;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::broadcast;

use crate::config_plane::events::ConfigEvent;
use crate::domain::config::{
    ConfigEntry, ConfigSnapshot, ConfigType, IngestionSettings, ProviderSettings, QueueSettings,
    SourcesConfig,
};
use crate::domain::ports::config_component::ConfigComponent;
use crate::domain::ports::define_port_error;

define_port_error! {
    pub enum ConfigError {
        InvalidPath { path: String } =>
            "configuration path {path} has no recognizable file name",
        UnknownFileStem { stem: String } =>
            "no configuration type is registered for file stem {stem}",
        ReadFailed { path: String, reason: String } =>
            "failed to read configuration file {path}: {reason}",
        ParseFailed { path: String, reason: String } =>
            "failed to parse configuration file {path}: {reason}",
        InterpolationDepthExceeded { fragment: String } =>
            "environment-variable interpolation exceeded the recursion guard while expanding {fragment}",
        ValidationFailed { config_type: String, reason: String } =>
            "configuration for {config_type} failed schema validation: {reason}",
        ApplyRejected { config_type: String, reason: String } =>
            "a component rejected configuration for {config_type}: {reason}",
        DirectoryUnreadable { path: String, reason: String } =>
            "failed to list configuration directory {path}: {reason}",
        WatchFailed { reason: String } =>
            "failed to start the configuration directory watcher: {reason}",
    }
}

/// A successfully validated configuration value, still tagged by which
/// [`ConfigType`] it belongs to, pending commit into the snapshot.
enum TypedConfig {
    Sources(SourcesConfig),
    Ingestion(IngestionSettings),
    Queue(QueueSettings),
    Provider(ProviderSettings),
}

impl TypedConfig {
    fn parse(config_type: ConfigType, value: &Value) -> Result<Self, serde_json::Error> {
        Ok(match config_type {
            ConfigType::Sources => Self::Sources(serde_json::from_value(value.clone())?),
            ConfigType::Ingestion => Self::Ingestion(serde_json::from_value(value.clone())?),
            ConfigType::Queue => Self::Queue(serde_json::from_value(value.clone())?),
            ConfigType::Provider => Self::Provider(serde_json::from_value(value.clone())?),
        })
    }

    fn store(self, snapshot: &mut ConfigSnapshot, source_path: String, version: u64) {
        match self {
            Self::Sources(value) => snapshot.sources = Some(ConfigEntry::new(value, source_path, version)),
            Self::Ingestion(value) => snapshot.ingestion = Some(ConfigEntry::new(value, source_path, version)),
            Self::Queue(value) => snapshot.queue = Some(ConfigEntry::new(value, source_path, version)),
            Self::Provider(value) => snapshot.provider = Some(ConfigEntry::new(value, source_path, version)),
        }
    }
}

fn current_value(snapshot: &ConfigSnapshot, config_type: ConfigType) -> Option<Value> {
    match config_type {
        ConfigType::Sources => snapshot.sources.as_ref().map(|entry| to_value_lossy(&entry.value)),
        ConfigType::Ingestion => snapshot.ingestion.as_ref().map(|entry| to_value_lossy(&entry.value)),
        ConfigType::Queue => snapshot.queue.as_ref().map(|entry| to_value_lossy(&entry.value)),
        ConfigType::Provider => snapshot.provider.as_ref().map(|entry| to_value_lossy(&entry.value)),
    }
}

fn to_value_lossy<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn clear_value(snapshot: &mut ConfigSnapshot, config_type: ConfigType) {
    match config_type {
        ConfigType::Sources => snapshot.sources = None,
        ConfigType::Ingestion => snapshot.ingestion = None,
        ConfigType::Queue => snapshot.queue = None,
        ConfigType::Provider => snapshot.provider = None,
    }
}

/// Owns the last successfully applied configuration of each type and the
/// set of subsystems that receive hot-reloaded updates.
pub struct ConfigPlane {
    snapshot: Mutex<ConfigSnapshot>,
    components: Mutex<Vec<Arc<dyn ConfigComponent>>>,
    apply_lock: AsyncMutex<()>,
    next_version: AtomicU64,
    events: broadcast::Sender<ConfigEvent>,
}

impl Default for ConfigPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigPlane {
    #[must_use]
    pub fn new() -> Self {
        let (events, _rx) = events::channel();
        Self {
            snapshot: Mutex::new(ConfigSnapshot::default()),
            components: Mutex::new(Vec::new()),
            apply_lock: AsyncMutex::new(()),
            next_version: AtomicU64::new(1),
            events,
        }
    }

    /// Register a subsystem to receive hot-reloaded configuration. Order of
    /// registration has no bearing on fan-out order (fan-out runs
    /// concurrently); there is no way to deregister, since subsystems are
    /// wired once at composition-root startup and live for the process
    /// lifetime.
    pub fn register_component(&self, component: Arc<dyn ConfigComponent>) {
        let mut components = self.components.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        components.push(component);
    }

    /// Subscribe to config plane lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> ConfigSnapshot {
        self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Read-through accessor: the last successfully applied `sources`
    /// configuration, if any has ever been loaded.
    #[must_use]
    pub fn sources(&self) -> Option<ConfigEntry<SourcesConfig>> {
        self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).sources.clone()
    }

    #[must_use]
    pub fn ingestion(&self) -> Option<ConfigEntry<IngestionSettings>> {
        self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).ingestion.clone()
    }

    #[must_use]
    pub fn queue(&self) -> Option<ConfigEntry<QueueSettings>> {
        self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).queue.clone()
    }

    #[must_use]
    pub fn provider(&self) -> Option<ConfigEntry<ProviderSettings>> {
        self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).provider.clone()
    }

    /// Load every recognized configuration file in `dir`. Each file is
    /// applied independently and best-effort: one file's rejection is
    /// logged and does not prevent the others from loading. Returns an
    /// error only if the directory itself cannot be listed.
    pub async fn load_directory(&self, dir: &Path) -> Result<(), ConfigError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|err| ConfigError::directory_unreadable(dir.display().to_string(), err.to_string()))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| ConfigError::directory_unreadable(dir.display().to_string(), err.to_string()))?;
            let path = entry.path();
            if path.is_file() {
                paths.push(path);
            }
        }

        for path in paths {
            if config_type_of(&path).is_none() {
                continue;
            }
            if let Err(err) = self.load_file(&path).await {
                tracing::warn!(path = %path.display(), error = %err, "skipping unloadable configuration file");
            }
        }
        Ok(())
    }

    /// Load, interpolate, validate, and apply one configuration file.
    pub async fn load_file(&self, path: &Path) -> Result<(), ConfigError> {
        let config_type = config_type_of(path).ok_or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map_or_else(
                    || ConfigError::invalid_path(path.display().to_string()),
                    |stem| ConfigError::unknown_file_stem(stem.to_owned()),
                )
        })?;

        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ConfigError::read_failed(path.display().to_string(), err.to_string()))?;

        self.apply_raw(config_type, path.display().to_string(), &raw).await
    }

    /// Parse, interpolate, validate, diff, and fan out `raw` as the content
    /// of a `config_type` configuration file at `source_path`.
    async fn apply_raw(&self, config_type: ConfigType, source_path: String, raw: &str) -> Result<(), ConfigError> {
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                let reason = err.to_string();
                self.emit(ConfigEvent::Rejected { config_type, reason: reason.clone() });
                return Err(ConfigError::parse_failed(source_path, reason));
            }
        };

        let interpolated = match interpolate::interpolate_value(&parsed) {
            Ok(value) => value,
            Err(err) => {
                self.emit(ConfigEvent::Rejected { config_type, reason: err.to_string() });
                return Err(err);
            }
        };

        let typed = match TypedConfig::parse(config_type, &interpolated) {
            Ok(typed) => typed,
            Err(err) => {
                let reason = err.to_string();
                self.emit(ConfigEvent::Rejected { config_type, reason: reason.clone() });
                return Err(ConfigError::validation_failed(config_type.file_stem().to_owned(), reason));
            }
        };

        let _guard = self.apply_lock.lock().await;

        let old_value = current_value(&self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner), config_type);
        if old_value.as_ref() == Some(&interpolated) {
            return Ok(());
        }

        let components = self.components_for(config_type);

        if let Err(failure) = fan_out_update(&components, config_type, interpolated.clone(), old_value.clone()).await {
            let reason = failure.to_string();
            self.emit(rollback_event(config_type, &reason, old_value, interpolated, &components).await);
            return Err(ConfigError::apply_rejected(config_type.file_stem().to_owned(), reason));
        }

        let version = self.next_version.fetch_add(1, Ordering::AcqRel);
        {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            typed.store(&mut snapshot, source_path, version);
        }
        self.emit(ConfigEvent::Applied { config_type, version });
        Ok(())
    }

    /// Apply the removal of a configuration file: fan out
    /// `handleConfigRemoval` to every interested component (best-effort, no
    /// rollback), then clear the type from the snapshot.
    pub async fn remove_config(&self, config_type: ConfigType) -> Result<(), ConfigError> {
        let _guard = self.apply_lock.lock().await;

        let Some(old_value) = current_value(&self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner), config_type)
        else {
            return Ok(());
        };

        let components = self.components_for(config_type);
        let results = futures_util::future::join_all(
            components.iter().map(|component| component.handle_config_removal(config_type, old_value.clone())),
        )
        .await;

        for result in results {
            if let Err(err) = result {
                tracing::error!(config_type = config_type.file_stem(), error = %err, "component failed to handle configuration removal");
            }
        }

        {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            clear_value(&mut snapshot, config_type);
        }
        self.emit(ConfigEvent::Removed { config_type });
        Ok(())
    }

    /// Components currently registered for `config_type`, snapshotted under
    /// the registry lock and released before any `.await`.
    fn components_for(&self, config_type: ConfigType) -> Vec<Arc<dyn ConfigComponent>> {
        self.components
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|component| component.handles_config_type(config_type))
            .cloned()
            .collect()
    }

    fn emit(&self, event: ConfigEvent) {
        let _ = self.events.send(event);
    }
}

fn config_type_of(path: &Path) -> Option<ConfigType> {
    path.file_stem().and_then(|stem| stem.to_str()).and_then(ConfigType::from_file_stem)
}

/// Fan out `updateConfig(config_type, new_value, old_value)` to every
/// component, concurrently. Resolves to the first component error
/// encountered, if any; all calls still run to completion either way
/// (`join_all` does not short-circuit).
async fn fan_out_update(
    components: &[Arc<dyn ConfigComponent>],
    config_type: ConfigType,
    new_value: Value,
    old_value: Option<Value>,
) -> Result<(), crate::domain::ports::config_component::ConfigComponentError> {
    let results = futures_util::future::join_all(
        components.iter().map(|component| component.update_config(config_type, new_value.clone(), old_value.clone())),
    )
    .await;
    for result in results {
        result?;
    }
    Ok(())
}

/// Best-effort re-apply of `old_value` to every component after a rejected
/// apply of `rejected_value`, logging and reporting whether rollback itself
/// also failed on at least one component.
async fn rollback_event(
    config_type: ConfigType,
    rejection_reason: &str,
    old_value: Option<Value>,
    rejected_value: Value,
    components: &[Arc<dyn ConfigComponent>],
) -> ConfigEvent {
    let Some(old_value) = old_value else {
        return ConfigEvent::RolledBack { config_type, reason: rejection_reason.to_owned() };
    };

    match fan_out_update(components, config_type, old_value, Some(rejected_value)).await {
        Ok(()) => ConfigEvent::RolledBack { config_type, reason: rejection_reason.to_owned() },
        Err(rollback_failure) => {
            let reason = rollback_failure.to_string();
            tracing::error!(
                config_type = config_type.file_stem(),
                error = %reason,
                "rollback after rejected configuration apply also failed on at least one component"
            );
            ConfigEvent::RollbackFailed { config_type, reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::config_component::ConfigComponentError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct RecordingComponent {
        config_type: ConfigType,
        applied: AtomicUsize,
        last_value: Mutex<Option<Value>>,
    }

    impl RecordingComponent {
        fn new(config_type: ConfigType) -> Self {
            Self {
                config_type,
                applied: AtomicUsize::new(0),
                last_value: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ConfigComponent for RecordingComponent {
        fn handles_config_type(&self, config_type: ConfigType) -> bool {
            config_type == self.config_type
        }

        async fn update_config(
            &self,
            _config_type: ConfigType,
            new_value: Value,
            _old_value: Option<Value>,
        ) -> Result<(), ConfigComponentError> {
            self.applied.fetch_add(1, Ordering::AcqRel);
            *self.last_value.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(new_value);
            Ok(())
        }
    }

    /// Rejects exactly the configuration carrying `batchSize == 2`, so a
    /// test can drive a real apply-then-reject-then-rollback sequence: the
    /// first apply (batch size 1) is accepted, the second (batch size 2) is
    /// rejected, and the rollback reapplies batch size 1 again.
    struct RejectingComponent {
        config_type: ConfigType,
        accepted_batch_sizes: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl ConfigComponent for RejectingComponent {
        fn handles_config_type(&self, config_type: ConfigType) -> bool {
            config_type == self.config_type
        }

        async fn update_config(
            &self,
            _config_type: ConfigType,
            new_value: Value,
            _old_value: Option<Value>,
        ) -> Result<(), ConfigComponentError> {
            let batch_size = new_value.get("batchSize").and_then(Value::as_u64).unwrap_or(0);
            if batch_size == 2 {
                return Err(ConfigComponentError::rejected("simulated rejection".to_owned()));
            }
            self.accepted_batch_sizes
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(batch_size);
            Ok(())
        }
    }

    fn ingestion_payload(batch_size: u32) -> String {
        serde_json::json!({
            "batchSize": batch_size,
            "maxRetries": 1,
            "timeoutMs": 1000,
            "concurrency": 2,
        })
        .to_string()
    }

    #[tokio::test]
    async fn applying_a_valid_file_commits_and_notifies_components() {
        let plane = ConfigPlane::new();
        let component = Arc::new(RecordingComponent::new(ConfigType::Ingestion));
        plane.register_component(component.clone());

        plane
            .apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), &ingestion_payload(10))
            .await
            .expect("apply");

        assert_eq!(component.applied.load(Ordering::Acquire), 1);
        let entry = plane.ingestion().expect("ingestion entry");
        assert_eq!(entry.value.batch_size, 10);
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn reapplying_an_unchanged_file_is_a_no_op() {
        let plane = ConfigPlane::new();
        let component = Arc::new(RecordingComponent::new(ConfigType::Ingestion));
        plane.register_component(component.clone());

        let payload = ingestion_payload(5);
        plane
            .apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), &payload)
            .await
            .expect("first apply");
        plane
            .apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), &payload)
            .await
            .expect("second apply");

        assert_eq!(component.applied.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn invalid_json_is_rejected_and_leaves_prior_snapshot_intact() {
        let plane = ConfigPlane::new();
        plane
            .apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), &ingestion_payload(1))
            .await
            .expect("apply");

        let result = plane.apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), "not json").await;
        assert!(result.is_err());
        assert_eq!(plane.ingestion().expect("entry").value.batch_size, 1);
    }

    #[tokio::test]
    async fn schema_violation_is_rejected() {
        let plane = ConfigPlane::new();
        let result = plane
            .apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), "{\"batchSize\": \"not-a-number\"}")
            .await;
        assert!(result.is_err());
        assert!(plane.ingestion().is_none());
    }

    #[tokio::test]
    async fn a_rejecting_component_triggers_rollback_to_the_prior_value() {
        let plane = ConfigPlane::new();
        let component = Arc::new(RejectingComponent {
            config_type: ConfigType::Ingestion,
            accepted_batch_sizes: Mutex::new(Vec::new()),
        });
        plane.register_component(component.clone());

        plane
            .apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), &ingestion_payload(1))
            .await
            .expect("first apply");

        let result = plane
            .apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), &ingestion_payload(2))
            .await;
        assert!(result.is_err());
        assert_eq!(
            *component.accepted_batch_sizes.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            vec![1, 1],
            "expected the initial apply and the rollback reapply, batch size 2 never accepted"
        );
        assert_eq!(plane.ingestion().expect("entry").value.batch_size, 1);
    }

    #[tokio::test]
    async fn removal_clears_the_snapshot_and_notifies_without_rollback() {
        let plane = ConfigPlane::new();
        let component = Arc::new(RecordingComponent::new(ConfigType::Ingestion));
        plane.register_component(component.clone());
        plane
            .apply_raw(ConfigType::Ingestion, "ingestion.json".to_owned(), &ingestion_payload(1))
            .await
            .expect("apply");

        plane.remove_config(ConfigType::Ingestion).await.expect("remove");
        assert!(plane.ingestion().is_none());
    }

    #[tokio::test]
    async fn environment_interpolation_runs_before_schema_validation() {
        // No env var named this way is expected to exist, so the
        // placeholder interpolates to an empty string; if interpolation
        // did not run before validation the literal `${...}` text would
        // still be present (and would still validate fine here, since the
        // field is a plain string) — what this actually pins down is that
        // apply_raw's pipeline reaches interpolate::interpolate_value at
        // all before committing a snapshot.
        let plane = ConfigPlane::new();
        let payload = serde_json::json!({
            "openai": { "apiKey": "${PIPELINE_CORE_TEST_UNSET_VAR}" },
            "anthropic": null,
            "failover": {
                "circuitBreakerThreshold": 5,
                "circuitBreakerTimeoutMs": 30000,
                "healthCheckIntervalMs": 60000,
                "maxRetries": 3,
                "baseRetryDelayMs": 100,
                "maxRetryDelayMs": 5000,
                "retryMultiplier": 2.0,
                "defaultWeight": 1.0,
                "performanceWeight": 1.0,
                "costWeight": 1.0,
                "reliabilityWeight": 1.0,
            },
        })
        .to_string();

        plane.apply_raw(ConfigType::Provider, "provider.json".to_owned(), &payload).await.expect("apply");

        let entry = plane.provider().expect("provider entry");
        assert_eq!(entry.value.openai.expect("openai credential").api_key, String::new());
    }
}
