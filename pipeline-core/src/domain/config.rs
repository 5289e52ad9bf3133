//! Typed configuration sections applied by the config plane.
//!
//! One Rust type per configuration file type (`sources`, `ingestion`,
//! `queue`, `provider`), matching the directory-of-typed-files external
//! interface. [`ConfigSnapshot`] is the versioned, source-path-tagged
//! envelope the config plane publishes; only the most recently,
//! successfully validated value per type is visible to readers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::source::SourceSpec;

/// Discriminates the four configuration file types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    Sources,
    Ingestion,
    Queue,
    Provider,
}

impl ConfigType {
    /// The filename stem this configuration type is read from.
    #[must_use]
    pub const fn file_stem(self) -> &'static str {
        match self {
            Self::Sources => "sources",
            Self::Ingestion => "ingestion",
            Self::Queue => "queue",
            Self::Provider => "provider",
        }
    }

    /// Inverse of [`Self::file_stem`]: the type a configuration directory
    /// entry belongs to, by its filename stem. `None` for unrecognized
    /// stems, which the config plane ignores rather than rejects.
    #[must_use]
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        match stem {
            "sources" => Some(Self::Sources),
            "ingestion" => Some(Self::Ingestion),
            "queue" => Some(Self::Queue),
            "provider" => Some(Self::Provider),
            _ => None,
        }
    }
}

/// The `sources` configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub sources: Vec<SourceSpec>,
}

/// The `ingestion` configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSettings {
    pub batch_size: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub concurrency: u32,
    #[serde(default = "default_true")]
    pub enable_validation: bool,
}

const fn default_true() -> bool {
    true
}

/// The `queue` configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    pub backing_store: Option<QueueBackingStore>,
    pub queues: BTreeMap<String, QueueOptions>,
}

/// Connection details for the queue's backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueBackingStore {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u32,
}

/// Per-queue-name operational settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub concurrency: u32,
    pub default_job_options: DefaultJobOptions,
}

/// Default per-job options applied when a job does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultJobOptions {
    pub attempts: u32,
    pub backoff: BackoffSpec,
    pub remove_on_complete: u32,
    pub remove_on_fail: u32,
}

/// A named backoff strategy and its base delay, as configured externally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffSpec {
    pub backoff_type: BackoffType,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Fixed,
    Exponential,
}

/// The `provider` configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub openai: Option<ProviderCredential>,
    pub anthropic: Option<ProviderCredential>,
    pub failover: FailoverSettings,
}

/// Credentials and endpoint overrides for one provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredential {
    pub api_key: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub version: Option<String>,
}

/// Gateway-wide failover, retry, circuit-breaker, and scoring parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverSettings {
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_multiplier: f64,
    pub default_weight: f64,
    pub performance_weight: f64,
    pub cost_weight: f64,
    pub reliability_weight: f64,
}

/// One versioned, source-tagged configuration entry of a given type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry<T> {
    pub value: T,
    pub source_path: String,
    pub version: u64,
}

impl<T> ConfigEntry<T> {
    #[must_use]
    pub const fn new(value: T, source_path: String, version: u64) -> Self {
        Self {
            value,
            source_path,
            version,
        }
    }
}

/// The full set of configuration the config plane maintains: at most one
/// current entry per [`ConfigType`].
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub sources: Option<ConfigEntry<SourcesConfig>>,
    pub ingestion: Option<ConfigEntry<IngestionSettings>>,
    pub queue: Option<ConfigEntry<QueueSettings>>,
    pub provider: Option<ConfigEntry<ProviderSettings>>,
}
