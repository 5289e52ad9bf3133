//! The contract a concrete source adapter (static files, HTTP polling, …)
//! must satisfy for the ingestion processor to discover, extract, and
//! transform its documents.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::ports::define_port_error;
use crate::domain::source::{DocumentHandle, EnrichedRecord, ExtractedRecord, SourceSpec};

define_port_error! {
    #[derive(Clone)]
    pub enum SourceHandlerError {
        MissingFields { fields: String } => "source spec is missing required fields: {fields}",
        InvalidAuth => "source spec has invalid or missing authentication",
        DiscoveryFailed { reason: String } => "document discovery failed: {reason}",
        ExtractionFailed { document_id: String, reason: String } =>
            "extraction failed for document {document_id}: {reason}",
        TransformFailed { document_id: String, reason: String } =>
            "transform failed for document {document_id}: {reason}",
        Network { reason: String } => "network error: {reason}",
        Timeout => "operation timed out",
        CleanupFailed { reason: String } => "source cleanup failed: {reason}",
    }
}

impl SourceHandlerError {
    /// Whether the ingestion processor should retry the job that produced
    /// this error: `network`/`timeout` are retryable; registration/discovery/
    /// auth failures are `handler_fatal` and non-retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout)
    }
}

/// A concrete adapter over one class of external source.
///
/// Implementations must be safe to call concurrently across distinct
/// source ids; the ingestion processor serializes calls for a single
/// source id itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Validate a source spec's handler-specific `config` blob before it is
    /// registered.
    async fn validate(&self, spec: &SourceSpec) -> Result<(), SourceHandlerError>;

    /// Prepare the handler for use. Must be idempotent.
    async fn initialize(&self, spec: &SourceSpec) -> Result<(), SourceHandlerError>;

    /// Enumerate documents available from this source, lazily omitting
    /// handles whose change markers indicate no update since the caller's
    /// last known state.
    async fn discover(&self, spec: &SourceSpec) -> Result<Vec<DocumentHandle>, SourceHandlerError>;

    /// Fetch raw content for one document.
    async fn extract(
        &self,
        spec: &SourceSpec,
        handle: &DocumentHandle,
    ) -> Result<ExtractedRecord, SourceHandlerError>;

    /// Transform extracted content into an enriched record.
    async fn transform(
        &self,
        spec: &SourceSpec,
        extracted: &ExtractedRecord,
    ) -> Result<EnrichedRecord, SourceHandlerError>;

    /// Release any resources acquired since `initialize`.
    async fn cleanup(&self, spec: &SourceSpec) -> Result<(), SourceHandlerError>;
}

/// A no-op [`SourceHandler`] for wiring tests and documentation examples
/// without a real adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureSourceHandler;

#[async_trait]
impl SourceHandler for FixtureSourceHandler {
    async fn validate(&self, _spec: &SourceSpec) -> Result<(), SourceHandlerError> {
        Ok(())
    }

    async fn initialize(&self, _spec: &SourceSpec) -> Result<(), SourceHandlerError> {
        Ok(())
    }

    async fn discover(
        &self,
        _spec: &SourceSpec,
    ) -> Result<Vec<DocumentHandle>, SourceHandlerError> {
        Ok(Vec::new())
    }

    async fn extract(
        &self,
        _spec: &SourceSpec,
        handle: &DocumentHandle,
    ) -> Result<ExtractedRecord, SourceHandlerError> {
        Ok(ExtractedRecord::new(
            handle.id.clone(),
            crate::domain::source::RawContent::Text(String::new()),
            Value::Null,
        ))
    }

    async fn transform(
        &self,
        _spec: &SourceSpec,
        extracted: &ExtractedRecord,
    ) -> Result<EnrichedRecord, SourceHandlerError> {
        Ok(EnrichedRecord::new(
            extracted.document_id.clone(),
            String::new(),
            None,
            Value::Null,
            None,
        ))
    }

    async fn cleanup(&self, _spec: &SourceSpec) -> Result<(), SourceHandlerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_timeout_are_retryable() {
        assert!(
            SourceHandlerError::network("reset".to_owned()).is_retryable()
        );
        assert!(SourceHandlerError::timeout().is_retryable());
    }

    #[test]
    fn auth_and_missing_fields_are_not_retryable() {
        assert!(!SourceHandlerError::invalid_auth().is_retryable());
        assert!(
            !SourceHandlerError::missing_fields("config.basePath".to_owned()).is_retryable()
        );
    }

    #[tokio::test]
    async fn fixture_handler_round_trips_an_empty_document() {
        let handler = FixtureSourceHandler;
        let spec = SourceSpec::test_fixture();
        let handles = handler.discover(&spec).await.expect("discover");
        assert!(handles.is_empty());
    }
}
