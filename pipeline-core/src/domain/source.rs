//! Source specifications and the documents/records they yield.
//!
//! These types describe the contract between the ingestion processor and a
//! concrete [`crate::domain::ports::source_handler::SourceHandler`]
//! implementation, without prescribing how any particular handler discovers
//! or fetches documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::provider::PromptTemplateRef;

/// Caller-chosen source configuration.
///
/// `config` is an opaque, handler-specific blob; only the handler named by
/// `type_tag` knows how to interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: String,
    pub type_tag: String,
    pub enabled: bool,
    pub visibility: SourceVisibility,
    pub config: Value,
    pub schedule: Option<String>,
}

impl SourceSpec {
    #[cfg(test)]
    pub(crate) fn test_fixture() -> Self {
        Self {
            id: "src-1".to_owned(),
            type_tag: "static".to_owned(),
            enabled: true,
            visibility: SourceVisibility::Private,
            config: Value::Null,
            schedule: None,
        }
    }
}

/// Whether a source is visible to other tenants/processes beyond the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceVisibility {
    Private,
    Shared,
}

/// A stable reference to a document within a source, with change markers
/// that let discovery skip unchanged documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentHandle {
    pub id: String,
    pub location: String,
    pub metadata: Value,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl DocumentHandle {
    /// Whether `candidate` represents the same content as `self` per its
    /// change markers (etag takes precedence over last-modified).
    #[must_use]
    pub fn is_unchanged(&self, candidate: &Self) -> bool {
        match (&self.etag, &candidate.etag) {
            (Some(known), Some(seen)) => known == seen,
            _ => self.last_modified.is_some() && self.last_modified == candidate.last_modified,
        }
    }
}

/// Raw bytes or text pulled from a document, prior to transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub document_id: String,
    pub raw_content: RawContent,
    pub content_hash: String,
    pub metadata: Value,
}

impl ExtractedRecord {
    /// Build a record, computing `content_hash` deterministically over the
    /// content's normalized (UTF-8, newline-collapsed) form.
    #[must_use]
    pub fn new(document_id: impl Into<String>, raw_content: RawContent, metadata: Value) -> Self {
        let content_hash = hash_normalized(&raw_content);
        Self {
            document_id: document_id.into(),
            raw_content,
            content_hash,
            metadata,
        }
    }
}

/// Extracted content, either textual or opaque bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "encoding", content = "data")]
pub enum RawContent {
    Text(String),
    Bytes(Vec<u8>),
}

fn hash_normalized(content: &RawContent) -> String {
    let normalized: Vec<u8> = match content {
        RawContent::Text(text) => text.replace("\r\n", "\n").into_bytes(),
        RawContent::Bytes(bytes) => bytes.clone(),
    };
    let digest = Sha256::digest(&normalized);
    hex::encode(digest)
}

/// The result of transforming an [`ExtractedRecord`], optionally via the
/// provider gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub document_id: String,
    pub content: String,
    pub title: Option<String>,
    pub word_count: u32,
    pub char_count: u32,
    pub metadata: Value,
    pub prompt_template: Option<PromptTemplateRef>,
}

impl EnrichedRecord {
    /// Build a record, computing `word_count`/`char_count` from `content`.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        content: impl Into<String>,
        title: Option<String>,
        metadata: Value,
        prompt_template: Option<PromptTemplateRef>,
    ) -> Self {
        let content = content.into();
        let word_count = u32::try_from(content.split_whitespace().count()).unwrap_or(u32::MAX);
        let char_count = u32::try_from(content.chars().count()).unwrap_or(u32::MAX);
        Self {
            document_id: document_id.into(),
            content,
            title,
            word_count,
            char_count,
            metadata,
            prompt_template,
        }
    }
}
