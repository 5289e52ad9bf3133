//! Content-addressed prompt template store.
//!
//! One store, not two parallel managers: templates are versioned by name,
//! content-addressed with the same `sha2`/`hex`-based hashing
//! [`crate::domain::source::hash_normalized`] uses for extracted record
//! content, and variable substitution is a plain `{{name}}` scan rather
//! than pulling in a templating engine dependency for substitution this
//! simple.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::domain::ports::define_port_error;

define_port_error! {
    pub enum PromptTemplateError {
        UnknownTemplate { name: String } => "no prompt template registered under name {name}",
        UnknownVersion { name: String, version: u32 } => "prompt template {name} has no version {version}",
        MissingVariables { names: String } => "prompt is missing required variables: {names}",
    }
}

/// A saved, versioned prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplateRecord {
    pub template_id: String,
    pub name: String,
    pub version: u32,
    pub text: String,
    pub required_variables: Vec<String>,
    pub hash: String,
}

/// In-memory, append-only store of prompt template versions, keyed by name.
///
/// Saving content identical to an existing version (by canonical hash)
/// returns that version rather than minting a new one, so repeated
/// `save_template` calls with the same content are idempotent.
#[derive(Debug, Default)]
pub struct PromptTemplateStore {
    versions: Mutex<HashMap<String, Vec<PromptTemplateRecord>>>,
}

fn canonical_hash(name: &str, text: &str, required_variables: &[String]) -> String {
    let mut sorted = required_variables.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hasher.update([0u8]);
    hasher.update(sorted.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

impl PromptTemplateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a template version. Byte-identical content (name, text, and
    /// required variable set) returns the existing record instead of
    /// minting a new version.
    pub fn save_template(&self, name: impl Into<String>, text: impl Into<String>, required_variables: Vec<String>) -> PromptTemplateRecord {
        let name = name.into();
        let text = text.into();
        let hash = canonical_hash(&name, &text, &required_variables);
        let mut versions = self.versions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entries = versions.entry(name.clone()).or_default();
        if let Some(existing) = entries.iter().find(|record| record.hash == hash) {
            return existing.clone();
        }
        #[allow(clippy::cast_possible_truncation, reason = "template version counts stay far below u32::MAX in practice")]
        let version = entries.len() as u32 + 1;
        let record = PromptTemplateRecord {
            template_id: format!("{name}:v{version}"),
            name,
            version,
            text,
            required_variables,
            hash,
        };
        entries.push(record.clone());
        record
    }

    /// Resolve a template by name and optional version; `None` resolves to
    /// the latest saved version.
    pub fn resolve(&self, name: &str, version: Option<u32>) -> Result<PromptTemplateRecord, PromptTemplateError> {
        let versions = self.versions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entries = versions.get(name).ok_or_else(|| PromptTemplateError::unknown_template(name.to_owned()))?;
        match version {
            None => entries.last().cloned().ok_or_else(|| PromptTemplateError::unknown_template(name.to_owned())),
            Some(wanted) => entries
                .iter()
                .find(|record| record.version == wanted)
                .cloned()
                .ok_or_else(|| PromptTemplateError::unknown_version(name.to_owned(), wanted)),
        }
    }
}

/// Substitute `{{name}}` placeholders in `text` from `variables`. Returns
/// the rendered text and the names of any required variables absent from
/// `variables`.
#[must_use]
pub fn render(text: &str, required_variables: &[String], variables: &HashMap<String, String>) -> (String, Vec<String>) {
    let missing: Vec<String> = required_variables
        .iter()
        .filter(|name| !variables.contains_key(name.as_str()))
        .cloned()
        .collect();

    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            rendered.push_str(rest);
            rest = "";
            break;
        };
        rendered.push_str(&rest[..start]);
        let name = rest[start + 2..start + end].trim();
        match variables.get(name) {
            Some(value) => rendered.push_str(value),
            None => rendered.push_str(&rest[start..start + end + 2]),
        }
        rest = &rest[start + end + 2..];
    }
    rendered.push_str(rest);
    (rendered, missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saving_identical_content_twice_returns_the_same_version() {
        let store = PromptTemplateStore::new();
        let first = store.save_template("summarize", "hello {{name}}", vec!["name".to_owned()]);
        let second = store.save_template("summarize", "hello {{name}}", vec!["name".to_owned()]);
        assert_eq!(first.template_id, second.template_id);
        assert_eq!(first.version, second.version);
        assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn saving_different_content_mints_a_new_version() {
        let store = PromptTemplateStore::new();
        let first = store.save_template("summarize", "hello {{name}}", vec!["name".to_owned()]);
        let second = store.save_template("summarize", "hi {{name}}", vec!["name".to_owned()]);
        assert_ne!(first.version, second.version);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn resolve_without_version_returns_latest() {
        let store = PromptTemplateStore::new();
        store.save_template("summarize", "v1", vec![]);
        store.save_template("summarize", "v2", vec![]);
        let latest = store.resolve("summarize", None).expect("latest");
        assert_eq!(latest.text, "v2");
    }

    #[test]
    fn unknown_template_name_is_an_error() {
        let store = PromptTemplateStore::new();
        assert!(matches!(
            store.resolve("missing", None),
            Err(PromptTemplateError::UnknownTemplate { .. })
        ));
    }

    #[test]
    fn render_substitutes_known_variables_and_reports_missing_ones() {
        let variables = HashMap::from([("name".to_owned(), "world".to_owned())]);
        let (rendered, missing) = render(
            "hello {{name}}, your id is {{id}}",
            &["name".to_owned(), "id".to_owned()],
            &variables,
        );
        assert_eq!(rendered, "hello world, your id is {{id}}");
        assert_eq!(missing, vec!["id".to_owned()]);
    }
}
