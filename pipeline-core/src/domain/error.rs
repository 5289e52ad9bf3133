//! Domain error representation shared across queue, gateway, and config
//! plane subsystems.
//!
//! Keep this module free from any particular transport so the same error
//! shape can be surfaced by a CLI, a long-running service, or tests alike.
//! Subsystem-local errors (`queue::JobStoreError`, `gateway::GatewayError`,
//! `config_plane::ConfigError`, `ingestion::IngestionError`) classify into
//! one of these codes so library consumers can branch on a stable value
//! without matching on every subsystem's variants.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable machine-readable error classification.
///
/// Mirrors the error-kind taxonomy used throughout the pipeline: config and
/// request validation, provider failure modes, and job-lifecycle failures
/// all reduce to one of these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Config or request does not match its schema; never retried.
    Validation,
    /// A referenced entity (job, template, provider) is absent.
    NotFound,
    /// Provider authentication or permission failure; non-retryable.
    Auth,
    /// Retryable with backoff; counts toward the circuit breaker only on
    /// repeated occurrence.
    RateLimited,
    /// Retryable; scoped to a single attempt.
    Timeout,
    /// Retryable network-level failure (connection reset, DNS, etc.).
    Network,
    /// Retryable remote 5xx response.
    Remote5xx,
    /// Non-retryable remote 4xx response other than 429.
    Remote4xxOther,
    /// Lease visibility timeout exceeded; fatal for that attempt.
    Stalled,
    /// Discovery/registration failure; cleans up the source and fails the job.
    HandlerFatal,
    /// Per-document failure; soft unless `stopOnError` is set.
    DocumentError,
    /// Configuration rejected; the previous snapshot remains authoritative.
    ConfigInvalid,
    /// An unexpected internal error.
    InternalError,
}

impl ErrorCode {
    /// Whether an error of this kind should be retried by the caller.
    ///
    /// # Examples
    /// ```
    /// use pipeline_core::domain::ErrorCode;
    ///
    /// assert!(ErrorCode::Network.is_retryable());
    /// assert!(!ErrorCode::Validation.is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::Network | Self::Remote5xx
        )
    }
}

/// Domain error payload shared across subsystems.
///
/// ## Invariants
/// - `message` must be non-empty once trimmed of whitespace.
/// - `trace_id`, when present, must be non-empty.
///
/// # Examples
/// ```
/// use pipeline_core::domain::{Error, ErrorCode};
///
/// let err = Error::new(ErrorCode::NotFound, "missing");
/// assert_eq!(err.code(), ErrorCode::NotFound);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
#[serde(try_from = "ErrorDto", into = "ErrorDto")]
#[error("{message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(alias = "trace_id")]
    trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorValidationError {
    EmptyMessage,
    EmptyTraceId,
}

impl std::fmt::Display for ErrorValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "error message must not be empty"),
            Self::EmptyTraceId => write!(f, "trace identifier must not be empty"),
        }
    }
}

impl std::error::Error for ErrorValidationError {}

impl Error {
    /// Create a new error.
    ///
    /// # Panics
    /// Panics if `message` is empty once trimmed; use [`Self::try_new`] to
    /// handle that case without panicking.
    ///
    /// # Examples
    /// ```
    /// use pipeline_core::domain::{Error, ErrorCode};
    /// let err = Error::new(ErrorCode::Validation, "bad");
    /// assert_eq!(err.code(), ErrorCode::Validation);
    /// ```
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        match Self::try_new(code, message) {
            Ok(value) => value,
            Err(err) => panic!("error messages must satisfy validation: {err}"),
        }
    }

    /// Fallible constructor that validates the message content.
    pub fn try_new(
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Result<Self, ErrorValidationError> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(ErrorValidationError::EmptyMessage);
        }
        Ok(Self {
            code,
            message,
            trace_id: None,
            details: None,
        })
    }

    /// Stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Correlation identifier for tracing this error across systems.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Supplementary error details.
    #[must_use]
    pub const fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// Attach a trace identifier to the error.
    ///
    /// # Panics
    /// Panics if `id` is empty once trimmed; use [`Self::try_with_trace_id`]
    /// to handle that case without panicking.
    ///
    /// # Examples
    /// ```
    /// use pipeline_core::domain::{Error, ErrorCode};
    /// let err = Error::new(ErrorCode::Auth, "nope").with_trace_id("abc");
    /// assert_eq!(err.trace_id(), Some("abc"));
    /// ```
    #[must_use]
    pub fn with_trace_id(self, id: impl Into<String>) -> Self {
        match self.try_with_trace_id(id) {
            Ok(value) => value,
            Err(err) => panic!("trace identifiers must satisfy validation: {err}"),
        }
    }

    /// Fallible variant of [`Self::with_trace_id`].
    pub fn try_with_trace_id(
        mut self,
        id: impl Into<String>,
    ) -> Result<Self, ErrorValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ErrorValidationError::EmptyTraceId);
        }
        self.trace_id = Some(id);
        Ok(self)
    }

    /// Attach structured details to the error.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convenience constructor for [`ErrorCode::Validation`].
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Convenience constructor for [`ErrorCode::NotFound`].
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Convenience constructor for [`ErrorCode::Auth`].
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Auth, message)
    }

    /// Convenience constructor for [`ErrorCode::InternalError`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Provide a trace identifier if absent.
    pub fn with_optional_trace_id(
        self,
        trace_id: Option<String>,
    ) -> Result<Self, ErrorValidationError> {
        match trace_id {
            Some(id) => self.try_with_trace_id(id),
            None => Ok(self),
        }
    }

    /// Redact server-side details so the payload is safe to expose to callers
    /// outside the process boundary.
    ///
    /// Internal errors keep their code and trace identifier but replace the
    /// message with a generic explanation and drop structured details.
    #[must_use]
    pub fn redacted_for_clients(&self) -> Self {
        if !matches!(self.code, ErrorCode::InternalError) {
            return self.clone();
        }
        let mut redacted = self.clone();
        "Internal server error".clone_into(&mut redacted.message);
        redacted.details = None;
        redacted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDto {
    code: ErrorCode,
    message: String,
    #[serde(alias = "trace_id")]
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl From<Error> for ErrorDto {
    fn from(value: Error) -> Self {
        Self {
            code: value.code,
            message: value.message,
            trace_id: value.trace_id,
            details: value.details,
        }
    }
}

impl TryFrom<ErrorDto> for Error {
    type Error = ErrorValidationError;

    fn try_from(value: ErrorDto) -> Result<Self, Self::Error> {
        let ErrorDto {
            code,
            message,
            trace_id,
            details,
        } = value;

        let mut error = Self::try_new(code, message)?;
        if let Some(trace_id) = trace_id {
            error = error.try_with_trace_id(trace_id)?;
        } else {
            error.trace_id = None;
        }
        error.details = details;
        Ok(error)
    }
}

#[cfg(test)]
mod tests;
