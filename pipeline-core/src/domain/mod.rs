//! Domain primitives and aggregates.
//!
//! Purpose: define strongly typed domain entities shared by the queue,
//! worker pool, ingestion processor, provider gateway, and config plane.
//! Keep types immutable where invariants matter and document serialisation
//! contracts (serde) in each type's Rustdoc.
//!
//! Public surface:
//! - [`error::Error`] / [`error::ErrorCode`] — transport-agnostic error payload.
//! - [`job`] — job lifecycle records and identifiers.
//! - [`source`] — source specifications and the documents/records they yield.
//! - [`provider`] — provider descriptors and runtime/circuit-breaker state.
//! - [`config`] — typed configuration snapshots applied by the config plane.

pub mod config;
pub mod error;
pub mod job;
pub mod ports;
pub mod provider;
pub mod source;

pub use self::error::{Error, ErrorCode, ErrorValidationError};

/// Convenient domain result alias.
///
/// # Examples
/// ```
/// use pipeline_core::domain::{DomainResult, Error};
///
/// fn sample_operation() -> DomainResult<()> {
///     Err(Error::not_found("missing"))
/// }
/// ```
pub type DomainResult<T> = Result<T, Error>;
