//! Domain error validation and serde round-trips.

use super::*;
use rstest::{fixture, rstest};
use serde_json::json;

#[fixture]
fn base_error() -> Error {
    Error::validation("bad request body")
}

#[rstest]
fn validation_constructor_sets_code() {
    let err = Error::validation("bad");
    assert_eq!(err.code(), ErrorCode::Validation);
}

#[rstest]
fn try_new_rejects_empty_messages() {
    let result = Error::try_new(ErrorCode::Validation, "   ");
    assert!(matches!(result, Err(ErrorValidationError::EmptyMessage)));
}

#[rstest]
fn with_details_attaches_payload(base_error: Error) {
    let err = base_error.with_details(json!({"field": "name"}));
    assert_eq!(err.details(), Some(&json!({"field": "name"})));
}

#[rstest]
fn serde_round_trip_preserves_fields() {
    let err = Error::new(ErrorCode::Auth, "denied").with_details(json!({"reason": "policy"}));
    let json = serde_json::to_string(&err).expect("serialise");
    let round_tripped: Error = serde_json::from_str(&json).expect("deserialise should succeed");
    assert_eq!(round_tripped.code(), ErrorCode::Auth);
    assert_eq!(round_tripped.message(), "denied");
    assert_eq!(round_tripped.details(), Some(&json!({"reason": "policy"})));
}

#[rstest]
fn display_uses_message(base_error: Error) {
    assert_eq!(base_error.to_string(), base_error.message());
}

#[rstest]
#[case::rate_limited(ErrorCode::RateLimited, true)]
#[case::timeout(ErrorCode::Timeout, true)]
#[case::network(ErrorCode::Network, true)]
#[case::remote_5xx(ErrorCode::Remote5xx, true)]
#[case::validation(ErrorCode::Validation, false)]
#[case::auth(ErrorCode::Auth, false)]
#[case::remote_4xx_other(ErrorCode::Remote4xxOther, false)]
fn is_retryable_matches_taxonomy(#[case] code: ErrorCode, #[case] expected: bool) {
    assert_eq!(code.is_retryable(), expected);
}

#[rstest]
fn redacted_for_clients_masks_internal_errors_only() {
    let internal = Error::internal("boom").with_details(json!({"stack": "trace"}));
    let redacted = internal.redacted_for_clients();
    assert_eq!(redacted.message(), "Internal server error");
    assert!(redacted.details().is_none());

    let not_found = Error::not_found("missing job abc");
    assert_eq!(not_found.redacted_for_clients(), not_found);
}

#[rstest]
fn try_with_trace_id_rejects_blank_identifiers(base_error: Error) {
    let result = base_error.try_with_trace_id("   ");
    assert!(matches!(result, Err(ErrorValidationError::EmptyTraceId)));
}
