//! Per-candidate retry loop for a single provider call, reusing the queue's
//! jittered backoff primitives instead of maintaining a second
//! implementation of the same arithmetic.

use chrono::Duration;

use crate::domain::ports::provider_adapter::{CompletionRequest, CompletionResponse, ProviderAdapter, ProviderAdapterError};
use crate::queue::backoff::{BackoffJitter, RETRY_FLOOR, apply_jitter, exponential_base_delay};

/// Retry tuning for one candidate provider, sourced from `FailoverSettings`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_retry_delay: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
    /// Per-attempt deadline. Expiration is classified as a retryable
    /// timeout, same as an adapter-reported one.
    pub attempt_timeout: std::time::Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::milliseconds(500),
            max_retry_delay: Duration::seconds(10),
            multiplier: 2.0,
            jitter_fraction: 0.25,
            attempt_timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// Call `adapter` with up to `config.max_retries` retries, applying a
/// jittered exponential delay between retryable failures. Returns the last
/// error once retries are exhausted or a non-retryable error is seen.
pub async fn call_with_retry(
    adapter: &dyn ProviderAdapter,
    request: &CompletionRequest,
    config: &RetryConfig,
    jitter: &dyn BackoffJitter,
) -> Result<CompletionResponse, ProviderAdapterError> {
    let mut last_err: Option<ProviderAdapterError> = None;
    for attempt in 0..=config.max_retries {
        let result = match tokio::time::timeout(config.attempt_timeout, adapter.complete(request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ProviderAdapterError::timeout()),
        };
        match result {
            Ok(response) => return Ok(response),
            Err(err) => {
                let retryable = err.is_retryable();
                last_err = Some(err);
                if !retryable || attempt == config.max_retries {
                    break;
                }
                let delay = exponential_base_delay(config.base_delay, config.multiplier, config.max_retry_delay, attempt);
                let jittered = apply_jitter(delay, config.jitter_fraction, jitter).max(RETRY_FLOOR);
                tokio::time::sleep(jittered.to_std().unwrap_or_default()).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderAdapterError::network("no attempt was made".to_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::backoff::NoJitter;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyAdapter {
        failures_before_success: u32,
        attempts: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            "flaky"
        }

        fn supported_models(&self) -> HashSet<String> {
            HashSet::from(["model".to_owned()])
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderAdapterError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures_before_success {
                return Err(if self.retryable {
                    ProviderAdapterError::network("transient".to_owned())
                } else {
                    ProviderAdapterError::auth("bad key".to_owned())
                });
            }
            Ok(CompletionResponse {
                content: "ok".to_owned(),
                model: request.model.clone(),
                usage: crate::domain::ports::provider_adapter::TokenUsage {
                    input_tokens: 1,
                    output_tokens: 1,
                    total_tokens: 2,
                },
                cost: crate::domain::ports::provider_adapter::CallCost {
                    input: 0.0,
                    output: 0.0,
                    total: 0.0,
                    currency: "usd",
                },
                metadata: Value::Null,
            })
        }

        fn calculate_cost(&self, _model: &str, _input_tokens: u64, _output_tokens: u64) -> crate::domain::ports::provider_adapter::CallCost {
            crate::domain::ports::provider_adapter::CallCost {
                input: 0.0,
                output: 0.0,
                total: 0.0,
                currency: "usd",
            }
        }

        async fn health_check(&self) -> crate::domain::ports::provider_adapter::HealthCheckResult {
            crate::domain::ports::provider_adapter::HealthCheckResult {
                healthy: true,
                response_time_ms: Some(0),
                error: None,
            }
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "model".to_owned(),
            prompt: "hi".to_owned(),
            metadata: Value::Null,
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::milliseconds(1),
            max_retry_delay: Duration::milliseconds(5),
            multiplier: 1.0,
            jitter_fraction: 0.0,
            attempt_timeout: std::time::Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn retries_a_retryable_failure_until_success() {
        let adapter = FlakyAdapter {
            failures_before_success: 2,
            attempts: AtomicU32::new(0),
            retryable: true,
        };
        let result = call_with_retry(&adapter, &request(), &fast_config(), &NoJitter).await;
        assert!(result.is_ok());
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_a_non_retryable_failure() {
        let adapter = FlakyAdapter {
            failures_before_success: 10,
            attempts: AtomicU32::new(0),
            retryable: false,
        };
        let result = call_with_retry(&adapter, &request(), &fast_config(), &NoJitter).await;
        assert!(matches!(result, Err(ProviderAdapterError::Auth { .. })));
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_the_last_error() {
        let adapter = FlakyAdapter {
            failures_before_success: 100,
            attempts: AtomicU32::new(0),
            retryable: true,
        };
        let config = RetryConfig { max_retries: 2, ..fast_config() };
        let result = call_with_retry(&adapter, &request(), &config, &NoJitter).await;
        assert!(result.is_err());
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 3);
    }
}
