//! The contract a concrete external-model adapter (OpenAI, Anthropic, …)
//! must satisfy to be registered with the provider gateway.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

use crate::domain::ports::define_port_error;

define_port_error! {
    #[derive(Clone)]
    pub enum ProviderAdapterError {
        Auth { reason: String } => "authentication or permission error: {reason}",
        RateLimited => "provider rejected the request as rate limited",
        Timeout => "request to provider timed out",
        Network { reason: String } => "network error contacting provider: {reason}",
        Remote5xx { status: u16 } => "provider returned server error {status}",
        Remote4xxOther { status: u16 } => "provider returned client error {status}",
        InvalidRequest { reason: String } => "request rejected by provider: {reason}",
    }
}

impl ProviderAdapterError {
    /// Whether the gateway's per-candidate retry loop should retry this
    /// error: network errors, HTTP 5xx, and HTTP 429 are retryable; HTTP
    /// 4xx (other than 429) and adapter-classified auth/invalid-request
    /// errors are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::Network { .. } | Self::Remote5xx { .. }
        )
    }
}

/// Token usage reported by a completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Cost breakdown for a completion call, in the provider's billing
/// currency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallCost {
    pub input: f64,
    pub output: f64,
    pub total: f64,
    pub currency: &'static str,
}

/// A request to a provider's completion endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub metadata: Value,
}

/// The result of a successful completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: CallCost,
    pub metadata: Value,
}

/// The result of a health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub response_time_ms: Option<u32>,
    pub error: Option<String>,
}

/// A concrete adapter over one external language-model API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The provider's unique registry name.
    fn name(&self) -> &str;

    /// Model identifiers this adapter can serve.
    fn supported_models(&self) -> HashSet<String>;

    /// Execute a completion request against the given model.
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderAdapterError>;

    /// Compute the cost of a call with the given token counts, without
    /// executing it.
    fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> CallCost;

    /// Probe the provider's health out-of-band from real traffic.
    async fn health_check(&self) -> HealthCheckResult;

    /// Release any resources held by this adapter. Optional; the default
    /// implementation is a no-op.
    async fn shutdown(&self) {}
}

/// A no-op [`ProviderAdapter`] for wiring tests and documentation examples
/// without a real adapter.
#[derive(Debug, Clone)]
pub struct FixtureProviderAdapter {
    name: String,
    models: HashSet<String>,
}

impl FixtureProviderAdapter {
    #[must_use]
    pub fn new(name: impl Into<String>, models: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            models: models.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FixtureProviderAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_models(&self) -> HashSet<String> {
        self.models.clone()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderAdapterError> {
        Ok(CompletionResponse {
            content: String::new(),
            model: request.model.clone(),
            usage: TokenUsage {
                input_tokens: 0,
                output_tokens: 0,
                total_tokens: 0,
            },
            cost: CallCost {
                input: 0.0,
                output: 0.0,
                total: 0.0,
                currency: "usd",
            },
            metadata: Value::Null,
        })
    }

    fn calculate_cost(&self, _model: &str, _input_tokens: u64, _output_tokens: u64) -> CallCost {
        CallCost {
            input: 0.0,
            output: 0.0,
            total: 0.0,
            currency: "usd",
        }
    }

    async fn health_check(&self) -> HealthCheckResult {
        HealthCheckResult {
            healthy: true,
            response_time_ms: Some(0),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_and_5xx_are_retryable() {
        assert!(ProviderAdapterError::rate_limited().is_retryable());
        assert!(ProviderAdapterError::remote5xx(502).is_retryable());
    }

    #[test]
    fn auth_and_4xx_other_are_not_retryable() {
        assert!(!ProviderAdapterError::auth("bad key".to_owned()).is_retryable());
        assert!(!ProviderAdapterError::remote4xx_other(404).is_retryable());
    }

    #[tokio::test]
    async fn fixture_adapter_completes_without_error() {
        let adapter = FixtureProviderAdapter::new("fixture", ["gpt".to_owned()]);
        let response = adapter
            .complete(&CompletionRequest {
                model: "gpt".to_owned(),
                prompt: "hi".to_owned(),
                metadata: Value::Null,
            })
            .await
            .expect("fixture adapter never fails");
        assert_eq!(response.model, "gpt");
    }
}
