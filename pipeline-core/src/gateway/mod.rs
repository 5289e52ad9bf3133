//! Provider-agnostic enrichment gateway: weighted candidate selection,
//! per-provider circuit breakers, per-candidate retry with failover, health
//! probing, and a content-addressed prompt template store.
//!
//! Structured the same way [`crate::queue::JobStore`] pairs a pure state
//! machine ([`circuit_breaker::CircuitBreakerRegistry`],
//! [`selection::score`]) with an async-friendly facade that owns the
//! `Mutex`-guarded mutable state and publishes lifecycle events on a
//! broadcast channel.

pub mod circuit_breaker;
pub mod events;
pub mod prompt_template;
pub mod retry;
pub mod selection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::config::{ConfigType, FailoverSettings, ProviderSettings};
use crate::domain::ports::config_component::{ConfigComponent, ConfigComponentError};
use crate::domain::ports::define_port_error;
use crate::domain::ports::provider_adapter::{CompletionRequest, CompletionResponse, ProviderAdapter};
use crate::domain::provider::{CallSample, CircuitMode, PromptTemplateRef, ProviderHealth, ProviderRuntimeState};
use crate::gateway::circuit_breaker::{CircuitBreakerRegistry, CircuitConfig};
use crate::gateway::events::ProviderEvent;
use crate::gateway::prompt_template::{PromptTemplateRecord, PromptTemplateStore, render};
use crate::gateway::retry::{RetryConfig, call_with_retry};
use crate::gateway::selection::{ScoreWeights, score};
use crate::queue::backoff::{BackoffJitter, RandomJitter};

define_port_error! {
    pub enum GatewayError {
        UnknownProvider { name: String } => "no provider registered under name {name}",
        AllProvidersFailed { reason: String } => "every candidate provider failed: {reason}",
        Template { reason: String } => "prompt template resolution failed: {reason}",
        MissingVariables { names: String } => "prompt is missing required variables: {names}",
    }
}

impl From<prompt_template::PromptTemplateError> for GatewayError {
    fn from(err: prompt_template::PromptTemplateError) -> Self {
        Self::template(err.to_string())
    }
}

const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 60_000;

/// Registry of provider adapters plus the runtime counters, circuit
/// breakers, and scoring weights the gateway uses to order and retry
/// candidates for a completion request.
pub struct ProviderGateway {
    providers: Mutex<HashMap<String, Arc<dyn ProviderAdapter>>>,
    runtime: Mutex<HashMap<String, ProviderRuntimeState>>,
    circuit: CircuitBreakerRegistry,
    weights: Mutex<ScoreWeights>,
    retry: Mutex<RetryConfig>,
    jitter: Arc<dyn BackoffJitter>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<ProviderEvent>,
    prompt_templates: PromptTemplateStore,
    health_check_interval_ms: AtomicU64,
    shutting_down: AtomicBool,
}

impl ProviderGateway {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _rx) = events::channel();
        Self {
            providers: Mutex::new(HashMap::new()),
            runtime: Mutex::new(HashMap::new()),
            circuit: CircuitBreakerRegistry::new(CircuitConfig::default()),
            weights: Mutex::new(ScoreWeights::default()),
            retry: Mutex::new(RetryConfig::default()),
            jitter: Arc::new(RandomJitter),
            clock,
            events,
            prompt_templates: PromptTemplateStore::new(),
            health_check_interval_ms: AtomicU64::new(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Build a gateway with an injectable jitter source, for deterministic
    /// tests of retry timing.
    #[must_use]
    pub fn with_jitter(clock: Arc<dyn Clock>, jitter: Arc<dyn BackoffJitter>) -> Self {
        let mut gateway = Self::new(clock);
        gateway.jitter = jitter;
        gateway
    }

    /// Register (or replace) a provider adapter under its own reported name.
    pub fn register_provider(&self, adapter: Arc<dyn ProviderAdapter>) {
        let name = adapter.name().to_owned();
        self.providers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.clone(), adapter);
        self.runtime
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(name)
            .or_insert_with(ProviderRuntimeState::new);
    }

    /// Currently registered provider names.
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// A snapshot of a provider's runtime counters, for observability.
    #[must_use]
    pub fn runtime_snapshot(&self, name: &str) -> Option<ProviderRuntimeState> {
        self.runtime
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Rebind scoring weights, retry tuning, and circuit breaker thresholds
    /// from a `provider.json`'s `failover` section.
    pub fn apply_config(&self, settings: &FailoverSettings) {
        let weights = ScoreWeights {
            default_weight: settings.default_weight,
            performance_weight: settings.performance_weight,
            cost_weight: settings.cost_weight,
            reliability_weight: settings.reliability_weight,
            ..ScoreWeights::default()
        };
        *self.weights.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = weights;

        let retry = RetryConfig {
            max_retries: settings.max_retries,
            base_delay: chrono::Duration::milliseconds(i64::try_from(settings.base_retry_delay_ms).unwrap_or(i64::MAX)),
            max_retry_delay: chrono::Duration::milliseconds(i64::try_from(settings.max_retry_delay_ms).unwrap_or(i64::MAX)),
            multiplier: settings.retry_multiplier,
            ..RetryConfig::default()
        };
        *self.retry.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = retry;

        self.circuit.apply_config(CircuitConfig {
            failure_threshold: settings.circuit_breaker_threshold,
            open_cooldown: chrono::Duration::milliseconds(i64::try_from(settings.circuit_breaker_timeout_ms).unwrap_or(i64::MAX)),
        });

        self.health_check_interval_ms.store(settings.health_check_interval_ms, Ordering::Release);
    }

    /// Subscribe to gateway lifecycle events. Lagging subscribers drop the
    /// oldest unread event rather than stalling the publisher.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    fn ordered_candidates(&self, model: &str, now: DateTime<Utc>) -> Vec<String> {
        let providers = self.providers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let runtime = self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let weights = *self.weights.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut closed: Vec<(String, f64)> = Vec::new();
        let mut half_open_eligible: Vec<(String, f64)> = Vec::new();
        for (name, adapter) in providers.iter() {
            if !adapter.supported_models().contains(model) {
                continue;
            }
            let state = runtime.get(name).cloned().unwrap_or_default();
            let candidate_score = score(&state, &weights, now);
            let breaker = self.circuit.snapshot(name);
            match breaker.mode {
                CircuitMode::Closed => closed.push((name.clone(), candidate_score)),
                CircuitMode::HalfOpen => half_open_eligible.push((name.clone(), candidate_score)),
                CircuitMode::Open => {
                    let cooldown_elapsed = match breaker.next_attempt_at {
                        Some(at) => now >= at,
                        None => true,
                    };
                    if cooldown_elapsed {
                        half_open_eligible.push((name.clone(), candidate_score));
                    }
                }
            }
        }
        closed.sort_by(|left, right| right.1.total_cmp(&left.1));
        half_open_eligible.sort_by(|left, right| right.1.total_cmp(&left.1));
        closed.into_iter().chain(half_open_eligible).map(|(name, _)| name).collect()
    }

    /// Execute a completion request against the best-scoring admitted
    /// candidate, retrying and failing over across candidates in score
    /// order (half-open circuits tried last) until one succeeds or every
    /// candidate is exhausted.
    pub async fn execute(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        let candidates = self.ordered_candidates(&request.model, self.clock.utc());
        let mut last_reason = format!("no candidate providers are registered for model {}", request.model);
        if candidates.is_empty() {
            self.publish(ProviderEvent::AllProvidersFailed { reason: last_reason.clone() });
            return Err(GatewayError::all_providers_failed(last_reason));
        }

        for name in candidates {
            let now = self.clock.utc();
            if !self.circuit.admit(&name, now) {
                continue;
            }
            let Some(adapter) = self
                .providers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&name)
                .cloned()
            else {
                continue;
            };
            let retry_config = *self.retry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let jitter = Arc::clone(&self.jitter);
            let started = std::time::Instant::now();
            match call_with_retry(adapter.as_ref(), &request, &retry_config, jitter.as_ref()).await {
                Ok(response) => {
                    self.record_success(&name, &request.model, started.elapsed(), response.cost.total, now)?;
                    return Ok(response);
                }
                Err(err) => {
                    last_reason = err.to_string();
                    self.record_failure(&name, &last_reason, now)?;
                }
            }
        }

        self.publish(ProviderEvent::AllProvidersFailed { reason: last_reason.clone() });
        Err(GatewayError::all_providers_failed(last_reason))
    }

    /// Render `template_name` (latest version, or `version` if given) with
    /// `variables` and execute the resulting prompt against `model`,
    /// returning the response alongside a reference to the exact template
    /// version used.
    pub async fn execute_with_prompt(
        &self,
        template_name: &str,
        version: Option<u32>,
        model: impl Into<String>,
        variables: &HashMap<String, String>,
    ) -> Result<(CompletionResponse, PromptTemplateRef), GatewayError> {
        let template = self.prompt_templates.resolve(template_name, version)?;
        let (rendered, missing) = render(&template.text, &template.required_variables, variables);
        if !missing.is_empty() {
            return Err(GatewayError::missing_variables(missing.join(", ")));
        }
        let request = CompletionRequest {
            model: model.into(),
            prompt: rendered,
            metadata: Value::Null,
        };
        let response = self.execute(request).await?;
        let prompt_ref = PromptTemplateRef {
            template_id: template.template_id,
            template_name: template.name,
            template_version: template.version,
            prompt_hash: template.hash,
        };
        Ok((response, prompt_ref))
    }

    /// Save a prompt template version. Byte-identical content is idempotent;
    /// see [`PromptTemplateStore::save_template`].
    pub fn save_prompt_template(
        &self,
        name: impl Into<String>,
        text: impl Into<String>,
        required_variables: Vec<String>,
    ) -> PromptTemplateRecord {
        self.prompt_templates.save_template(name, text, required_variables)
    }

    /// Record a successful call against `name`.
    ///
    /// Per SPEC_FULL §9, an unregistered provider name is a programmer
    /// error, not a condition to paper over by silently initializing
    /// runtime state — callers get [`GatewayError::unknown_provider`]
    /// instead. `execute` never triggers this in practice since it only
    /// calls through candidates already drawn from the provider registry.
    fn record_success(
        &self,
        name: &str,
        model: &str,
        elapsed: std::time::Duration,
        cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        #[allow(clippy::cast_possible_truncation, reason = "call latencies fit comfortably within u32 milliseconds")]
        let response_time_ms = elapsed.as_millis().min(u128::from(u32::MAX)) as u32;
        {
            let mut runtime = self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let state = runtime
                .get_mut(name)
                .ok_or_else(|| GatewayError::unknown_provider(name.to_owned()))?;
            state.total_requests += 1;
            state.consecutive_failures = 0;
            state.last_success_at = Some(now);
            state.status = ProviderHealth::Healthy;
            state.recent_samples.push(CallSample { response_time_ms, cost: Some(cost) });
            state.ema_response_time_ms = ema_response_time(state.ema_response_time_ms, f64::from(response_time_ms), state.total_requests);
        }

        let was_half_open = self.circuit.snapshot(name).mode == CircuitMode::HalfOpen;
        self.circuit.record_success(name);

        self.publish(ProviderEvent::ExecutionSuccess {
            provider: name.to_owned(),
            model: model.to_owned(),
        });
        if was_half_open {
            self.publish(ProviderEvent::ProviderRecovered { provider: name.to_owned() });
        }
        Ok(())
    }

    /// Record a failed call against `name`. See [`Self::record_success`] for
    /// the unregistered-provider guard.
    fn record_failure(&self, name: &str, reason: &str, now: DateTime<Utc>) -> Result<(), GatewayError> {
        {
            let mut runtime = self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let state = runtime
                .get_mut(name)
                .ok_or_else(|| GatewayError::unknown_provider(name.to_owned()))?;
            state.total_requests += 1;
            state.total_failures += 1;
            state.consecutive_failures += 1;
            state.last_failure_at = Some(now);
        }

        let before_mode = self.circuit.snapshot(name).mode;
        self.circuit.record_failure(name, now);
        let after_mode = self.circuit.snapshot(name).mode;
        if after_mode == CircuitMode::Open {
            let mut runtime = self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = runtime.get_mut(name) {
                state.status = ProviderHealth::Unhealthy;
            }
        }

        self.publish(ProviderEvent::ProviderFailure {
            provider: name.to_owned(),
            reason: reason.to_owned(),
        });
        if before_mode != CircuitMode::Open && after_mode == CircuitMode::Open {
            self.publish(ProviderEvent::CircuitBreakerOpened { provider: name.to_owned() });
        }
        Ok(())
    }

    /// Probe every registered provider out-of-band from real traffic,
    /// updating its recorded health status. Probe failures do not affect
    /// circuit breaker state — only real call failures do.
    pub async fn probe_all_providers(&self) {
        let names = self.provider_names();
        for name in names {
            let adapter = self
                .providers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&name)
                .cloned();
            let Some(adapter) = adapter else { continue };
            let result = adapter.health_check().await;
            let mut runtime = self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = runtime.get_mut(&name) {
                state.status = if result.healthy { ProviderHealth::Healthy } else { ProviderHealth::Unhealthy };
            }
        }
    }

    /// The currently configured health probe interval.
    #[must_use]
    pub fn current_health_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.health_check_interval_ms.load(Ordering::Acquire))
    }

    /// Signal the health prober loop spawned by [`spawn_health_prober`] to
    /// stop after its current sleep.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

#[allow(
    clippy::float_arithmetic,
    reason = "response-time smoothing is inherently floating point"
)]
fn ema_response_time(previous: f64, sample: f64, total_requests: u64) -> f64 {
    const SMOOTHING: f64 = 0.2;
    if total_requests <= 1 {
        sample
    } else {
        SMOOTHING * sample + (1.0 - SMOOTHING) * previous
    }
}

/// Spawn a background task that periodically probes every registered
/// provider's health, reading the interval fresh on each iteration so a
/// `provider.json` reload takes effect without restarting the task.
pub fn spawn_health_prober(gateway: Arc<ProviderGateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(gateway.current_health_check_interval()).await;
            if gateway.is_shutting_down() {
                break;
            }
            gateway.probe_all_providers().await;
        }
    })
}

#[async_trait]
impl ConfigComponent for ProviderGateway {
    fn handles_config_type(&self, config_type: ConfigType) -> bool {
        config_type == ConfigType::Provider
    }

    async fn update_config(
        &self,
        _config_type: ConfigType,
        new_value: Value,
        _old_value: Option<Value>,
    ) -> Result<(), ConfigComponentError> {
        let settings: ProviderSettings =
            serde_json::from_value(new_value).map_err(|err| ConfigComponentError::rejected(err.to_string()))?;
        self.apply_config(&settings.failover);
        Ok(())
    }
}
