//! The contract a queue/worker-pool/gateway subsystem implements to receive
//! hot-reloaded configuration from the config plane.

use async_trait::async_trait;

use crate::domain::config::ConfigType;
use crate::domain::ports::define_port_error;

define_port_error! {
    #[derive(Clone)]
    pub enum ConfigComponentError {
        Rejected { reason: String } => "component rejected the new configuration: {reason}",
        RestartFailed { reason: String } => "component restart after reconfiguration failed: {reason}",
    }
}

/// A subsystem that can be reconfigured at runtime by the config plane.
///
/// `updateConfig` receives the new value plus the previous one (absent on
/// first apply) as opaque, pre-validated JSON; the component is responsible
/// for deserializing the shape it expects and for performing any
/// reconnect/restart its own new configuration requires — the config plane
/// itself does not know which field changes demand one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigComponent: Send + Sync {
    /// Whether this component wants to observe changes of `config_type`.
    /// Components that do not override this observe every type.
    fn handles_config_type(&self, _config_type: ConfigType) -> bool {
        true
    }

    /// Apply a new, already-schema-validated configuration value.
    async fn update_config(
        &self,
        config_type: ConfigType,
        new_value: serde_json::Value,
        old_value: Option<serde_json::Value>,
    ) -> Result<(), ConfigComponentError>;

    /// Called when a configuration file of `config_type` is deleted.
    /// Components that do not care about removal accept the default no-op.
    async fn handle_config_removal(
        &self,
        _config_type: ConfigType,
        _old_value: serde_json::Value,
    ) -> Result<(), ConfigComponentError> {
        Ok(())
    }
}

/// A no-op [`ConfigComponent`] for wiring tests and documentation examples.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureConfigComponent;

#[async_trait]
impl ConfigComponent for FixtureConfigComponent {
    async fn update_config(
        &self,
        _config_type: ConfigType,
        _new_value: serde_json::Value,
        _old_value: Option<serde_json::Value>,
    ) -> Result<(), ConfigComponentError> {
        Ok(())
    }
}
