//! Domain ports: the trait boundary between pure pipeline logic and the
//! concrete source/provider adapters and config subsystems that plug into
//! it.

mod macros;
pub(crate) use macros::define_port_error;

pub mod config_component;
pub mod provider_adapter;
pub mod source_handler;

#[cfg(test)]
pub use config_component::MockConfigComponent;
pub use config_component::{ConfigComponent, ConfigComponentError, FixtureConfigComponent};
#[cfg(test)]
pub use provider_adapter::MockProviderAdapter;
pub use provider_adapter::{
    CallCost, CompletionRequest, CompletionResponse, FixtureProviderAdapter, HealthCheckResult,
    ProviderAdapter, ProviderAdapterError, TokenUsage,
};
#[cfg(test)]
pub use source_handler::MockSourceHandler;
pub use source_handler::{FixtureSourceHandler, SourceHandler, SourceHandlerError};
