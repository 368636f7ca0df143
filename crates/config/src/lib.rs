//! Configuration for the voicebridge orchestrator.
//!
//! Everything is driven by environment variables with the `VOICEBRIDGE`
//! prefix and `__` as the section separator, e.g.
//! `VOICEBRIDGE__TC__ARI_URL`, `VOICEBRIDGE__CALLS__GLOBAL_MAX`. Defaults
//! exist for every knob except service endpoints and credentials, which
//! `Settings::validate` enforces.

mod settings;

pub use settings::{
    AgentServiceConfig, AudioConfig, BargeInPolicy, CallLimitsConfig, EventBusConfig,
    ObservabilityConfig, ResolverConfig, ServerConfig, Settings, StoreConfig, TcConfig,
    load_settings,
};

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("missing required configuration: {0}")]
    Missing(String),
}
