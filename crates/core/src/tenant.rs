//! Tenant directory seam: DID routing, provider selection, agent config.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DialogError;

/// Result of a DID lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidRecord {
    pub did: String,
    pub tenant_id: String,
    pub enabled: bool,
}

/// Per-tenant provider selection, fetched per call and cached briefly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub stt_provider: String,
    #[serde(default)]
    pub stt_config: serde_json::Value,
    pub tts_provider: String,
    #[serde(default)]
    pub tts_config: serde_json::Value,
    pub llm_provider: String,
    #[serde(default)]
    pub llm_config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub provider: String,
    pub voice_id: String,
    #[serde(default = "default_unit")]
    pub rate: f32,
    #[serde(default = "default_unit")]
    pub pitch: f32,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_unit() -> f32 {
    1.0
}
fn default_language() -> String {
    "en-US".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Transfer targets the agent is allowed to name.
    #[serde(default)]
    pub allowed_transfer_targets: Vec<String>,
    /// Intents that map to an automatic transfer.
    #[serde(default)]
    pub transfer_intents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default)]
    pub forbidden_topics: Vec<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Seconds without any user audio before the call is ended.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    /// Optional per-tenant concurrency cap; absent means the global cap
    /// alone applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_calls: Option<usize>,
}

fn default_max_turns() -> u32 {
    50
}
fn default_inactivity_timeout() -> u64 {
    120
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            forbidden_topics: Vec::new(),
            max_turns: default_max_turns(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            max_concurrent_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub confirmation_steps: bool,
    /// Whether failed conversations hand off to a human queue.
    #[serde(default)]
    pub handoff_enabled: bool,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            confirmation_steps: false,
            handoff_enabled: false,
        }
    }
}

/// Full agent configuration for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent_id: String,
    #[serde(default)]
    pub system_prompt: String,
    pub voice: VoiceConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub flow: FlowConfig,
}

/// Tenant directory client. Responses are cacheable for a configurable TTL;
/// the cache is per-process and keyed by the input argument.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// Resolve a dialed number to its tenant; `DialogError::NotFound` means
    /// the number is unroutable.
    async fn lookup_did(&self, number: &str) -> Result<DidRecord, DialogError>;

    async fn provider_settings(&self, tenant_id: &str) -> Result<ProviderSettings, DialogError>;

    async fn agent_config(&self, tenant_id: &str) -> Result<AgentSettings, DialogError>;
}
