//! Main settings module.

use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use voicebridge_core::AudioEncoding;

use crate::ConfigError;

/// Telephony control plane connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcConfig {
    /// Base URL of the TC REST surface, e.g. `http://tc:8088/ari`.
    /// No default: must be configured.
    #[serde(default)]
    pub ari_url: String,

    /// WebSocket URL of the TC event surface. Derived from `ari_url` when
    /// empty.
    #[serde(default)]
    pub ws_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Stasis application name to register under.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Per-request deadline in seconds.
    #[serde(default = "default_tc_timeout")]
    pub request_timeout_secs: u64,

    /// Initial reconnect backoff in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Consecutive failed connects before the reader gives up and surfaces
    /// a fatal error. `0` disables the bound.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
}

fn default_app_name() -> String {
    "voicebridge".to_string()
}
fn default_tc_timeout() -> u64 {
    10
}
fn default_backoff_initial_ms() -> u64 {
    250
}
fn default_backoff_max_ms() -> u64 {
    15_000
}
fn default_max_reconnects() -> u32 {
    20
}

impl Default for TcConfig {
    fn default() -> Self {
        Self {
            ari_url: String::new(),
            ws_url: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: default_app_name(),
            request_timeout_secs: default_tc_timeout(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_reconnects: default_max_reconnects(),
        }
    }
}

/// Call state store (Redis) connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,

    /// TTL applied to the call record and both indexes, in seconds. Also the
    /// grace period a terminal record stays readable.
    #[serde(default = "default_call_ttl")]
    pub call_ttl_secs: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_call_ttl() -> u64 {
    3_600
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            password: None,
            db: 0,
            call_ttl_secs: default_call_ttl(),
        }
    }
}

/// Event bus (Kafka) producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_brokers")]
    pub brokers: String,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Bounded publish retries before an event is dropped with a counter.
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
}

fn default_brokers() -> String {
    "127.0.0.1:9092".to_string()
}
fn default_topic_prefix() -> String {
    "voice".to_string()
}
fn default_publish_retries() -> u32 {
    2
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topic_prefix: default_topic_prefix(),
            publish_retries: default_publish_retries(),
        }
    }
}

/// Tenant resolver service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// No default: must be configured.
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_http_timeout")]
    pub request_timeout_secs: u64,

    /// TTL of the per-process lookup cache, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_http_timeout() -> u64 {
    5
}
fn default_cache_ttl() -> u64 {
    60
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_secs: default_http_timeout(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Conversational agent service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServiceConfig {
    /// No default: must be configured.
    #[serde(default)]
    pub url: String,

    /// Per-turn deadline in seconds; exceeding it counts as a failed turn.
    #[serde(default = "default_turn_deadline")]
    pub turn_deadline_secs: u64,
}

fn default_turn_deadline() -> u64 {
    8
}

impl Default for AgentServiceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            turn_deadline_secs: default_turn_deadline(),
        }
    }
}

/// Media format expected from the TC and fed to STT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u8,

    #[serde(default)]
    pub encoding: AudioEncoding,
}

fn default_sample_rate() -> u32 {
    16_000
}
fn default_channels() -> u8 {
    1
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            encoding: AudioEncoding::Pcm,
        }
    }
}

/// What happens to an in-flight agent reply when the caller barges in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BargeInPolicy {
    /// Keep the interrupted reply as context for the next turn.
    #[default]
    Keep,
    /// Discard it entirely.
    Discard,
}

/// Concurrency caps and per-call timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLimitsConfig {
    /// Global concurrent-call cap.
    #[serde(default = "default_global_max")]
    pub global_max: usize,

    /// Hard wall-clock cap on a single call, in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// No STT output for this long prompts the caller once, then ends the
    /// call on a second silent window.
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_secs: u64,

    /// Consecutive failed agent turns tolerated before the call ends.
    #[serde(default = "default_max_agent_retries")]
    pub max_agent_retries: u32,

    /// Interim transcript length (characters) that triggers barge-in while
    /// the agent is speaking. Length and confidence are independent
    /// criteria: either one crossing its threshold interrupts playback.
    /// `0` disables the length criterion.
    #[serde(default = "default_barge_in_min_chars")]
    pub barge_in_min_chars: usize,

    /// Interim confidence that triggers barge-in. `0.0` disables the
    /// confidence criterion.
    #[serde(default = "default_barge_in_min_confidence")]
    pub barge_in_min_confidence: f32,

    #[serde(default)]
    pub barge_in_policy: BargeInPolicy,

    /// Bounded size of each call's internal event queue.
    #[serde(default = "default_queue_capacity")]
    pub session_queue_capacity: usize,

    /// Grace period for draining live calls at shutdown, in seconds.
    #[serde(default = "default_drain_grace")]
    pub shutdown_grace_secs: u64,

    /// Canned prompt spoken after one silent window.
    #[serde(default = "default_silence_prompt")]
    pub silence_prompt_text: String,

    /// Canned apology spoken when a turn fails.
    #[serde(default = "default_apology")]
    pub apology_text: String,

    /// Media reference played when synthesizing the apology itself fails.
    #[serde(default = "default_apology_media")]
    pub fallback_apology_media: String,
}

fn default_global_max() -> usize {
    500
}
fn default_call_timeout() -> u64 {
    1_800
}
fn default_silence_timeout() -> u64 {
    12
}
fn default_max_agent_retries() -> u32 {
    3
}
fn default_barge_in_min_chars() -> usize {
    6
}
fn default_barge_in_min_confidence() -> f32 {
    0.6
}
fn default_queue_capacity() -> usize {
    64
}
fn default_drain_grace() -> u64 {
    20
}
fn default_silence_prompt() -> String {
    "Are you still there?".to_string()
}
fn default_apology() -> String {
    "Sorry, I'm having trouble right now. Could you say that again?".to_string()
}
fn default_apology_media() -> String {
    "sound:voicebridge/apology".to_string()
}

impl Default for CallLimitsConfig {
    fn default() -> Self {
        Self {
            global_max: default_global_max(),
            call_timeout_secs: default_call_timeout(),
            silence_timeout_secs: default_silence_timeout(),
            max_agent_retries: default_max_agent_retries(),
            barge_in_min_chars: default_barge_in_min_chars(),
            barge_in_min_confidence: default_barge_in_min_confidence(),
            barge_in_policy: BargeInPolicy::default(),
            session_queue_capacity: default_queue_capacity(),
            shutdown_grace_secs: default_drain_grace(),
            silence_prompt_text: default_silence_prompt(),
            apology_text: default_apology(),
            fallback_apology_media: default_apology_media(),
        }
    }
}

/// Operator HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Logging and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_port: default_metrics_port(),
        }
    }
}

/// Main application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tc: TcConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub events: EventBusConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub agent: AgentServiceConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub calls: CallLimitsConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Validate that required endpoints/credentials are present and that
    /// numeric knobs are inside sane bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tc.ari_url.is_empty() {
            return Err(ConfigError::Missing("tc.ari_url".to_string()));
        }
        if self.tc.username.is_empty() || self.tc.password.is_empty() {
            return Err(ConfigError::Missing("tc.username / tc.password".to_string()));
        }
        if self.resolver.url.is_empty() {
            return Err(ConfigError::Missing("resolver.url".to_string()));
        }
        if self.agent.url.is_empty() {
            return Err(ConfigError::Missing("agent.url".to_string()));
        }

        if self.calls.global_max == 0 {
            return Err(ConfigError::InvalidValue {
                field: "calls.global_max".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.calls.session_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "calls.session_queue_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.calls.barge_in_min_confidence) {
            return Err(ConfigError::InvalidValue {
                field: "calls.barge_in_min_confidence".to_string(),
                message: format!(
                    "must be between 0.0 and 1.0, got {}",
                    self.calls.barge_in_min_confidence
                ),
            });
        }
        if self.tc.backoff_initial_ms == 0 || self.tc.backoff_max_ms < self.tc.backoff_initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "tc.backoff_initial_ms / tc.backoff_max_ms".to_string(),
                message: "initial backoff must be nonzero and not exceed the cap".to_string(),
            });
        }
        if self.audio.channels != 1 {
            return Err(ConfigError::InvalidValue {
                field: "audio.channels".to_string(),
                message: "only mono capture is supported".to_string(),
            });
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".to_string(),
                message: "port cannot be 0".to_string(),
            });
        }
        Ok(())
    }

    /// Effective WS URL, derived from the REST URL when not set explicitly.
    pub fn tc_ws_url(&self) -> String {
        if !self.tc.ws_url.is_empty() {
            return self.tc.ws_url.clone();
        }
        let base = self
            .tc
            .ari_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{}/events?app={}&subscribeAll=false",
            base.trim_end_matches('/'),
            self.tc.app_name
        )
    }
}

/// Load settings from the environment.
///
/// Variables use the `VOICEBRIDGE` prefix with `__` separating sections,
/// e.g. `VOICEBRIDGE__TC__ARI_URL`, `VOICEBRIDGE__CALLS__GLOBAL_MAX`.
pub fn load_settings() -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(
            Environment::with_prefix("VOICEBRIDGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let settings: Settings = config.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Settings {
        let mut settings = Settings::default();
        settings.tc.ari_url = "http://tc:8088/ari".to_string();
        settings.tc.username = "vb".to_string();
        settings.tc.password = "secret".to_string();
        settings.resolver.url = "http://directory:8000".to_string();
        settings.agent.url = "http://agents:8100".to_string();
        settings
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.calls.global_max, 500);
        assert_eq!(settings.audio.sample_rate, 16_000);
        assert_eq!(settings.calls.barge_in_policy, BargeInPolicy::Keep);
    }

    #[test]
    fn test_validation_requires_endpoints() {
        let settings = Settings::default();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Missing(_))
        ));
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_validation_bounds() {
        let mut settings = configured();
        settings.calls.barge_in_min_confidence = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = configured();
        settings.calls.global_max = 0;
        assert!(settings.validate().is_err());

        let mut settings = configured();
        settings.tc.backoff_max_ms = 10;
        settings.tc.backoff_initial_ms = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_ws_url_derivation() {
        let mut settings = configured();
        assert_eq!(
            settings.tc_ws_url(),
            "ws://tc:8088/ari/events?app=voicebridge&subscribeAll=false"
        );

        settings.tc.ws_url = "ws://other:8088/ari/events?app=x".to_string();
        assert_eq!(settings.tc_ws_url(), "ws://other:8088/ari/events?app=x");
    }
}
