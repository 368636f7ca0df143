//! Speech provider implementations.
//!
//! STT and TTS providers are selected by name from per-tenant provider
//! settings; all implementations share the sink/source stream shape defined
//! in `voicebridge-core`. Provider-specific endpoints and credentials
//! arrive through the opaque `provider_config` value.

pub mod stt;
pub mod tts;

pub use stt::create_stt_provider;
pub use tts::create_tts_provider;
