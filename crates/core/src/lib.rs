//! Core domain types and component seams for the voicebridge orchestrator.
//!
//! Every other crate in the workspace depends on this one: the `Call` record
//! and its state machine, the event envelope published to the bus, and the
//! traits behind which the telephony control plane, speech providers, agent
//! service, tenant directory, call store, and event publisher live.

pub mod call;
pub mod conversation;
pub mod dialog;
pub mod error;
pub mod events;
pub mod publisher;
pub mod speech;
pub mod store;
pub mod telephony;
pub mod tenant;

pub use call::{Call, CallState, Direction, InvalidTransition};
pub use conversation::ConversationSession;
pub use dialog::{AgentAction, AgentActionKind, AgentClient, AgentReply, ConversationStart};
pub use error::{
    DialogError, PublishError, SpeechError, StoreError, TelephonyError,
};
pub use events::{CallEvent, ErrorComponent, EventPayload, TransferType};
pub use publisher::EventPublisher;
pub use speech::{
    AudioEncoding, SttConfig, SttProvider, SttStream, TranscriptResult, TtsConfig, TtsProvider,
};
pub use store::CallStore;
pub use telephony::{
    ChannelInfo, HangupReason, PlaybackHandle, PlaybackSource, TcEvent, TelephonyClient,
};
pub use tenant::{
    AgentSettings, DidRecord, FlowConfig, ProviderSettings, RoutingConfig, SafetyConfig,
    TenantResolver, VoiceConfig,
};
