//! Per-call session orchestration.
//!
//! One task per call owns the lifecycle state machine and the
//! STT -> agent -> TTS pipeline; the [`SessionSupervisor`] routes TC events
//! to the owning tasks and enforces admission through the
//! [`AdmissionController`].

mod admission;
mod queue;
mod session;
mod supervisor;

pub use admission::{AdmissionController, AdmissionDecision};
pub use queue::SessionQueue;
pub use session::{CallSession, SessionConfig, SessionDeps, SessionEvent, SttFactory, TtsFactory};
pub use session::OutboundPreset;
pub use supervisor::{LiveChannelSource, SessionSupervisor, SupervisorHealth};

use thiserror::Error;

/// Session orchestration errors. These never escape the owning task
/// unhandled: each one either drives a state transition, a bounded retry,
/// or an `error.*` event.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Telephony(#[from] voicebridge_core::TelephonyError),

    #[error(transparent)]
    Speech(#[from] voicebridge_core::SpeechError),

    #[error(transparent)]
    Dialog(#[from] voicebridge_core::DialogError),

    #[error(transparent)]
    Store(#[from] voicebridge_core::StoreError),

    #[error(transparent)]
    Transition(#[from] voicebridge_core::InvalidTransition),

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("call {0} is not in a state that allows this operation")]
    WrongState(String),
}
