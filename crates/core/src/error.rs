//! Error types for the component seams defined in this crate.
//!
//! Each external collaborator gets its own enum so callers can branch on the
//! failure class without string matching. Retryability follows the taxonomy
//! in the error-handling design: 4xx-style contract failures are final,
//! network and 5xx-style failures may be retried where the operation is
//! idempotent.

use thiserror::Error;

/// Failures talking to the telephony control plane.
#[derive(Debug, Error)]
pub enum TelephonyError {
    /// Non-retryable API rejection (4xx).
    #[error("TC rejected request: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// Retryable server-side failure (5xx).
    #[error("TC server error: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("TC network error: {0}")]
    Network(String),

    #[error("TC request deadline exceeded")]
    Timeout,

    #[error("TC event socket error: {0}")]
    WebSocket(String),

    /// The reader exhausted its consecutive reconnect budget.
    #[error("TC connection lost after {0} consecutive failed connects")]
    MaxReconnects(u32),

    #[error("unexpected TC response: {0}")]
    InvalidResponse(String),
}

impl TelephonyError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TelephonyError::Server { .. } | TelephonyError::Network(_) | TelephonyError::Timeout
        )
    }
}

/// Failures in the STT/TTS provider layer.
#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider protocol violation: {0}")]
    Protocol(String),

    #[error("stream closed: {0}")]
    Stream(String),

    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    #[error("invalid provider configuration: {0}")]
    Configuration(String),
}

/// Failures talking to the agent service or the tenant directory.
#[derive(Debug, Error)]
pub enum DialogError {
    /// Lookup miss, e.g. an unroutable DID. Non-retryable.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("service rejected request: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("service error: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("malformed response: {0}")]
    InvalidResponse(String),
}

impl DialogError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DialogError::Server { .. } | DialogError::Network(_) | DialogError::Timeout
        )
    }
}

/// Failures in the call state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("call {0} not found")]
    NotFound(String),

    /// Compare-and-set retries exhausted on `update_state`.
    #[error("concurrent update conflict on call {0}")]
    Conflict(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] crate::call::InvalidTransition),
}

/// Failures publishing to the event bus. Callers treat these as
/// non-fatal: the call record is the source of truth, the bus a projection.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("event serialization error: {0}")]
    Serialization(String),

    #[error("producer queue full")]
    QueueFull,
}
