//! Event bus seam.

use async_trait::async_trait;

use crate::error::PublishError;
use crate::events::CallEvent;

/// Producer of call-scoped events.
///
/// Implementations key every record by call id so the bus preserves per-call
/// order, and return once the broker has durably acknowledged. Callers treat
/// failures as non-fatal (log, bounded retry, drop with a counter): the call
/// record is authoritative, the bus is a projection of it.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &CallEvent) -> Result<(), PublishError>;
}
