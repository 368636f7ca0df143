//! Call state store seam.

use async_trait::async_trait;

use crate::call::{Call, CallState};
use crate::error::StoreError;

/// Persistent call state, backed by a shared KV store with TTL.
///
/// `save` refreshes the primary record, the channel index, and the tenant
/// set together, all with the same TTL. `update_state` is atomic
/// (read-modify-write with a bounded retry loop in the implementation).
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn save(&self, call: &Call) -> Result<(), StoreError>;

    async fn get(&self, call_id: &str) -> Result<Option<Call>, StoreError>;

    /// Look up through the channel-id secondary index.
    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<Call>, StoreError>;

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Call>, StoreError>;

    async fn delete(&self, call_id: &str) -> Result<(), StoreError>;

    /// Atomically apply a validated state transition, returning the updated
    /// record.
    async fn update_state(&self, call_id: &str, state: CallState) -> Result<Call, StoreError>;

    /// Count primary records, excluding secondary index keys.
    async fn count_active(&self) -> Result<usize, StoreError>;
}
