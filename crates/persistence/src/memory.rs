//! In-memory call store with the same index semantics as the Redis store.
//! Used by tests and local development; no TTL expiry.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use voicebridge_core::{Call, CallState, CallStore, StoreError};

#[derive(Default)]
pub struct MemoryCallStore {
    calls: RwLock<HashMap<String, Call>>,
    by_channel: RwLock<HashMap<String, String>>,
    by_tenant: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn save(&self, call: &Call) -> Result<(), StoreError> {
        self.calls.write().insert(call.id.clone(), call.clone());
        self.by_channel
            .write()
            .insert(call.channel_id.clone(), call.id.clone());
        if !call.tenant_id.is_empty() {
            self.by_tenant
                .write()
                .entry(call.tenant_id.clone())
                .or_default()
                .insert(call.id.clone());
        }
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<Call>, StoreError> {
        Ok(self.calls.read().get(call_id).cloned())
    }

    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<Call>, StoreError> {
        let call_id = self.by_channel.read().get(channel_id).cloned();
        Ok(call_id.and_then(|id| self.calls.read().get(&id).cloned()))
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Call>, StoreError> {
        let ids = self
            .by_tenant
            .read()
            .get(tenant_id)
            .cloned()
            .unwrap_or_default();
        let calls = self.calls.read();
        Ok(ids.iter().filter_map(|id| calls.get(id).cloned()).collect())
    }

    async fn delete(&self, call_id: &str) -> Result<(), StoreError> {
        let Some(call) = self.calls.write().remove(call_id) else {
            return Ok(());
        };
        self.by_channel.write().remove(&call.channel_id);
        if let Some(set) = self.by_tenant.write().get_mut(&call.tenant_id) {
            set.remove(call_id);
        }
        Ok(())
    }

    async fn update_state(&self, call_id: &str, state: CallState) -> Result<Call, StoreError> {
        let mut calls = self.calls.write();
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        call.transition(state)?;
        Ok(call.clone())
    }

    async fn count_active(&self) -> Result<usize, StoreError> {
        // Nothing expires in memory, so terminal records are filtered here
        // instead of aging out under a grace TTL.
        Ok(self
            .calls
            .read()
            .values()
            .filter(|c| !c.state.is_terminal())
            .count())
    }
}
