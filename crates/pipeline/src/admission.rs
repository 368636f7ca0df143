//! Admission control: the only throttle on concurrent calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use voicebridge_core::{CallStore, StoreError};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    RejectedGlobal,
    RejectedTenant,
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }
}

/// Compares the store's active count, plus an in-memory delta of calls
/// admitted but not yet persisted, against the global cap; per-tenant caps
/// apply only when the tenant's config supplies one. Every path that
/// creates a call (inbound ringing, operator originate) must come through
/// here.
pub struct AdmissionController {
    store: Arc<dyn CallStore>,
    global_max: usize,
    /// Admitted but not yet visible in `count_active()`.
    pending: AtomicUsize,
    pending_by_tenant: DashMap<String, usize>,
    /// Monotonic usage accounting per tenant.
    admitted_by_tenant: DashMap<String, u64>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CallStore>, global_max: usize) -> Self {
        Self {
            store,
            global_max,
            pending: AtomicUsize::new(0),
            pending_by_tenant: DashMap::new(),
            admitted_by_tenant: DashMap::new(),
        }
    }

    /// Decide whether one more call for `tenant_id` fits. On admission the
    /// pending delta is taken; the caller must follow up with
    /// [`confirm`](Self::confirm) once the record is persisted, or
    /// [`abort`](Self::abort) if it never is.
    ///
    /// `exclude_self` compensates for callers whose own record is already
    /// in the store when they ask (inbound calls persist at `ringing`,
    /// before the admission decision).
    pub async fn try_admit(
        &self,
        tenant_id: &str,
        tenant_cap: Option<usize>,
        exclude_self: bool,
    ) -> Result<AdmissionDecision, StoreError> {
        let own = usize::from(exclude_self);
        let persisted = self.store.count_active().await?.saturating_sub(own);
        let pending = self.pending.load(Ordering::SeqCst);
        if persisted + pending >= self.global_max {
            metrics::counter!("admission_rejected_total", "scope" => "global").increment(1);
            return Ok(AdmissionDecision::RejectedGlobal);
        }

        if let Some(cap) = tenant_cap {
            let persisted_tenant = self
                .store
                .list_by_tenant(tenant_id)
                .await?
                .iter()
                .filter(|c| !c.state.is_terminal())
                .count()
                .saturating_sub(own);
            let pending_tenant = self
                .pending_by_tenant
                .get(tenant_id)
                .map(|e| *e.value())
                .unwrap_or(0);
            if persisted_tenant + pending_tenant >= cap {
                metrics::counter!("admission_rejected_total", "scope" => "tenant").increment(1);
                return Ok(AdmissionDecision::RejectedTenant);
            }
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        *self
            .pending_by_tenant
            .entry(tenant_id.to_string())
            .or_insert(0) += 1;
        *self
            .admitted_by_tenant
            .entry(tenant_id.to_string())
            .or_insert(0) += 1;
        Ok(AdmissionDecision::Admitted)
    }

    /// The admitted call is now persisted and visible to `count_active()`.
    pub fn confirm(&self, tenant_id: &str) {
        self.release_pending(tenant_id);
    }

    /// The admitted call never made it to the store.
    pub fn abort(&self, tenant_id: &str) {
        self.release_pending(tenant_id);
    }

    fn release_pending(&self, tenant_id: &str) {
        let previous = self.pending.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "pending underflow");
        if let Some(mut entry) = self.pending_by_tenant.get_mut(tenant_id) {
            *entry = entry.saturating_sub(1);
        }
    }

    /// Calls ever admitted for a tenant.
    pub fn admitted_count(&self, tenant_id: &str) -> u64 {
        self.admitted_by_tenant
            .get(tenant_id)
            .map(|e| *e.value())
            .unwrap_or(0)
    }
}
