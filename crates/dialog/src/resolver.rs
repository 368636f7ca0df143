//! Tenant directory client with a per-process TTL cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Response, StatusCode};

use voicebridge_core::{AgentSettings, DialogError, DidRecord, ProviderSettings, TenantResolver};

/// Raw HTTP resolver; see [`CachedResolver`] for the production wrapper.
pub struct HttpTenantResolver {
    base_url: String,
    client: Client,
}

impl HttpTenantResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DialogError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DialogError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        not_found: &str,
    ) -> Result<T, DialogError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DialogError::Timeout
                } else {
                    DialogError::Network(e.to_string())
                }
            })?;
        let response = Self::check(response, not_found).await?;
        response
            .json()
            .await
            .map_err(|e| DialogError::InvalidResponse(e.to_string()))
    }

    async fn check(response: Response, not_found: &str) -> Result<Response, DialogError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(DialogError::NotFound(not_found.to_string()));
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(DialogError::Api {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(DialogError::Server {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl TenantResolver for HttpTenantResolver {
    async fn lookup_did(&self, number: &str) -> Result<DidRecord, DialogError> {
        self.get_json(&format!("/telephony/dids/lookup/{number}"), number)
            .await
    }

    async fn provider_settings(&self, tenant_id: &str) -> Result<ProviderSettings, DialogError> {
        self.get_json(
            &format!("/tenants/{tenant_id}/telephony/provider-settings"),
            tenant_id,
        )
        .await
    }

    async fn agent_config(&self, tenant_id: &str) -> Result<AgentSettings, DialogError> {
        self.get_json(&format!("/tenants/{tenant_id}/agent-config"), tenant_id)
            .await
    }
}

struct Entry<V> {
    value: V,
    fetched_at: Instant,
}

/// Read-mostly cache keyed by the lookup argument, expiring by wall-clock
/// TTL. Misses fall through to the inner resolver; errors are never cached.
pub struct CachedResolver<R> {
    inner: R,
    ttl: Duration,
    dids: RwLock<HashMap<String, Entry<DidRecord>>>,
    providers: RwLock<HashMap<String, Entry<ProviderSettings>>>,
    agents: RwLock<HashMap<String, Entry<AgentSettings>>>,
}

impl<R: TenantResolver> CachedResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            dids: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
        }
    }

    fn fresh<V: Clone>(&self, map: &RwLock<HashMap<String, Entry<V>>>, key: &str) -> Option<V> {
        let map = map.read();
        let entry = map.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn store<V>(&self, map: &RwLock<HashMap<String, Entry<V>>>, key: String, value: V) {
        map.write().insert(
            key,
            Entry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl<R: TenantResolver> TenantResolver for CachedResolver<R> {
    async fn lookup_did(&self, number: &str) -> Result<DidRecord, DialogError> {
        if let Some(hit) = self.fresh(&self.dids, number) {
            return Ok(hit);
        }
        tracing::debug!(number, "DID cache miss");
        let record = self.inner.lookup_did(number).await?;
        self.store(&self.dids, number.to_string(), record.clone());
        Ok(record)
    }

    async fn provider_settings(&self, tenant_id: &str) -> Result<ProviderSettings, DialogError> {
        if let Some(hit) = self.fresh(&self.providers, tenant_id) {
            return Ok(hit);
        }
        let settings = self.inner.provider_settings(tenant_id).await?;
        self.store(&self.providers, tenant_id.to_string(), settings.clone());
        Ok(settings)
    }

    async fn agent_config(&self, tenant_id: &str) -> Result<AgentSettings, DialogError> {
        if let Some(hit) = self.fresh(&self.agents, tenant_id) {
            return Ok(hit);
        }
        let config = self.inner.agent_config(tenant_id).await?;
        self.store(&self.agents, tenant_id.to_string(), config.clone());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TenantResolver for CountingResolver {
        async fn lookup_did(&self, number: &str) -> Result<DidRecord, DialogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if number == "+15559999" {
                return Err(DialogError::NotFound(number.to_string()));
            }
            Ok(DidRecord {
                did: number.to_string(),
                tenant_id: "t1".to_string(),
                enabled: true,
            })
        }

        async fn provider_settings(&self, _: &str) -> Result<ProviderSettings, DialogError> {
            unimplemented!()
        }

        async fn agent_config(&self, _: &str) -> Result<AgentSettings, DialogError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inner() {
        let resolver = CachedResolver::new(
            CountingResolver {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );
        resolver.lookup_did("+15550100").await.unwrap();
        resolver.lookup_did("+15550100").await.unwrap();
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let resolver = CachedResolver::new(
            CountingResolver {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );
        assert!(resolver.lookup_did("+15559999").await.is_err());
        assert!(resolver.lookup_did("+15559999").await.is_err());
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let resolver = CachedResolver::new(
            CountingResolver {
                calls: AtomicUsize::new(0),
            },
            Duration::from_millis(0),
        );
        resolver.lookup_did("+15550100").await.unwrap();
        resolver.lookup_did("+15550100").await.unwrap();
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 2);
    }
}
