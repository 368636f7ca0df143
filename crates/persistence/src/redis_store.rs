//! Redis-backed call store.
//!
//! Three key shapes, all carrying the same TTL, refreshed together on every
//! save:
//!
//! - `call:<call-id>`           JSON call record (primary)
//! - `call:channel:<chan-id>`   call id (secondary index)
//! - `calls:tenant:<tenant-id>` set of call ids
//!
//! Delete removes primary first, then the indexes; a crash mid-delete
//! leaves stale index entries that miss the primary on lookup and expire by
//! TTL. `update_state` is a compare-and-set loop over a small Lua script.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use voicebridge_core::{Call, CallState, CallStore, StoreError};

const PRIMARY_PREFIX: &str = "call:";
const CHANNEL_PREFIX: &str = "call:channel:";
const TENANT_PREFIX: &str = "calls:tenant:";

/// Attempts for the `update_state` compare-and-set loop.
const CAS_ATTEMPTS: u32 = 5;

/// Grace period a terminal record stays readable. Shorter than the active
/// TTL so ended calls stop counting against capacity promptly.
const ENDED_GRACE_SECS: u64 = 60;

/// Replace the record only if it has not changed since it was read,
/// keeping the key's TTL.
const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
    return 1
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    pub password: Option<String>,
    pub db: i64,
    /// TTL for the record and both indexes; doubles as the grace period a
    /// terminal record stays readable.
    pub call_ttl: Duration,
}

impl RedisConfig {
    fn connection_url(&self) -> String {
        let mut url = self.url.clone();
        if let Some(password) = &self.password {
            if !url.contains('@') {
                url = url.replacen("redis://", &format!("redis://:{password}@"), 1);
            }
        }
        if self.db != 0 {
            url = format!("{}/{}", url.trim_end_matches('/'), self.db);
        }
        url
    }
}

pub struct RedisCallStore {
    manager: ConnectionManager,
    ttl: Duration,
}

fn primary_key(call_id: &str) -> String {
    format!("{PRIMARY_PREFIX}{call_id}")
}

fn channel_key(channel_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{channel_id}")
}

fn tenant_key(tenant_id: &str) -> String {
    format!("{TENANT_PREFIX}{tenant_id}")
}

/// `call:*` matches both primary records and the channel index; only keys
/// without the index prefix are primaries.
fn is_primary_key(key: &str) -> bool {
    key.starts_with(PRIMARY_PREFIX) && !key.starts_with(CHANNEL_PREFIX)
}

fn encode(call: &Call) -> Result<String, StoreError> {
    serde_json::to_string(call).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(json: &str) -> Result<Call, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn connection_error(e: redis::RedisError) -> StoreError {
    StoreError::Connection(e.to_string())
}

impl RedisCallStore {
    pub async fn connect(config: RedisConfig) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(config.connection_url()).map_err(connection_error)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(connection_error)?;
        tracing::info!(url = %config.url, db = config.db, "connected to call store");
        Ok(Self {
            manager,
            ttl: config.call_ttl,
        })
    }

    /// Liveness probe for the readiness endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut con)
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl CallStore for RedisCallStore {
    async fn save(&self, call: &Call) -> Result<(), StoreError> {
        let json = encode(call)?;
        let mut con = self.manager.clone();
        let ttl = if call.state.is_terminal() {
            ENDED_GRACE_SECS.min(self.ttl_secs())
        } else {
            self.ttl_secs()
        };

        // One round trip; primary, channel index, and tenant set stay in
        // step with a shared TTL. The tenant set is skipped until DID
        // resolution fills the tenant in.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(primary_key(&call.id), json, ttl)
            .set_ex(channel_key(&call.channel_id), &call.id, ttl);
        if !call.tenant_id.is_empty() {
            pipe.sadd(tenant_key(&call.tenant_id), &call.id)
                .expire(tenant_key(&call.tenant_id), ttl as i64);
        }
        pipe.query_async::<_, ()>(&mut con)
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<Call>, StoreError> {
        let mut con = self.manager.clone();
        let json: Option<String> = con
            .get(primary_key(call_id))
            .await
            .map_err(connection_error)?;
        json.as_deref().map(decode).transpose()
    }

    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<Call>, StoreError> {
        let mut con = self.manager.clone();
        let call_id: Option<String> = con
            .get(channel_key(channel_id))
            .await
            .map_err(connection_error)?;
        match call_id {
            // A stale index entry whose primary expired is a miss.
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Call>, StoreError> {
        let mut con = self.manager.clone();
        let ids: Vec<String> = con
            .smembers(tenant_key(tenant_id))
            .await
            .map_err(connection_error)?;

        let mut calls = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(call) = self.get(&id).await? {
                calls.push(call);
            }
        }
        Ok(calls)
    }

    async fn delete(&self, call_id: &str) -> Result<(), StoreError> {
        // Read first so the index keys can be derived; an absent record
        // means indexes are already stale-but-expiring.
        let Some(call) = self.get(call_id).await? else {
            return Ok(());
        };
        let mut con = self.manager.clone();
        con.del::<_, ()>(primary_key(call_id))
            .await
            .map_err(connection_error)?;
        con.del::<_, ()>(channel_key(&call.channel_id))
            .await
            .map_err(connection_error)?;
        con.srem::<_, _, ()>(tenant_key(&call.tenant_id), call_id)
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn update_state(&self, call_id: &str, state: CallState) -> Result<Call, StoreError> {
        let script = Script::new(CAS_SCRIPT);
        let key = primary_key(call_id);

        for attempt in 0..CAS_ATTEMPTS {
            let mut con = self.manager.clone();
            let old_json: Option<String> =
                con.get(&key).await.map_err(connection_error)?;
            let old_json = old_json.ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;

            let mut call = decode(&old_json)?;
            call.transition(state)?;
            let new_json = encode(&call)?;

            let swapped: i64 = script
                .key(&key)
                .arg(&old_json)
                .arg(&new_json)
                .invoke_async(&mut con)
                .await
                .map_err(connection_error)?;
            if swapped == 1 {
                return Ok(call);
            }
            tracing::debug!(call_id, attempt, "state CAS lost, retrying");
        }
        Err(StoreError::Conflict(call_id.to_string()))
    }

    async fn count_active(&self) -> Result<usize, StoreError> {
        let mut con = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut count = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("call:*")
                .arg("COUNT")
                .arg(200)
                .query_async(&mut con)
                .await
                .map_err(connection_error)?;

            count += keys.iter().filter(|k| is_primary_key(k)).count();
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(count)
    }
}
