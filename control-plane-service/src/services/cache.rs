//! Cache & deny layer: token blacklist, active-impersonation-session
//! registry, role-access-control cache and short-TTL stats caches.
//!
//! Key layout:
//! - `blacklist:<token-digest>` -> reason
//! - `impersonation:session:<impersonator-id>` -> JSON session entry
//! - `roles:access-control:<role-id>` -> JSON access-control record
//!
//! All entries carry an explicit TTL.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};

use crate::models::ActiveSession;
use crate::rbac::access::RoleAccessRecord;

#[async_trait]
pub trait CacheLayer: Send + Sync {
    async fn health_check(&self) -> Result<(), anyhow::Error>;

    // ==================== Token blacklist ====================

    async fn blacklist_token(
        &self,
        digest: &str,
        reason: &str,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error>;
    async fn is_blacklisted(&self, digest: &str) -> Result<bool, anyhow::Error>;

    // ==================== Session registry ====================

    /// Atomically register a session for an impersonator. Returns false when
    /// an entry already exists (single-key compare-and-set semantics).
    async fn put_session_if_absent(
        &self,
        impersonator_id: &str,
        session: &ActiveSession,
        ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error>;
    async fn get_session(
        &self,
        impersonator_id: &str,
    ) -> Result<Option<ActiveSession>, anyhow::Error>;
    async fn clear_session(&self, impersonator_id: &str) -> Result<(), anyhow::Error>;

    // ==================== Role access-control cache ====================

    async fn get_role_access(
        &self,
        role_id: &str,
    ) -> Result<Option<RoleAccessRecord>, anyhow::Error>;
    async fn put_role_access(
        &self,
        role_id: &str,
        record: &RoleAccessRecord,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error>;
    async fn invalidate_role_access(&self, role_id: &str) -> Result<(), anyhow::Error>;

    // ==================== Stats caches ====================

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, anyhow::Error>;
    async fn put_json(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error>;
    async fn invalidate(&self, key: &str) -> Result<(), anyhow::Error>;
}

fn blacklist_key(digest: &str) -> String {
    format!("blacklist:{}", digest)
}

fn session_key(impersonator_id: &str) -> String {
    format!("impersonation:session:{}", impersonator_id)
}

fn role_access_key(role_id: &str) -> String {
    format!("roles:access-control:{}", role_id)
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects automatically.
        let manager = client.get_connection_manager().await?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl CacheLayer for RedisService {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }

    async fn blacklist_token(
        &self,
        digest: &str,
        reason: &str,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(blacklist_key(digest))
            .arg(reason)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to blacklist token: {}", e))
    }

    async fn is_blacklisted(&self, digest: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(blacklist_key(digest))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check blacklist: {}", e))?;
        Ok(exists)
    }

    async fn put_session_if_absent(
        &self,
        impersonator_id: &str,
        session: &ActiveSession,
        ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(session)?;
        let stored: Option<String> = redis::cmd("SET")
            .arg(session_key(impersonator_id))
            .arg(payload)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to register session: {}", e))?;
        Ok(stored.is_some())
    }

    async fn get_session(
        &self,
        impersonator_id: &str,
    ) -> Result<Option<ActiveSession>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(session_key(impersonator_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read session registry: {}", e))?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear_session(&self, impersonator_id: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(session_key(impersonator_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to clear session: {}", e))
    }

    async fn get_role_access(
        &self,
        role_id: &str,
    ) -> Result<Option<RoleAccessRecord>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(role_access_key(role_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read role access cache: {}", e))?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_role_access(
        &self,
        role_id: &str,
        record: &RoleAccessRecord,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(record)?;
        redis::cmd("SET")
            .arg(role_access_key(role_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write role access cache: {}", e))
    }

    async fn invalidate_role_access(&self, role_id: &str) -> Result<(), anyhow::Error> {
        self.invalidate(&role_access_key(role_id)).await
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read cache key {}: {}", key, e))?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_json(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(serde_json::to_string(value)?)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write cache key {}: {}", key, e))
    }

    async fn invalidate(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to invalidate cache key {}: {}", key, e))
    }
}

/// In-memory cache for tests.
#[derive(Default)]
pub struct MockCache {
    inner: std::sync::Mutex<MockCacheInner>,
    /// When set, every operation fails; used to exercise fail-open /
    /// fail-closed paths.
    pub fail: std::sync::atomic::AtomicBool,
    /// When set, only session-registry operations fail.
    pub fail_sessions: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct MockCacheInner {
    blacklist: std::collections::HashMap<String, String>,
    sessions: std::collections::HashMap<String, ActiveSession>,
    role_access: std::collections::HashMap<String, RoleAccessRecord>,
    json: std::collections::HashMap<String, serde_json::Value>,
}

impl MockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_sessions_failing(&self, failing: bool) {
        self.fail_sessions
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), anyhow::Error> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            Err(anyhow::anyhow!("cache unavailable"))
        } else {
            Ok(())
        }
    }

    fn check_sessions(&self) -> Result<(), anyhow::Error> {
        self.check()?;
        if self.fail_sessions.load(std::sync::atomic::Ordering::SeqCst) {
            Err(anyhow::anyhow!("session registry unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheLayer for MockCache {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.check()
    }

    async fn blacklist_token(
        &self,
        digest: &str,
        reason: &str,
        _ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        self.check()?;
        self.inner
            .lock()
            .unwrap()
            .blacklist
            .insert(digest.to_string(), reason.to_string());
        Ok(())
    }

    async fn is_blacklisted(&self, digest: &str) -> Result<bool, anyhow::Error> {
        self.check()?;
        Ok(self.inner.lock().unwrap().blacklist.contains_key(digest))
    }

    async fn put_session_if_absent(
        &self,
        impersonator_id: &str,
        session: &ActiveSession,
        _ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error> {
        self.check_sessions()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.contains_key(impersonator_id) {
            return Ok(false);
        }
        inner
            .sessions
            .insert(impersonator_id.to_string(), session.clone());
        Ok(true)
    }

    async fn get_session(
        &self,
        impersonator_id: &str,
    ) -> Result<Option<ActiveSession>, anyhow::Error> {
        self.check_sessions()?;
        Ok(self.inner.lock().unwrap().sessions.get(impersonator_id).cloned())
    }

    async fn clear_session(&self, impersonator_id: &str) -> Result<(), anyhow::Error> {
        self.check_sessions()?;
        self.inner.lock().unwrap().sessions.remove(impersonator_id);
        Ok(())
    }

    async fn get_role_access(
        &self,
        role_id: &str,
    ) -> Result<Option<RoleAccessRecord>, anyhow::Error> {
        self.check()?;
        Ok(self.inner.lock().unwrap().role_access.get(role_id).cloned())
    }

    async fn put_role_access(
        &self,
        role_id: &str,
        record: &RoleAccessRecord,
        _ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        self.check()?;
        self.inner
            .lock()
            .unwrap()
            .role_access
            .insert(role_id.to_string(), record.clone());
        Ok(())
    }

    async fn invalidate_role_access(&self, role_id: &str) -> Result<(), anyhow::Error> {
        self.check()?;
        self.inner.lock().unwrap().role_access.remove(role_id);
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, anyhow::Error> {
        self.check()?;
        Ok(self.inner.lock().unwrap().json.get(key).cloned())
    }

    async fn put_json(
        &self,
        key: &str,
        value: &serde_json::Value,
        _ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        self.check()?;
        self.inner
            .lock()
            .unwrap()
            .json
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), anyhow::Error> {
        self.check()?;
        self.inner.lock().unwrap().json.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn session_registration_is_exclusive() {
        let cache = MockCache::new();
        let session = ActiveSession {
            session_id: "s-1".to_string(),
            target_id: "bob".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            created_at: Utc::now(),
        };
        assert!(cache
            .put_session_if_absent("alice", &session, 3600)
            .await
            .unwrap());
        assert!(!cache
            .put_session_if_absent("alice", &session, 3600)
            .await
            .unwrap());
        cache.clear_session("alice").await.unwrap();
        assert!(cache
            .put_session_if_absent("alice", &session, 3600)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn failing_mode_errors_every_operation() {
        let cache = MockCache::new();
        cache.set_failing(true);
        assert!(cache.is_blacklisted("x").await.is_err());
        assert!(cache.get_session("alice").await.is_err());
    }
}
