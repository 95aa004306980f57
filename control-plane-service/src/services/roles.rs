//! Role-level access gating with a write-through cache.
//!
//! The access-control record for a role is cached in the deny layer under
//! `roles:access-control:<role-id>` with a short TTL; mutations invalidate
//! the single cache key. A lookup that cannot be resolved denies.

use std::sync::Arc;

use super::cache::CacheLayer;
use super::database::Database;
use crate::models::OrgTier;
use crate::rbac::access::can_access_role;

const ROLE_ACCESS_TTL_SECONDS: i64 = 300;

#[derive(Clone)]
pub struct RoleAccessService {
    db: Database,
    cache: Arc<dyn CacheLayer>,
}

impl RoleAccessService {
    pub fn new(db: Database, cache: Arc<dyn CacheLayer>) -> Self {
        Self { db, cache }
    }

    /// May the actor hold or assign this role? Cache-aside over the store;
    /// a store failure denies (fail closed).
    pub async fn can_user_access_role(&self, role_id: &str, actor_role: Option<OrgTier>) -> bool {
        match self.cache.get_role_access(role_id).await {
            Ok(Some(record)) => return can_access_role(Some(&record), actor_role),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(role = %role_id, error = %e, "role access cache unavailable, falling through to store");
            }
        }

        match self.db.get_role_access_control(role_id).await {
            Ok(record) => {
                if let Some(ref r) = record {
                    if let Err(e) = self
                        .cache
                        .put_role_access(role_id, r, ROLE_ACCESS_TTL_SECONDS)
                        .await
                    {
                        tracing::warn!(role = %role_id, error = %e, "failed to populate role access cache");
                    }
                }
                can_access_role(record.as_ref(), actor_role)
            }
            Err(e) => {
                tracing::warn!(role = %role_id, error = %e, "role access lookup failed, denying");
                false
            }
        }
    }

    /// Invalidate after a mutation touching the role's access control.
    pub async fn invalidate(&self, role_id: &str) {
        if let Err(e) = self.cache.invalidate_role_access(role_id).await {
            tracing::warn!(role = %role_id, error = %e, "failed to invalidate role access cache");
        }
    }
}
