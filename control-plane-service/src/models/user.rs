//! User model and the enriched subject assembled at token exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::org::OrgTier;

/// Local user row. The IdP remains the identity source of truth; this is the
/// surrogate that audit records and hierarchy queries hang off.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub logto_id: String,
    pub username: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub user_role_ids: serde_json::Value,
    pub organization_id: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspended_reason: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn role_ids(&self) -> Vec<String> {
        self.user_role_ids
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The enriched subject produced by the identity gateway: local identity,
/// user-roles with permissions, and the single organization membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    /// Local surrogate id; empty until the first local record exists.
    pub id: Option<Uuid>,
    /// IdP identifier (`sub`).
    pub logto_id: String,
    pub username: String,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub user_roles: Vec<String>,
    pub user_role_ids: Vec<String>,
    pub user_permissions: Vec<String>,
    pub org_role: Option<OrgTier>,
    pub org_role_id: Option<String>,
    pub org_permissions: Vec<String>,
    pub organization_id: Option<String>,
    pub organization_name: Option<String>,
}

impl Subject {
    /// Exact-match membership across both permission buckets.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.user_permissions.iter().any(|p| p == permission)
            || self.org_permissions.iter().any(|p| p == permission)
    }

    /// Case-insensitive user-role check.
    pub fn has_user_role(&self, role: &str) -> bool {
        self.user_roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

/// Request to create a user under an organization.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 128))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub password: String,
    #[serde(default)]
    pub user_role_ids: Vec<String>,
    pub organization_id: String,
}

/// Request to update a user. Role assignment uses identifiers only; names
/// are resolved for display.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(email)]
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub user_role_ids: Option<Vec<String>>,
    pub organization_id: Option<String>,
}

/// User response for the API.
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub logto_id: String,
    pub username: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub user_role_ids: Vec<String>,
    pub organization_id: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub suspended: bool,
    pub suspended_reason: Option<String>,
}

impl From<UserRecord> for UserResponse {
    fn from(u: UserRecord) -> Self {
        let role_ids = u.role_ids();
        Self {
            id: u.id,
            logto_id: u.logto_id,
            username: u.username,
            email: u.email,
            name: u.name,
            phone: u.phone,
            user_role_ids: role_ids,
            organization_id: u.organization_id,
            last_login_at: u.last_login_at,
            created_at: u.created_at,
            suspended: u.suspended_at.is_some(),
            suspended_reason: u.suspended_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> Subject {
        Subject {
            id: Some(Uuid::new_v4()),
            logto_id: "user-1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            name: "Alice".to_string(),
            phone: None,
            user_roles: vec!["Admin".to_string()],
            user_role_ids: vec!["role-admin".to_string()],
            user_permissions: vec!["manage:users".to_string()],
            org_role: Some(OrgTier::Owner),
            org_role_id: Some("org-role-owner".to_string()),
            org_permissions: vec!["manage:orgs".to_string()],
            organization_id: Some("org-owner".to_string()),
            organization_name: Some("Owner Org".to_string()),
        }
    }

    #[test]
    fn permission_check_spans_both_buckets() {
        let s = subject();
        assert!(s.has_permission("manage:users"));
        assert!(s.has_permission("manage:orgs"));
        assert!(!s.has_permission("manage:billing"));
    }

    #[test]
    fn permission_check_is_exact_match() {
        let s = subject();
        assert!(!s.has_permission("manage"));
        assert!(!s.has_permission("MANAGE:USERS"));
    }

    #[test]
    fn user_role_check_is_case_insensitive() {
        let s = subject();
        assert!(s.has_user_role("admin"));
        assert!(s.has_user_role("ADMIN"));
        assert!(!s.has_user_role("support"));
    }
}
