//! Impersonation models: consent grants, the active-session registry entry,
//! and the append-only audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Consent grant row; at most one per grantor.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConsentGrant {
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub duration_hours: Option<i32>,
}

impl ConsentGrant {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Active-session registry entry, stored in the deny layer keyed on the
/// impersonator. An entry whose expiry has passed logically does not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: String,
    pub target_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ActiveSession {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Durable session row backing the history endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub session_id: String,
    pub impersonator_id: String,
    pub impersonated_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Audit actions; `Action` covers optional mid-session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SessionStart,
    SessionEnd,
    Action,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::SessionStart => "session_start",
            AuditAction::SessionEnd => "session_end",
            AuditAction::Action => "action",
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub session_id: String,
    pub action: String,
    pub impersonator_id: String,
    pub impersonator_username: String,
    pub impersonated_id: String,
    pub impersonated_username: String,
    pub at: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn consent_liveness_tracks_expiry() {
        let now = Utc::now();
        let grant = ConsentGrant {
            user_id: "bob".to_string(),
            issued_at: now - Duration::minutes(10),
            expires_at: now + Duration::hours(1),
            duration_hours: Some(1),
        };
        assert!(grant.is_live(now));
        assert!(!grant.is_live(now + Duration::hours(2)));
    }

    #[test]
    fn expired_registry_entry_is_dead() {
        let now = Utc::now();
        let session = ActiveSession {
            session_id: "s-1".to_string(),
            target_id: "bob".to_string(),
            expires_at: now - Duration::seconds(1),
            created_at: now - Duration::hours(1),
        };
        assert!(!session.is_live(now));
    }

    #[test]
    fn audit_action_wire_names() {
        assert_eq!(AuditAction::SessionStart.as_str(), "session_start");
        assert_eq!(AuditAction::SessionEnd.as_str(), "session_end");
        assert_eq!(
            serde_json::to_string(&AuditAction::SessionEnd).unwrap(),
            "\"session_end\""
        );
    }
}
