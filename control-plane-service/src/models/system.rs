//! System (managed node) model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Snapshot of the subject that created a system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedBy {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub organization_id: Option<String>,
    pub organization_name: Option<String>,
}

/// System row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemRecord {
    pub id: Uuid,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub system_type: String,
    pub version: Option<String>,
    pub status: String,
    pub system_key: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub organization_id: Option<String>,
    pub custom_data: serde_json::Value,
    pub created_by: Option<serde_json::Value>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SystemRecord {
    /// Liveness derived from the last heartbeat against the configured
    /// timeout; a system with no heartbeat is offline.
    pub fn liveness(&self, timeout_minutes: i64, now: DateTime<Utc>) -> &'static str {
        match self.heartbeat_at {
            Some(hb) if now - hb <= Duration::minutes(timeout_minutes) => "online",
            _ => "offline",
        }
    }
}

/// Inventory snapshot for a system.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InventoryRecord {
    pub id: i64,
    pub system_id: Uuid,
    pub data: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Request to create a system.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateSystemRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(rename = "type")]
    pub system_type: String,
    pub version: Option<String>,
    pub organization_id: Option<String>,
    #[serde(default)]
    pub custom_data: Option<serde_json::Value>,
}

/// Request to update a system.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateSystemRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub version: Option<String>,
    pub organization_id: Option<String>,
    pub custom_data: Option<serde_json::Value>,
}

/// System response for the API. The secret never leaves the create /
/// regenerate responses.
#[derive(Debug, Serialize)]
pub struct SystemResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub system_type: String,
    pub version: Option<String>,
    pub status: String,
    pub system_key: String,
    pub organization_id: Option<String>,
    pub custom_data: serde_json::Value,
    pub created_by: Option<serde_json::Value>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub suspended: bool,
}

impl SystemResponse {
    pub fn from_record(s: SystemRecord, heartbeat_timeout_minutes: i64) -> Self {
        let status = if s.suspended_at.is_some() {
            "suspended".to_string()
        } else {
            s.liveness(heartbeat_timeout_minutes, Utc::now()).to_string()
        };
        Self {
            id: s.id,
            name: s.name,
            system_type: s.system_type,
            version: s.version,
            status,
            system_key: s.system_key,
            organization_id: s.organization_id,
            custom_data: s.custom_data,
            created_by: s.created_by,
            heartbeat_at: s.heartbeat_at,
            created_at: s.created_at,
            suspended: s.suspended_at.is_some(),
        }
    }
}
