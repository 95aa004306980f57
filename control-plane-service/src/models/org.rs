//! Organization model - the three-tier hierarchy plus the synthetic owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Organization tier. Spelling variants are normalized once at the boundary;
/// everything downstream compares discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrgTier {
    Owner,
    Distributor,
    Reseller,
    Customer,
}

impl OrgTier {
    /// Rank order: Owner > Distributor > Reseller > Customer.
    pub fn rank(self) -> u8 {
        match self {
            OrgTier::Owner => 4,
            OrgTier::Distributor => 3,
            OrgTier::Reseller => 2,
            OrgTier::Customer => 1,
        }
    }

    /// Canonical capitalized spelling, the form stored in tokens.
    pub fn as_str(self) -> &'static str {
        match self {
            OrgTier::Owner => "Owner",
            OrgTier::Distributor => "Distributor",
            OrgTier::Reseller => "Reseller",
            OrgTier::Customer => "Customer",
        }
    }

    /// Lowercase form used in `custom_data.type`.
    pub fn type_name(self) -> &'static str {
        match self {
            OrgTier::Owner => "owner",
            OrgTier::Distributor => "distributor",
            OrgTier::Reseller => "reseller",
            OrgTier::Customer => "customer",
        }
    }

    /// Case-insensitive parse; unknown values yield None (rank 0, denied).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Some(OrgTier::Owner),
            "distributor" => Some(OrgTier::Distributor),
            "reseller" => Some(OrgTier::Reseller),
            "customer" => Some(OrgTier::Customer),
            _ => None,
        }
    }

    /// The backing table for a non-owner tier.
    pub fn table(self) -> Option<&'static str> {
        match self {
            OrgTier::Owner => None,
            OrgTier::Distributor => Some("distributors"),
            OrgTier::Reseller => Some("resellers"),
            OrgTier::Customer => Some("customers"),
        }
    }
}

impl std::fmt::Display for OrgTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrgTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrgTier::parse(s).ok_or_else(|| format!("unknown org role: {}", s))
    }
}

impl Serialize for OrgTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OrgTier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        OrgTier::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown org role: {}", s)))
    }
}

/// Optional branding block carried in org custom data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgBranding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
}

/// The structured part of an organization's `custom_data` JSONB column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgCustomData {
    #[serde(rename = "type")]
    pub org_type: String,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branding: Option<OrgBranding>,
    #[serde(default)]
    pub mfa_required: bool,
    /// Default org role assigned to members at first sign-in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jit_role: Option<String>,
}

/// Organization row, shared by the three tier tables.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrgRecord {
    pub id: Uuid,
    pub logto_id: String,
    pub name: String,
    pub description: Option<String>,
    pub custom_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub logto_synced_at: Option<DateTime<Utc>>,
    pub logto_sync_error: Option<String>,
}

impl OrgRecord {
    /// The `createdBy` org identity from custom data, if present.
    pub fn created_by(&self) -> Option<&str> {
        self.custom_data.get("createdBy").and_then(|v| v.as_str())
    }

    /// The tier recorded in custom data.
    pub fn tier(&self) -> Option<OrgTier> {
        self.custom_data
            .get("type")
            .and_then(|v| v.as_str())
            .and_then(OrgTier::parse)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }
}

/// Request to create an organization in a tier.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrgRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    pub vat: Option<String>,
    pub branding: Option<OrgBranding>,
    #[serde(default)]
    pub mfa_required: bool,
}

/// Request to update an organization.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateOrgRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub branding: Option<OrgBranding>,
    pub mfa_required: Option<bool>,
}

/// Organization response for the API.
#[derive(Debug, Serialize)]
pub struct OrgResponse {
    pub id: Uuid,
    pub logto_id: String,
    pub name: String,
    pub description: Option<String>,
    pub custom_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub suspended: bool,
}

impl From<OrgRecord> for OrgResponse {
    fn from(o: OrgRecord) -> Self {
        Self {
            id: o.id,
            logto_id: o.logto_id,
            name: o.name,
            description: o.description,
            custom_data: o.custom_data,
            created_at: o.created_at,
            updated_at: o.updated_at,
            suspended: o.suspended_at.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parse_is_case_insensitive() {
        assert_eq!(OrgTier::parse("owner"), Some(OrgTier::Owner));
        assert_eq!(OrgTier::parse("OWNER"), Some(OrgTier::Owner));
        assert_eq!(OrgTier::parse("Distributor"), Some(OrgTier::Distributor));
        assert_eq!(OrgTier::parse("rEsElLeR"), Some(OrgTier::Reseller));
        assert_eq!(OrgTier::parse("supervisor"), None);
        assert_eq!(OrgTier::parse(""), None);
    }

    #[test]
    fn tier_rank_total_order() {
        assert!(OrgTier::Owner.rank() > OrgTier::Distributor.rank());
        assert!(OrgTier::Distributor.rank() > OrgTier::Reseller.rank());
        assert!(OrgTier::Reseller.rank() > OrgTier::Customer.rank());
    }

    #[test]
    fn tier_serializes_canonical_capitalized() {
        let json = serde_json::to_string(&OrgTier::Reseller).unwrap();
        assert_eq!(json, "\"Reseller\"");
        let parsed: OrgTier = serde_json::from_str("\"reseller\"").unwrap();
        assert_eq!(parsed, OrgTier::Reseller);
    }

    #[test]
    fn record_reads_custom_data() {
        let record = OrgRecord {
            id: Uuid::new_v4(),
            logto_id: "org-r1".to_string(),
            name: "Reseller One".to_string(),
            description: None,
            custom_data: serde_json::json!({"type": "reseller", "createdBy": "org-d1"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            suspended_at: None,
            deleted_at: None,
            logto_synced_at: None,
            logto_sync_error: None,
        };
        assert_eq!(record.tier(), Some(OrgTier::Reseller));
        assert_eq!(record.created_by(), Some("org-d1"));
    }
}
