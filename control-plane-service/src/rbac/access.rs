//! Role-level access gating.
//!
//! A user-role may carry an access-control record naming the minimum
//! org-role rank required to hold or assign it. The record is cached in the
//! deny layer under `roles:access-control:<role-id>`; a lookup that cannot
//! be resolved denies.

use serde::{Deserialize, Serialize};

use super::has_org_role_at_least;
use crate::models::OrgTier;

/// Access-control record for a user-role.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoleAccessRecord {
    pub has_access_control: bool,
    pub required_org_role: Option<String>,
}

/// Pure gate: no record or an unrestricted record allows; a restricted
/// record requires sufficient rank; a restricted record whose required role
/// cannot be parsed denies.
pub fn can_access_role(record: Option<&RoleAccessRecord>, actor_role: Option<OrgTier>) -> bool {
    match record {
        None => true,
        Some(r) if !r.has_access_control => true,
        Some(r) => match r.required_org_role.as_deref().and_then(OrgTier::parse) {
            Some(required) => has_org_role_at_least(actor_role, required),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted(required: &str) -> RoleAccessRecord {
        RoleAccessRecord {
            has_access_control: true,
            required_org_role: Some(required.to_string()),
        }
    }

    #[test]
    fn absent_record_allows() {
        assert!(can_access_role(None, Some(OrgTier::Customer)));
        assert!(can_access_role(None, None));
    }

    #[test]
    fn unrestricted_record_allows() {
        let record = RoleAccessRecord {
            has_access_control: false,
            required_org_role: Some("Owner".to_string()),
        };
        assert!(can_access_role(Some(&record), Some(OrgTier::Customer)));
    }

    #[test]
    fn restricted_record_requires_rank() {
        let record = restricted("Reseller");
        assert!(can_access_role(Some(&record), Some(OrgTier::Owner)));
        assert!(can_access_role(Some(&record), Some(OrgTier::Reseller)));
        assert!(!can_access_role(Some(&record), Some(OrgTier::Customer)));
        assert!(!can_access_role(Some(&record), None));
    }

    #[test]
    fn required_role_comparison_is_case_insensitive() {
        let record = restricted("distributor");
        assert!(can_access_role(Some(&record), Some(OrgTier::Distributor)));
        assert!(!can_access_role(Some(&record), Some(OrgTier::Reseller)));
    }

    #[test]
    fn malformed_required_role_denies() {
        let record = restricted("superuser");
        assert!(!can_access_role(Some(&record), Some(OrgTier::Owner)));
    }
}
