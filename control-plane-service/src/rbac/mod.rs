//! Hierarchical RBAC evaluator.
//!
//! Pure decision functions over the organization tree. All comparisons are
//! case-insensitive at the boundary (`OrgTier::parse`); inside this module
//! everything is discriminants and ranks. SQL-side filtering composes the
//! same rules through `Database::visibility_clause`; single-target checks
//! come here.

pub mod access;

use crate::models::OrgTier;

/// The acting side of a check: org-role and organization identity as carried
/// in the validated token.
#[derive(Debug, Clone, Copy)]
pub struct ActorRef<'a> {
    pub org_role: Option<OrgTier>,
    pub org_id: &'a str,
}

/// The target organization of a check.
#[derive(Debug, Clone, Copy)]
pub struct OrgRef<'a> {
    pub tier: OrgTier,
    pub id: &'a str,
    pub created_by: Option<&'a str>,
}

/// Rank of an org-role; unknown roles rank 0 and are denied everywhere.
pub fn rank(org_role: Option<OrgTier>) -> u8 {
    org_role.map(OrgTier::rank).unwrap_or(0)
}

pub fn has_org_role_at_least(actor: Option<OrgTier>, required: OrgTier) -> bool {
    rank(actor) >= required.rank()
}

/// The central hierarchical check.
///
/// `target_creator` is the organization named by `target.created_by`, when
/// the caller has resolved it; it is only consulted for the distributor's
/// one-hop transitive rule (customers created by the distributor's direct
/// resellers).
pub fn can_actor_operate_on(
    actor: &ActorRef<'_>,
    target: &OrgRef<'_>,
    target_creator: Option<&OrgRef<'_>>,
) -> bool {
    let Some(role) = actor.org_role else {
        return false;
    };

    // Every tier may operate on its own organization.
    if role != OrgTier::Owner && actor.org_id == target.id {
        return true;
    }

    match role {
        OrgTier::Owner => true,
        OrgTier::Distributor => match target.tier {
            OrgTier::Reseller | OrgTier::Customer
                if target.created_by == Some(actor.org_id) =>
            {
                true
            }
            OrgTier::Customer => target_creator.is_some_and(|creator| {
                creator.tier == OrgTier::Reseller
                    && target.created_by == Some(creator.id)
                    && creator.created_by == Some(actor.org_id)
            }),
            _ => false,
        },
        OrgTier::Reseller => {
            target.tier == OrgTier::Customer && target.created_by == Some(actor.org_id)
        }
        OrgTier::Customer => false,
    }
}

/// Account-creation check: the hierarchy rule, plus the Admin user-role when
/// creating inside the actor's own organization.
pub fn can_actor_create_account_for(
    actor: &ActorRef<'_>,
    target: &OrgRef<'_>,
    target_creator: Option<&OrgRef<'_>>,
    actor_is_admin: bool,
) -> bool {
    if actor.org_id == target.id {
        return actor.org_role.is_some() && actor_is_admin;
    }
    can_actor_operate_on(actor, target, target_creator)
}

/// Subject-level check: the org rule, with Customer actors additionally
/// required to hold the Admin user-role. Self-read/-delete/-update special
/// cases are enforced by the callers, which know the request shape.
pub fn can_actor_operate_on_subject(
    actor: &ActorRef<'_>,
    target_org: &OrgRef<'_>,
    target_creator: Option<&OrgRef<'_>>,
    actor_is_admin: bool,
) -> bool {
    if actor.org_role == Some(OrgTier::Customer) && !actor_is_admin {
        return false;
    }
    can_actor_operate_on(actor, target_org, target_creator)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER_ORG: &str = "org-owner";
    const D1: &str = "org-d1";
    const D2: &str = "org-d2";
    const R1: &str = "org-r1";
    const C1: &str = "org-c1";

    fn actor(role: OrgTier, org: &str) -> ActorRef<'_> {
        ActorRef {
            org_role: Some(role),
            org_id: org,
        }
    }

    fn reseller_of<'a>(id: &'a str, distributor: &'a str) -> OrgRef<'a> {
        OrgRef {
            tier: OrgTier::Reseller,
            id,
            created_by: Some(distributor),
        }
    }

    fn customer_of<'a>(id: &'a str, creator: &'a str) -> OrgRef<'a> {
        OrgRef {
            tier: OrgTier::Customer,
            id,
            created_by: Some(creator),
        }
    }

    #[test]
    fn owner_operates_on_anything() {
        let a = actor(OrgTier::Owner, OWNER_ORG);
        assert!(can_actor_operate_on(&a, &reseller_of(R1, D1), None));
        assert!(can_actor_operate_on(&a, &customer_of(C1, R1), None));
        assert!(can_actor_operate_on(
            &a,
            &OrgRef {
                tier: OrgTier::Distributor,
                id: D1,
                created_by: Some(OWNER_ORG)
            },
            None
        ));
    }

    #[test]
    fn distributor_operates_on_direct_children() {
        let a = actor(OrgTier::Distributor, D1);
        assert!(can_actor_operate_on(&a, &reseller_of(R1, D1), None));
        assert!(can_actor_operate_on(&a, &customer_of(C1, D1), None));
    }

    #[test]
    fn distributor_operates_transitively_through_own_reseller() {
        let a = actor(OrgTier::Distributor, D1);
        let r1 = reseller_of(R1, D1);
        assert!(can_actor_operate_on(&a, &customer_of(C1, R1), Some(&r1)));
    }

    #[test]
    fn distributor_denied_other_distributors_subtree() {
        let a = actor(OrgTier::Distributor, D1);
        let foreign_reseller = reseller_of(R1, D2);
        assert!(!can_actor_operate_on(&a, &foreign_reseller, None));
        assert!(!can_actor_operate_on(
            &a,
            &customer_of(C1, R1),
            Some(&foreign_reseller)
        ));
    }

    #[test]
    fn reseller_operates_only_on_own_customers() {
        let a = actor(OrgTier::Reseller, R1);
        assert!(can_actor_operate_on(&a, &customer_of(C1, R1), None));
        assert!(!can_actor_operate_on(&a, &customer_of(C1, "org-r2"), None));
        assert!(!can_actor_operate_on(&a, &reseller_of("org-r2", D1), None));
    }

    #[test]
    fn customer_operates_only_on_self() {
        let a = actor(OrgTier::Customer, C1);
        assert!(can_actor_operate_on(
            &a,
            &OrgRef {
                tier: OrgTier::Customer,
                id: C1,
                created_by: Some(R1)
            },
            None
        ));
        assert!(!can_actor_operate_on(&a, &customer_of("org-c2", R1), None));
    }

    #[test]
    fn unknown_role_is_denied() {
        let a = ActorRef {
            org_role: None,
            org_id: D1,
        };
        assert!(!can_actor_operate_on(&a, &reseller_of(R1, D1), None));
        assert_eq!(rank(None), 0);
    }

    // Monotonicity: if a lower rank may operate on a target inside its
    // subtree, every higher rank whose subtree contains the target may too.
    #[test]
    fn operate_is_monotone_in_rank() {
        let target = customer_of(C1, R1);
        let r1 = reseller_of(R1, D1);

        let reseller = actor(OrgTier::Reseller, R1);
        let distributor = actor(OrgTier::Distributor, D1);
        let owner = actor(OrgTier::Owner, OWNER_ORG);

        assert!(can_actor_operate_on(&reseller, &target, None));
        assert!(can_actor_operate_on(&distributor, &target, Some(&r1)));
        assert!(can_actor_operate_on(&owner, &target, Some(&r1)));
    }

    #[test]
    fn org_role_rank_comparisons() {
        assert!(has_org_role_at_least(Some(OrgTier::Owner), OrgTier::Customer));
        assert!(has_org_role_at_least(
            Some(OrgTier::Reseller),
            OrgTier::Reseller
        ));
        assert!(!has_org_role_at_least(
            Some(OrgTier::Customer),
            OrgTier::Reseller
        ));
        assert!(!has_org_role_at_least(None, OrgTier::Customer));
    }

    #[test]
    fn create_in_own_org_requires_admin() {
        let a = actor(OrgTier::Reseller, R1);
        let own_org = OrgRef {
            tier: OrgTier::Reseller,
            id: R1,
            created_by: Some(D1),
        };
        assert!(!can_actor_create_account_for(&a, &own_org, None, false));
        assert!(can_actor_create_account_for(&a, &own_org, None, true));
    }

    #[test]
    fn create_downstream_does_not_require_admin() {
        let a = actor(OrgTier::Reseller, R1);
        let target = customer_of(C1, R1);
        assert!(can_actor_create_account_for(&a, &target, None, false));
    }

    #[test]
    fn customer_subject_operations_require_admin() {
        let a = actor(OrgTier::Customer, C1);
        let own_org = OrgRef {
            tier: OrgTier::Customer,
            id: C1,
            created_by: Some(R1),
        };
        assert!(!can_actor_operate_on_subject(&a, &own_org, None, false));
        assert!(can_actor_operate_on_subject(&a, &own_org, None, true));
    }
}
