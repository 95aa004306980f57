//! Identity gateway: turns an IdP access token into an enriched subject.
//!
//! The IdP stays the source of truth for identity; the gateway resolves the
//! canonical profile, maintains the local surrogate record, and enriches the
//! subject with user-roles, permissions and the single organization
//! membership. Enrichment failures degrade to an identified-but-unauthorized
//! subject rather than failing the exchange.

use std::sync::Arc;

use super::database::Database;
use super::error::ServiceError;
use super::idp::{IdentityProvider, IdpError, IdpUser};
use crate::models::{OrgTier, Subject};

#[derive(Clone)]
pub struct IdentityGateway {
    idp: Arc<dyn IdentityProvider>,
    db: Database,
}

#[derive(Debug, Default)]
struct Enrichment {
    user_roles: Vec<String>,
    user_role_ids: Vec<String>,
    user_permissions: Vec<String>,
    org_role: Option<OrgTier>,
    org_role_id: Option<String>,
    org_permissions: Vec<String>,
    organization_id: Option<String>,
    organization_name: Option<String>,
}

impl IdentityGateway {
    pub fn new(idp: Arc<dyn IdentityProvider>, db: Database) -> Self {
        Self { idp, db }
    }

    /// Resolve the subject presenting an IdP access token.
    #[tracing::instrument(skip_all)]
    pub async fn resolve_subject(&self, idp_access_token: &str) -> Result<Subject, ServiceError> {
        let userinfo = match self.idp.userinfo(idp_access_token).await {
            Ok(info) => info,
            Err(IdpError::Unauthorized) => return Err(ServiceError::InvalidCredential),
            Err(e) => return Err(ServiceError::Idp(e)),
        };
        self.resolve_subject_by_id(&userinfo.sub).await
    }

    /// Resolve a subject by its IdP identifier (refresh and impersonation
    /// paths re-run enrichment here so permission changes take effect).
    #[tracing::instrument(skip(self))]
    pub async fn resolve_subject_by_id(&self, sub: &str) -> Result<Subject, ServiceError> {
        let profile = match self.idp.get_user(sub).await {
            Ok(profile) => profile,
            Err(IdpError::NotFound(_)) => return Err(ServiceError::InvalidCredential),
            Err(e) => return Err(ServiceError::Idp(e)),
        };

        let local_id = self.sync_local_record(&profile).await;
        let enrichment = self.enrich(sub).await;

        Ok(Subject {
            id: local_id,
            logto_id: profile.id,
            username: profile.username,
            email: profile.primary_email.unwrap_or_default(),
            name: profile.name.unwrap_or_default(),
            phone: profile.primary_phone,
            user_roles: enrichment.user_roles,
            user_role_ids: enrichment.user_role_ids,
            user_permissions: enrichment.user_permissions,
            org_role: enrichment.org_role,
            org_role_id: enrichment.org_role_id,
            org_permissions: enrichment.org_permissions,
            organization_id: enrichment.organization_id,
            organization_name: enrichment.organization_name,
        })
    }

    /// Create the local surrogate on first exchange, or touch
    /// `last_login_at` on later ones. Best-effort, never fatal.
    async fn sync_local_record(&self, profile: &IdpUser) -> Option<uuid::Uuid> {
        match self.db.find_user_by_logto_id(&profile.id).await {
            Ok(Some(record)) => {
                if let Err(e) = self.db.touch_last_login(record.id).await {
                    tracing::warn!(user = %profile.id, error = %e, "failed to update last_login_at");
                }
                Some(record.id)
            }
            Ok(None) => match self.db.insert_user_from_idp(profile).await {
                Ok(record) => Some(record.id),
                Err(e) => {
                    tracing::warn!(user = %profile.id, error = %e, "failed to create local user record");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(user = %profile.id, error = %e, "failed to look up local user record");
                None
            }
        }
    }

    /// Fetch roles, permissions and the organization membership. Any failure
    /// yields empty sets: the subject stays identified, never authorized.
    async fn enrich(&self, sub: &str) -> Enrichment {
        match self.try_enrich(sub).await {
            Ok(enrichment) => enrichment,
            Err(e) => {
                tracing::warn!(user = %sub, error = %e, "subject enrichment failed, returning empty role sets");
                Enrichment::default()
            }
        }
    }

    async fn try_enrich(&self, sub: &str) -> Result<Enrichment, IdpError> {
        let roles = self.idp.get_user_roles(sub).await?;
        let user_permissions = self.idp.get_user_permissions(sub).await?;
        let organizations = self.idp.get_user_organizations(sub).await?;

        let mut enrichment = Enrichment {
            user_roles: roles.iter().map(|r| r.name.clone()).collect(),
            user_role_ids: roles.iter().map(|r| r.id.clone()).collect(),
            user_permissions,
            ..Enrichment::default()
        };

        if let Some(org) = organizations.into_iter().next() {
            let org_roles = self.idp.get_organization_roles(&org.id, sub).await?;
            if let Some(org_role) = org_roles.into_iter().next() {
                enrichment.org_role = OrgTier::parse(&org_role.name);
                enrichment.org_role_id = Some(org_role.id);
                enrichment.org_permissions = org_role.scopes;
            }
            enrichment.organization_id = Some(org.id);
            enrichment.organization_name = Some(org.name);
        }

        Ok(enrichment)
    }

    /// Assert the subject has exactly one organization membership of a known
    /// tier.
    pub fn ensure_organization_membership(subject: &Subject) -> Result<(), ServiceError> {
        if subject.organization_id.is_none() {
            return Err(ServiceError::MalformedSubject(
                "subject has no organization membership".to_string(),
            ));
        }
        if subject.org_role.is_none() {
            return Err(ServiceError::MalformedSubject(
                "subject organization has no recognized tier".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_requires_org_and_tier() {
        let mut subject = Subject {
            id: None,
            logto_id: "u".to_string(),
            username: "u".to_string(),
            email: String::new(),
            name: String::new(),
            phone: None,
            user_roles: vec![],
            user_role_ids: vec![],
            user_permissions: vec![],
            org_role: None,
            org_role_id: None,
            org_permissions: vec![],
            organization_id: None,
            organization_name: None,
        };
        assert!(IdentityGateway::ensure_organization_membership(&subject).is_err());

        subject.organization_id = Some("org-1".to_string());
        assert!(IdentityGateway::ensure_organization_membership(&subject).is_err());

        subject.org_role = Some(OrgTier::Customer);
        assert!(IdentityGateway::ensure_organization_membership(&subject).is_ok());
    }
}
