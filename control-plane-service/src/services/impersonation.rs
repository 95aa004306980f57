//! Impersonation engine: consent grants, active-session uniqueness, and the
//! audited session lifecycle.
//!
//! Failure asymmetry: registry errors fail closed when creating a session
//! and fail open on liveness reads of an already-validated session. Audit
//! writes are best-effort; a failed audit never blocks a state transition.
//!
//! Expired registry entries are cleaned up lazily: whichever code path
//! observes one removes it and appends the `session_end` audit row.

use chrono::{Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use service_core::error::FieldError;
use std::sync::Arc;

use super::cache::CacheLayer;
use super::database::Database;
use super::error::ServiceError;
use super::identity::IdentityGateway;
use super::token::{AccessTokenClaims, MintedToken, TokenService};
use crate::models::{ActiveSession, AuditAction, ConsentGrant, SessionRecord, Subject};

#[derive(Clone)]
pub struct ImpersonationEngine {
    db: Database,
    cache: Arc<dyn CacheLayer>,
    tokens: TokenService,
    identity: IdentityGateway,
    default_consent_hours: i64,
}

/// Result of starting a session.
#[derive(Debug)]
pub struct StartedSession {
    pub token: MintedToken,
    pub session_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Result of exiting a session: fresh non-impersonation tokens for the
/// original actor.
#[derive(Debug)]
pub struct ExitedSession {
    pub access: MintedToken,
    pub refresh: MintedToken,
    pub actor: Subject,
}

/// Status as seen by the current token holder.
#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ImpersonationStatus {
    /// The presented token is an impersonation token.
    Impersonating {
        session_id: String,
        impersonated_by: Subject,
        expires_at: i64,
    },
    /// A live session exists in the registry; a fresh impersonation token
    /// was re-minted for the remaining duration.
    Resumed {
        session_id: String,
        token: String,
        expires_in: i64,
    },
    /// No active impersonation.
    None,
}

impl ImpersonationEngine {
    pub fn new(
        db: Database,
        cache: Arc<dyn CacheLayer>,
        tokens: TokenService,
        identity: IdentityGateway,
        default_consent_hours: i64,
    ) -> Self {
        Self {
            db,
            cache,
            tokens,
            identity,
            default_consent_hours,
        }
    }

    // ==================== Consent ====================

    /// Upsert the consent row for a subject; a fresh consent replaces any
    /// prior one.
    pub async fn enable_consent(
        &self,
        subject_id: &str,
        duration_hours: Option<i64>,
    ) -> Result<ConsentGrant, ServiceError> {
        let hours = duration_hours.unwrap_or(self.default_consent_hours);
        if hours <= 0 || hours > 24 * 7 {
            return Err(ServiceError::Validation(vec![FieldError::new(
                "duration_hours",
                "must be between 1 and 168",
            )]));
        }
        let expires_at = Utc::now() + Duration::hours(hours);
        let grant = self
            .db
            .upsert_consent(subject_id, expires_at, hours as i32)
            .await?;
        tracing::info!(user = %subject_id, expires_at = %expires_at, "impersonation consent enabled");
        Ok(grant)
    }

    /// Idempotent consent removal.
    pub async fn disable_consent(&self, subject_id: &str) -> Result<(), ServiceError> {
        self.db.delete_consent(subject_id).await?;
        tracing::info!(user = %subject_id, "impersonation consent disabled");
        Ok(())
    }

    pub async fn consent_status(
        &self,
        subject_id: &str,
    ) -> Result<Option<ConsentGrant>, ServiceError> {
        let grant = self.db.get_consent(subject_id).await?;
        Ok(grant.filter(|g| g.is_live(Utc::now())))
    }

    pub async fn can_be_impersonated(&self, target_id: &str) -> Result<bool, ServiceError> {
        Ok(self.consent_status(target_id).await?.is_some())
    }

    // ==================== Session lifecycle ====================

    /// Start impersonating `target_id`. Preconditions are checked in order;
    /// each failure maps to a distinct error kind.
    #[tracing::instrument(skip(self, actor_claims))]
    pub async fn start(
        &self,
        actor_claims: &AccessTokenClaims,
        target_id: &str,
    ) -> Result<StartedSession, ServiceError> {
        let actor = actor_claims.to_subject();

        // (a) no chaining
        if actor_claims.is_impersonated {
            return Err(ServiceError::AccessDenied(
                "cannot impersonate while already impersonating".to_string(),
            ));
        }

        // (b) active-session uniqueness; a registry failure fails closed
        // here, so an outage cannot mint duplicate sessions.
        match self.cache.get_session(&actor.logto_id).await {
            Ok(Some(existing)) if existing.is_live(Utc::now()) => {
                return Err(ServiceError::Conflict(
                    "an active impersonation session already exists".to_string(),
                ));
            }
            Ok(Some(expired)) => {
                self.cleanup_expired(&actor.logto_id, &expired).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "session registry unavailable, refusing to start impersonation");
                return Err(ServiceError::Cache(e.to_string()));
            }
        }

        // (c) live consent
        let consent = self
            .db
            .get_consent(target_id)
            .await?
            .filter(|g| g.is_live(Utc::now()))
            .ok_or_else(|| {
                ServiceError::AccessDenied("target has not consented to impersonation".to_string())
            })?;

        // (d) resolvable target
        let target = match self.identity.resolve_subject_by_id(target_id).await {
            Ok(subject) => subject,
            Err(ServiceError::InvalidCredential) => {
                return Err(ServiceError::NotFound("user".to_string()))
            }
            Err(e) => return Err(e),
        };

        // (e) not self
        if actor.logto_id == target.logto_id
            || (actor.id.is_some() && actor.id == target.id)
        {
            return Err(ServiceError::Validation(vec![FieldError::new(
                "user_id",
                "cannot impersonate yourself",
            )]));
        }

        // Session TTL is the remaining consent window, so chained sessions
        // within one consent all expire together.
        let now = Utc::now();
        let remaining = consent.expires_at - now;
        let session_id = generate_session_id();

        let session = ActiveSession {
            session_id: session_id.clone(),
            target_id: target.logto_id.clone(),
            expires_at: consent.expires_at,
            created_at: now,
        };

        let registered = self
            .cache
            .put_session_if_absent(&actor.logto_id, &session, remaining.num_seconds())
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "session registration failed");
                ServiceError::Cache(e.to_string())
            })?;
        if !registered {
            return Err(ServiceError::Conflict(
                "an active impersonation session already exists".to_string(),
            ));
        }

        let record = SessionRecord {
            session_id: session_id.clone(),
            impersonator_id: actor.logto_id.clone(),
            impersonated_id: target.logto_id.clone(),
            started_at: now,
            ended_at: None,
        };
        if let Err(e) = self.db.insert_session(&record).await {
            // Keep registry and store consistent: release the slot.
            if let Err(clear_err) = self.cache.clear_session(&actor.logto_id).await {
                tracing::warn!(error = %clear_err, "failed to release session registry entry");
            }
            return Err(e);
        }

        let token = self
            .tokens
            .mint_impersonation(&target, &session_id, &actor, remaining)?;

        self.audit(
            &session_id,
            AuditAction::SessionStart,
            &actor.logto_id,
            &actor.username,
            &target.logto_id,
            &target.username,
        )
        .await;

        tracing::info!(
            session_id = %session_id,
            impersonator = %actor.logto_id,
            impersonated = %target.logto_id,
            "impersonation session started"
        );

        Ok(StartedSession {
            token,
            session_id,
            expires_at: consent.expires_at,
        })
    }

    /// Exit the current impersonation session and mint fresh tokens for the
    /// original actor.
    #[tracing::instrument(skip_all)]
    pub async fn exit(&self, claims: &AccessTokenClaims) -> Result<ExitedSession, ServiceError> {
        if !claims.is_impersonated {
            return Err(ServiceError::AccessDenied(
                "not an impersonation session".to_string(),
            ));
        }
        let envelope = claims.impersonated_by.as_deref().cloned().ok_or_else(|| {
            ServiceError::AccessDenied("not an impersonation session".to_string())
        })?;
        let session_id = claims
            .session_id
            .clone()
            .ok_or(ServiceError::TokenMalformed)?;

        // Liveness path: registry failures are logged, never block the exit.
        match self.cache.get_session(&envelope.logto_id).await {
            Ok(Some(entry)) if entry.session_id != session_id => {
                tracing::warn!(
                    registry = %entry.session_id,
                    token = %session_id,
                    "registry session does not match token session, clearing anyway"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "session registry read failed during exit");
            }
            _ => {}
        }
        if let Err(e) = self.cache.clear_session(&envelope.logto_id).await {
            tracing::warn!(error = %e, "failed to clear session registry entry");
        }

        if let Err(e) = self.db.end_session(&session_id).await {
            tracing::warn!(error = %e, session_id = %session_id, "failed to mark session ended");
        }

        self.audit(
            &session_id,
            AuditAction::SessionEnd,
            &envelope.logto_id,
            &envelope.username,
            &claims.sub,
            &claims.username,
        )
        .await;

        // Re-enrich the actor so permission changes since the session began
        // take effect; fall back to the envelope snapshot if the IdP is
        // unavailable.
        let actor = match self.identity.resolve_subject_by_id(&envelope.logto_id).await {
            Ok(subject) => subject,
            Err(e) => {
                tracing::warn!(error = %e, "failed to re-enrich actor on exit, using token envelope");
                envelope
            }
        };

        let access = self.tokens.mint_access(&actor)?;
        let refresh = self.tokens.mint_refresh(&actor.logto_id)?;

        tracing::info!(session_id = %session_id, actor = %actor.logto_id, "impersonation session ended");

        Ok(ExitedSession {
            access,
            refresh,
            actor,
        })
    }

    /// Status for the presenting subject. A regular token holder with a live
    /// registry entry gets a re-minted impersonation token for the remaining
    /// duration.
    pub async fn status(
        &self,
        claims: &AccessTokenClaims,
    ) -> Result<ImpersonationStatus, ServiceError> {
        if claims.is_impersonated {
            let envelope = claims
                .impersonated_by
                .as_deref()
                .cloned()
                .ok_or(ServiceError::TokenMalformed)?;
            return Ok(ImpersonationStatus::Impersonating {
                session_id: claims.session_id.clone().unwrap_or_default(),
                impersonated_by: envelope,
                expires_at: claims.exp,
            });
        }

        // Liveness read: registry failures fail open.
        let entry = match self.cache.get_session(&claims.sub).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "session registry read failed during status check");
                return Ok(ImpersonationStatus::None);
            }
        };

        match entry {
            Some(session) if session.is_live(Utc::now()) => {
                let target = match self.identity.resolve_subject_by_id(&session.target_id).await {
                    Ok(subject) => subject,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to resolve impersonation target for resume");
                        return Ok(ImpersonationStatus::None);
                    }
                };
                let actor = claims.to_subject();
                let remaining = session.expires_at - Utc::now();
                let minted = self.tokens.mint_impersonation(
                    &target,
                    &session.session_id,
                    &actor,
                    remaining,
                )?;
                Ok(ImpersonationStatus::Resumed {
                    session_id: session.session_id,
                    token: minted.token,
                    expires_in: minted.expires_in,
                })
            }
            Some(expired) => {
                self.cleanup_expired(&claims.sub, &expired).await;
                Ok(ImpersonationStatus::None)
            }
            None => Ok(ImpersonationStatus::None),
        }
    }

    // ==================== History ====================

    /// Session history: owners see every session, everyone else their own.
    pub async fn list_sessions(
        &self,
        actor: &Subject,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<SessionRecord>, i64), ServiceError> {
        let scope = if actor.org_role == Some(crate::models::OrgTier::Owner) {
            None
        } else {
            Some(actor.logto_id.as_str())
        };
        self.db.list_sessions(scope, page, page_size).await
    }

    pub async fn session_detail(
        &self,
        actor: &Subject,
        session_id: &str,
    ) -> Result<SessionRecord, ServiceError> {
        let session = self
            .db
            .get_session(session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("impersonation session".to_string()))?;
        if actor.org_role != Some(crate::models::OrgTier::Owner)
            && session.impersonator_id != actor.logto_id
            && session.impersonated_id != actor.logto_id
        {
            // Filtered out by visibility, not revealed as forbidden.
            return Err(ServiceError::NotFound("impersonation session".to_string()));
        }
        Ok(session)
    }

    pub async fn session_audit(
        &self,
        actor: &Subject,
        session_id: &str,
    ) -> Result<Vec<crate::models::AuditEntry>, ServiceError> {
        self.session_detail(actor, session_id).await?;
        self.db.list_audit(session_id).await
    }

    // ==================== Internals ====================

    /// Remove an expired registry entry and close its audit trail.
    async fn cleanup_expired(&self, impersonator_id: &str, session: &ActiveSession) {
        if let Err(e) = self.cache.clear_session(impersonator_id).await {
            tracing::warn!(error = %e, "failed to clear expired session entry");
        }
        if let Err(e) = self.db.end_session(&session.session_id).await {
            tracing::warn!(error = %e, "failed to mark expired session ended");
        }

        let (impersonator_username, target_username) = self
            .audit_usernames(impersonator_id, &session.target_id)
            .await;
        self.audit(
            &session.session_id,
            AuditAction::SessionEnd,
            impersonator_id,
            &impersonator_username,
            &session.target_id,
            &target_username,
        )
        .await;
        tracing::info!(session_id = %session.session_id, "expired impersonation session cleaned up");
    }

    async fn audit_usernames(&self, impersonator_id: &str, target_id: &str) -> (String, String) {
        let impersonator = self
            .db
            .find_user_by_logto_id(impersonator_id)
            .await
            .ok()
            .flatten()
            .map(|u| u.username)
            .unwrap_or_else(|| impersonator_id.to_string());
        let target = self
            .db
            .find_user_by_logto_id(target_id)
            .await
            .ok()
            .flatten()
            .map(|u| u.username)
            .unwrap_or_else(|| target_id.to_string());
        (impersonator, target)
    }

    /// Best-effort audit append; failure is logged at WARN, never raised.
    async fn audit(
        &self,
        session_id: &str,
        action: AuditAction,
        impersonator_id: &str,
        impersonator_username: &str,
        impersonated_id: &str,
        impersonated_username: &str,
    ) {
        if let Err(e) = self
            .db
            .insert_audit(
                session_id,
                action,
                impersonator_id,
                impersonator_username,
                impersonated_id,
                impersonated_username,
                None,
            )
            .await
        {
            tracing::warn!(
                error = %e,
                session_id = %session_id,
                action = %action.as_str(),
                "failed to append impersonation audit entry"
            );
        }
    }
}

/// 128-bit random session identity.
fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_128_bit_hex() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }
}
