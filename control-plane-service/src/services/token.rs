//! Token service: mints and validates the three token kinds and maintains
//! the deny list.
//!
//! Tokens are compact JWTs signed with the configured symmetric secret
//! (HMAC-SHA-256). The signing key is process-wide and immutable after
//! startup.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::cache::CacheLayer;
use super::error::ServiceError;
use crate::config::JwtConfig;
use crate::models::{OrgTier, Subject};

/// Claims for access tokens, carrying the full enriched subject. When
/// impersonating, the envelope names the original actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (IdP identifier).
    pub sub: String,
    pub username: String,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub user_roles: Vec<String>,
    #[serde(default)]
    pub user_role_ids: Vec<String>,
    #[serde(default)]
    pub user_permissions: Vec<String>,
    #[serde(default)]
    pub org_role: String,
    #[serde(default)]
    pub org_role_id: String,
    #[serde(default)]
    pub org_permissions: Vec<String>,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub organization_name: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    pub iss: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_impersonated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonated_by: Option<Box<Subject>>,
}

impl AccessTokenClaims {
    /// Reconstruct the subject carried by these claims. The local surrogate
    /// id is not part of the wire format.
    pub fn to_subject(&self) -> Subject {
        Subject {
            id: None,
            logto_id: self.sub.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            phone: self.phone.clone(),
            user_roles: self.user_roles.clone(),
            user_role_ids: self.user_role_ids.clone(),
            user_permissions: self.user_permissions.clone(),
            org_role: OrgTier::parse(&self.org_role),
            org_role_id: if self.org_role_id.is_empty() {
                None
            } else {
                Some(self.org_role_id.clone())
            },
            org_permissions: self.org_permissions.clone(),
            organization_id: if self.organization_id.is_empty() {
                None
            } else {
                Some(self.organization_id.clone())
            },
            organization_name: if self.organization_name.is_empty() {
                None
            } else {
                Some(self.organization_name.clone())
            },
        }
    }
}

/// Claims for refresh tokens: identity only, so refresh works before the
/// local record exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    pub iss: String,
    pub typ: String,
}

/// A minted token with its lifetime in seconds.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_expiry_hours: i64,
    refresh_expiry_hours: i64,
}

impl TokenService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            access_expiry_hours: config.expiration_hours,
            refresh_expiry_hours: config.refresh_expiration_hours,
        }
    }

    pub fn access_expiry_seconds(&self) -> i64 {
        self.access_expiry_hours * 3600
    }

    fn claims_for(&self, subject: &Subject, ttl: Duration) -> AccessTokenClaims {
        let now = Utc::now();
        AccessTokenClaims {
            sub: subject.logto_id.clone(),
            username: subject.username.clone(),
            email: subject.email.clone(),
            name: subject.name.clone(),
            phone: subject.phone.clone(),
            user_roles: subject.user_roles.clone(),
            user_role_ids: subject.user_role_ids.clone(),
            user_permissions: subject.user_permissions.clone(),
            org_role: subject
                .org_role
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
            org_role_id: subject.org_role_id.clone().unwrap_or_default(),
            org_permissions: subject.org_permissions.clone(),
            organization_id: subject.organization_id.clone().unwrap_or_default(),
            organization_name: subject.organization_name.clone().unwrap_or_default(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            nbf: now.timestamp(),
            iss: self.issuer.clone(),
            is_impersonated: false,
            session_id: None,
            impersonated_by: None,
        }
    }

    /// Mint an access token for a subject.
    pub fn mint_access(&self, subject: &Subject) -> Result<MintedToken, ServiceError> {
        let ttl = Duration::hours(self.access_expiry_hours);
        let claims = self.claims_for(subject, ttl);
        self.encode_access(&claims, ttl)
    }

    /// Mint an impersonation token: the target's subject, with the envelope
    /// naming the original actor. Its lifetime is the remaining consent
    /// window, never the configured access lifetime.
    pub fn mint_impersonation(
        &self,
        target: &Subject,
        session_id: &str,
        impersonator: &Subject,
        remaining: Duration,
    ) -> Result<MintedToken, ServiceError> {
        let mut claims = self.claims_for(target, remaining);
        claims.is_impersonated = true;
        claims.session_id = Some(session_id.to_string());
        claims.impersonated_by = Some(Box::new(impersonator.clone()));
        self.encode_access(&claims, remaining)
    }

    fn encode_access(
        &self,
        claims: &AccessTokenClaims,
        ttl: Duration,
    ) -> Result<MintedToken, ServiceError> {
        let token = encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("failed to encode token: {}", e)))?;
        Ok(MintedToken {
            token,
            expires_in: ttl.num_seconds(),
        })
    }

    /// Mint a refresh token carrying only the IdP identifier.
    pub fn mint_refresh(&self, sub: &str) -> Result<MintedToken, ServiceError> {
        let now = Utc::now();
        let ttl = Duration::hours(self.refresh_expiry_hours);
        let claims = RefreshTokenClaims {
            sub: sub.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            nbf: now.timestamp(),
            iss: self.issuer.clone(),
            typ: "refresh".to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("failed to encode token: {}", e)))?;
        Ok(MintedToken {
            token,
            expires_in: ttl.num_seconds(),
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation
    }

    /// Validate signature and time claims of an access token.
    pub fn validate_access(&self, token: &str) -> Result<AccessTokenClaims, ServiceError> {
        decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation())
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    /// Validate a refresh token, including its `typ` marker.
    pub fn validate_refresh(&self, token: &str) -> Result<RefreshTokenClaims, ServiceError> {
        let claims = decode::<RefreshTokenClaims>(token, &self.decoding_key, &self.validation())
            .map(|data| data.claims)
            .map_err(map_jwt_error)?;
        if claims.typ != "refresh" {
            return Err(ServiceError::TokenMalformed);
        }
        Ok(claims)
    }

    /// Deterministic digest of a token, the deny-list key.
    pub fn digest(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    /// Put a token on the deny list for its remaining lifetime.
    pub async fn blacklist(
        &self,
        cache: &dyn CacheLayer,
        token: &str,
        exp: i64,
        reason: &str,
    ) -> Result<(), ServiceError> {
        let remaining = exp - Utc::now().timestamp();
        if remaining <= 0 {
            return Ok(());
        }
        cache
            .blacklist_token(&Self::digest(token), reason, remaining)
            .await
            .map_err(|e| ServiceError::Cache(e.to_string()))
    }

    /// Deny-list check. A lookup failure rejects: an unverifiable token is
    /// treated as blacklisted.
    pub async fn check_denied(
        &self,
        cache: &dyn CacheLayer,
        token: &str,
    ) -> Result<(), ServiceError> {
        match cache.is_blacklisted(&Self::digest(token)).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(ServiceError::BlacklistedToken),
            Err(e) => {
                tracing::warn!(error = %e, "blacklist lookup failed, rejecting token");
                Err(ServiceError::BlacklistedToken)
            }
        }
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> ServiceError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => ServiceError::TokenExpired,
        ErrorKind::InvalidSignature => ServiceError::BadSignature,
        ErrorKind::ImmatureSignature => ServiceError::TokenExpired,
        _ => ServiceError::TokenMalformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::services::cache::MockCache;

    fn test_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret-at-least-32-bytes-long!!".to_string(),
            issuer: "control-plane".to_string(),
            expiration_hours: 24,
            refresh_expiration_hours: 168,
        }
    }

    fn subject() -> Subject {
        Subject {
            id: None,
            logto_id: "owner-alice".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            name: "Alice".to_string(),
            phone: None,
            user_roles: vec!["Admin".to_string()],
            user_role_ids: vec!["role-admin".to_string()],
            user_permissions: vec!["manage:users".to_string()],
            org_role: Some(OrgTier::Owner),
            org_role_id: Some("org-role-owner".to_string()),
            org_permissions: vec![],
            organization_id: Some("org-owner".to_string()),
            organization_name: Some("Owner Org".to_string()),
        }
    }

    #[test]
    fn access_token_roundtrip_preserves_sub() {
        let service = TokenService::new(&test_config());
        let minted = service.mint_access(&subject()).unwrap();
        assert_eq!(minted.expires_in, 86400);

        let claims = service.validate_access(&minted.token).unwrap();
        assert_eq!(claims.sub, "owner-alice");
        assert_eq!(claims.org_role, "Owner");
        assert!(!claims.is_impersonated);
        assert_eq!(claims.iss, "control-plane");
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let service = TokenService::new(&test_config());
        let minted = service.mint_access(&subject()).unwrap();

        let mut other = test_config();
        other.secret = "another-secret-also-32-bytes-long!!!".to_string();
        let other_service = TokenService::new(&other);
        assert!(matches!(
            other_service.validate_access(&minted.token),
            Err(ServiceError::BadSignature)
        ));
    }

    #[test]
    fn garbage_token_is_malformed() {
        let service = TokenService::new(&test_config());
        assert!(matches!(
            service.validate_access("not.a.jwt"),
            Err(ServiceError::TokenMalformed)
        ));
    }

    #[test]
    fn refresh_token_roundtrip() {
        let service = TokenService::new(&test_config());
        let minted = service.mint_refresh("owner-alice").unwrap();
        let claims = service.validate_refresh(&minted.token).unwrap();
        assert_eq!(claims.sub, "owner-alice");
        assert_eq!(claims.typ, "refresh");
    }

    #[test]
    fn access_token_is_not_a_refresh_token() {
        let service = TokenService::new(&test_config());
        let minted = service.mint_access(&subject()).unwrap();
        assert!(service.validate_refresh(&minted.token).is_err());
    }

    #[test]
    fn impersonation_token_carries_envelope_and_remaining_ttl() {
        let service = TokenService::new(&test_config());
        let mut target = subject();
        target.logto_id = "bob".to_string();
        target.username = "bob".to_string();
        target.org_role = Some(OrgTier::Customer);

        let minted = service
            .mint_impersonation(&target, "sess-1", &subject(), Duration::minutes(30))
            .unwrap();
        assert_eq!(minted.expires_in, 1800);

        let claims = service.validate_access(&minted.token).unwrap();
        assert_eq!(claims.sub, "bob");
        assert!(claims.is_impersonated);
        assert_eq!(claims.session_id.as_deref(), Some("sess-1"));
        let envelope = claims.impersonated_by.unwrap();
        assert_eq!(envelope.logto_id, "owner-alice");
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(TokenService::digest("abc"), TokenService::digest("abc"));
        assert_ne!(TokenService::digest("abc"), TokenService::digest("abd"));
    }

    #[tokio::test]
    async fn blacklisted_token_is_denied() {
        let service = TokenService::new(&test_config());
        let cache = MockCache::new();
        let minted = service.mint_access(&subject()).unwrap();
        let claims = service.validate_access(&minted.token).unwrap();

        service
            .blacklist(&cache, &minted.token, claims.exp, "logout")
            .await
            .unwrap();
        assert!(matches!(
            service.check_denied(&cache, &minted.token).await,
            Err(ServiceError::BlacklistedToken)
        ));
    }

    #[tokio::test]
    async fn blacklist_lookup_failure_rejects() {
        let service = TokenService::new(&test_config());
        let cache = MockCache::new();
        cache.set_failing(true);
        let minted = service.mint_access(&subject()).unwrap();
        assert!(matches!(
            service.check_denied(&cache, &minted.token).await,
            Err(ServiceError::BlacklistedToken)
        ));
    }

    #[test]
    fn claims_reconstruct_subject() {
        let service = TokenService::new(&test_config());
        let minted = service.mint_access(&subject()).unwrap();
        let claims = service.validate_access(&minted.token).unwrap();
        let reconstructed = claims.to_subject();
        assert_eq!(reconstructed.logto_id, "owner-alice");
        assert_eq!(reconstructed.org_role, Some(OrgTier::Owner));
        assert_eq!(reconstructed.organization_id.as_deref(), Some("org-owner"));
    }
}
