//! Identity provider client.
//!
//! The IdP owns identities; this client consumes its userinfo endpoint, the
//! management API (users, organizations, roles) and the password-verification
//! endpoint. Management calls authenticate with a client-credentials token
//! cached until shortly before expiry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::IdpConfig;

#[derive(Error, Debug)]
pub enum IdpError {
    #[error("identity provider rejected the credential")]
    Unauthorized,

    #[error("{0} not found at identity provider")]
    NotFound(String),

    #[error("identity provider request failed: {0}")]
    Http(String),

    #[error("identity provider returned status {0}: {1}")]
    Status(u16, String),

    #[error("failed to decode identity provider response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for IdpError {
    fn from(err: reqwest::Error) -> Self {
        IdpError::Http(err.to_string())
    }
}

/// Claims returned by the userinfo endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IdpUserInfo {
    pub sub: String,
}

/// Management profile of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpUser {
    pub id: String,
    pub username: String,
    #[serde(rename = "primaryEmail")]
    pub primary_email: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "primaryPhone")]
    pub primary_phone: Option<String>,
}

/// A user-role as known to the IdP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpRole {
    pub id: String,
    pub name: String,
}

/// An organization membership as known to the IdP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpOrganization {
    pub id: String,
    pub name: String,
    #[serde(rename = "customData", default)]
    pub custom_data: serde_json::Value,
}

/// An organization role carried by a membership, with its scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpOrgRole {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Request to create a user at the IdP.
#[derive(Debug, Clone, Serialize)]
pub struct IdpCreateUser {
    pub username: String,
    #[serde(rename = "primaryEmail")]
    pub primary_email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "primaryPhone", skip_serializing_if = "Option::is_none")]
    pub primary_phone: Option<String>,
}

/// Partial profile update.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdpProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "primaryEmail", skip_serializing_if = "Option::is_none")]
    pub primary_email: Option<String>,
    #[serde(rename = "primaryPhone", skip_serializing_if = "Option::is_none")]
    pub primary_phone: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn userinfo(&self, access_token: &str) -> Result<IdpUserInfo, IdpError>;
    async fn get_user(&self, user_id: &str) -> Result<IdpUser, IdpError>;
    async fn create_user(&self, req: &IdpCreateUser) -> Result<IdpUser, IdpError>;
    async fn delete_user(&self, user_id: &str) -> Result<(), IdpError>;
    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<IdpRole>, IdpError>;
    async fn assign_user_roles(&self, user_id: &str, role_ids: &[String]) -> Result<(), IdpError>;
    async fn get_user_permissions(&self, user_id: &str) -> Result<Vec<String>, IdpError>;
    async fn get_user_organizations(
        &self,
        user_id: &str,
    ) -> Result<Vec<IdpOrganization>, IdpError>;
    async fn get_organization_roles(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Vec<IdpOrgRole>, IdpError>;
    async fn create_organization(
        &self,
        name: &str,
        custom_data: &serde_json::Value,
    ) -> Result<IdpOrganization, IdpError>;
    async fn delete_organization(&self, org_id: &str) -> Result<(), IdpError>;
    async fn add_user_to_organization(
        &self,
        org_id: &str,
        user_id: &str,
        org_role_name: &str,
    ) -> Result<(), IdpError>;
    async fn verify_password(&self, user_id: &str, password: &str) -> Result<bool, IdpError>;
    async fn update_password(&self, user_id: &str, new_password: &str) -> Result<(), IdpError>;
    async fn update_profile(
        &self,
        user_id: &str,
        update: &IdpProfileUpdate,
    ) -> Result<(), IdpError>;
}

/// HTTP client against the IdP. Process-wide; retry and rate limiting live
/// behind the shared reqwest client.
pub struct IdpClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    management_token: RwLock<Option<(String, Instant)>>,
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    expires_in: u64,
}

impl IdpClient {
    pub fn new(config: &IdpConfig) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.management_client_id.clone(),
            client_secret: config.management_client_secret.clone(),
            management_token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch (or reuse) the management API token.
    async fn management_token(&self) -> Result<String, IdpError> {
        {
            let guard = self.management_token.read().await;
            if let Some((token, expires)) = guard.as_ref() {
                if *expires > Instant::now() {
                    return Ok(token.clone());
                }
            }
        }

        let response = self
            .http
            .post(self.url("/oidc/token"))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("resource", "https://default.logto.app/api"),
                ("scope", "all"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IdpError::Status(
                response.status().as_u16(),
                "management token grant failed".to_string(),
            ));
        }

        let grant: TokenGrant = response
            .json()
            .await
            .map_err(|e| IdpError::Decode(e.to_string()))?;

        // Refresh a minute early.
        let expires = Instant::now() + Duration::from_secs(grant.expires_in.saturating_sub(60));
        *self.management_token.write().await = Some((grant.access_token.clone(), expires));
        Ok(grant.access_token)
    }

    async fn management_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        what: &str,
    ) -> Result<T, IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await?;
        Self::decode(response, what).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T, IdpError> {
        match response.status().as_u16() {
            200..=299 => response
                .json()
                .await
                .map_err(|e| IdpError::Decode(e.to_string())),
            401 | 403 => Err(IdpError::Unauthorized),
            404 => Err(IdpError::NotFound(what.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(IdpError::Status(status, body))
            }
        }
    }

    async fn check_status(response: reqwest::Response, what: &str) -> Result<(), IdpError> {
        match response.status().as_u16() {
            200..=299 => Ok(()),
            401 | 403 => Err(IdpError::Unauthorized),
            404 => Err(IdpError::NotFound(what.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(IdpError::Status(status, body))
            }
        }
    }
}

#[async_trait]
impl IdentityProvider for IdpClient {
    async fn userinfo(&self, access_token: &str) -> Result<IdpUserInfo, IdpError> {
        let response = self
            .http
            .get(self.url("/oidc/me"))
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::decode(response, "user").await
    }

    async fn get_user(&self, user_id: &str) -> Result<IdpUser, IdpError> {
        self.management_get(&format!("/api/users/{}", user_id), "user")
            .await
    }

    async fn create_user(&self, req: &IdpCreateUser) -> Result<IdpUser, IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .post(self.url("/api/users"))
            .bearer_auth(token)
            .json(req)
            .send()
            .await?;
        Self::decode(response, "user").await
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .delete(self.url(&format!("/api/users/{}", user_id)))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check_status(response, "user").await
    }

    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<IdpRole>, IdpError> {
        self.management_get(&format!("/api/users/{}/roles", user_id), "user roles")
            .await
    }

    async fn assign_user_roles(&self, user_id: &str, role_ids: &[String]) -> Result<(), IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .put(self.url(&format!("/api/users/{}/roles", user_id)))
            .bearer_auth(token)
            .json(&serde_json::json!({ "roleIds": role_ids }))
            .send()
            .await?;
        Self::check_status(response, "user roles").await
    }

    async fn get_user_permissions(&self, user_id: &str) -> Result<Vec<String>, IdpError> {
        self.management_get(
            &format!("/api/users/{}/permissions", user_id),
            "user permissions",
        )
        .await
    }

    async fn get_user_organizations(
        &self,
        user_id: &str,
    ) -> Result<Vec<IdpOrganization>, IdpError> {
        self.management_get(
            &format!("/api/users/{}/organizations", user_id),
            "user organizations",
        )
        .await
    }

    async fn get_organization_roles(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Vec<IdpOrgRole>, IdpError> {
        self.management_get(
            &format!("/api/organizations/{}/users/{}/roles", org_id, user_id),
            "organization roles",
        )
        .await
    }

    async fn create_organization(
        &self,
        name: &str,
        custom_data: &serde_json::Value,
    ) -> Result<IdpOrganization, IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .post(self.url("/api/organizations"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "name": name, "customData": custom_data }))
            .send()
            .await?;
        Self::decode(response, "organization").await
    }

    async fn delete_organization(&self, org_id: &str) -> Result<(), IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .delete(self.url(&format!("/api/organizations/{}", org_id)))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check_status(response, "organization").await
    }

    async fn add_user_to_organization(
        &self,
        org_id: &str,
        user_id: &str,
        org_role_name: &str,
    ) -> Result<(), IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .post(self.url(&format!("/api/organizations/{}/users", org_id)))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "userIds": [user_id],
                "organizationRoleNames": [org_role_name],
            }))
            .send()
            .await?;
        Self::check_status(response, "organization membership").await
    }

    async fn verify_password(&self, user_id: &str, password: &str) -> Result<bool, IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .post(self.url(&format!("/api/users/{}/password/verify", user_id)))
            .bearer_auth(token)
            .json(&serde_json::json!({ "password": password }))
            .send()
            .await?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            422 => Ok(false),
            404 => Err(IdpError::NotFound("user".to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(IdpError::Status(status, body))
            }
        }
    }

    async fn update_password(&self, user_id: &str, new_password: &str) -> Result<(), IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .patch(self.url(&format!("/api/users/{}/password", user_id)))
            .bearer_auth(token)
            .json(&serde_json::json!({ "password": new_password }))
            .send()
            .await?;
        Self::check_status(response, "user").await
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &IdpProfileUpdate,
    ) -> Result<(), IdpError> {
        let token = self.management_token().await?;
        let response = self
            .http
            .patch(self.url(&format!("/api/users/{}", user_id)))
            .bearer_auth(token)
            .json(update)
            .send()
            .await?;
        Self::check_status(response, "user").await
    }
}

/// In-memory IdP for tests. State is seeded by the test and mutated by the
/// same operations the real client performs.
#[derive(Default)]
pub struct MockIdentityProvider {
    inner: std::sync::Mutex<MockIdpInner>,
    pub enrichment_fails: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct MockIdpInner {
    /// access token -> sub
    tokens: std::collections::HashMap<String, String>,
    users: std::collections::HashMap<String, IdpUser>,
    passwords: std::collections::HashMap<String, String>,
    roles: std::collections::HashMap<String, Vec<IdpRole>>,
    permissions: std::collections::HashMap<String, Vec<String>>,
    organizations: std::collections::HashMap<String, Vec<IdpOrganization>>,
    org_roles: std::collections::HashMap<(String, String), Vec<IdpOrgRole>>,
    next_org_seq: u32,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_token(&self, access_token: &str, sub: &str) {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .insert(access_token.to_string(), sub.to_string());
    }

    pub fn seed_user(&self, user: IdpUser, password: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = password {
            inner.passwords.insert(user.id.clone(), p.to_string());
        }
        inner.users.insert(user.id.clone(), user);
    }

    pub fn seed_roles(&self, user_id: &str, roles: Vec<IdpRole>, permissions: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.roles.insert(user_id.to_string(), roles);
        inner.permissions.insert(user_id.to_string(), permissions);
    }

    pub fn seed_membership(&self, user_id: &str, org: IdpOrganization, org_role: IdpOrgRole) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .org_roles
            .insert((org.id.clone(), user_id.to_string()), vec![org_role]);
        inner
            .organizations
            .entry(user_id.to_string())
            .or_default()
            .push(org);
    }

    pub fn set_enrichment_failing(&self, failing: bool) {
        self.enrichment_fails
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn enrichment_check(&self) -> Result<(), IdpError> {
        if self
            .enrichment_fails
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            Err(IdpError::Http("enrichment unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn userinfo(&self, access_token: &str) -> Result<IdpUserInfo, IdpError> {
        let inner = self.inner.lock().unwrap();
        inner
            .tokens
            .get(access_token)
            .map(|sub| IdpUserInfo { sub: sub.clone() })
            .ok_or(IdpError::Unauthorized)
    }

    async fn get_user(&self, user_id: &str) -> Result<IdpUser, IdpError> {
        let inner = self.inner.lock().unwrap();
        inner
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| IdpError::NotFound("user".to_string()))
    }

    async fn create_user(&self, req: &IdpCreateUser) -> Result<IdpUser, IdpError> {
        let mut inner = self.inner.lock().unwrap();
        let user = IdpUser {
            id: format!("idp-{}", req.username),
            username: req.username.clone(),
            primary_email: Some(req.primary_email.clone()),
            name: req.name.clone(),
            primary_phone: req.primary_phone.clone(),
        };
        inner
            .passwords
            .insert(user.id.clone(), req.password.clone());
        inner.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), IdpError> {
        self.inner.lock().unwrap().users.remove(user_id);
        Ok(())
    }

    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<IdpRole>, IdpError> {
        self.enrichment_check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .roles
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn assign_user_roles(&self, user_id: &str, role_ids: &[String]) -> Result<(), IdpError> {
        let mut inner = self.inner.lock().unwrap();
        let roles = role_ids
            .iter()
            .map(|id| IdpRole {
                id: id.clone(),
                name: id.clone(),
            })
            .collect();
        inner.roles.insert(user_id.to_string(), roles);
        Ok(())
    }

    async fn get_user_permissions(&self, user_id: &str) -> Result<Vec<String>, IdpError> {
        self.enrichment_check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .permissions
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_user_organizations(
        &self,
        user_id: &str,
    ) -> Result<Vec<IdpOrganization>, IdpError> {
        self.enrichment_check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .organizations
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_organization_roles(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Vec<IdpOrgRole>, IdpError> {
        self.enrichment_check()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .org_roles
            .get(&(org_id.to_string(), user_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_organization(
        &self,
        name: &str,
        custom_data: &serde_json::Value,
    ) -> Result<IdpOrganization, IdpError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_org_seq += 1;
        Ok(IdpOrganization {
            id: format!("idp-org-{}", inner.next_org_seq),
            name: name.to_string(),
            custom_data: custom_data.clone(),
        })
    }

    async fn delete_organization(&self, _org_id: &str) -> Result<(), IdpError> {
        Ok(())
    }

    async fn add_user_to_organization(
        &self,
        org_id: &str,
        user_id: &str,
        org_role_name: &str,
    ) -> Result<(), IdpError> {
        let mut inner = self.inner.lock().unwrap();
        inner.org_roles.insert(
            (org_id.to_string(), user_id.to_string()),
            vec![IdpOrgRole {
                id: format!("org-role-{}", org_role_name.to_lowercase()),
                name: org_role_name.to_string(),
                scopes: vec![],
            }],
        );
        Ok(())
    }

    async fn verify_password(&self, user_id: &str, password: &str) -> Result<bool, IdpError> {
        let inner = self.inner.lock().unwrap();
        match inner.passwords.get(user_id) {
            Some(stored) => Ok(stored == password),
            None => Err(IdpError::NotFound("user".to_string())),
        }
    }

    async fn update_password(&self, user_id: &str, new_password: &str) -> Result<(), IdpError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.users.contains_key(user_id) {
            return Err(IdpError::NotFound("user".to_string()));
        }
        inner
            .passwords
            .insert(user_id.to_string(), new_password.to_string());
        Ok(())
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &IdpProfileUpdate,
    ) -> Result<(), IdpError> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| IdpError::NotFound("user".to_string()))?;
        if let Some(name) = &update.name {
            user.name = Some(name.clone());
        }
        if let Some(email) = &update.primary_email {
            user.primary_email = Some(email.clone());
        }
        if let Some(phone) = &update.primary_phone {
            user.primary_phone = Some(phone.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_userinfo_resolves_seeded_token() {
        let idp = MockIdentityProvider::new();
        idp.seed_token("AT-1", "user-1");
        let info = idp.userinfo("AT-1").await.unwrap();
        assert_eq!(info.sub, "user-1");
        assert!(matches!(
            idp.userinfo("AT-unknown").await,
            Err(IdpError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn mock_password_roundtrip() {
        let idp = MockIdentityProvider::new();
        idp.seed_user(
            IdpUser {
                id: "user-1".to_string(),
                username: "alice".to_string(),
                primary_email: Some("alice@example.com".to_string()),
                name: None,
                primary_phone: None,
            },
            Some("old-secret"),
        );
        assert!(idp.verify_password("user-1", "old-secret").await.unwrap());
        idp.update_password("user-1", "new-secret").await.unwrap();
        assert!(!idp.verify_password("user-1", "old-secret").await.unwrap());
        assert!(idp.verify_password("user-1", "new-secret").await.unwrap());
    }
}
