//! Authentication middleware.
//!
//! Validates the bearer token, consults the deny list (a lookup failure
//! rejects), and loads a typed actor into the request extensions. Handlers
//! receive the actor through the `Actor` extractor; nothing downstream
//! re-parses the token.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, StatusCode},
    middleware::Next,
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::rbac::ActorRef;
use crate::services::AccessTokenClaims;
use crate::AppState;
use crate::models::{OrgTier, Subject};

/// The authenticated actor for the current request.
#[derive(Clone)]
pub struct Actor {
    pub claims: AccessTokenClaims,
    /// The raw bearer token as presented, needed for logout blacklisting.
    pub token: String,
}

impl Actor {
    pub fn subject(&self) -> Subject {
        self.claims.to_subject()
    }

    pub fn org_role(&self) -> Option<OrgTier> {
        OrgTier::parse(&self.claims.org_role)
    }

    pub fn org_id(&self) -> &str {
        &self.claims.organization_id
    }

    pub fn is_impersonating(&self) -> bool {
        self.claims.is_impersonated
    }

    /// Case-insensitive Admin user-role check.
    pub fn is_admin(&self) -> bool {
        self.claims
            .user_roles
            .iter()
            .any(|r| r.eq_ignore_ascii_case("admin"))
    }

    pub fn as_actor_ref(&self) -> ActorRef<'_> {
        ActorRef {
            org_role: self.org_role(),
            org_id: &self.claims.organization_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            code: StatusCode::UNAUTHORIZED.as_u16(),
            message: message.to_string(),
            data: None,
        }),
    )
}

/// Middleware to require authentication.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let token = match token {
        Some(token) => token.to_string(),
        None => return Err(unauthorized("Missing or invalid Authorization header")),
    };

    let claims = match state.tokens.validate_access(&token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(error = %e, "token validation failed");
            return Err(unauthorized("Invalid or expired token"));
        }
    };

    if let Err(e) = state.tokens.check_denied(state.cache.as_ref(), &token).await {
        tracing::debug!(error = %e, "token denied");
        return Err(unauthorized("token has been invalidated"));
    }

    req.extensions_mut().insert(Actor { claims, token });

    Ok(next.run(req).await)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Actor>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                message: "Actor missing from request extensions".to_string(),
                data: None,
            }),
        ))
    }
}
