//! Authentication handlers: token exchange, refresh and logout.

use axum::{
    extract::{Json, State},
    http::{header, HeaderMap},
};
use serde::{Deserialize, Serialize};

use crate::models::Subject;
use crate::AppState;
use service_core::api::ApiResponse;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

/// Exchange request: an IdP access token.
#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub access_token: String,
}

/// Token refresh request.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Authentication response with tokens.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user: Subject,
}

// ============================================================================
// Handlers
// ============================================================================

/// Exchange an IdP access token for local tokens.
///
/// POST /auth/exchange
pub async fn exchange(
    State(state): State<AppState>,
    Json(req): Json<ExchangeRequest>,
) -> Result<ApiResponse<AuthResponse>, AppError> {
    if req.access_token.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "access_token is required"
        )));
    }

    let subject = state.identity.resolve_subject(&req.access_token).await?;

    let access = state.tokens.mint_access(&subject)?;
    let refresh = state.tokens.mint_refresh(&subject.logto_id)?;

    tracing::info!(user = %subject.logto_id, "token exchange completed");

    Ok(ApiResponse::ok(AuthResponse {
        token: access.token,
        refresh_token: refresh.token,
        expires_in: access.expires_in,
        user: subject,
    }))
}

/// Refresh the token pair. Enrichment re-runs so permission changes since
/// the last mint take effect; the old refresh token is not revoked.
///
/// POST /auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<ApiResponse<AuthResponse>, AppError> {
    let claims = state
        .tokens
        .validate_refresh(&req.refresh_token)
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("invalid or expired refresh token")))?;

    state
        .tokens
        .check_denied(state.cache.as_ref(), &req.refresh_token)
        .await?;

    let subject = state.identity.resolve_subject_by_id(&claims.sub).await?;

    let access = state.tokens.mint_access(&subject)?;
    let refresh = state.tokens.mint_refresh(&subject.logto_id)?;

    Ok(ApiResponse::ok(AuthResponse {
        token: access.token,
        refresh_token: refresh.token,
        expires_in: access.expires_in,
        user: subject,
    }))
}

/// Blacklist the presented access token until its expiry.
///
/// POST /auth/logout
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("missing Authorization header")))?;

    let claims = state
        .tokens
        .validate_access(token)
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("invalid or expired token")))?;

    state
        .tokens
        .blacklist(state.cache.as_ref(), token, claims.exp, "logout")
        .await?;

    tracing::info!(user = %claims.sub, "user logged out");

    Ok(ApiResponse::message("logged out"))
}
