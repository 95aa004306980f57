//! Impersonation handlers: consent, session lifecycle, status and history.

use axum::extract::{Json, Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::api::{ApiResponse, Paginated};
use service_core::error::AppError;

use crate::middleware::Actor;
use crate::models::{AuditEntry, SessionRecord, Subject};
use crate::services::ImpersonationStatus;
use crate::utils::pagination::{PageParams, PageQuery};
use crate::AppState;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EnableConsentRequest {
    pub duration_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ConsentResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_hours: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct StartImpersonationRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct StartImpersonationResponse {
    pub token: String,
    pub session_id: String,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ExitImpersonationResponse {
    pub token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user: Subject,
}

// ============================================================================
// Consent handlers
// ============================================================================

/// GET /api/impersonate/consent
pub async fn get_consent(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<ApiResponse<ConsentResponse>, AppError> {
    let grant = state
        .impersonation
        .consent_status(&actor.claims.sub)
        .await?;
    Ok(ApiResponse::ok(match grant {
        Some(g) => ConsentResponse {
            active: true,
            issued_at: Some(g.issued_at),
            expires_at: Some(g.expires_at),
            duration_hours: g.duration_hours,
        },
        None => ConsentResponse {
            active: false,
            issued_at: None,
            expires_at: None,
            duration_hours: None,
        },
    }))
}

/// POST /api/impersonate/consent
pub async fn enable_consent(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<EnableConsentRequest>,
) -> Result<ApiResponse<ConsentResponse>, AppError> {
    let grant = state
        .impersonation
        .enable_consent(&actor.claims.sub, req.duration_hours)
        .await?;
    Ok(ApiResponse::ok(ConsentResponse {
        active: true,
        issued_at: Some(grant.issued_at),
        expires_at: Some(grant.expires_at),
        duration_hours: grant.duration_hours,
    }))
}

/// DELETE /api/impersonate/consent
pub async fn disable_consent(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    state
        .impersonation
        .disable_consent(&actor.claims.sub)
        .await?;
    Ok(ApiResponse::message("consent disabled"))
}

// ============================================================================
// Session handlers
// ============================================================================

/// POST /api/impersonate
pub async fn start(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<StartImpersonationRequest>,
) -> Result<ApiResponse<StartImpersonationResponse>, AppError> {
    let started = state.impersonation.start(&actor.claims, &req.user_id).await?;
    Ok(ApiResponse::ok(StartImpersonationResponse {
        token: started.token.token,
        session_id: started.session_id,
        expires_in: started.token.expires_in,
        expires_at: started.expires_at,
    }))
}

/// DELETE /api/impersonate. Must be called under an impersonation token.
pub async fn exit(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<ApiResponse<ExitImpersonationResponse>, AppError> {
    let exited = state.impersonation.exit(&actor.claims).await?;
    Ok(ApiResponse::ok(ExitImpersonationResponse {
        token: exited.access.token,
        refresh_token: exited.refresh.token,
        expires_in: exited.access.expires_in,
        user: exited.actor,
    }))
}

/// GET /api/impersonate/status
pub async fn status(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<ApiResponse<ImpersonationStatus>, AppError> {
    let status = state.impersonation.status(&actor.claims).await?;
    Ok(ApiResponse::ok(status))
}

// ============================================================================
// History handlers
// ============================================================================

/// GET /api/impersonate/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<PageQuery>,
) -> Result<ApiResponse<Paginated<SessionRecord>>, AppError> {
    let params = PageParams::from_query(
        &query,
        state.config.pagination.default_page_size,
        state.config.pagination.max_page_size,
    );
    let (items, total) = state
        .impersonation
        .list_sessions(&actor.subject(), params.page, params.page_size)
        .await?;
    Ok(ApiResponse::ok(Paginated::new(
        items,
        total,
        params.page,
        params.page_size,
    )))
}

/// GET /api/impersonate/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    actor: Actor,
    Path(session_id): Path<String>,
) -> Result<ApiResponse<SessionRecord>, AppError> {
    let session = state
        .impersonation
        .session_detail(&actor.subject(), &session_id)
        .await?;
    Ok(ApiResponse::ok(session))
}

/// GET /api/impersonate/sessions/:id/audit
pub async fn get_session_audit(
    State(state): State<AppState>,
    actor: Actor,
    Path(session_id): Path<String>,
) -> Result<ApiResponse<Vec<AuditEntry>>, AppError> {
    let entries = state
        .impersonation
        .session_audit(&actor.subject(), &session_id)
        .await?;
    Ok(ApiResponse::ok(entries))
}
