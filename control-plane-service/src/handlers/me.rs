//! Self-service profile handlers.

use axum::extract::{Json, State};
use serde::Deserialize;
use service_core::api::ApiResponse;
use service_core::error::{AppError, FieldError};

use crate::middleware::Actor;
use crate::models::Subject;
use crate::services::idp::IdpProfileUpdate;
use crate::utils::validation::validate_password_strength;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeInfoRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// The subject carried by the current token.
///
/// GET /me
pub async fn me(actor: Actor) -> Result<ApiResponse<Subject>, AppError> {
    Ok(ApiResponse::ok(actor.subject()))
}

/// Verify the current password against the IdP, then update.
///
/// POST /me/change-password
pub async fn change_password(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let strength_errors = validate_password_strength(&req.new_password);
    if !strength_errors.is_empty() {
        return Err(AppError::Validation(strength_errors));
    }

    let verified = state
        .idp
        .verify_password(&actor.claims.sub, &req.current_password)
        .await
        .map_err(|e| AppError::Dependency(anyhow::anyhow!(e)))?;
    if !verified {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "current password is incorrect"
        )));
    }

    state
        .idp
        .update_password(&actor.claims.sub, &req.new_password)
        .await
        .map_err(|e| AppError::Dependency(anyhow::anyhow!(e)))?;

    tracing::info!(user = %actor.claims.sub, "password changed");

    Ok(ApiResponse::message("password changed"))
}

/// Update profile fields; at least one is required.
///
/// POST /me/change-info
pub async fn change_info(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<ChangeInfoRequest>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    if req.name.is_none() && req.email.is_none() && req.phone.is_none() {
        return Err(AppError::Validation(vec![FieldError::new(
            "body",
            "at least one of name, email, phone is required",
        )]));
    }

    state
        .idp
        .update_profile(
            &actor.claims.sub,
            &IdpProfileUpdate {
                name: req.name.clone(),
                primary_email: req.email.clone(),
                primary_phone: req.phone.clone(),
            },
        )
        .await
        .map_err(|e| AppError::Dependency(anyhow::anyhow!(e)))?;

    // Keep the local surrogate in step; the IdP remains authoritative.
    if let Ok(Some(record)) = state.db.find_user_by_logto_id(&actor.claims.sub).await {
        if let Err(e) = state
            .db
            .update_user(
                record.id,
                req.email.as_deref(),
                req.name.as_deref(),
                req.phone.as_deref(),
                None,
                None,
            )
            .await
        {
            tracing::warn!(user = %actor.claims.sub, error = %e, "failed to sync local profile");
        }
    }

    Ok(ApiResponse::message("profile updated"))
}
