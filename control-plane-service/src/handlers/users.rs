//! User account handlers.
//!
//! All writes use role identifiers; names are only resolved for display.
//! Self-service rules: a subject may always read themselves, never delete
//! themselves, and self-update may not touch `organization_id` or
//! `user_role_ids`.

use axum::extract::{Json, Path, Query, State};
use serde_json::json;
use service_core::api::{ApiResponse, Paginated};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::Actor;
use crate::models::{CreateUserRequest, OrgTier, UpdateUserRequest, UserRecord, UserResponse};
use crate::rbac::{self, OrgRef};
use crate::services::idp::{IdpCreateUser, IdpProfileUpdate};
use crate::utils::pagination::{PageParams, PageQuery};
use crate::utils::validation::{collect_validator_errors, validate_password_strength};
use crate::AppState;

// ============================================================================
// RBAC plumbing
// ============================================================================

/// Authorize the actor to operate on another subject through that subject's
/// organization.
async fn authorize_subject(
    state: &AppState,
    actor: &Actor,
    target: &UserRecord,
) -> Result<(), AppError> {
    let denied = || {
        AppError::Forbidden(anyhow::anyhow!(
            "access denied: user is outside your hierarchy"
        ))
    };

    let Some(org_id) = target.organization_id.as_deref() else {
        // Orphaned subjects are visible to the owner tier only.
        if actor.org_role() == Some(OrgTier::Owner) {
            return Ok(());
        }
        return Err(denied());
    };

    let Some((tier, org)) = state.db.find_org_any_tier(org_id).await? else {
        if actor.org_role() == Some(OrgTier::Owner) {
            return Ok(());
        }
        return Err(denied());
    };

    let target_ref = OrgRef {
        tier,
        id: &org.logto_id,
        created_by: org.created_by(),
    };

    let creator_record = match (actor.org_role(), tier, org.created_by()) {
        (Some(OrgTier::Distributor), OrgTier::Customer, Some(created_by))
            if created_by != actor.org_id() =>
        {
            state.db.find_org_any_tier(created_by).await?
        }
        _ => None,
    };
    let creator_ref = creator_record.as_ref().map(|(creator_tier, record)| OrgRef {
        tier: *creator_tier,
        id: &record.logto_id,
        created_by: record.created_by(),
    });

    if !rbac::can_actor_operate_on_subject(
        &actor.as_actor_ref(),
        &target_ref,
        creator_ref.as_ref(),
        actor.is_admin(),
    ) {
        return Err(denied());
    }
    Ok(())
}

/// Every requested role must pass the role-level access gate.
async fn authorize_roles(state: &AppState, actor: &Actor, role_ids: &[String]) -> Result<(), AppError> {
    for role_id in role_ids {
        if !state
            .role_access
            .can_user_access_role(role_id, actor.org_role())
            .await
        {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "access denied: role {} requires a higher organization tier",
                role_id
            )));
        }
    }
    Ok(())
}

async fn fetch_user(state: &AppState, id: Uuid) -> Result<UserRecord, AppError> {
    Ok(state
        .db
        .find_user_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("user not found")))?)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/users
pub async fn list_users(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<PageQuery>,
) -> Result<ApiResponse<Paginated<UserResponse>>, AppError> {
    let params = PageParams::from_query(
        &query,
        state.config.pagination.default_page_size,
        state.config.pagination.max_page_size,
    );
    let (items, total) = state
        .db
        .list_users(actor.org_role(), actor.org_id(), &params)
        .await?;
    let items = items.into_iter().map(UserResponse::from).collect();
    Ok(ApiResponse::ok(Paginated::new(
        items,
        total,
        params.page,
        params.page_size,
    )))
}

/// GET /api/users/:id. A subject may always read themselves.
pub async fn get_user(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<UserResponse>, AppError> {
    let user = fetch_user(&state, id).await?;
    if user.logto_id != actor.claims.sub {
        authorize_subject(&state, &actor, &user).await?;
    }
    Ok(ApiResponse::ok(UserResponse::from(user)))
}

/// POST /api/users
pub async fn create_user(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<CreateUserRequest>,
) -> Result<ApiResponse<UserResponse>, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(collect_validator_errors(&e)))?;
    let strength = validate_password_strength(&req.password);
    if !strength.is_empty() {
        return Err(AppError::Validation(strength));
    }

    // Account-creation rule: hierarchy table, plus Admin when the target is
    // the actor's own organization.
    let Some((tier, org)) = state.db.find_org_any_tier(&req.organization_id).await? else {
        return Err(AppError::NotFound(anyhow::anyhow!("organization not found")));
    };
    let target_ref = OrgRef {
        tier,
        id: &org.logto_id,
        created_by: org.created_by(),
    };
    let creator_record = match (actor.org_role(), tier, org.created_by()) {
        (Some(OrgTier::Distributor), OrgTier::Customer, Some(created_by))
            if created_by != actor.org_id() =>
        {
            state.db.find_org_any_tier(created_by).await?
        }
        _ => None,
    };
    let creator_ref = creator_record.as_ref().map(|(creator_tier, record)| OrgRef {
        tier: *creator_tier,
        id: &record.logto_id,
        created_by: record.created_by(),
    });
    if !rbac::can_actor_create_account_for(
        &actor.as_actor_ref(),
        &target_ref,
        creator_ref.as_ref(),
        actor.is_admin(),
    ) {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: cannot create accounts for this organization"
        )));
    }

    authorize_roles(&state, &actor, &req.user_role_ids).await?;

    // Identity lives at the IdP; the membership carries the org's JIT role.
    let idp_user = state
        .idp
        .create_user(&IdpCreateUser {
            username: req.username.clone(),
            primary_email: req.email.clone(),
            password: req.password.clone(),
            name: req.name.clone(),
            primary_phone: req.phone.clone(),
        })
        .await
        .map_err(|e| AppError::Dependency(anyhow::anyhow!(e)))?;

    let jit_role = org
        .custom_data
        .get("jit_role")
        .and_then(|v| v.as_str())
        .unwrap_or(tier.as_str())
        .to_string();
    if let Err(e) = state
        .idp
        .add_user_to_organization(&org.logto_id, &idp_user.id, &jit_role)
        .await
    {
        tracing::warn!(user = %idp_user.id, error = %e, "failed to attach organization membership");
    }
    if !req.user_role_ids.is_empty() {
        if let Err(e) = state
            .idp
            .assign_user_roles(&idp_user.id, &req.user_role_ids)
            .await
        {
            tracing::warn!(user = %idp_user.id, error = %e, "failed to assign user roles");
        }
    }

    let record = state
        .db
        .insert_user(
            &idp_user.id,
            &req.username,
            &req.email,
            req.name.as_deref(),
            req.phone.as_deref(),
            &req.user_role_ids,
            &org.logto_id,
        )
        .await?;

    state.invalidate_filter_caches(actor.org_id()).await;

    tracing::info!(user = %record.logto_id, organization = %org.logto_id, "user created");

    Ok(ApiResponse::created(UserResponse::from(record)))
}

/// PUT /api/users/:id
pub async fn update_user(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<ApiResponse<UserResponse>, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(collect_validator_errors(&e)))?;

    let user = fetch_user(&state, id).await?;
    let is_self = user.logto_id == actor.claims.sub;

    if is_self {
        if req.organization_id.is_some() || req.user_role_ids.is_some() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "access denied: cannot change your own organization or roles"
            )));
        }
    } else {
        authorize_subject(&state, &actor, &user).await?;
    }

    if let Some(role_ids) = &req.user_role_ids {
        authorize_roles(&state, &actor, role_ids).await?;
        if let Err(e) = state.idp.assign_user_roles(&user.logto_id, role_ids).await {
            tracing::warn!(user = %user.logto_id, error = %e, "failed to sync roles to identity provider");
        }
    }

    if let Some(org_id) = &req.organization_id {
        // Moving a subject requires authority over the destination too.
        let Some((tier, org)) = state.db.find_org_any_tier(org_id).await? else {
            return Err(AppError::NotFound(anyhow::anyhow!("organization not found")));
        };
        let target_ref = OrgRef {
            tier,
            id: &org.logto_id,
            created_by: org.created_by(),
        };
        if !rbac::can_actor_operate_on(&actor.as_actor_ref(), &target_ref, None) {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "access denied: destination organization is outside your hierarchy"
            )));
        }
    }

    if req.email.is_some() || req.name.is_some() || req.phone.is_some() {
        if let Err(e) = state
            .idp
            .update_profile(
                &user.logto_id,
                &IdpProfileUpdate {
                    name: req.name.clone(),
                    primary_email: req.email.clone(),
                    primary_phone: req.phone.clone(),
                },
            )
            .await
        {
            tracing::warn!(user = %user.logto_id, error = %e, "failed to sync profile to identity provider");
        }
    }

    let updated = state
        .db
        .update_user(
            id,
            req.email.as_deref(),
            req.name.as_deref(),
            req.phone.as_deref(),
            req.user_role_ids.as_deref(),
            req.organization_id.as_deref(),
        )
        .await?;

    Ok(ApiResponse::ok(UserResponse::from(updated)))
}

/// DELETE /api/users/:id. A subject may never delete themselves.
pub async fn delete_user(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let user = fetch_user(&state, id).await?;
    if user.logto_id == actor.claims.sub {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: cannot delete yourself"
        )));
    }
    authorize_subject(&state, &actor, &user).await?;

    state.db.soft_delete_user(id).await?;

    if let Err(e) = state.idp.delete_user(&user.logto_id).await {
        tracing::warn!(user = %user.logto_id, error = %e, "failed to delete user at identity provider");
    }

    state.invalidate_filter_caches(actor.org_id()).await;

    tracing::info!(user = %user.logto_id, "user deleted");

    Ok(ApiResponse::message("user deleted"))
}

/// PATCH /api/users/:id/suspend
pub async fn suspend_user(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let user = fetch_user(&state, id).await?;
    if user.logto_id == actor.claims.sub {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: cannot suspend yourself"
        )));
    }
    authorize_subject(&state, &actor, &user).await?;

    state.db.suspend_user(id, "manual").await?;

    Ok(ApiResponse::ok(json!({ "suspended": true })))
}

/// PATCH /api/users/:id/reactivate
pub async fn reactivate_user(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let user = fetch_user(&state, id).await?;
    authorize_subject(&state, &actor, &user).await?;

    state.db.reactivate_user(id).await?;

    Ok(ApiResponse::ok(json!({ "suspended": false })))
}
