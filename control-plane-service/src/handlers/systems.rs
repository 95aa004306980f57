//! System (managed node) handlers: CRUD, secret lifecycle, registration and
//! inventory history.

use axum::extract::{Json, Path, Query, State};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use service_core::api::{ApiResponse, Paginated};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::Actor;
use crate::models::{
    CreateSystemRequest, CreatedBy, InventoryRecord, SystemRecord, SystemResponse,
    UpdateSystemRequest,
};
use crate::rbac::{self, OrgRef};
use crate::services::SystemFilters;
use crate::utils::pagination::{PageParams, PageQuery};
use crate::utils::validation::collect_validator_errors;
use crate::AppState;

// ============================================================================
// Query/Request DTOs
// ============================================================================

/// Systems listing query. Array filters arrive comma-separated and are OR
/// within a filter, AND across filters. Pagination fields are inlined:
/// `serde(flatten)` breaks numeric parsing under `serde_urlencoded`.
#[derive(Debug, Default, Deserialize)]
pub struct SystemsQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_direction: Option<String>,
    pub name: Option<String>,
    pub system_key: Option<String>,
    #[serde(rename = "type")]
    pub system_type: Option<String>,
    pub created_by: Option<String>,
    pub version: Option<String>,
    pub org_id: Option<String>,
    pub status: Option<String>,
}

impl SystemsQuery {
    fn page_query(&self) -> PageQuery {
        PageQuery {
            page: self.page,
            page_size: self.page_size,
            search: self.search.clone(),
            sort_by: self.sort_by.clone(),
            sort_direction: self.sort_direction.clone(),
        }
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
pub struct RegisterSystemRequest {
    pub system_key: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct InventoryIngestRequest {
    pub data: serde_json::Value,
}

// ============================================================================
// Secret handling
// ============================================================================

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn generate_system_key() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("sys-{}", hex::encode(bytes))
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

// ============================================================================
// RBAC plumbing
// ============================================================================

async fn authorize_system_org(
    state: &AppState,
    actor: &Actor,
    org_id: Option<&str>,
) -> Result<(), AppError> {
    let denied = || {
        AppError::Forbidden(anyhow::anyhow!(
            "access denied: system is outside your hierarchy"
        ))
    };

    let Some(org_id) = org_id else {
        if actor.org_role() == Some(crate::models::OrgTier::Owner) {
            return Ok(());
        }
        return Err(denied());
    };

    let Some((tier, org)) = state.db.find_org_any_tier(org_id).await? else {
        if actor.org_role() == Some(crate::models::OrgTier::Owner) {
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
        (Some(crate::models::OrgTier::Distributor), crate::models::OrgTier::Customer, Some(c))
            if c != actor.org_id() =>
        {
            state.db.find_org_any_tier(c).await?
        }
        _ => None,
    };
    let creator_ref = creator_record.as_ref().map(|(creator_tier, record)| OrgRef {
        tier: *creator_tier,
        id: &record.logto_id,
        created_by: record.created_by(),
    });

    if !rbac::can_actor_operate_on(&actor.as_actor_ref(), &target_ref, creator_ref.as_ref()) {
        return Err(denied());
    }
    Ok(())
}

async fn fetch_system(state: &AppState, id: Uuid) -> Result<SystemRecord, AppError> {
    Ok(state
        .db
        .find_system(id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("system not found")))?)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/systems
pub async fn list_systems(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<SystemsQuery>,
) -> Result<ApiResponse<Paginated<SystemResponse>>, AppError> {
    let params = PageParams::from_query(
        &query.page_query(),
        state.config.pagination.systems_default_page_size,
        state.config.pagination.max_page_size,
    );
    let filters = SystemFilters {
        name: query.name.clone(),
        system_key: query.system_key.clone(),
        types: split_list(query.system_type.as_deref()),
        created_by: split_list(query.created_by.as_deref()),
        versions: split_list(query.version.as_deref()),
        org_ids: split_list(query.org_id.as_deref()),
        statuses: split_list(query.status.as_deref()),
    };

    let (items, total) = state
        .db
        .list_systems(actor.org_role(), actor.org_id(), &params, &filters)
        .await?;
    let timeout = state.config.heartbeat.timeout_minutes;
    let items = items
        .into_iter()
        .map(|s| SystemResponse::from_record(s, timeout))
        .collect();
    Ok(ApiResponse::ok(Paginated::new(
        items,
        total,
        params.page,
        params.page_size,
    )))
}

/// GET /api/systems/:id
pub async fn get_system(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<SystemResponse>, AppError> {
    let system = fetch_system(&state, id).await?;
    authorize_system_org(&state, &actor, system.organization_id.as_deref()).await?;
    Ok(ApiResponse::ok(SystemResponse::from_record(
        system,
        state.config.heartbeat.timeout_minutes,
    )))
}

/// POST /api/systems. The secret is returned exactly once.
pub async fn create_system(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<CreateSystemRequest>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(collect_validator_errors(&e)))?;

    let org_id = req
        .organization_id
        .clone()
        .or_else(|| Some(actor.org_id().to_string()).filter(|s| !s.is_empty()));
    authorize_system_org(&state, &actor, org_id.as_deref()).await?;

    let system_key = generate_system_key();
    let secret = generate_secret();
    let created_by = CreatedBy {
        user_id: actor.claims.sub.clone(),
        name: actor.claims.name.clone(),
        email: actor.claims.email.clone(),
        organization_id: Some(actor.claims.organization_id.clone()).filter(|s| !s.is_empty()),
        organization_name: Some(actor.claims.organization_name.clone()).filter(|s| !s.is_empty()),
    };

    let record = state
        .db
        .insert_system(
            &req.name,
            &req.system_type,
            req.version.as_deref(),
            &system_key,
            &hash_secret(&secret),
            org_id.as_deref(),
            req.custom_data.as_ref().unwrap_or(&json!({})),
            &json!(created_by),
        )
        .await?;

    state.invalidate_filter_caches(actor.org_id()).await;

    tracing::info!(system = %record.id, system_key = %system_key, "system created");

    Ok(ApiResponse::created(json!({
        "system": SystemResponse::from_record(record, state.config.heartbeat.timeout_minutes),
        "secret": secret,
    })))
}

/// POST /api/systems/register. Exchanges the one-time secret for
/// registration; the calling system has no bearer token.
pub async fn register_system(
    State(state): State<AppState>,
    Json(req): Json<RegisterSystemRequest>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let system = state
        .db
        .find_system_by_key(&req.system_key)
        .await?
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("unknown system key")))?;

    if hash_secret(&req.secret) != system.secret_hash {
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "invalid system secret"
        )));
    }
    if system.suspended_at.is_some() {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: system is suspended"
        )));
    }

    state.db.record_heartbeat(&req.system_key).await?;

    tracing::info!(system = %system.id, "system registered");

    Ok(ApiResponse::ok(json!({
        "system_id": system.id,
        "name": system.name,
        "organization_id": system.organization_id,
    })))
}

/// POST /api/systems/:id/regenerate-secret. The new secret is returned
/// exactly once.
pub async fn regenerate_secret(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let system = fetch_system(&state, id).await?;
    authorize_system_org(&state, &actor, system.organization_id.as_deref()).await?;

    let secret = generate_secret();
    state
        .db
        .update_system_secret(id, &hash_secret(&secret))
        .await?;

    tracing::info!(system = %id, "system secret regenerated");

    Ok(ApiResponse::ok(json!({ "secret": secret })))
}

/// PUT /api/systems/:id
pub async fn update_system(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSystemRequest>,
) -> Result<ApiResponse<SystemResponse>, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(collect_validator_errors(&e)))?;

    let system = fetch_system(&state, id).await?;
    authorize_system_org(&state, &actor, system.organization_id.as_deref()).await?;

    if let Some(new_org) = req.organization_id.as_deref() {
        authorize_system_org(&state, &actor, Some(new_org)).await?;
    }

    let updated = state
        .db
        .update_system(
            id,
            req.name.as_deref(),
            req.version.as_deref(),
            req.organization_id.as_deref(),
            req.custom_data.as_ref(),
        )
        .await?;

    Ok(ApiResponse::ok(SystemResponse::from_record(
        updated,
        state.config.heartbeat.timeout_minutes,
    )))
}

/// DELETE /api/systems/:id
pub async fn delete_system(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let system = fetch_system(&state, id).await?;
    authorize_system_org(&state, &actor, system.organization_id.as_deref()).await?;

    state.db.soft_delete_system(id).await?;
    state.invalidate_filter_caches(actor.org_id()).await;

    tracing::info!(system = %id, "system deleted");

    Ok(ApiResponse::message("system deleted"))
}

/// PATCH /api/systems/:id/suspend
pub async fn suspend_system(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let system = fetch_system(&state, id).await?;
    authorize_system_org(&state, &actor, system.organization_id.as_deref()).await?;

    state.db.suspend_system(id).await?;

    Ok(ApiResponse::ok(json!({ "suspended": true })))
}

/// PATCH /api/systems/:id/reactivate
pub async fn reactivate_system(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let system = fetch_system(&state, id).await?;
    authorize_system_org(&state, &actor, system.organization_id.as_deref()).await?;

    state.db.reactivate_system(id).await?;

    Ok(ApiResponse::ok(json!({ "suspended": false })))
}

/// POST /api/systems/:id/inventory
pub async fn ingest_inventory(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<InventoryIngestRequest>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let system = fetch_system(&state, id).await?;
    authorize_system_org(&state, &actor, system.organization_id.as_deref()).await?;

    state.db.insert_inventory(id, &req.data).await?;

    Ok(ApiResponse::message("inventory recorded"))
}

/// GET /api/systems/:id/inventory
pub async fn list_inventory(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<ApiResponse<Paginated<InventoryRecord>>, AppError> {
    let system = fetch_system(&state, id).await?;
    authorize_system_org(&state, &actor, system.organization_id.as_deref()).await?;

    let params = PageParams::from_query(
        &query,
        state.config.pagination.default_page_size,
        state.config.pagination.max_page_size,
    );
    let (items, total) = state
        .db
        .list_inventory(id, params.page, params.page_size)
        .await?;
    Ok(ApiResponse::ok(Paginated::new(
        items,
        total,
        params.page,
        params.page_size,
    )))
}
