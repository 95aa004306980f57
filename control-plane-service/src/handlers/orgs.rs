//! Hierarchy CRUD handlers for distributors, resellers and customers.
//!
//! The three tiers share one implementation; the routed wrappers pin the
//! tier. Every operation consults the RBAC evaluator before touching the
//! store, and listing goes through the store's visibility clause.

use axum::extract::{Json, Path, Query, State};
use serde_json::json;
use service_core::api::{ApiResponse, Paginated};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::Actor;
use crate::models::{CreateOrgRequest, OrgRecord, OrgResponse, OrgTier, UpdateOrgRequest};
use crate::rbac::{self, OrgRef};
use crate::utils::pagination::{PageParams, PageQuery};
use crate::utils::validation::collect_validator_errors;
use crate::AppState;

// ============================================================================
// Shared RBAC plumbing
// ============================================================================

/// Authorize the actor against a concrete organization row, resolving the
/// one-hop creator when the distributor transitive rule needs it.
async fn authorize_org(
    state: &AppState,
    actor: &Actor,
    tier: OrgTier,
    org: &OrgRecord,
) -> Result<(), AppError> {
    let target = OrgRef {
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

    if !rbac::can_actor_operate_on(&actor.as_actor_ref(), &target, creator_ref.as_ref()) {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: organization is outside your hierarchy"
        )));
    }
    Ok(())
}

async fn fetch_org(state: &AppState, tier: OrgTier, id: Uuid) -> Result<OrgRecord, AppError> {
    Ok(state
        .db
        .find_org(tier, id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("organization not found")))?)
}

// ============================================================================
// Core operations
// ============================================================================

async fn list_core(
    state: AppState,
    actor: Actor,
    tier: OrgTier,
    query: PageQuery,
) -> Result<ApiResponse<Paginated<OrgResponse>>, AppError> {
    let params = PageParams::from_query(
        &query,
        state.config.pagination.default_page_size,
        state.config.pagination.max_page_size,
    );
    let (items, total) = state
        .db
        .list_organizations(actor.org_role(), actor.org_id(), tier, &params)
        .await?;
    let items = items.into_iter().map(OrgResponse::from).collect();
    let mut page = Paginated::new(items, total, params.page, params.page_size);
    if let Some(sort_by) = params.sort_by {
        page = page.sorted(sort_by, params.sort_direction.unwrap_or_default());
    }
    Ok(ApiResponse::ok(page))
}

async fn get_core(
    state: AppState,
    actor: Actor,
    tier: OrgTier,
    id: Uuid,
) -> Result<ApiResponse<OrgResponse>, AppError> {
    let org = fetch_org(&state, tier, id).await?;
    authorize_org(&state, &actor, tier, &org).await?;
    Ok(ApiResponse::ok(OrgResponse::from(org)))
}

async fn create_core(
    state: AppState,
    actor: Actor,
    tier: OrgTier,
    req: CreateOrgRequest,
) -> Result<ApiResponse<OrgResponse>, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(collect_validator_errors(&e)))?;

    crate::services::IdentityGateway::ensure_organization_membership(&actor.subject())?;

    // Only a strictly higher tier may create organizations at this tier.
    let actor_rank = rbac::rank(actor.org_role());
    if actor_rank <= tier.rank() || actor.org_id().is_empty() {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: insufficient tier to create a {}",
            tier.type_name()
        )));
    }

    let custom_data = serde_json::to_value(crate::models::OrgCustomData {
        org_type: tier.type_name().to_string(),
        created_by: actor.org_id().to_string(),
        vat: req.vat.clone(),
        branding: req.branding.clone(),
        mfa_required: req.mfa_required,
        jit_role: Some(tier.as_str().to_string()),
    })
    .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

    // The IdP owns organization identity; local rows reference it.
    let idp_org = state
        .idp
        .create_organization(&req.name, &custom_data)
        .await
        .map_err(|e| AppError::Dependency(anyhow::anyhow!(e)))?;

    let record = match state
        .db
        .insert_org(
            tier,
            &idp_org.id,
            &req.name,
            req.description.as_deref(),
            &custom_data,
        )
        .await
    {
        Ok(record) => record,
        Err(e) => {
            // Roll the IdP side back so a retry does not collide.
            if let Err(cleanup) = state.idp.delete_organization(&idp_org.id).await {
                tracing::warn!(org = %idp_org.id, error = %cleanup, "failed to roll back identity provider organization");
            }
            return Err(e.into());
        }
    };

    if let Err(e) = state.db.mark_org_synced(tier, record.id).await {
        tracing::warn!(org = %record.id, error = %e, "failed to record sync state");
    }

    state.invalidate_filter_caches(actor.org_id()).await;

    tracing::info!(
        org = %record.logto_id,
        tier = %tier,
        created_by = %actor.org_id(),
        "organization created"
    );

    Ok(ApiResponse::created(OrgResponse::from(record)))
}

async fn update_core(
    state: AppState,
    actor: Actor,
    tier: OrgTier,
    id: Uuid,
    req: UpdateOrgRequest,
) -> Result<ApiResponse<OrgResponse>, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(collect_validator_errors(&e)))?;

    let org = fetch_org(&state, tier, id).await?;
    authorize_org(&state, &actor, tier, &org).await?;

    // `type` and `createdBy` are immutable after creation.
    let mut custom_data = org.custom_data.clone();
    if let Some(map) = custom_data.as_object_mut() {
        if let Some(branding) = &req.branding {
            map.insert("branding".to_string(), json!(branding));
        }
        if let Some(mfa) = req.mfa_required {
            map.insert("mfa_required".to_string(), json!(mfa));
        }
    }

    let updated = state
        .db
        .update_org(
            tier,
            id,
            req.name.as_deref(),
            req.description.as_deref(),
            &custom_data,
        )
        .await?;

    Ok(ApiResponse::ok(OrgResponse::from(updated)))
}

async fn delete_core(
    state: AppState,
    actor: Actor,
    tier: OrgTier,
    id: Uuid,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let org = fetch_org(&state, tier, id).await?;
    authorize_org(&state, &actor, tier, &org).await?;

    if org.logto_id == actor.org_id() {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: cannot delete your own organization"
        )));
    }

    let deleted_users = state.db.soft_delete_org_cascade(tier, &org).await?;

    if let Err(e) = state.idp.delete_organization(&org.logto_id).await {
        tracing::warn!(org = %org.logto_id, error = %e, "failed to delete organization at identity provider");
    }

    state.invalidate_filter_caches(actor.org_id()).await;

    tracing::info!(org = %org.logto_id, deleted_users, "organization deleted");

    Ok(ApiResponse::ok(json!({ "deleted_users_count": deleted_users })))
}

async fn restore_core(
    state: AppState,
    actor: Actor,
    tier: OrgTier,
    id: Uuid,
) -> Result<ApiResponse<OrgResponse>, AppError> {
    // The tombstoned row is invisible to the normal read path.
    let org = state
        .db
        .find_org_including_deleted(tier, id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("organization not found")))?;
    authorize_org(&state, &actor, tier, &org).await?;

    let restored = state.db.restore_org(tier, id).await?;

    tracing::info!(org = %restored.logto_id, "organization restored");

    Ok(ApiResponse::ok(OrgResponse::from(restored)))
}

async fn suspend_core(
    state: AppState,
    actor: Actor,
    tier: OrgTier,
    id: Uuid,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let org = fetch_org(&state, tier, id).await?;
    authorize_org(&state, &actor, tier, &org).await?;

    // Suspension requires a strictly higher tier.
    if rbac::rank(actor.org_role()) <= tier.rank() {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: insufficient tier to suspend this organization"
        )));
    }

    let suspended_users = state.db.suspend_org_cascade(tier, &org).await?;

    tracing::info!(org = %org.logto_id, suspended_users, "organization suspended");

    Ok(ApiResponse::ok(
        json!({ "suspended_users_count": suspended_users }),
    ))
}

async fn reactivate_core(
    state: AppState,
    actor: Actor,
    tier: OrgTier,
    id: Uuid,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let org = fetch_org(&state, tier, id).await?;
    authorize_org(&state, &actor, tier, &org).await?;

    if rbac::rank(actor.org_role()) <= tier.rank() {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "access denied: insufficient tier to reactivate this organization"
        )));
    }

    let reactivated_users = state.db.reactivate_org_cascade(tier, &org).await?;

    tracing::info!(org = %org.logto_id, reactivated_users, "organization reactivated");

    Ok(ApiResponse::ok(
        json!({ "reactivated_users_count": reactivated_users }),
    ))
}

// ============================================================================
// Routed wrappers
// ============================================================================

macro_rules! tier_handlers {
    ($tier:expr, $list:ident, $get:ident, $create:ident, $update:ident, $delete:ident, $restore:ident, $suspend:ident, $reactivate:ident) => {
        pub async fn $list(
            State(state): State<AppState>,
            actor: Actor,
            Query(query): Query<PageQuery>,
        ) -> Result<ApiResponse<Paginated<OrgResponse>>, AppError> {
            list_core(state, actor, $tier, query).await
        }

        pub async fn $get(
            State(state): State<AppState>,
            actor: Actor,
            Path(id): Path<Uuid>,
        ) -> Result<ApiResponse<OrgResponse>, AppError> {
            get_core(state, actor, $tier, id).await
        }

        pub async fn $create(
            State(state): State<AppState>,
            actor: Actor,
            Json(req): Json<CreateOrgRequest>,
        ) -> Result<ApiResponse<OrgResponse>, AppError> {
            create_core(state, actor, $tier, req).await
        }

        pub async fn $update(
            State(state): State<AppState>,
            actor: Actor,
            Path(id): Path<Uuid>,
            Json(req): Json<UpdateOrgRequest>,
        ) -> Result<ApiResponse<OrgResponse>, AppError> {
            update_core(state, actor, $tier, id, req).await
        }

        pub async fn $delete(
            State(state): State<AppState>,
            actor: Actor,
            Path(id): Path<Uuid>,
        ) -> Result<ApiResponse<serde_json::Value>, AppError> {
            delete_core(state, actor, $tier, id).await
        }

        pub async fn $restore(
            State(state): State<AppState>,
            actor: Actor,
            Path(id): Path<Uuid>,
        ) -> Result<ApiResponse<OrgResponse>, AppError> {
            restore_core(state, actor, $tier, id).await
        }

        pub async fn $suspend(
            State(state): State<AppState>,
            actor: Actor,
            Path(id): Path<Uuid>,
        ) -> Result<ApiResponse<serde_json::Value>, AppError> {
            suspend_core(state, actor, $tier, id).await
        }

        pub async fn $reactivate(
            State(state): State<AppState>,
            actor: Actor,
            Path(id): Path<Uuid>,
        ) -> Result<ApiResponse<serde_json::Value>, AppError> {
            reactivate_core(state, actor, $tier, id).await
        }
    };
}

tier_handlers!(
    OrgTier::Distributor,
    list_distributors,
    get_distributor,
    create_distributor,
    update_distributor,
    delete_distributor,
    restore_distributor,
    suspend_distributor,
    reactivate_distributor
);

tier_handlers!(
    OrgTier::Reseller,
    list_resellers,
    get_reseller,
    create_reseller,
    update_reseller,
    delete_reseller,
    restore_reseller,
    suspend_reseller,
    reactivate_reseller
);

tier_handlers!(
    OrgTier::Customer,
    list_customers,
    get_customer,
    create_customer,
    update_customer,
    delete_customer,
    restore_customer,
    suspend_customer,
    reactivate_customer
);
