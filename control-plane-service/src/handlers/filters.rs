//! Combined filter endpoints.
//!
//! Each endpoint fans out its distinct-value subqueries concurrently; the
//! first failure fails the whole request. Results are held in a short-TTL
//! cache keyed by the actor's organization, invalidated after mutating
//! handlers.

use axum::extract::State;
use serde_json::json;
use service_core::api::ApiResponse;
use service_core::error::AppError;

use crate::middleware::Actor;
use crate::AppState;

const FILTER_CACHE_TTL_SECONDS: i64 = 60;

fn user_filters_key(org: &str) -> String {
    format!("stats:filters:users:{}", org)
}

fn system_filters_key(org: &str) -> String {
    format!("stats:filters:systems:{}", org)
}

/// GET /api/filters/users
pub async fn user_filters(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let key = user_filters_key(actor.org_id());
    if let Ok(Some(cached)) = state.cache.get_json(&key).await {
        return Ok(ApiResponse::ok(cached));
    }

    let (organizations, roles) = futures::try_join!(
        state
            .db
            .distinct_user_organizations(actor.org_role(), actor.org_id()),
        state
            .db
            .distinct_user_role_ids(actor.org_role(), actor.org_id()),
    )?;

    let payload = json!({
        "organizations": organizations,
        "roles": roles,
    });

    if let Err(e) = state
        .cache
        .put_json(&key, &payload, FILTER_CACHE_TTL_SECONDS)
        .await
    {
        tracing::warn!(error = %e, "failed to cache user filters");
    }

    Ok(ApiResponse::ok(payload))
}

/// GET /api/filters/systems
pub async fn system_filters(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let key = system_filters_key(actor.org_id());
    if let Ok(Some(cached)) = state.cache.get_json(&key).await {
        return Ok(ApiResponse::ok(cached));
    }

    let (types, versions, statuses, organizations) = futures::try_join!(
        state
            .db
            .distinct_system_column(actor.org_role(), actor.org_id(), "type"),
        state
            .db
            .distinct_system_column(actor.org_role(), actor.org_id(), "version"),
        state
            .db
            .distinct_system_column(actor.org_role(), actor.org_id(), "status"),
        state
            .db
            .distinct_system_column(actor.org_role(), actor.org_id(), "organization_id"),
    )?;

    let payload = json!({
        "types": types,
        "versions": versions,
        "statuses": statuses,
        "organizations": organizations,
    });

    if let Err(e) = state
        .cache
        .put_json(&key, &payload, FILTER_CACHE_TTL_SECONDS)
        .await
    {
        tracing::warn!(error = %e, "failed to cache system filters");
    }

    Ok(ApiResponse::ok(payload))
}

/// The single invalidation point called after each mutating handler.
pub(crate) async fn invalidate_filter_caches(state: &AppState, org: &str) {
    for key in [user_filters_key(org), system_filters_key(org)] {
        if let Err(e) = state.cache.invalidate(&key).await {
            tracing::warn!(key = %key, error = %e, "failed to invalidate filter cache");
        }
    }
}
