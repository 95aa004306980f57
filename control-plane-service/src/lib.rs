//! Control-plane service
//!
//! Multi-tenant control-plane backend:
//! - Token exchange and lifecycle against an external IdP
//! - Four-tier hierarchical RBAC over the organization tree
//! - Consented impersonation with an active-session registry and audit

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod rbac;
pub mod services;
pub mod utils;

use axum::{
    extract::State,
    http::HeaderValue,
    routing::{get, patch, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServiceConfig;
use crate::handlers::{auth, filters, impersonation, me, orgs, systems, users};
use crate::services::{
    CacheLayer, Database, IdentityGateway, IdentityProvider, ImpersonationEngine,
    RoleAccessService, TokenService,
};
use service_core::error::AppError;
use service_core::middleware::{request_id_middleware, security_headers_middleware};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServiceConfig,
    pub db: Database,
    pub cache: Arc<dyn CacheLayer>,
    pub idp: Arc<dyn IdentityProvider>,
    pub tokens: TokenService,
    pub identity: IdentityGateway,
    pub impersonation: ImpersonationEngine,
    pub role_access: RoleAccessService,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        db: Database,
        cache: Arc<dyn CacheLayer>,
        idp: Arc<dyn IdentityProvider>,
    ) -> Self {
        let tokens = TokenService::new(&config.jwt);
        let identity = IdentityGateway::new(idp.clone(), db.clone());
        let impersonation = ImpersonationEngine::new(
            db.clone(),
            cache.clone(),
            tokens.clone(),
            identity.clone(),
            config.impersonation.default_consent_hours,
        );
        let role_access = RoleAccessService::new(db.clone(), cache.clone());
        Self {
            config,
            db,
            cache,
            idp,
            tokens,
            identity,
            impersonation,
            role_access,
        }
    }

    /// Invalidation point for the short-TTL filter caches, called after
    /// mutating handlers.
    pub async fn invalidate_filter_caches(&self, org: &str) {
        handlers::filters::invalidate_filter_caches(self, org).await;
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    // Public routes: token plumbing and system registration.
    let public_routes = Router::new()
        .route("/auth/exchange", post(auth::exchange))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/api/systems/register", post(systems::register_system));

    // Impersonation routes
    let impersonation_routes = Router::new()
        .route(
            "/consent",
            get(impersonation::get_consent)
                .post(impersonation::enable_consent)
                .delete(impersonation::disable_consent),
        )
        .route("/", post(impersonation::start).delete(impersonation::exit))
        .route("/status", get(impersonation::status))
        .route("/sessions", get(impersonation::list_sessions))
        .route("/sessions/:id", get(impersonation::get_session))
        .route("/sessions/:id/audit", get(impersonation::get_session_audit));

    // Hierarchy routes
    let distributor_routes = Router::new()
        .route(
            "/",
            get(orgs::list_distributors).post(orgs::create_distributor),
        )
        .route(
            "/:id",
            get(orgs::get_distributor)
                .put(orgs::update_distributor)
                .delete(orgs::delete_distributor),
        )
        .route("/:id/restore", patch(orgs::restore_distributor))
        .route("/:id/suspend", patch(orgs::suspend_distributor))
        .route("/:id/reactivate", patch(orgs::reactivate_distributor));

    let reseller_routes = Router::new()
        .route("/", get(orgs::list_resellers).post(orgs::create_reseller))
        .route(
            "/:id",
            get(orgs::get_reseller)
                .put(orgs::update_reseller)
                .delete(orgs::delete_reseller),
        )
        .route("/:id/restore", patch(orgs::restore_reseller))
        .route("/:id/suspend", patch(orgs::suspend_reseller))
        .route("/:id/reactivate", patch(orgs::reactivate_reseller));

    let customer_routes = Router::new()
        .route("/", get(orgs::list_customers).post(orgs::create_customer))
        .route(
            "/:id",
            get(orgs::get_customer)
                .put(orgs::update_customer)
                .delete(orgs::delete_customer),
        )
        .route("/:id/restore", patch(orgs::restore_customer))
        .route("/:id/suspend", patch(orgs::suspend_customer))
        .route("/:id/reactivate", patch(orgs::reactivate_customer));

    // User routes
    let user_routes = Router::new()
        .route("/", get(users::list_users).post(users::create_user))
        .route(
            "/:id",
            get(users::get_user)
                .put(users::update_user)
                .delete(users::delete_user),
        )
        .route("/:id/suspend", patch(users::suspend_user))
        .route("/:id/reactivate", patch(users::reactivate_user));

    // System routes
    let system_routes = Router::new()
        .route("/", get(systems::list_systems).post(systems::create_system))
        .route(
            "/:id",
            get(systems::get_system)
                .put(systems::update_system)
                .delete(systems::delete_system),
        )
        .route("/:id/suspend", patch(systems::suspend_system))
        .route("/:id/reactivate", patch(systems::reactivate_system))
        .route("/:id/regenerate-secret", post(systems::regenerate_secret))
        .route(
            "/:id/inventory",
            get(systems::list_inventory).post(systems::ingest_inventory),
        );

    // Filter routes
    let filter_routes = Router::new()
        .route("/users", get(filters::user_filters))
        .route("/systems", get(filters::system_filters));

    let protected_routes = Router::new()
        .route("/me", get(me::me))
        .route("/me/change-password", post(me::change_password))
        .route("/me/change-info", post(me::change_info))
        .nest("/api/impersonate", impersonation_routes)
        .nest("/api/distributors", distributor_routes)
        .nest("/api/resellers", reseller_routes)
        .nest("/api/customers", customer_routes)
        .nest("/api/users", user_routes)
        .nest("/api/systems", system_routes)
        .nest("/api/filters", filter_routes)
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .merge(public_routes)
        .merge(protected_routes)
        .layer(axum::middleware::from_fn(security_headers_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}

fn cors_layer(config: &ServiceConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .security
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if config.security.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Liveness probe.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "control-plane-service",
    }))
}

/// Readiness probe: PostgreSQL and Redis must answer.
async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.db.health_check().await?;

    state.cache.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Redis health check failed");
        AppError::Internal(e)
    })?;

    Ok(Json(serde_json::json!({
        "status": "ready",
        "service": "control-plane-service",
        "checks": {
            "postgresql": "up",
            "redis": "up"
        }
    })))
}
