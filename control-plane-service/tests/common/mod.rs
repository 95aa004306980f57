//! Test helper module for control-plane-service integration tests.
//!
//! Builds an `AppState` over the mock IdP and mock cache. The PostgreSQL
//! pool is created lazily, so flows that never reach the database run
//! without infrastructure; tests that need real rows are marked `#[ignore]`
//! and expect a local PostgreSQL.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower::util::ServiceExt;

use control_plane_service::config::{
    DatabaseConfig, Environment, ExportConfig, HeartbeatConfig, IdpConfig, ImpersonationConfig,
    JwtConfig, PaginationConfig, RedisConfig, SecurityConfig, ServiceConfig,
};
use control_plane_service::services::idp::{IdpOrgRole, IdpOrganization, IdpRole, IdpUser};
use control_plane_service::services::{
    CacheLayer, Database, IdentityProvider, MockCache, MockIdentityProvider,
};
use control_plane_service::{build_router, AppState};

pub const TEST_JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        common: service_core::config::Config { port: 8080 },
        environment: Environment::Dev,
        service_name: "control-plane-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/control_plane_test".to_string()),
            max_connections: 5,
            min_connections: 0,
        },
        redis: RedisConfig {
            url: "redis://localhost".to_string(),
        },
        jwt: JwtConfig {
            secret: TEST_JWT_SECRET.to_string(),
            issuer: "control-plane".to_string(),
            expiration_hours: 24,
            refresh_expiration_hours: 168,
        },
        idp: IdpConfig {
            base_url: "http://localhost:3001".to_string(),
            management_client_id: "m2m".to_string(),
            management_client_secret: "m2m-secret".to_string(),
            request_timeout_seconds: 2,
        },
        impersonation: ImpersonationConfig {
            default_consent_hours: 1,
        },
        pagination: PaginationConfig {
            default_page_size: 20,
            systems_default_page_size: 50,
            max_page_size: 100,
        },
        export: ExportConfig {
            max_export_rows: 10000,
        },
        heartbeat: HeartbeatConfig {
            timeout_minutes: 15,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
    }
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub idp: Arc<MockIdentityProvider>,
    pub cache: Arc<MockCache>,
}

pub fn build_test_app() -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .try_init();

    let config = test_config();

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_lazy(&config.database.url)
        .expect("lazy pool");
    let db = Database::new(pool);

    let idp = Arc::new(MockIdentityProvider::new());
    let cache = Arc::new(MockCache::new());

    let state = AppState::new(
        config,
        db,
        cache.clone() as Arc<dyn CacheLayer>,
        idp.clone() as Arc<dyn IdentityProvider>,
    );
    let router = build_router(state.clone());

    TestApp {
        state,
        router,
        idp,
        cache,
    }
}

/// Seed the mock IdP with an owner whose access token is `AT-owner-1`.
pub fn seed_owner(idp: &MockIdentityProvider) {
    idp.seed_token("AT-owner-1", "owner-alice");
    idp.seed_user(
        IdpUser {
            id: "owner-alice".to_string(),
            username: "alice".to_string(),
            primary_email: Some("alice@example.com".to_string()),
            name: Some("Alice".to_string()),
            primary_phone: None,
        },
        Some("Sup3rSecret"),
    );
    idp.seed_roles(
        "owner-alice",
        vec![IdpRole {
            id: "role-admin".to_string(),
            name: "Admin".to_string(),
        }],
        vec!["manage:users".to_string()],
    );
    idp.seed_membership(
        "owner-alice",
        IdpOrganization {
            id: "org-owner".to_string(),
            name: "Owner Org".to_string(),
            custom_data: serde_json::json!({ "type": "owner" }),
        },
        IdpOrgRole {
            id: "org-role-owner".to_string(),
            name: "Owner".to_string(),
            scopes: vec!["manage:orgs".to_string()],
        },
    );
}

/// Seed a customer-tier user `bob` with access token `AT-bob-1`.
pub fn seed_bob(idp: &MockIdentityProvider) {
    idp.seed_token("AT-bob-1", "bob");
    idp.seed_user(
        IdpUser {
            id: "bob".to_string(),
            username: "bob".to_string(),
            primary_email: Some("bob@example.com".to_string()),
            name: Some("Bob".to_string()),
            primary_phone: None,
        },
        Some("BobSecret1"),
    );
    idp.seed_roles("bob", vec![], vec![]);
    idp.seed_membership(
        "bob",
        IdpOrganization {
            id: "org-c1".to_string(),
            name: "Customer One".to_string(),
            custom_data: serde_json::json!({ "type": "customer", "createdBy": "org-r1" }),
        },
        IdpOrgRole {
            id: "org-role-customer".to_string(),
            name: "Customer".to_string(),
            scopes: vec![],
        },
    );
}

pub async fn send_json(
    router: &Router,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

/// Build an app against a live PostgreSQL (DATABASE_URL), running
/// migrations and truncating state. For `#[ignore]`-marked tests.
pub async fn build_live_db_app() -> TestApp {
    let config = test_config();

    let pool = control_plane_service::db::create_pool(&config.database)
        .await
        .expect("PostgreSQL must be running for this test");
    control_plane_service::db::run_migrations(&pool)
        .await
        .expect("migrations");

    sqlx::query(
        "TRUNCATE distributors, resellers, customers, users, systems, system_inventory, \
         impersonation_consents, impersonation_sessions, impersonation_audit, \
         role_access_controls CASCADE",
    )
    .execute(&pool)
    .await
    .expect("truncate");

    let db = Database::new(pool);
    let idp = Arc::new(MockIdentityProvider::new());
    let cache = Arc::new(MockCache::new());

    let state = AppState::new(
        config,
        db,
        cache.clone() as Arc<dyn CacheLayer>,
        idp.clone() as Arc<dyn IdentityProvider>,
    );
    let router = build_router(state.clone());

    TestApp {
        state,
        router,
        idp,
        cache,
    }
}

/// Mint an access token straight from the token service for a constructed
/// subject, bypassing the exchange.
pub fn mint_token_for(app: &TestApp, subject: &control_plane_service::models::Subject) -> String {
    app.state.tokens.mint_access(subject).unwrap().token
}

pub fn subject(
    logto_id: &str,
    username: &str,
    org_role: control_plane_service::models::OrgTier,
    org_id: &str,
    admin: bool,
) -> control_plane_service::models::Subject {
    control_plane_service::models::Subject {
        id: None,
        logto_id: logto_id.to_string(),
        username: username.to_string(),
        email: format!("{}@example.com", username),
        name: username.to_string(),
        phone: None,
        user_roles: if admin {
            vec!["Admin".to_string()]
        } else {
            vec![]
        },
        user_role_ids: if admin {
            vec!["role-admin".to_string()]
        } else {
            vec![]
        },
        user_permissions: vec![],
        org_role: Some(org_role),
        org_role_id: Some(format!("org-role-{}", org_role.type_name())),
        org_permissions: vec![],
        organization_id: Some(org_id.to_string()),
        organization_name: Some(org_id.to_string()),
    }
}

/// Exchange the seeded owner token and return the minted access token.
pub async fn exchange_owner(router: &Router) -> String {
    let (status, body) = send_json(
        router,
        "POST",
        "/auth/exchange",
        None,
        Some(serde_json::json!({ "access_token": "AT-owner-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "exchange failed: {}", body);
    body["data"]["token"].as_str().unwrap().to_string()
}
