//! Impersonation state-machine flows that run against the mock cache and
//! IdP: chaining prevention, session uniqueness, exit and resume.

mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::{build_test_app, exchange_owner, seed_bob, seed_owner, send_json};
use serde_json::json;

use control_plane_service::models::{ActiveSession, OrgTier, Subject};
use control_plane_service::services::CacheLayer;

fn owner_subject() -> Subject {
    Subject {
        id: None,
        logto_id: "owner-alice".to_string(),
        username: "alice".to_string(),
        email: "alice@example.com".to_string(),
        name: "Alice".to_string(),
        phone: None,
        user_roles: vec!["Admin".to_string()],
        user_role_ids: vec!["role-admin".to_string()],
        user_permissions: vec!["manage:users".to_string()],
        org_role: Some(OrgTier::Owner),
        org_role_id: Some("org-role-owner".to_string()),
        org_permissions: vec![],
        organization_id: Some("org-owner".to_string()),
        organization_name: Some("Owner Org".to_string()),
    }
}

fn bob_subject() -> Subject {
    Subject {
        id: None,
        logto_id: "bob".to_string(),
        username: "bob".to_string(),
        email: "bob@example.com".to_string(),
        name: "Bob".to_string(),
        phone: None,
        user_roles: vec![],
        user_role_ids: vec![],
        user_permissions: vec![],
        org_role: Some(OrgTier::Customer),
        org_role_id: Some("org-role-customer".to_string()),
        org_permissions: vec![],
        organization_id: Some("org-c1".to_string()),
        organization_name: Some("Customer One".to_string()),
    }
}

#[tokio::test]
async fn impersonation_token_cannot_chain() {
    let app = build_test_app();
    seed_owner(&app.idp);
    seed_bob(&app.idp);

    let minted = app
        .state
        .tokens
        .mint_impersonation(&bob_subject(), "sess-1", &owner_subject(), Duration::hours(1))
        .unwrap();

    let (status, body) = send_json(
        &app.router,
        "POST",
        "/api/impersonate",
        Some(&minted.token),
        Some(json!({ "user_id": "carol" })),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("cannot impersonate while already impersonating"));
}

#[tokio::test]
async fn live_session_conflicts() {
    let app = build_test_app();
    seed_owner(&app.idp);
    seed_bob(&app.idp);
    let token = exchange_owner(&app.router).await;

    let session = ActiveSession {
        session_id: "sess-live".to_string(),
        target_id: "bob".to_string(),
        expires_at: Utc::now() + Duration::hours(1),
        created_at: Utc::now(),
    };
    app.cache
        .put_session_if_absent("owner-alice", &session, 3600)
        .await
        .unwrap();

    let (status, _) = send_json(
        &app.router,
        "POST",
        "/api/impersonate",
        Some(&token),
        Some(json!({ "user_id": "bob" })),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn exit_requires_impersonation_token() {
    let app = build_test_app();
    seed_owner(&app.idp);
    let token = exchange_owner(&app.router).await;

    let (status, _) = send_json(&app.router, "DELETE", "/api/impersonate", Some(&token), None).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn exit_clears_session_and_restores_actor() {
    let app = build_test_app();
    seed_owner(&app.idp);
    seed_bob(&app.idp);

    let session = ActiveSession {
        session_id: "sess-exit".to_string(),
        target_id: "bob".to_string(),
        expires_at: Utc::now() + Duration::hours(1),
        created_at: Utc::now(),
    };
    app.cache
        .put_session_if_absent("owner-alice", &session, 3600)
        .await
        .unwrap();

    let minted = app
        .state
        .tokens
        .mint_impersonation(
            &bob_subject(),
            "sess-exit",
            &owner_subject(),
            Duration::hours(1),
        )
        .unwrap();

    let (status, body) = send_json(
        &app.router,
        "DELETE",
        "/api/impersonate",
        Some(&minted.token),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user"]["logto_id"], "owner-alice");

    // Fresh tokens are regular access tokens for the original actor.
    let fresh = body["data"]["token"].as_str().unwrap();
    let claims = app.state.tokens.validate_access(fresh).unwrap();
    assert!(!claims.is_impersonated);
    assert_eq!(claims.sub, "owner-alice");

    // The registry slot is free again.
    assert!(app.cache.get_session("owner-alice").await.unwrap().is_none());
}

#[tokio::test]
async fn status_under_impersonation_token_reads_envelope() {
    let app = build_test_app();
    seed_owner(&app.idp);
    seed_bob(&app.idp);

    let minted = app
        .state
        .tokens
        .mint_impersonation(
            &bob_subject(),
            "sess-status",
            &owner_subject(),
            Duration::minutes(30),
        )
        .unwrap();

    let (status, body) = send_json(
        &app.router,
        "GET",
        "/api/impersonate/status",
        Some(&minted.token),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "impersonating");
    assert_eq!(body["data"]["session_id"], "sess-status");
    assert_eq!(body["data"]["impersonated_by"]["logto_id"], "owner-alice");
}

#[tokio::test]
async fn status_resumes_from_registry_with_remint() {
    let app = build_test_app();
    seed_owner(&app.idp);
    seed_bob(&app.idp);
    let token = exchange_owner(&app.router).await;

    let session = ActiveSession {
        session_id: "sess-resume".to_string(),
        target_id: "bob".to_string(),
        expires_at: Utc::now() + Duration::minutes(30),
        created_at: Utc::now(),
    };
    app.cache
        .put_session_if_absent("owner-alice", &session, 1800)
        .await
        .unwrap();

    let (status, body) = send_json(
        &app.router,
        "GET",
        "/api/impersonate/status",
        Some(&token),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "resumed");
    assert_eq!(body["data"]["session_id"], "sess-resume");
    assert!(body["data"]["expires_in"].as_i64().unwrap() <= 1800);

    // The re-minted token impersonates bob with alice in the envelope.
    let reminted = body["data"]["token"].as_str().unwrap();
    let claims = app.state.tokens.validate_access(reminted).unwrap();
    assert!(claims.is_impersonated);
    assert_eq!(claims.sub, "bob");
    assert_eq!(claims.impersonated_by.unwrap().logto_id, "owner-alice");
}

#[tokio::test]
async fn status_without_session_is_none() {
    let app = build_test_app();
    seed_owner(&app.idp);
    let token = exchange_owner(&app.router).await;

    let (status, body) = send_json(
        &app.router,
        "GET",
        "/api/impersonate/status",
        Some(&token),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "none");
}

#[tokio::test]
async fn status_fails_open_on_registry_outage() {
    let app = build_test_app();
    seed_owner(&app.idp);
    let token = exchange_owner(&app.router).await;

    // Only the session registry is down; the blacklist check still works,
    // so the request proceeds and the status read fails open.
    app.cache.set_sessions_failing(true);

    let (status, body) = send_json(
        &app.router,
        "GET",
        "/api/impersonate/status",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "none");
}

#[tokio::test]
async fn registry_outage_fails_start_closed() {
    let app = build_test_app();
    seed_owner(&app.idp);
    seed_bob(&app.idp);
    let token = exchange_owner(&app.router).await;

    app.cache.set_sessions_failing(true);

    let (status, _) = send_json(
        &app.router,
        "POST",
        "/api/impersonate",
        Some(&token),
        Some(json!({ "user_id": "bob" })),
    )
    .await;

    // Creation fails closed when the registry cannot be consulted.
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
