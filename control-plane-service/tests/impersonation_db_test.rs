//! Full consent + impersonation lifecycle against a live PostgreSQL.
//! Run with `cargo test -- --ignored` and DATABASE_URL set.

mod common;

use axum::http::StatusCode;
use common::{build_live_db_app, exchange_owner, seed_bob, seed_owner, send_json};
use serde_json::json;

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn consent_impersonation_lifecycle() {
    let app = build_live_db_app().await;
    seed_owner(&app.idp);
    seed_bob(&app.idp);

    let alice_token = exchange_owner(&app.router).await;

    // (1) No consent: start is forbidden.
    let (status, _) = send_json(
        &app.router,
        "POST",
        "/api/impersonate",
        Some(&alice_token),
        Some(json!({ "user_id": "bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // (2) Bob enables consent for two hours.
    let (status, bob_exchange) = send_json(
        &app.router,
        "POST",
        "/auth/exchange",
        None,
        Some(json!({ "access_token": "AT-bob-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let bob_token = bob_exchange["data"]["token"].as_str().unwrap();

    let (status, _) = send_json(
        &app.router,
        "POST",
        "/api/impersonate/consent",
        Some(bob_token),
        Some(json!({ "duration_hours": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // (3) Alice starts impersonating; lifetime is bounded by the consent.
    let (status, started) = send_json(
        &app.router,
        "POST",
        "/api/impersonate",
        Some(&alice_token),
        Some(json!({ "user_id": "bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "start failed: {}", started);
    let session_id = started["data"]["session_id"].as_str().unwrap().to_string();
    let imp_token = started["data"]["token"].as_str().unwrap().to_string();
    assert!(started["data"]["expires_in"].as_i64().unwrap() <= 7200);

    let claims = app.state.tokens.validate_access(&imp_token).unwrap();
    assert!(claims.is_impersonated);
    assert_eq!(claims.sub, "bob");
    assert_eq!(
        claims.impersonated_by.as_deref().unwrap().logto_id,
        "owner-alice"
    );

    // (4) A second start without exiting conflicts.
    let (status, _) = send_json(
        &app.router,
        "POST",
        "/api/impersonate",
        Some(&alice_token),
        Some(json!({ "user_id": "bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // (5) Exit under the impersonation token returns fresh actor tokens.
    let (status, exited) = send_json(
        &app.router,
        "DELETE",
        "/api/impersonate",
        Some(&imp_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let fresh = exited["data"]["token"].as_str().unwrap();
    let fresh_claims = app.state.tokens.validate_access(fresh).unwrap();
    assert!(!fresh_claims.is_impersonated);
    assert_eq!(fresh_claims.sub, "owner-alice");

    // (6) The audit holds exactly one start and one end for the session.
    let (status, audit) = send_json(
        &app.router,
        "GET",
        &format!("/api/impersonate/sessions/{}/audit", session_id),
        Some(&alice_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = audit["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(
        actions
            .iter()
            .filter(|a| **a == "session_start")
            .count(),
        1
    );
    assert_eq!(actions.iter().filter(|a| **a == "session_end").count(), 1);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn self_impersonation_is_rejected() {
    let app = build_live_db_app().await;
    seed_owner(&app.idp);

    let alice_token = exchange_owner(&app.router).await;

    // Alice consents, then tries to impersonate herself.
    let (status, _) = send_json(
        &app.router,
        "POST",
        "/api/impersonate/consent",
        Some(&alice_token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(
        &app.router,
        "POST",
        "/api/impersonate",
        Some(&alice_token),
        Some(json!({ "user_id": "owner-alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn disabling_consent_blocks_new_sessions() {
    let app = build_live_db_app().await;
    seed_owner(&app.idp);
    seed_bob(&app.idp);

    let alice_token = exchange_owner(&app.router).await;

    let (_, bob_exchange) = send_json(
        &app.router,
        "POST",
        "/auth/exchange",
        None,
        Some(json!({ "access_token": "AT-bob-1" })),
    )
    .await;
    let bob_token = bob_exchange["data"]["token"].as_str().unwrap();

    send_json(
        &app.router,
        "POST",
        "/api/impersonate/consent",
        Some(bob_token),
        Some(json!({ "duration_hours": 1 })),
    )
    .await;
    assert!(app.state.impersonation.can_be_impersonated("bob").await.unwrap());

    // Disable is idempotent.
    for _ in 0..2 {
        let (status, _) = send_json(
            &app.router,
            "DELETE",
            "/api/impersonate/consent",
            Some(bob_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    assert!(!app.state.impersonation.can_be_impersonated("bob").await.unwrap());

    let (status, _) = send_json(
        &app.router,
        "POST",
        "/api/impersonate",
        Some(&alice_token),
        Some(json!({ "user_id": "bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
