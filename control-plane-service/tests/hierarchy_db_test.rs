//! Hierarchy visibility and suspension-cascade flows against a live
//! PostgreSQL. Run with `cargo test -- --ignored` and DATABASE_URL set.

mod common;

use axum::http::StatusCode;
use common::{build_live_db_app, mint_token_for, send_json, subject};
use control_plane_service::models::OrgTier;
use serde_json::json;

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn reseller_cannot_reach_foreign_customer() {
    let app = build_live_db_app().await;

    // D1 -> R1 -> C1 ; D2 -> C2
    app.state
        .db
        .insert_org(
            OrgTier::Reseller,
            "org-r1",
            "Reseller One",
            None,
            &json!({ "type": "reseller", "createdBy": "org-d1" }),
        )
        .await
        .unwrap();
    let c1 = app
        .state
        .db
        .insert_org(
            OrgTier::Customer,
            "org-c1",
            "Customer One",
            None,
            &json!({ "type": "customer", "createdBy": "org-r1" }),
        )
        .await
        .unwrap();
    let c2 = app
        .state
        .db
        .insert_org(
            OrgTier::Customer,
            "org-c2",
            "Customer Two",
            None,
            &json!({ "type": "customer", "createdBy": "org-d2" }),
        )
        .await
        .unwrap();

    let reseller = subject("user-r1", "rene", OrgTier::Reseller, "org-r1", true);
    let token = mint_token_for(&app, &reseller);

    // Direct read of the foreign customer is denied.
    let (status, body) = send_json(
        &app.router,
        "GET",
        &format!("/api/customers/{}", c2.id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["message"].as_str().unwrap().contains("access denied"));

    // The listing contains only the reseller's own customer.
    let (status, body) = send_json(&app.router, "GET", "/api/customers", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["data"]["items"].as_array().unwrap();
    let ids: Vec<&str> = items
        .iter()
        .map(|i| i["logto_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"org-c1"));
    assert!(!ids.contains(&"org-c2"));
    assert_eq!(body["data"]["total"], 1);

    let _ = c1;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn distributor_sees_transitive_customers() {
    let app = build_live_db_app().await;

    app.state
        .db
        .insert_org(
            OrgTier::Reseller,
            "org-r1",
            "Reseller One",
            None,
            &json!({ "type": "reseller", "createdBy": "org-d1" }),
        )
        .await
        .unwrap();
    app.state
        .db
        .insert_org(
            OrgTier::Customer,
            "org-c1",
            "Customer via reseller",
            None,
            &json!({ "type": "customer", "createdBy": "org-r1" }),
        )
        .await
        .unwrap();
    app.state
        .db
        .insert_org(
            OrgTier::Customer,
            "org-c2",
            "Customer of other distributor",
            None,
            &json!({ "type": "customer", "createdBy": "org-d2" }),
        )
        .await
        .unwrap();

    let distributor = subject("user-d1", "dana", OrgTier::Distributor, "org-d1", true);
    let token = mint_token_for(&app, &distributor);

    let (status, body) = send_json(&app.router, "GET", "/api/customers", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["data"]["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["logto_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"org-c1"));
    assert!(!ids.contains(&"org-c2"));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn suspend_cascade_counts_and_reverts_exactly() {
    let app = build_live_db_app().await;

    let r1 = app
        .state
        .db
        .insert_org(
            OrgTier::Reseller,
            "org-r1",
            "Reseller One",
            None,
            &json!({ "type": "reseller", "createdBy": "org-d1" }),
        )
        .await
        .unwrap();

    for i in 1..=5 {
        app.state
            .db
            .insert_user(
                &format!("user-{}", i),
                &format!("user{}", i),
                &format!("user{}@example.com", i),
                None,
                None,
                &[],
                "org-r1",
            )
            .await
            .unwrap();
    }
    // One user suspended beforehand for another reason keeps its state.
    let manual = app
        .state
        .db
        .insert_user(
            "user-manual",
            "manual",
            "manual@example.com",
            None,
            None,
            &[],
            "org-r1",
        )
        .await
        .unwrap();
    app.state.db.suspend_user(manual.id, "manual").await.unwrap();

    let owner = subject("owner-alice", "alice", OrgTier::Owner, "org-owner", true);
    let token = mint_token_for(&app, &owner);

    let (status, body) = send_json(
        &app.router,
        "PATCH",
        &format!("/api/resellers/{}/suspend", r1.id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["suspended_users_count"], 5);

    // Suspending again conflicts.
    let (status, _) = send_json(
        &app.router,
        "PATCH",
        &format!("/api/resellers/{}/suspend", r1.id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send_json(
        &app.router,
        "PATCH",
        &format!("/api/resellers/{}/reactivate", r1.id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["reactivated_users_count"], 5);

    // The manually suspended user is untouched by the cascade revert.
    let still_manual = app
        .state
        .db
        .find_user_by_id(manual.id)
        .await
        .unwrap()
        .unwrap();
    assert!(still_manual.suspended_at.is_some());
    assert_eq!(still_manual.suspended_reason.as_deref(), Some("manual"));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn customer_listing_is_self_only() {
    let app = build_live_db_app().await;

    app.state
        .db
        .insert_org(
            OrgTier::Customer,
            "org-c1",
            "Customer One",
            None,
            &json!({ "type": "customer", "createdBy": "org-r1" }),
        )
        .await
        .unwrap();
    app.state
        .db
        .insert_org(
            OrgTier::Customer,
            "org-c2",
            "Customer Two",
            None,
            &json!({ "type": "customer", "createdBy": "org-r1" }),
        )
        .await
        .unwrap();

    let customer = subject("user-c1", "carl", OrgTier::Customer, "org-c1", true);
    let token = mint_token_for(&app, &customer);

    let (status, body) = send_json(&app.router, "GET", "/api/customers", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["items"][0]["logto_id"], "org-c1");
}
