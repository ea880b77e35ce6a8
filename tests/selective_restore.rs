//! Selective restore tests
//!
//! Only the selected component classes are touched, and overwriting an
//! existing account needs a typed confirmation first.

mod common;

use common::Harness;
use serde_json::json;

async fn wait_planned(h: &Harness, body: &serde_json::Value) -> String {
    let job_id = body["job_id"].as_str().unwrap().to_string();
    h.agent.wait_for_analyses().await;
    let status = h.wait_for(&job_id, &["planning", "failed"]).await;
    assert_eq!(status["status"], json!("planning"), "{}", status);
    job_id
}

async fn approve(h: &Harness, job_id: &str) {
    let token = h.approval_token(job_id).await;
    h.ok(json!({
        "action": "migration_apply",
        "job_id": job_id,
        "approval_token": token,
    }))
    .await;
}

#[tokio::test]
async fn test_overwrite_requires_confirmation() {
    let h = Harness::new();
    h.host.add_user("alice");

    let resp = h
        .call(json!({
            "action": "migration_selective_restore",
            "backup_path": h.backup,
            "target_user": "alice",
            "mode": "overwrite",
            "components": ["databases"],
        }))
        .await;
    assert!(!resp.is_success());
    assert!(resp.to_json().contains("MIGRATE_AGENT_CONFIRMATION_REQUIRED"));

    let jobs = h.ok(json!({"action": "migration_list_jobs"})).await;
    assert_eq!(jobs["count"], json!(0));
}

#[tokio::test]
async fn test_confirmation_is_bound_to_user() {
    let h = Harness::new();
    let confirm = h
        .ok(json!({
            "action": "migration_confirm_overwrite",
            "target_user": "bob",
            "confirm": "bob",
        }))
        .await;

    let resp = h
        .call(json!({
            "action": "migration_selective_restore",
            "backup_path": h.backup,
            "target_user": "alice",
            "mode": "overwrite",
            "components": ["databases"],
            "confirmation_token": confirm["confirmation_token"],
        }))
        .await;
    assert!(resp.to_json().contains("MIGRATE_JOB_TOKEN_REJECTED"));
}

#[tokio::test]
async fn test_overwrite_touches_only_selected_components() {
    let h = Harness::new();
    h.host.add_user("alice");
    h.host.add_database("alice_wp", "alice");

    let confirm = h
        .ok(json!({
            "action": "migration_confirm_overwrite",
            "operator": "admin",
            "target_user": "alice",
            "confirm": "alice",
        }))
        .await;
    let token = confirm["confirmation_token"].as_str().unwrap().to_string();

    let body = h
        .ok(json!({
            "action": "migration_selective_restore",
            "operator": "admin",
            "backup_path": h.backup,
            "target_user": "alice",
            "mode": "overwrite",
            "components": ["databases"],
            "confirmation_token": token,
        }))
        .await;
    assert_eq!(body["mode"], json!("overwrite"));
    let job_id = wait_planned(&h, &body).await;

    let plan = h
        .ok(json!({"action": "migration_create_plan", "job_id": job_id}))
        .await;
    assert_eq!(plan["blocking_conflicts"], json!([]));

    approve(&h, &job_id).await;
    let done = h.wait_for(&job_id, &["complete", "failed"]).await;
    assert_eq!(done["status"], json!("complete"), "{}", done);

    assert_eq!(h.host.calls_to("restore_database"), vec!["restore_database:alice_wp"]);
    assert!(h.host.calls_to("restore_home").is_empty());
    assert!(h.host.calls_to("restore_mailbox").is_empty());
    assert!(h.host.calls_to("restore_zone").is_empty());
    assert!(h.host.calls_to("install_certificate").is_empty());

    // confirmation tokens are single use
    let again = h
        .call(json!({
            "action": "migration_selective_restore",
            "backup_path": h.backup,
            "target_user": "alice",
            "mode": "overwrite",
            "components": ["databases"],
            "confirmation_token": token,
        }))
        .await;
    assert!(again.to_json().contains("MIGRATE_JOB_TOKEN_REJECTED"));
}

#[tokio::test]
async fn test_merge_accepts_component_flags() {
    let h = Harness::new();
    let body = h
        .ok(json!({
            "action": "migration_selective_restore",
            "backup_path": h.backup,
            "target_user": "carol",
            "components": {"email": true, "dns": true, "files": false},
        }))
        .await;
    assert_eq!(body["mode"], json!("merge"));
    let job_id = wait_planned(&h, &body).await;

    approve(&h, &job_id).await;
    let done = h.wait_for(&job_id, &["complete", "failed"]).await;
    assert_eq!(done["status"], json!("complete"), "{}", done);

    assert!(h.host.has_mailbox("info@example.com"));
    assert!(h.host.has_zone("example.com"));
    assert!(!h.host.has_database("carol_wp"));
    assert!(h.host.calls_to("restore_home").is_empty());
    // domains are only created alongside files
    assert!(!h.host.has_domain("example.com"));
}

#[tokio::test]
async fn test_invalid_selection_rejected() {
    let h = Harness::new();
    for components in [json!([]), json!(["databases", "crontab"]), json!({"email": false})] {
        let resp = h
            .call(json!({
                "action": "migration_selective_restore",
                "backup_path": h.backup,
                "target_user": "carol",
                "components": components,
            }))
            .await;
        assert!(resp.to_json().contains("MIGRATE_AGENT_INVALID_PARAMETER"));
    }

    let resp = h
        .call(json!({
            "action": "migration_selective_restore",
            "backup_path": h.backup,
            "target_user": "carol",
            "mode": "replace",
            "components": ["email"],
        }))
        .await;
    assert!(resp.to_json().contains("MIGRATE_AGENT_INVALID_PARAMETER"));
}
