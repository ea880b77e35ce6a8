//! Job lifecycle tests
//!
//! Drives the agent through analyze, plan, preview, apply and rollback
//! against a simulated host.

mod common;

use common::Harness;
use migrad::observability::AuditOutcome;
use serde_json::json;

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_full_migration_completes() {
    let h = Harness::new();
    let job_id = h.analyzed("alice").await;

    let plan = h
        .ok(json!({"action": "migration_create_plan", "job_id": job_id}))
        .await;
    assert_eq!(plan["plan"]["source_user"], json!("olduser"));
    assert_eq!(plan["plan"]["domains_count"], json!(2));
    assert_eq!(plan["plan"]["database_count"], json!(1));
    assert_eq!(plan["plan"]["email_count"], json!(1));
    assert_eq!(plan["blocking_conflicts"], json!([]));

    let preview = h
        .ok(json!({"action": "migration_preview", "job_id": job_id}))
        .await;
    assert_eq!(preview["dry_run"], json!(true));
    assert!(preview["simulation"]["steps"].as_array().unwrap().len() > 1);
    let token = preview["approval_token"].as_str().unwrap();

    // preview alone never touches the target
    assert!(h.host.calls_to("create_account").is_empty());

    let applied = h
        .ok(json!({
            "action": "migration_apply",
            "operator": "admin",
            "job_id": job_id,
            "approval_token": token,
        }))
        .await;
    assert_eq!(applied["queued"], json!(true));

    let done = h.wait_for(&job_id, &["complete", "failed"]).await;
    assert_eq!(done["status"], json!("complete"), "{}", done);
    assert_eq!(done["progress"], json!(100));

    assert!(h.host.has_user("alice"));
    assert!(h.host.has_database("alice_wp"));
    assert!(h.host.has_mailbox("info@example.com"));
    assert!(h.host.has_zone("example.com"));
    assert!(h.host.has_certificate("example.com"));
    assert!(h.host.home_bytes("alice") > 0);

    let checks = h
        .ok(json!({"action": "migration_validate", "target_user": "alice"}))
        .await;
    assert_eq!(checks["valid"], json!(true));

    let logs = h
        .ok(json!({"action": "migration_job_logs", "job_id": job_id}))
        .await;
    assert!(!logs["logs"].as_str().unwrap().is_empty());

    let apply_audit = h.audit.records_for("migration_apply");
    assert_eq!(apply_audit.len(), 1);
    assert_eq!(apply_audit[0].outcome, AuditOutcome::Queued);
    assert_eq!(apply_audit[0].operator.as_deref(), Some("admin"));
}

#[tokio::test]
async fn test_rollback_removes_created_items() {
    let h = Harness::new();
    let job_id = h.applied("alice").await;
    h.wait_for(&job_id, &["complete"]).await;

    let body = h
        .ok(json!({"action": "migration_rollback", "job_id": job_id}))
        .await;
    assert_eq!(body["status"], json!("rolled_back"));

    assert!(!h.host.has_user("alice"));
    assert!(!h.host.has_database("alice_wp"));
    assert!(!h.host.has_mailbox("info@example.com"));
    assert!(!h.host.has_zone("example.com"));
    assert!(!h.host.has_certificate("example.com"));
    assert!(!h.host.has_directory("/home/alice"));
    assert!(!h.host.has_domain("example.com"));
    assert!(!h.host.has_domain("blog.example.com"));

    // certificates are reversed before the identity
    let calls = h.host.calls();
    let cert = calls.iter().position(|c| c.starts_with("remove_certificate:")).unwrap();
    let account = calls.iter().position(|c| c.starts_with("remove_account:")).unwrap();
    assert!(cert < account);
}

#[tokio::test]
async fn test_rollback_keeps_preexisting_account() {
    let h = Harness::new();
    h.host.add_user("alice");

    let job_id = h.analyzed("alice").await;
    let token = h.approval_token(&job_id).await;
    h.ok(json!({
        "action": "migration_apply",
        "job_id": job_id,
        "approval_token": token,
        "overwrite_existing": true,
    }))
    .await;
    h.wait_for(&job_id, &["complete"]).await;

    h.ok(json!({"action": "migration_rollback", "job_id": job_id}))
        .await;
    assert!(h.host.has_user("alice"));
    assert!(!h.host.has_database("alice_wp"));
    assert!(h.host.calls_to("remove_account").is_empty());
}

// =============================================================================
// Approval gate
// =============================================================================

#[tokio::test]
async fn test_apply_rejects_bad_token_without_mutation() {
    let h = Harness::new();
    let job_id = h.analyzed("alice").await;
    h.approval_token(&job_id).await;

    let resp = h
        .call(json!({
            "action": "migration_apply",
            "job_id": job_id,
            "approval_token": "not-a-token",
        }))
        .await;
    assert!(!resp.is_success());
    assert!(resp.to_json().contains("MIGRATE_JOB_TOKEN_REJECTED"));

    let status = h.status(&job_id).await;
    assert_eq!(status["status"], json!("planning"));
    assert_eq!(status["queued"], json!(false));
    assert!(h.host.calls_to("create_account").is_empty());
    assert_eq!(
        h.audit.records_for("migration_apply")[0].outcome,
        AuditOutcome::Rejected
    );
}

#[tokio::test]
async fn test_approval_token_is_single_use() {
    let h = Harness::new();
    let job_id = h.analyzed("alice").await;
    let token = h.approval_token(&job_id).await;
    let request = json!({
        "action": "migration_apply",
        "job_id": job_id,
        "approval_token": token,
    });

    assert!(h.call(request.clone()).await.is_success());
    let again = h.call(request).await;
    assert!(!again.is_success());
}

#[tokio::test]
async fn test_existing_user_blocks_apply_until_overwrite() {
    let h = Harness::new();
    h.host.add_user("alice");
    let job_id = h.analyzed("alice").await;

    let plan = h
        .ok(json!({"action": "migration_create_plan", "job_id": job_id}))
        .await;
    assert!(!plan["blocking_conflicts"].as_array().unwrap().is_empty());

    let token = h.approval_token(&job_id).await;
    let blocked = h
        .call(json!({
            "action": "migration_apply",
            "job_id": job_id,
            "approval_token": token,
        }))
        .await;
    assert!(blocked.to_json().contains("MIGRATE_ENGINE_CONFLICTS"));

    // a blocked request leaves the token usable
    h.ok(json!({
        "action": "migration_apply",
        "job_id": job_id,
        "approval_token": token,
        "overwrite_existing": true,
    }))
    .await;
    let done = h.wait_for(&job_id, &["complete", "failed"]).await;
    assert_eq!(done["status"], json!("complete"));
}

#[tokio::test]
async fn test_dry_run_preview_issues_no_token() {
    let h = Harness::new();
    let body = h
        .ok(json!({
            "action": "migration_analyze_backup",
            "backup_path": h.backup,
            "target_user": "alice",
            "dry_run": true,
        }))
        .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();
    h.agent.wait_for_analyses().await;
    h.wait_for(&job_id, &["planning"]).await;

    let preview = h
        .ok(json!({"action": "migration_preview", "job_id": job_id}))
        .await;
    assert!(preview.get("approval_token").is_none());
}

// =============================================================================
// State machine
// =============================================================================

#[tokio::test]
async fn test_rollback_requires_finished_job() {
    let h = Harness::new();
    let job_id = h.analyzed("alice").await;
    let resp = h
        .call(json!({"action": "migration_rollback", "job_id": job_id}))
        .await;
    assert!(resp.to_json().contains("MIGRATE_JOB_INVALID_STATE"));
}

#[tokio::test]
async fn test_apply_on_complete_job_is_invalid_state() {
    let h = Harness::new();
    let job_id = h.applied("alice").await;
    h.wait_for(&job_id, &["complete"]).await;

    let resp = h
        .call(json!({
            "action": "migration_apply",
            "job_id": job_id,
            "approval_token": "whatever",
        }))
        .await;
    assert!(resp.to_json().contains("MIGRATE_JOB_INVALID_STATE"));
}

#[tokio::test]
async fn test_failed_step_stops_apply() {
    let h = Harness::new();
    h.host.fail_on("restore_database", "ERROR 1045 (28000): Access denied for 'root'");
    let job_id = h.applied("alice").await;

    let done = h.wait_for(&job_id, &["complete", "failed"]).await;
    assert_eq!(done["status"], json!("failed"));
    assert_eq!(done["current_step"], json!("restore databases"));
    assert_eq!(done["failed_step"], json!("restore databases"));

    let message = done["error_message"].as_str().unwrap();
    assert!(!message.is_empty());
    assert!(!message.contains("Access denied"));

    // later steps never ran
    assert!(h.host.calls_to("restore_mailbox").is_empty());
    assert!(h.host.calls_to("restore_zone").is_empty());

    // the failed job can still be rolled back
    h.host.clear_failure("restore_database");
    let body = h
        .ok(json!({"action": "migration_rollback", "job_id": job_id}))
        .await;
    assert_eq!(body["status"], json!("rolled_back"));
    assert!(!h.host.has_user("alice"));
}

#[tokio::test]
async fn test_rollback_partial_failure_can_be_retried() {
    let h = Harness::new();
    let job_id = h.applied("alice").await;
    h.wait_for(&job_id, &["complete"]).await;

    h.host.fail_on("remove_mailbox", "doveadm: mailbox is locked");
    let resp = h
        .call(json!({"action": "migration_rollback", "job_id": job_id}))
        .await;
    assert!(!resp.is_success());
    assert!(resp.to_json().contains("MIGRATE_ENGINE_ROLLBACK_INCOMPLETE"));

    // everything but the mailbox was reversed
    assert!(h.host.has_mailbox("info@example.com"));
    assert!(!h.host.has_database("alice_wp"));
    assert!(!h.host.has_zone("example.com"));
    assert!(!h.host.has_certificate("example.com"));
    assert!(!h.host.has_user("alice"));

    let status = h.status(&job_id).await;
    assert_eq!(status["status"], json!("failed"));
    let message = status["error_message"].as_str().unwrap();
    assert!(message.contains("rollback incomplete"));
    assert!(message.contains("mailboxes"));
    assert!(!message.contains("locked"));

    h.host.clear_failure("remove_mailbox");
    let body = h
        .ok(json!({"action": "migration_rollback", "job_id": job_id}))
        .await;
    assert_eq!(body["status"], json!("rolled_back"));
    assert!(!h.host.has_mailbox("info@example.com"));

    // the retry only touched what was left
    assert_eq!(h.host.calls_to("remove_account").len(), 1);
    assert_eq!(h.host.calls_to("drop_database").len(), 1);
}

#[tokio::test]
async fn test_verification_failure_fails_job() {
    let h = Harness::new();
    h.host.break_ownership("alice");
    let job_id = h.applied("alice").await;

    let done = h.wait_for(&job_id, &["complete", "failed"]).await;
    assert_eq!(done["status"], json!("failed"));
    assert_eq!(done["failed_step"], json!("post-restore verification"));

    let message = done["error_message"].as_str().unwrap();
    assert_eq!(
        message,
        "post-restore verification failed: home directory is not owned by the target account"
    );
    assert_eq!(message.matches("verification failed").count(), 1);

    // every restore step ran before the check
    assert_eq!(h.host.calls_to("install_certificate").len(), 1);
}

#[tokio::test]
async fn test_list_jobs_filters_by_user() {
    let h = Harness::new();
    h.analyzed("alice").await;
    h.analyzed("bob").await;

    let all = h.ok(json!({"action": "migration_list_jobs"})).await;
    assert_eq!(all["count"], json!(2));

    let bob = h
        .ok(json!({"action": "migration_list_jobs", "target_user": "bob"}))
        .await;
    assert_eq!(bob["count"], json!(1));
    assert_eq!(bob["jobs"][0]["target_user"], json!("bob"));
}
