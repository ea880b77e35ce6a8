//! Apply worker pool tests
//!
//! At most `max_concurrent_applies` jobs run at once; the rest wait queued
//! in approval order.

mod common;

use std::time::Duration;

use common::Harness;
use serde_json::json;

#[tokio::test]
async fn test_pool_bounds_concurrent_applies() {
    let h = Harness::with(|c| c.max_concurrent_applies = 3, u64::MAX);
    h.host.hold_identity();

    let users = ["ann", "ben", "cat", "dan", "eve"];
    let mut jobs = Vec::new();
    for user in users {
        jobs.push(h.applied(user).await);
    }

    // three workers park inside create_account, two jobs stay queued
    let mut applying = 0;
    for _ in 0..500 {
        applying = 0;
        for job_id in &jobs {
            if h.status(job_id).await["status"] == json!("applying") {
                applying += 1;
            }
        }
        if applying == 3 && h.agent.pool().in_flight() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(applying, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.agent.pool().in_flight(), 3);
    assert!(h.host.calls_to("create_account").is_empty());

    let mut waiting = 0;
    for job_id in &jobs {
        let status = h.status(job_id).await;
        match status["status"].as_str().unwrap() {
            "applying" => {}
            "planning" => {
                assert_eq!(status["queued"], json!(true));
                waiting += 1;
            }
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(waiting, 2);

    h.host.release_identity();
    for job_id in &jobs {
        let done = h.wait_for(job_id, &["complete", "failed"]).await;
        assert_eq!(done["status"], json!("complete"), "{}", done);
    }
    for user in users {
        assert!(h.host.has_user(user));
    }
    assert_eq!(h.agent.pool().in_flight(), 0);
}

#[tokio::test]
async fn test_shutdown_refuses_new_applies() {
    let h = Harness::new();
    let job_id = h.analyzed("alice").await;
    let token = h.approval_token(&job_id).await;

    h.agent.shutdown().await;

    let resp = h
        .call(json!({
            "action": "migration_apply",
            "job_id": job_id,
            "approval_token": token,
        }))
        .await;
    assert!(!resp.is_success());
    assert!(resp.to_json().contains("MIGRATE_ENGINE_POOL_CLOSED"));

    let status = h.status(&job_id).await;
    assert_eq!(status["queued"], json!(false));
}
