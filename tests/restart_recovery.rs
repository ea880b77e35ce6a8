//! Restart recovery tests
//!
//! Job records survive the agent; on startup interrupted work is failed,
//! approved work resumes in approval order and unanalyzed jobs are analyzed.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::write_backup;
use migrad::agent::MigrationAgent;
use migrad::archive::FixedSpaceProbe;
use migrad::config::MigrationConfig;
use migrad::engine::EngineContext;
use migrad::job::{
    FileJobStore, JobFilter, JobLogs, JobManager, MigrationStatus, NewJob, INTERRUPTED_ERROR,
};
use migrad::observability::MemoryAuditLog;
use migrad::services::memory::InMemoryHost;
use migrad::services::RestoreServices;
use serde_json::json;
use tempfile::TempDir;

fn durable_context(root: &Path, host: Arc<InMemoryHost>) -> EngineContext {
    let config = MigrationConfig::rooted_at(root);
    let store = FileJobStore::open(&config.state_dir).unwrap();
    let jobs = JobManager::open(Arc::new(store), JobLogs::new(&config.state_dir)).unwrap();
    EngineContext {
        config: Arc::new(config),
        jobs: Arc::new(jobs),
        services: RestoreServices::in_memory(host),
        space: Arc::new(FixedSpaceProbe(u64::MAX)),
    }
}

#[tokio::test]
async fn test_restart_resumes_and_fails_interrupted() {
    let dir = TempDir::new().unwrap();
    let backup = write_backup(dir.path());
    let host = Arc::new(InMemoryHost::new());

    let (approved, interrupted, fresh) = {
        let agent = MigrationAgent::new(
            durable_context(dir.path(), host.clone()),
            Arc::new(MemoryAuditLog::new()),
        );
        let body = agent
            .handle_value(json!({
                "action": "migration_analyze_backup",
                "backup_path": backup,
                "target_user": "alice",
            }))
            .await
            .to_value();
        agent.wait_for_analyses().await;
        let approved: uuid::Uuid = serde_json::from_value(body["job_id"].clone()).unwrap();

        // approved but never picked up by a worker
        agent.jobs().approve(approved, false).unwrap();

        // caught mid-validation
        let interrupted = agent.jobs().create(NewJob::full(&backup, "bob")).unwrap().id;
        agent
            .jobs()
            .transition(interrupted, MigrationStatus::Validating, "validating backup", 5)
            .unwrap();

        // accepted, analysis never started
        let fresh = agent.jobs().create(NewJob::full(&backup, "carol")).unwrap().id;

        (approved, interrupted, fresh)
    };

    let agent = MigrationAgent::start(
        durable_context(dir.path(), host.clone()),
        Arc::new(MemoryAuditLog::new()),
    )
    .unwrap();
    agent.wait_for_analyses().await;

    let bob = agent.jobs().get(interrupted).unwrap();
    assert_eq!(bob.status, MigrationStatus::Failed);
    assert_eq!(bob.error.as_deref(), Some(INTERRUPTED_ERROR));
    assert_eq!(bob.failed_step.as_deref(), Some("validating backup"));

    let carol = agent.jobs().get(fresh).unwrap();
    assert_eq!(carol.status, MigrationStatus::Planning);
    assert!(carol.has_plan());

    for _ in 0..500 {
        if agent.jobs().get(approved).unwrap().status.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(agent.jobs().get(approved).unwrap().status, MigrationStatus::Complete);
    assert!(host.has_user("alice"));
    assert!(!host.has_user("bob"));

    assert_eq!(agent.jobs().list(&JobFilter::default()).unwrap().len(), 3);
    agent.shutdown().await;
}
