//! CLI command implementations
//!
//! `serve` owns the only long-lived runtime. `request` and `inspect` are
//! one-shot and print a single JSON object.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::runtime::{Builder, Runtime};

use crate::agent::request::{validate_backup_path, validate_username};
use crate::agent::{self, MigrationAgent};
use crate::archive::{ScratchDir, StatvfsProbe};
use crate::config::MigrationConfig;
use crate::engine::{analyze, blocking_conflicts, EngineContext, EngineError};
use crate::job::{JobError, NewJob};
use crate::observability::{FileAuditLog, Logger};
use crate::services::memory::InMemoryHost;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{read_request, write_json, write_line};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config } => serve(&config),
        Command::Request { socket } => request(&socket),
        Command::Inspect {
            backup,
            target_user,
        } => inspect(&backup, &target_user),
    }
}

fn runtime(multi_thread: bool) -> CliResult<Runtime> {
    let mut builder = if multi_thread {
        Builder::new_multi_thread()
    } else {
        Builder::new_current_thread()
    };
    builder
        .enable_all()
        .build()
        .map_err(|e| CliError::Runtime(e.to_string()))
}

/// Run the agent until SIGINT.
///
/// Startup order:
/// 1. Load and validate config
/// 2. Open the job store, recovering interrupted jobs
/// 3. Open the audit log
/// 4. Bind the socket and serve
pub fn serve(config_path: &Path) -> CliResult<()> {
    let config = MigrationConfig::load(config_path)?;
    Logger::info(
        "AGENT_STARTING",
        &[
            ("config", &config_path.display().to_string()),
            ("max_concurrent_applies", &config.max_concurrent_applies.to_string()),
        ],
    );

    let rt = runtime(true)?;
    rt.block_on(async move {
        let socket_path = config.socket_path.clone();
        let audit = FileAuditLog::open(&config.audit_log_path)?;
        let ctx = EngineContext::open(config)?;
        let agent = Arc::new(MigrationAgent::start(ctx, Arc::new(audit))?);

        agent::serve(agent, &socket_path, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                Logger::error("SIGNAL_HANDLER_FAILED", &[("error", &e.to_string())]);
            }
        })
        .await?;
        Ok::<(), CliError>(())
    })
}

/// Forward one stdin request line to the agent and print its response.
pub fn request(socket_path: &Path) -> CliResult<()> {
    let line = read_request()?;
    let rt = runtime(false)?;
    let response = rt.block_on(agent::server::request(socket_path, &line))?;
    write_line(&response)
}

/// Analyze a backup without touching the host.
///
/// Runs the same validation, extraction and planning as the agent against an
/// empty simulated host, so conflicts reflect the backup alone.
pub fn inspect(backup: &Path, target_user: &str) -> CliResult<()> {
    validate_username(target_user)?;
    validate_backup_path(&backup.display().to_string())?;

    let scratch = ScratchDir::create(&env::temp_dir(), "migrad-inspect").map_err(EngineError::from)?;
    let config = MigrationConfig::rooted_at(scratch.path());
    config.validate()?;
    fs::create_dir_all(&config.home_root)?;

    let rt = runtime(true)?;
    let body = rt.block_on(async {
        let mut ctx = EngineContext::in_memory(config, Arc::new(InMemoryHost::new()), 0)?;
        ctx.space = Arc::new(StatvfsProbe);

        let job = ctx
            .jobs
            .create(NewJob::full(backup, target_user).dry_run(true))
            .map_err(EngineError::from)?;
        let job = analyze(&ctx, job.id).await?;
        let plan = match job.plan() {
            Some(Ok(plan)) => plan,
            Some(Err(e)) => return Err(CliError::from(EngineError::PlanUnreadable(e.to_string()))),
            None => return Err(CliError::from(EngineError::from(JobError::PlanMissing(job.id)))),
        };
        let blocking = blocking_conflicts(&job, false)?;

        Ok::<_, CliError>(json!({
            "success": true,
            "backup_path": backup,
            "target_user": target_user,
            "status": job.status,
            "summary": plan.summary(),
            "plan": plan,
            "blocking_conflicts": blocking,
        }))
    })?;

    write_json(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_rejects_bad_username() {
        let err = inspect(Path::new("/tmp/backup.tar.gz"), "Bad User").unwrap_err();
        assert_eq!(err.code(), "MIGRATE_AGENT_INVALID_PARAMETER");
    }

    #[test]
    fn test_inspect_rejects_relative_backup() {
        let err = inspect(Path::new("backup.tar.gz"), "alice").unwrap_err();
        assert_eq!(err.code(), "MIGRATE_AGENT_INVALID_PARAMETER");
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let err = serve(Path::new("/nonexistent/migrad.json")).unwrap_err();
        assert_eq!(err.code(), "MIGRATE_CONFIG_IO");
    }
}
