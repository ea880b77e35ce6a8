//! Analyze phase
//!
//! `pending -> validating -> extracting -> planning`, ending with the plan
//! attached and the job awaiting approval. Any unrecoverable error fails the
//! job at the step it was on; progress keeps its last value.
//!
//! The extraction directory lives only for this phase and is removed on
//! every path out of it.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::preflight::validate_backup;
use super::{run_blocking, EngineContext, EngineResult};
use crate::archive::{extract_archive, source_user_hint, ArchiveError, ScratchDir};
use crate::job::{progress, JobKind, MigrationJob, MigrationStatus};
use crate::observability::Logger;
use crate::plan::{detect_conflicts, parse_backup, BackupMeta, StructureMapping};

pub const STEP_VALIDATING: &str = "validating backup";
pub const STEP_EXTRACTING: &str = "extracting backup";
pub const STEP_PARSING: &str = "parsing backup";

/// Analyze in the background. Errors are recorded on the job.
pub fn spawn_analysis(ctx: EngineContext, job_id: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = analyze(&ctx, job_id).await {
            Logger::error(
                "MIGRATION_ANALYSIS_FAILED",
                &[
                    ("code", e.code()),
                    ("error", &e.to_string()),
                    ("job_id", &job_id.to_string()),
                ],
            );
        }
    })
}

/// Run the whole analyze phase for a pending job.
pub async fn analyze(ctx: &EngineContext, job_id: Uuid) -> EngineResult<MigrationJob> {
    let job = ctx.jobs.transition(
        job_id,
        MigrationStatus::Validating,
        STEP_VALIDATING,
        progress::VALIDATING,
    )?;

    match run_phases(ctx, &job).await {
        Ok(job) => Ok(job),
        Err(e) => {
            let current = ctx.jobs.get(job_id)?;
            if !current.status.is_terminal() {
                ctx.jobs
                    .fail(job_id, &current.current_step, &e.operator_message())?;
            }
            Err(e)
        }
    }
}

async fn run_phases(ctx: &EngineContext, job: &MigrationJob) -> EngineResult<MigrationJob> {
    let report = validate_backup(ctx, &job.source_path, &job.target_user).await?;
    let Some(detected) = report.detected.clone() else {
        return Err(ArchiveError::UnknownFormat(job.source_path.display().to_string()).into());
    };

    ctx.jobs.transition(
        job.id,
        MigrationStatus::Extracting,
        STEP_EXTRACTING,
        progress::EXTRACTING,
    )?;

    let scratch = ScratchDir::create(&ctx.config.scratch_dir, "analyze")?;
    let source = job.source_path.clone();
    let gzip = detected.is_gzip();
    let (scratch, stats) = run_blocking(move || {
        let stats = extract_archive(&source, gzip, scratch.path())?;
        Ok((scratch, stats))
    })
    .await?;

    Logger::info(
        "BACKUP_EXTRACTED",
        &[
            ("bytes", &stats.bytes.to_string()),
            ("files", &stats.files.to_string()),
            ("job_id", &job.id.to_string()),
            ("skipped", &stats.skipped_entries.to_string()),
        ],
    );

    ctx.jobs.transition(
        job.id,
        MigrationStatus::Planning,
        STEP_PARSING,
        progress::PLANNING,
    )?;

    let meta = BackupMeta {
        format: detected.tag().to_string(),
        backup_date: modified_at(&job.source_path),
        total_size: stats.bytes,
        source_user_hint: source_user_hint(&job.source_path),
    };
    let target = job.target_user.clone();
    let mut plan = run_blocking(move || {
        let plan = parse_backup(scratch.path(), &target, &meta);
        drop(scratch);
        Ok(plan)
    })
    .await?;

    plan.warnings.extend(report.format_warnings.iter().cloned());
    if let Some(w) = report.services_warning() {
        plan.warnings.push(w);
    }
    if stats.skipped_entries > 0 {
        plan.warnings.push(format!(
            "{} archive entries pointing outside the backup were skipped",
            stats.skipped_entries
        ));
    }

    let mapping = StructureMapping::build(&plan, &job.components, job.effective_mode());
    detect_conflicts(&plan, &mapping, ctx.services.inventory.as_ref())?.record_in(&mut plan);

    if job.kind == JobKind::Selective {
        for class in job.components.excluded() {
            plan.skip_reasons
                .push(format!("{} not selected for this restore", class));
        }
    }

    Ok(ctx.jobs.attach_plan(job.id, &plan)?)
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
