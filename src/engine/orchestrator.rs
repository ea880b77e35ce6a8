//! Apply orchestrator
//!
//! Drives one approved job through `ApplyStep::ALL` in order:
//! - steps for unselected component classes are skipped
//! - every created artifact is written to the job ledger as soon as it exists
//! - the first failure fails the job at that step; nothing after it runs and
//!   nothing is compensated
//! - the target account is re-checked right before identity provisioning

use std::time::Instant;

use uuid::Uuid;

use super::steps::ApplyStep;
use super::{run_blocking, EngineContext, EngineError, EngineResult};
use crate::archive::{detect_format, extract_archive, ScratchDir};
use crate::job::{progress, MigrationJob, MigrationStatus, RestoreLedger};
use crate::observability::{Logger, Severity};
use crate::plan::{
    locate_backup_root, ComponentClass, Conflict, ConflictReport, MigrationDomain, MigrationPlan,
    StructureMapping,
};
use crate::services::{RestoreContext, RestoreOutcome};

pub const STEP_COMPLETE: &str = "complete";

pub(crate) fn load_plan(job: &MigrationJob) -> EngineResult<MigrationPlan> {
    match job.plan() {
        Some(Ok(plan)) => Ok(plan),
        Some(Err(e)) => Err(EngineError::PlanUnreadable(e.to_string())),
        None => Err(crate::job::JobError::PlanMissing(job.id).into()),
    }
}

/// Conflicts that would block applying `job` with the given overwrite flag.
pub fn blocking_conflicts(job: &MigrationJob, overwrite_existing: bool) -> EngineResult<Vec<Conflict>> {
    let plan = load_plan(job)?;
    let mut candidate = job.clone();
    candidate.overwrite_existing = overwrite_existing;
    Ok(ConflictReport::from_plan(&plan)
        .blocking(&candidate.components, candidate.authorization())
        .into_iter()
        .cloned()
        .collect())
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|i| i == item) {
        list.push(item.to_string());
    }
}

struct ApplyRun<'a> {
    ctx: &'a EngineContext,
    job: &'a MigrationJob,
    plan: MigrationPlan,
    mapping: StructureMapping,
    scratch: Option<ScratchDir>,
    restore: Option<RestoreContext>,
}

impl<'a> ApplyRun<'a> {
    fn restore_ctx(&self) -> EngineResult<&RestoreContext> {
        self.restore
            .as_ref()
            .ok_or_else(|| EngineError::Task("backup content was not prepared".to_string()))
    }

    fn record<F: FnOnce(&mut RestoreLedger)>(&self, f: F) -> EngineResult<()> {
        self.ctx.jobs.record_artifacts(self.job.id, f)?;
        Ok(())
    }

    async fn execute(&mut self, step: ApplyStep) -> EngineResult<()> {
        match step {
            ApplyStep::PrepareContent => self.prepare().await,
            ApplyStep::CreateIdentity => self.create_identity().await,
            ApplyStep::CreateTree => self.create_tree().await,
            ApplyStep::RestoreHome => self.restore_home().await,
            ApplyStep::RestoreDatabases => self.restore_databases().await,
            ApplyStep::RestoreMailboxes => self.restore_mailboxes().await,
            ApplyStep::RestoreDnsZones => self.restore_zones().await,
            ApplyStep::RestoreCertificates => self.restore_certificates().await,
            ApplyStep::Verify => self.verify().await,
        }
    }

    async fn prepare(&mut self) -> EngineResult<()> {
        let detected = detect_format(&self.job.source_path)?;
        let scratch = ScratchDir::create(&self.ctx.config.scratch_dir, "apply")?;
        let source = self.job.source_path.clone();
        let gzip = detected.is_gzip();

        let (scratch, stats) = run_blocking(move || {
            let stats = extract_archive(&source, gzip, scratch.path())?;
            Ok((scratch, stats))
        })
        .await?;

        self.restore = Some(RestoreContext {
            job_id: self.job.id,
            target_user: self.job.target_user.clone(),
            content_root: locate_backup_root(scratch.path()),
            mode: self.job.effective_mode(),
        });
        self.scratch = Some(scratch);
        self.ctx.jobs.note(
            self.job,
            Severity::Info,
            &format!("backup content prepared: {} files, {} bytes", stats.files, stats.bytes),
        );
        Ok(())
    }

    async fn create_identity(&self) -> EngineResult<()> {
        let services = &self.ctx.services;
        let target = &self.job.target_user;

        if services.inventory.user_exists(target)? && !self.job.authorization().existing_user {
            return Err(EngineError::TargetUserExists(target.clone()));
        }

        let outcome = services.identity.create_account(self.restore_ctx()?).await?;
        if outcome == RestoreOutcome::Created {
            self.record(|l| l.identity_created = true)?;
        }
        Ok(())
    }

    async fn create_tree(&self) -> EngineResult<()> {
        let domains: &[MigrationDomain] = if self.job.components.contains(ComponentClass::Files) {
            &self.plan.domains
        } else {
            &[]
        };
        let outcome = self
            .ctx
            .services
            .filesystem
            .create_tree(self.restore_ctx()?, domains)
            .await?;

        self.record(|l| {
            for dir in &outcome.directories {
                push_unique(&mut l.directories, dir);
            }
            for domain in &outcome.domains {
                push_unique(&mut l.domains, domain);
            }
        })
    }

    async fn restore_home(&self) -> EngineResult<()> {
        let bytes = self
            .ctx
            .services
            .filesystem
            .restore_home(self.restore_ctx()?)
            .await?;
        self.ctx.jobs.note(
            self.job,
            Severity::Info,
            &format!("home directory restored: {} bytes", bytes),
        );
        Ok(())
    }

    async fn restore_databases(&self) -> EngineResult<()> {
        let rctx = self.restore_ctx()?;
        for db in &self.plan.databases {
            let target_name = self.mapping.database(&db.name);
            let db_user = db.db_user.as_deref().map(|u| self.mapping.database_user(u));
            let outcome = self
                .ctx
                .services
                .databases
                .restore_database(rctx, db, &target_name, db_user.as_deref())
                .await?;
            if outcome.touched_target() {
                self.record(|l| push_unique(&mut l.databases, &target_name))?;
            }
        }
        Ok(())
    }

    async fn restore_mailboxes(&self) -> EngineResult<()> {
        let rctx = self.restore_ctx()?;
        for mailbox in &self.plan.email_accounts {
            let outcome = self
                .ctx
                .services
                .mailboxes
                .restore_mailbox(rctx, mailbox)
                .await?;
            if outcome.touched_target() {
                self.record(|l| push_unique(&mut l.mailboxes, &mailbox.address))?;
            }
        }
        Ok(())
    }

    async fn restore_zones(&self) -> EngineResult<()> {
        let rctx = self.restore_ctx()?;
        for zone in &self.plan.dns_zones {
            let outcome = self.ctx.services.dns.restore_zone(rctx, zone).await?;
            if outcome.touched_target() {
                self.record(|l| push_unique(&mut l.dns_zones, &zone.zone_name))?;
            }
        }
        Ok(())
    }

    async fn restore_certificates(&self) -> EngineResult<()> {
        let rctx = self.restore_ctx()?;
        for cert in self.plan.installable_certificates() {
            let outcome = self
                .ctx
                .services
                .certificates
                .install_certificate(rctx, cert)
                .await?;
            if outcome.touched_target() {
                self.record(|l| push_unique(&mut l.certificates, &cert.domain))?;
            }
        }
        Ok(())
    }

    async fn verify(&self) -> EngineResult<()> {
        let facts = self
            .ctx
            .services
            .identity
            .verify_account(&self.job.target_user)
            .await?;

        if !facts.exists {
            return Err(EngineError::Verification("target account does not exist".to_string()));
        }
        if !facts.home_exists {
            return Err(EngineError::Verification("home directory is missing".to_string()));
        }
        if !facts.ownership_ok {
            return Err(EngineError::Verification(
                "home directory is not owned by the target account".to_string(),
            ));
        }
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            let _ = run_blocking(move || {
                drop(scratch);
                Ok(())
            })
            .await;
        }
    }
}

/// Claim a queued job and run every selected step.
pub async fn run_apply(ctx: &EngineContext, job_id: Uuid) -> EngineResult<MigrationJob> {
    let job = ctx.jobs.claim(job_id, ApplyStep::PrepareContent.label())?;
    let started = Instant::now();

    let plan = match load_plan(&job) {
        Ok(plan) => plan,
        Err(e) => return Err(fail_step(ctx, &job, ApplyStep::PrepareContent, e)),
    };
    let mapping = StructureMapping::build(&plan, &job.components, job.effective_mode());
    let mut run = ApplyRun {
        ctx,
        job: &job,
        plan,
        mapping,
        scratch: None,
        restore: None,
    };

    for step in ApplyStep::ALL {
        if !step.runs_for(&job.components) {
            ctx.jobs
                .note(&job, Severity::Info, &format!("skipped: {}", step.label()));
            continue;
        }

        let entered = if step == ApplyStep::Verify {
            ctx.jobs
                .transition(job_id, MigrationStatus::Verifying, step.label(), step.progress())
        } else {
            ctx.jobs.progress(job_id, step.label(), step.progress())
        };
        if let Err(e) = entered {
            run.release().await;
            return Err(e.into());
        }

        Logger::info(
            "APPLY_STEP_STARTED",
            &[("job_id", &job_id.to_string()), ("step", step.label())],
        );

        if let Err(e) = run.execute(step).await {
            run.release().await;
            return Err(fail_step(ctx, &job, step, e));
        }
    }

    run.release().await;
    let done = ctx
        .jobs
        .transition(job_id, MigrationStatus::Complete, STEP_COMPLETE, progress::COMPLETE)?;

    Logger::info(
        "MIGRATION_APPLY_COMPLETE",
        &[
            ("duration_secs", &started.elapsed().as_secs().to_string()),
            ("job_id", &job_id.to_string()),
            ("target_user", &done.target_user),
        ],
    );
    Ok(done)
}

fn fail_step(ctx: &EngineContext, job: &MigrationJob, step: ApplyStep, source: EngineError) -> EngineError {
    let err = EngineError::Step {
        step: step.label(),
        source: Box::new(source),
    };
    Logger::error(
        "APPLY_STEP_FAILED",
        &[
            ("code", err.code()),
            ("error", &err.to_string()),
            ("job_id", &job.id.to_string()),
            ("step", step.label()),
        ],
    );
    if let Err(e) = ctx.jobs.fail(job.id, step.label(), &err.operator_message()) {
        Logger::error(
            "MIGRATION_JOB_UPDATE_FAILED",
            &[("error", &e.to_string()), ("job_id", &job.id.to_string())],
        );
    }
    err
}
