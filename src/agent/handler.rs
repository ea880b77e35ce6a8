//! Migration agent handler
//!
//! Dispatches parsed requests to the engine and writes one audit record per
//! request. Input errors are rejected before any job state is touched.
//!
//! Long-running work never runs on the request path: analysis is spawned per
//! job and applies go through the bounded pool. Rollback is the exception and
//! completes before the response is sent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::errors::{AgentError, AgentResult};
use super::request::{
    validate_backup_path, validate_username, AgentRequest, AnalyzeParams, ApplyParams,
    BackupParams, ConfirmOverwriteParams, Envelope, JobParams, ListParams, SelectiveParams,
    TargetParams,
};
use super::response::Response;
use crate::archive::check_file;
use crate::engine::orchestrator::load_plan;
use crate::engine::{
    blocking_conflicts, run_rollback, spawn_analysis, validate_backup, ApplyPool, ApplyStep,
    EngineContext, EngineError,
};
use crate::job::{
    ApprovalRegistry, JobFilter, JobManager, MigrationJob, MigrationStatus, NewJob, TokenPurpose,
};
use crate::observability::{AuditLog, AuditOutcome, AuditRecord, Logger};
use crate::plan::{ComponentClass, MigrationPlan, RestoreMode, StructureMapping};

const PREVIEW_MESSAGE: &str = "This is a preview. No changes have been made.";

/// Audit facts gathered while a request runs.
#[derive(Debug, Default)]
struct Trail {
    target_user: Option<String>,
    job_id: Option<Uuid>,
    detail: Option<String>,
    queued: bool,
}

impl Trail {
    fn user(&mut self, user: &str) {
        self.target_user = Some(user.to_string());
    }

    fn job(&mut self, job: &MigrationJob) {
        self.job_id = Some(job.id);
        self.target_user = Some(job.target_user.clone());
    }
}

pub struct MigrationAgent {
    ctx: EngineContext,
    pool: ApplyPool,
    approvals: ApprovalRegistry,
    audit: Arc<dyn AuditLog>,
    analyses: Mutex<Vec<JoinHandle<()>>>,
}

impl MigrationAgent {
    /// Agent with a fresh apply pool. Must be called inside a tokio runtime.
    pub fn new(ctx: EngineContext, audit: Arc<dyn AuditLog>) -> Self {
        let pool = ApplyPool::start(ctx.clone(), ctx.config.max_concurrent_applies);
        let approvals =
            ApprovalRegistry::new(ctx.config.approval_ttl(), ctx.config.confirmation_ttl());
        Self {
            ctx,
            pool,
            approvals,
            audit,
            analyses: Mutex::new(Vec::new()),
        }
    }

    /// Agent after startup recovery: interrupted jobs failed, approved jobs
    /// resubmitted in approval order, never-analyzed jobs analyzed.
    pub fn start(ctx: EngineContext, audit: Arc<dyn AuditLog>) -> AgentResult<Self> {
        let report = ctx.jobs.recover()?;
        let agent = Self::new(ctx, audit);
        for id in &report.requeued {
            agent.pool.submit(*id)?;
        }
        for id in &report.reanalyze {
            agent.track(spawn_analysis(agent.ctx.clone(), *id));
        }
        Ok(agent)
    }

    pub fn jobs(&self) -> &JobManager {
        &self.ctx.jobs
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn pool(&self) -> &ApplyPool {
        &self.pool
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut analyses) = self.analyses.lock() {
            analyses.retain(|h| !h.is_finished());
            analyses.push(handle);
        }
    }

    /// Wait for every spawned analysis to finish.
    pub async fn wait_for_analyses(&self) {
        let handles = match self.analyses.lock() {
            Ok(mut analyses) => std::mem::take(&mut *analyses),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Stop admitting applies and let running work finish.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.wait_for_analyses().await;
    }

    /// Handle one raw request line.
    pub async fn handle_line(&self, line: &str) -> Response {
        match AgentRequest::parse(line) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => self.reject_unparsed(&e),
        }
    }

    pub async fn handle_value(&self, value: Value) -> Response {
        match AgentRequest::from_value(value) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => self.reject_unparsed(&e),
        }
    }

    fn reject_unparsed(&self, err: &AgentError) -> Response {
        let operation = match err {
            AgentError::UnknownAction(action) => action.clone(),
            _ => "unparsed_request".to_string(),
        };
        self.write_audit(
            AuditRecord::new(operation, AuditOutcome::Rejected).with_detail(err.operator_message()),
        );
        Logger::warn(
            "AGENT_REQUEST_REJECTED",
            &[("code", err.code()), ("error", &err.to_string())],
        );
        Response::error(err)
    }

    /// Dispatch a parsed request.
    pub async fn handle(&self, envelope: Envelope) -> Response {
        self.approvals.cleanup_expired();
        let mut trail = Trail::default();

        let result = match envelope.request {
            AgentRequest::ValidateBackup(p) => self.validate_backup(p, &mut trail).await,
            AgentRequest::AnalyzeBackup(p) => {
                self.analyze_backup(p, envelope.operator.as_deref(), &mut trail)
            }
            AgentRequest::CreatePlan(p) => self.create_plan(p, &mut trail),
            AgentRequest::Preview(p) => self.preview(p, &mut trail),
            AgentRequest::Apply(p) => self.apply(p, &mut trail),
            AgentRequest::Validate(p) => self.validate_migration(p, &mut trail).await,
            AgentRequest::Rollback(p) => self.rollback(p, &mut trail).await,
            AgentRequest::SelectiveRestore(p) => {
                self.selective_restore(p, envelope.operator.as_deref(), &mut trail)
            }
            AgentRequest::ConfirmOverwrite(p) => self.confirm_overwrite(p, &mut trail),
            AgentRequest::JobStatus(p) => self.job_status(p, &mut trail),
            AgentRequest::JobLogs(p) => self.job_logs(p, &mut trail),
            AgentRequest::ListJobs(p) => self.list_jobs(p, &mut trail),
        };

        let (outcome, response) = match &result {
            Ok(body) if trail.queued => (AuditOutcome::Queued, Response::success(body)),
            Ok(body) => (AuditOutcome::Success, Response::success(body)),
            Err(e) if e.is_rejection() => (AuditOutcome::Rejected, Response::error(e)),
            Err(e) => (AuditOutcome::Failed, Response::error(e)),
        };

        let mut record = AuditRecord::new(envelope.action.clone(), outcome)
            .with_operator(envelope.operator.as_deref());
        if let Some(user) = trail.target_user.take() {
            record = record.with_target_user(user);
        }
        if let Some(id) = trail.job_id {
            record = record.with_job(id);
        }
        let detail = match &result {
            Ok(_) => trail.detail.take(),
            Err(e) => Some(e.operator_message()),
        };
        if let Some(detail) = detail {
            record = record.with_detail(detail);
        }
        self.write_audit(record);

        match &result {
            Ok(_) => Logger::info(
                "AGENT_REQUEST",
                &[("action", &envelope.action), ("outcome", outcome.as_str())],
            ),
            Err(e) => Logger::warn(
                "AGENT_REQUEST",
                &[
                    ("action", &envelope.action),
                    ("code", e.code()),
                    ("error", &e.to_string()),
                    ("outcome", outcome.as_str()),
                ],
            ),
        }
        response
    }

    fn write_audit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.append(&record) {
            Logger::error(
                "AUDIT_WRITE_FAILED",
                &[("error", &e.to_string()), ("operation", &record.operation)],
            );
        }
    }

    async fn validate_backup(&self, p: BackupParams, trail: &mut Trail) -> AgentResult<Value> {
        validate_username(&p.target_user)?;
        trail.user(&p.target_user);
        let path = validate_backup_path(&p.backup_path)?;

        let report = validate_backup(&self.ctx, &path, &p.target_user).await?;
        let warnings = report.warnings();
        let valid = report.is_valid();
        let message = if valid {
            "Backup is valid and ready for migration"
        } else {
            "Backup has warnings; review them before migrating"
        };
        trail.detail = Some(format!(
            "format={}, size={} bytes, valid={}",
            report.backup_format, report.backup_size, valid
        ));

        Ok(json!({
            "valid": valid,
            "backup_path": report.backup_path,
            "backup_format": report.backup_format,
            "backup_size": report.backup_size,
            "target_user": p.target_user,
            "disk_available": report.disk_available,
            "target_user_exists": report.target_user_exists,
            "missing_services": report.missing_services,
            "warning": warnings.first(),
            "warnings": warnings,
            "message": message,
        }))
    }

    fn analyze_backup(
        &self,
        p: AnalyzeParams,
        operator: Option<&str>,
        trail: &mut Trail,
    ) -> AgentResult<Value> {
        validate_username(&p.target_user)?;
        trail.user(&p.target_user);
        let path = validate_backup_path(&p.backup_path)?;
        check_file(&path, self.ctx.config.max_backup_size_bytes)?;

        let job = self.ctx.jobs.create(
            NewJob::full(path, &p.target_user)
                .dry_run(p.dry_run)
                .requested_by(operator),
        )?;
        trail.job(&job);
        trail.queued = true;
        self.track(spawn_analysis(self.ctx.clone(), job.id));

        Ok(json!({
            "job_id": job.id,
            "status": job.status,
            "dry_run": job.dry_run,
            "message": "Backup analysis queued",
            "next_action": "Poll migration_job_status until the plan is ready, then call migration_create_plan",
        }))
    }

    fn analyzed_job(&self, job_id: Uuid, trail: &mut Trail) -> AgentResult<(MigrationJob, MigrationPlan)> {
        let job = self.ctx.jobs.get(job_id)?;
        trail.job(&job);
        let plan = load_plan(&job)?;
        Ok((job, plan))
    }

    fn create_plan(&self, p: JobParams, trail: &mut Trail) -> AgentResult<Value> {
        let (job, plan) = self.analyzed_job(p.job_id, trail)?;
        let mapping = StructureMapping::build(&plan, &job.components, job.effective_mode());
        let summary = plan.summary();
        let blocking = blocking_conflicts(&job, job.overwrite_existing)?;

        Ok(json!({
            "job_id": job.id,
            "plan": {
                "target_user": plan.target_user,
                "source_user": plan.source_user,
                "backup_format": plan.backup_format,
                "backup_version": plan.backup_version,
                "backup_date": plan.backup_date,
                "total_size": plan.total_size,
                "domains_count": summary.domains,
                "email_count": summary.email_accounts,
                "database_count": summary.databases,
                "dns_zones_count": summary.dns_zones,
                "ssl_certs_count": summary.ssl_certificates,
                "domains": plan.domains,
                "email_accounts": plan.email_accounts,
                "databases": plan.databases,
                "dns_zones": plan.dns_zones,
                "ssl_certificates": plan.ssl_certificates,
                "warnings": plan.warnings,
                "conflicts": plan.conflicts,
                "skip_reasons": plan.skip_reasons,
            },
            "mapping": mapping,
            "blocking_conflicts": blocking,
            "requires_confirmation": true,
        }))
    }

    fn preview(&self, p: JobParams, trail: &mut Trail) -> AgentResult<Value> {
        let (job, plan) = self.analyzed_job(p.job_id, trail)?;
        if !job.is_awaiting_approval() {
            return Err(crate::job::JobError::invalid_state(job.id, job.status, "preview").into());
        }

        let simulation = simulate(&job, &plan);
        let mut body = json!({
            "job_id": job.id,
            "simulation": simulation,
            "dry_run": true,
            "message": PREVIEW_MESSAGE,
        });

        if job.dry_run {
            body["next_action"] =
                json!("Dry-run job: analyze again without dry_run to apply this backup");
        } else {
            let issued = self.approvals.issue_apply(job.id)?;
            body["approval_token"] = json!(issued.token);
            body["approval_expires_in_secs"] = json!(issued.expires_in.as_secs());
            body["next_action"] =
                json!("Call migration_apply with job_id and approval_token to proceed");
            trail.detail = Some("approval token issued".to_string());
        }
        Ok(body)
    }

    fn apply(&self, p: ApplyParams, trail: &mut Trail) -> AgentResult<Value> {
        let job = self.ctx.jobs.check_approvable(p.job_id)?;
        trail.job(&job);

        let blocking = blocking_conflicts(&job, p.overwrite_existing)?;
        if !blocking.is_empty() {
            return Err(EngineError::Blocked {
                count: blocking.len(),
                subjects: blocking.iter().map(|c| c.subject.clone()).collect(),
            }
            .into());
        }

        if !self.pool.is_accepting() {
            return Err(EngineError::PoolClosed.into());
        }

        self.approvals.consume(
            &p.approval_token,
            &TokenPurpose::Apply { job_id: job.id },
        )?;
        let job = self.ctx.jobs.approve(job.id, p.overwrite_existing)?;
        if let Err(e) = self.pool.submit(job.id) {
            self.ctx.jobs.withdraw_approval(job.id)?;
            return Err(e.into());
        }
        trail.queued = true;
        trail.detail = Some(format!("overwrite_existing={}", p.overwrite_existing));

        Ok(json!({
            "job_id": job.id,
            "apply_job_id": job.id,
            "status": job.status,
            "queued": job.queued,
            "overwrite_existing": job.overwrite_existing,
            "message": "Migration apply queued",
            "check_progress": "migration_job_status",
        }))
    }

    async fn validate_migration(&self, p: TargetParams, trail: &mut Trail) -> AgentResult<Value> {
        validate_username(&p.target_user)?;
        trail.user(&p.target_user);

        let facts = self
            .ctx
            .services
            .identity
            .verify_account(&p.target_user)
            .await?;
        let valid = facts.exists && facts.home_exists && facts.ownership_ok;
        trail.detail = Some(format!("valid={}", valid));

        Ok(json!({
            "target_user": p.target_user,
            "valid": valid,
            "checks": {
                "user_exists": facts.exists,
                "home_dir_exists": facts.home_exists,
                "permissions_correct": facts.ownership_ok,
            },
        }))
    }

    async fn rollback(&self, p: JobParams, trail: &mut Trail) -> AgentResult<Value> {
        let job = self.ctx.jobs.get(p.job_id)?;
        trail.job(&job);

        let done = run_rollback(&self.ctx, job.id).await?;
        Ok(json!({
            "job_id": done.id,
            "target_user": done.target_user,
            "status": done.status,
            "message": "Migration rolled back successfully",
        }))
    }

    fn selective_restore(
        &self,
        p: SelectiveParams,
        operator: Option<&str>,
        trail: &mut Trail,
    ) -> AgentResult<Value> {
        validate_username(&p.target_user)?;
        trail.user(&p.target_user);
        let path = validate_backup_path(&p.backup_path)?;
        let mode = p.restore_mode()?;
        let components = p.components.to_set()?;
        check_file(&path, self.ctx.config.max_backup_size_bytes)?;

        if mode == RestoreMode::Overwrite {
            let token = p
                .confirmation_token
                .as_deref()
                .ok_or(AgentError::ConfirmationRequired)?;
            self.approvals.consume(
                token,
                &TokenPurpose::Overwrite {
                    target_user: p.target_user.clone(),
                },
            )?;
        }

        let job = self.ctx.jobs.create(
            NewJob::selective(path, &p.target_user, components.clone(), mode)
                .dry_run(p.dry_run)
                .requested_by(operator),
        )?;
        trail.job(&job);
        trail.queued = true;
        trail.detail = Some(format!(
            "mode={}, components={}",
            mode.as_str(),
            components.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(",")
        ));
        self.track(spawn_analysis(self.ctx.clone(), job.id));

        Ok(json!({
            "job_id": job.id,
            "status": job.status,
            "mode": mode,
            "components": components,
            "message": "Selective restore job queued",
            "next_action": "Review with migration_create_plan and migration_preview, then call migration_apply",
        }))
    }

    fn confirm_overwrite(&self, p: ConfirmOverwriteParams, trail: &mut Trail) -> AgentResult<Value> {
        validate_username(&p.target_user)?;
        trail.user(&p.target_user);
        if p.confirm != p.target_user {
            return Err(AgentError::parameter(
                "confirm",
                "must repeat target_user exactly",
            ));
        }

        let issued = self.approvals.issue_overwrite(&p.target_user)?;
        trail.detail = Some("overwrite confirmation issued".to_string());
        Ok(json!({
            "target_user": p.target_user,
            "confirmation_token": issued.token,
            "expires_in_secs": issued.expires_in.as_secs(),
            "message": "Pass confirmation_token to migration_selective_restore with mode=overwrite",
        }))
    }

    fn job_status(&self, p: JobParams, trail: &mut Trail) -> AgentResult<Value> {
        let job = self.ctx.jobs.get(p.job_id)?;
        trail.job(&job);
        Ok(status_body(&job))
    }

    fn job_logs(&self, p: JobParams, trail: &mut Trail) -> AgentResult<Value> {
        let job = self.ctx.jobs.get(p.job_id)?;
        trail.job(&job);
        let logs = self.ctx.jobs.read_log(job.id)?;
        Ok(json!({
            "job_id": job.id,
            "logs": logs,
        }))
    }

    fn list_jobs(&self, p: ListParams, trail: &mut Trail) -> AgentResult<Value> {
        if let Some(user) = &p.target_user {
            validate_username(user)?;
            trail.user(user);
        }
        let filter = JobFilter {
            status: p.status,
            target_user: p.target_user,
        };
        let jobs: Vec<Value> = self.ctx.jobs.list(&filter)?.iter().map(status_body).collect();
        Ok(json!({
            "count": jobs.len(),
            "jobs": jobs,
        }))
    }
}

fn status_body(job: &MigrationJob) -> Value {
    json!({
        "job_id": job.id,
        "kind": job.kind.as_str(),
        "status": job.status,
        "progress": job.progress,
        "current_step": job.current_step,
        "error_message": job.error.clone().unwrap_or_default(),
        "failed_step": job.failed_step,
        "source_type": job.source_type,
        "target_user": job.target_user,
        "dry_run": job.dry_run,
        "components": job.components,
        "mode": job.mode,
        "queued": job.queued,
        "rollback_in_progress": job.rollback_in_progress,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
        "started_at": job.started_at,
        "finished_at": job.finished_at,
    })
}

/// What an apply would do, computed from the plan alone.
fn simulate(job: &MigrationJob, plan: &MigrationPlan) -> Value {
    let selected = |class: ComponentClass| job.components.contains(class);
    let mapping = StructureMapping::build(plan, &job.components, job.effective_mode());

    let domains: Vec<&str> = if selected(ComponentClass::Files) {
        plan.domains.iter().map(|d| d.name.as_str()).collect()
    } else {
        Vec::new()
    };
    let databases: Vec<String> = if selected(ComponentClass::Databases) {
        plan.databases.iter().map(|d| mapping.database(&d.name)).collect()
    } else {
        Vec::new()
    };
    let mailboxes: Vec<&str> = if selected(ComponentClass::Email) {
        plan.email_accounts.iter().map(|m| m.address.as_str()).collect()
    } else {
        Vec::new()
    };
    let zones: Vec<&str> = if selected(ComponentClass::Dns) {
        plan.dns_zones.iter().map(|z| z.zone_name.as_str()).collect()
    } else {
        Vec::new()
    };
    let certificates: Vec<&str> = if selected(ComponentClass::Ssl) {
        plan.installable_certificates().map(|c| c.domain.as_str()).collect()
    } else {
        Vec::new()
    };
    let steps: Vec<&str> = ApplyStep::selected(&job.components)
        .iter()
        .map(|s| s.label())
        .collect();
    let blocking = blocking_conflicts(job, job.overwrite_existing).unwrap_or_default();

    json!({
        "target_user": job.target_user,
        "mode": job.effective_mode(),
        "components": job.components,
        "steps": steps,
        "would_create": {
            "account": job.target_user,
            "domains": domains,
            "databases": databases,
            "email_accounts": mailboxes,
            "dns_zones": zones,
            "ssl_certificates": certificates,
        },
        "estimated_duration_secs": estimate_duration(plan).as_secs(),
        "warnings": plan.warnings,
        "conflicts": plan.conflicts,
        "blocking_conflicts": blocking,
        "skip_reasons": plan.skip_reasons,
    })
}

/// Rough apply time at ~50 MiB/s plus a fixed cost per restored item.
fn estimate_duration(plan: &MigrationPlan) -> Duration {
    let summary = plan.summary();
    let items = summary.domains
        + summary.email_accounts
        + summary.databases
        + summary.dns_zones
        + summary.ssl_certificates;
    Duration::from_secs(plan.total_size / (50 * 1024 * 1024) + 2 * items as u64 + 5)
}
