//! Rollback engine
//!
//! Reverses what a job's ledger says it created, newest component first:
//! certificates, DNS zones, mailboxes, databases, the directory tree and
//! domain registrations, then the account itself when the job created it.
//!
//! Every component is attempted even after a failure. Whatever could not be
//! reversed stays in the ledger so a later rollback can pick it up.

use uuid::Uuid;

use super::{EngineContext, EngineError, EngineResult};
use crate::job::{MigrationJob, RestoreLedger};
use crate::observability::{Logger, Severity};
use crate::services::{RestoreServices, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerItem {
    Certificate,
    DnsZone,
    Mailbox,
    Database,
}

impl LedgerItem {
    fn component(&self) -> &'static str {
        match self {
            LedgerItem::Certificate => "certificates",
            LedgerItem::DnsZone => "dns zones",
            LedgerItem::Mailbox => "mailboxes",
            LedgerItem::Database => "databases",
        }
    }

    fn items<'l>(&self, ledger: &'l mut RestoreLedger) -> &'l mut Vec<String> {
        match self {
            LedgerItem::Certificate => &mut ledger.certificates,
            LedgerItem::DnsZone => &mut ledger.dns_zones,
            LedgerItem::Mailbox => &mut ledger.mailboxes,
            LedgerItem::Database => &mut ledger.databases,
        }
    }

    async fn remove(&self, services: &RestoreServices, name: &str) -> ServiceResult<()> {
        match self {
            LedgerItem::Certificate => services.certificates.remove_certificate(name).await,
            LedgerItem::DnsZone => services.dns.remove_zone(name).await,
            LedgerItem::Mailbox => services.mailboxes.remove_mailbox(name).await,
            LedgerItem::Database => services.databases.drop_database(name).await,
        }
    }
}

const ORDER: [LedgerItem; 4] = [
    LedgerItem::Certificate,
    LedgerItem::DnsZone,
    LedgerItem::Mailbox,
    LedgerItem::Database,
];

struct Reversal<'a> {
    ctx: &'a EngineContext,
    job: &'a MigrationJob,
    remaining: RestoreLedger,
    failed: Vec<String>,
}

impl<'a> Reversal<'a> {
    fn record_failure(&mut self, component: &str, subject: &str, error: &dyn std::fmt::Display) {
        Logger::error(
            "ROLLBACK_ITEM_FAILED",
            &[
                ("component", component),
                ("error", &error.to_string()),
                ("job_id", &self.job.id.to_string()),
                ("subject", subject),
            ],
        );
        self.ctx.jobs.note(
            self.job,
            Severity::Error,
            &format!("could not reverse {} {}", component, subject),
        );
        if !self.failed.iter().any(|c| c == component) {
            self.failed.push(component.to_string());
        }
    }

    async fn reverse_items(&mut self, kind: LedgerItem) {
        let names: Vec<String> = kind.items(&mut self.remaining).clone();
        let mut kept = Vec::new();
        for name in names.iter().rev() {
            match kind.remove(&self.ctx.services, name).await {
                Ok(()) => self.ctx.jobs.note(
                    self.job,
                    Severity::Info,
                    &format!("reversed {} {}", kind.component(), name),
                ),
                Err(e) => {
                    self.record_failure(kind.component(), name, &e);
                    kept.push(name.clone());
                }
            }
        }
        kept.reverse();
        *kind.items(&mut self.remaining) = kept;
    }

    async fn reverse_tree(&mut self) {
        if self.remaining.directories.is_empty() && self.remaining.domains.is_empty() {
            return;
        }
        let result = self
            .ctx
            .services
            .filesystem
            .remove_tree(
                &self.job.target_user,
                &self.remaining.directories,
                &self.remaining.domains,
            )
            .await;
        match result {
            Ok(()) => {
                self.remaining.directories.clear();
                self.remaining.domains.clear();
                self.ctx
                    .jobs
                    .note(self.job, Severity::Info, "reversed directory tree");
            }
            Err(e) => {
                let job = self.job;
                self.record_failure("directory tree", &job.target_user, &e);
            }
        }
    }

    async fn reverse_identity(&mut self) {
        if !self.remaining.identity_created {
            return;
        }
        match self
            .ctx
            .services
            .identity
            .remove_account(&self.job.target_user)
            .await
        {
            Ok(()) => {
                self.remaining.identity_created = false;
                self.ctx
                    .jobs
                    .note(self.job, Severity::Info, "removed target account");
            }
            Err(e) => {
                let job = self.job;
                self.record_failure("identity", &job.target_user, &e);
            }
        }
    }
}

/// Roll back a complete or failed job.
pub async fn run_rollback(ctx: &EngineContext, job_id: Uuid) -> EngineResult<MigrationJob> {
    let job = ctx.jobs.begin_rollback(job_id)?;
    Logger::info(
        "ROLLBACK_STARTED",
        &[
            ("job_id", &job_id.to_string()),
            ("status", job.status.as_str()),
            ("target_user", &job.target_user),
        ],
    );

    let mut reversal = Reversal {
        ctx,
        job: &job,
        remaining: job.ledger.clone(),
        failed: Vec::new(),
    };
    for kind in ORDER {
        reversal.reverse_items(kind).await;
    }
    reversal.reverse_tree().await;
    reversal.reverse_identity().await;

    let Reversal {
        remaining, failed, ..
    } = reversal;

    if failed.is_empty() {
        let done = ctx.jobs.finish_rollback(job_id, remaining, None)?;
        Logger::info(
            "ROLLBACK_COMPLETE",
            &[("job_id", &job_id.to_string()), ("target_user", &done.target_user)],
        );
        return Ok(done);
    }

    let message = format!("rollback incomplete, could not reverse: {}", failed.join(", "));
    ctx.jobs.finish_rollback(job_id, remaining, Some(&message))?;
    Logger::error(
        "ROLLBACK_INCOMPLETE",
        &[("components", &failed.join(",")), ("job_id", &job_id.to_string())],
    );
    Err(EngineError::Rollback { components: failed })
}
