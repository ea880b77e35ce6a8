//! Apply steps, in execution order

use std::fmt;

use crate::plan::{ComponentClass, ComponentSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyStep {
    PrepareContent,
    CreateIdentity,
    CreateTree,
    RestoreHome,
    RestoreDatabases,
    RestoreMailboxes,
    RestoreDnsZones,
    RestoreCertificates,
    Verify,
}

impl ApplyStep {
    pub const ALL: [ApplyStep; 9] = [
        ApplyStep::PrepareContent,
        ApplyStep::CreateIdentity,
        ApplyStep::CreateTree,
        ApplyStep::RestoreHome,
        ApplyStep::RestoreDatabases,
        ApplyStep::RestoreMailboxes,
        ApplyStep::RestoreDnsZones,
        ApplyStep::RestoreCertificates,
        ApplyStep::Verify,
    ];

    /// Label recorded as the job's `current_step`.
    pub fn label(&self) -> &'static str {
        match self {
            ApplyStep::PrepareContent => "prepare backup content",
            ApplyStep::CreateIdentity => "create target identity",
            ApplyStep::CreateTree => "create directory tree",
            ApplyStep::RestoreHome => "restore home directory",
            ApplyStep::RestoreDatabases => "restore databases",
            ApplyStep::RestoreMailboxes => "restore mailboxes",
            ApplyStep::RestoreDnsZones => "restore DNS zones",
            ApplyStep::RestoreCertificates => "restore certificates",
            ApplyStep::Verify => "post-restore verification",
        }
    }

    /// Component class gating the step; `None` means it always runs.
    pub fn component(&self) -> Option<ComponentClass> {
        match self {
            ApplyStep::RestoreHome => Some(ComponentClass::Files),
            ApplyStep::RestoreDatabases => Some(ComponentClass::Databases),
            ApplyStep::RestoreMailboxes => Some(ComponentClass::Email),
            ApplyStep::RestoreDnsZones => Some(ComponentClass::Dns),
            ApplyStep::RestoreCertificates => Some(ComponentClass::Ssl),
            _ => None,
        }
    }

    pub fn runs_for(&self, components: &ComponentSet) -> bool {
        self.component().map_or(true, |c| components.contains(c))
    }

    /// Progress reported when the step starts, spread over 50..=95.
    pub fn progress(&self) -> u8 {
        let idx = Self::ALL.iter().position(|s| s == self).unwrap_or(0) as u32;
        let last = (Self::ALL.len() - 1) as u32;
        (50 + idx * 45 / last) as u8
    }

    /// Steps that would run for a component selection.
    pub fn selected(components: &ComponentSet) -> Vec<ApplyStep> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.runs_for(components))
            .collect()
    }
}

impl fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
