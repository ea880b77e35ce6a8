//! Migration job state machine
//!
//! - States are explicit and enumerable
//! - Forward order: pending, validating, extracting, planning, applying,
//!   verifying, complete
//! - `failed` is reachable from validating onward
//! - `rolled_back` only from complete or failed, and only via rollback
//! - A complete job whose rollback fails moves to failed
//! - Awaiting approval is implicit: planning with a plan attached
//!
//! Restart semantics:
//! - pending, planning: kept as-is
//! - validating, extracting, applying, verifying: marked failed
//! - complete, failed, rolled_back: kept as-is

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Validating,
    Extracting,
    Planning,
    Applying,
    Verifying,
    Complete,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Validating => "validating",
            MigrationStatus::Extracting => "extracting",
            MigrationStatus::Planning => "planning",
            MigrationStatus::Applying => "applying",
            MigrationStatus::Verifying => "verifying",
            MigrationStatus::Complete => "complete",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Extracting)
                | (Extracting, Planning)
                | (Planning, Applying)
                | (Applying, Verifying)
                | (Verifying, Complete)
                | (Validating | Extracting | Planning | Applying | Verifying, Failed)
                | (Complete, Failed)
                | (Complete | Failed, RolledBack)
        )
    }

    /// A worker or analyzer was running when the agent stopped.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Validating
                | MigrationStatus::Extracting
                | MigrationStatus::Applying
                | MigrationStatus::Verifying
        )
    }

    /// Rollback is accepted only from these states.
    pub fn is_rollback_eligible(&self) -> bool {
        matches!(self, MigrationStatus::Complete | MigrationStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Complete | MigrationStatus::Failed | MigrationStatus::RolledBack
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress checkpoints.
pub mod progress {
    pub const VALIDATING: u8 = 10;
    pub const EXTRACTING: u8 = 25;
    pub const PLANNING: u8 = 40;
    pub const AWAITING_APPROVAL: u8 = 50;
    pub const APPLY_START: u8 = 50;
    pub const APPLY_END: u8 = 95;
    pub const COMPLETE: u8 = 100;
}

#[cfg(test)]
mod tests {
    use super::*;
    use MigrationStatus::*;

    const ALL: [MigrationStatus; 9] = [
        Pending, Validating, Extracting, Planning, Applying, Verifying, Complete, Failed,
        RolledBack,
    ];

    #[test]
    fn test_forward_chain() {
        let chain = [Pending, Validating, Extracting, Planning, Applying, Verifying, Complete];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_skipping_or_regression() {
        assert!(!Pending.can_transition_to(Planning));
        assert!(!Planning.can_transition_to(Complete));
        assert!(!Applying.can_transition_to(Planning));
        assert!(!Complete.can_transition_to(Applying));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn test_rolled_back_only_from_complete_or_failed() {
        for status in ALL {
            assert_eq!(
                status.can_transition_to(RolledBack),
                matches!(status, Complete | Failed),
                "{}",
                status
            );
        }
        assert!(!RolledBack.can_transition_to(Failed));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&RolledBack).unwrap(), "\"rolled_back\"");
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }
}
