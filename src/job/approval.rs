//! Approval and overwrite-confirmation tokens
//!
//! - Explicit, contemporaneous, specific, not reusable
//! - 32 random bytes, URL-safe base64; only the SHA-256 digest is retained
//! - Compared in constant time
//! - Apply approvals are bound to one job, overwrite confirmations to one
//!   target user
//! - A token presented for the wrong purpose is rejected and stays usable
//!
//! Tokens live in memory only and do not survive an agent restart.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::errors::{JobError, JobResult};

/// What a token authorizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPurpose {
    /// Move one analyzed job into the apply queue.
    Apply { job_id: Uuid },
    /// Destructive replacement of one account's existing data.
    Overwrite { target_user: String },
}

impl TokenPurpose {
    fn label(&self) -> &'static str {
        match self {
            TokenPurpose::Apply { .. } => "approval",
            TokenPurpose::Overwrite { .. } => "overwrite confirmation",
        }
    }
}

/// A freshly issued token. The raw value is never stored.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
}

#[derive(Debug)]
struct PendingToken {
    digest: [u8; 32],
    purpose: TokenPurpose,
    issued_at: Instant,
    ttl: Duration,
}

impl PendingToken {
    fn is_expired(&self) -> bool {
        self.issued_at.elapsed() > self.ttl
    }
}

fn generate() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[derive(Debug)]
pub struct ApprovalRegistry {
    pending: Mutex<Vec<PendingToken>>,
    apply_ttl: Duration,
    overwrite_ttl: Duration,
}

impl ApprovalRegistry {
    pub fn new(apply_ttl: Duration, overwrite_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            apply_ttl,
            overwrite_ttl,
        }
    }

    /// Issue an apply approval for a job, replacing earlier ones for it.
    pub fn issue_apply(&self, job_id: Uuid) -> JobResult<IssuedToken> {
        self.issue(TokenPurpose::Apply { job_id }, self.apply_ttl)
    }

    pub fn issue_overwrite(&self, target_user: &str) -> JobResult<IssuedToken> {
        self.issue(
            TokenPurpose::Overwrite {
                target_user: target_user.to_string(),
            },
            self.overwrite_ttl,
        )
    }

    fn issue(&self, purpose: TokenPurpose, ttl: Duration) -> JobResult<IssuedToken> {
        let token = generate();
        let mut pending = self.pending.lock().map_err(|_| JobError::LockPoisoned)?;
        pending.retain(|p| !p.is_expired() && p.purpose != purpose);
        pending.push(PendingToken {
            digest: digest(&token),
            purpose,
            issued_at: Instant::now(),
            ttl,
        });
        Ok(IssuedToken {
            token,
            expires_in: ttl,
        })
    }

    /// Verify and consume a token for `purpose`.
    pub fn consume(&self, token: &str, purpose: &TokenPurpose) -> JobResult<()> {
        let presented = digest(token);
        let mut pending = self.pending.lock().map_err(|_| JobError::LockPoisoned)?;

        let mut found = None;
        for (idx, p) in pending.iter().enumerate() {
            if bool::from(p.digest.ct_eq(&presented)) {
                found = Some(idx);
            }
        }
        let Some(idx) = found else {
            return Err(JobError::TokenRejected(format!(
                "{} token is invalid or already used",
                purpose.label()
            )));
        };

        if pending[idx].is_expired() {
            pending.remove(idx);
            return Err(JobError::TokenRejected(format!(
                "{} token has expired",
                purpose.label()
            )));
        }
        if &pending[idx].purpose != purpose {
            return Err(JobError::TokenRejected(format!(
                "{} token was not issued for this request",
                purpose.label()
            )));
        }

        pending.remove(idx);
        Ok(())
    }

    /// Drop expired tokens.
    pub fn cleanup_expired(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|p| !p.is_expired());
        }
    }
}
