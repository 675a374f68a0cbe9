//! Core trait for ledger clients.
//!
//! This module defines the `LedgerClient` trait - the capability the
//! integrity service uses to anchor digests outside the local database.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::hasher::Digest;
use crate::types::{LedgerOrigin, Receipt, SubmissionMetadata};

/// Error types for ledger operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// Node could not be reached (connection refused, timeout)
    #[error("Ledger unreachable: {0}")]
    Unreachable(String),

    /// Node refused the transaction (insufficient funds, bad nonce, revert)
    #[error("Ledger rejected submission: {0}")]
    Rejected(String),

    /// Node answered with something we could not interpret
    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),
}

impl LedgerError {
    /// Whether the failure is transient and eligible for the simulated fallback.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, LedgerError::Unreachable(_))
    }
}

/// Reachability and network information for a ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    /// Whether the ledger answered
    pub reachable: bool,
    /// Latest block height / sequence position
    pub height: Option<u64>,
    /// Chain id reported by the node
    pub chain_id: Option<u64>,
    /// Account submissions are sent from
    pub account: Option<String>,
}

impl LedgerStatus {
    pub fn unreachable() -> Self {
        Self::default()
    }
}

/// Capability for anchoring digests on a ledger.
///
/// Implementations never retry internally; the integrity service owns retry
/// and fallback policy.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Which ledger family this client talks to.
    fn origin(&self) -> LedgerOrigin;

    /// Submit a digest. May block on network I/O.
    async fn submit(
        &self,
        digest: &Digest,
        metadata: &SubmissionMetadata,
    ) -> Result<Receipt, LedgerError>;

    /// Whether a submission of this digest was accepted by the ledger but has
    /// not produced a receipt yet. Submitting it again resumes that submission.
    fn has_pending(&self, _digest: &Digest, _metadata: &SubmissionMetadata) -> bool {
        false
    }

    /// Look up a receipt by id. `Ok(None)` means the ledger does not know it.
    async fn query(&self, receipt_id: &str) -> Result<Option<Receipt>, LedgerError>;

    /// Report reachability and chain position.
    async fn status(&self) -> LedgerStatus;
}
