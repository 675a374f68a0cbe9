//! Append-only audit store.
//!
//! Handles:
//! - Persisting one audit record per successful `record()` call
//! - Per-subject hash chains over the records
//! - Consistency checks on append (monotonic sequence, single ledger origin)
//! - Operator halts for subjects whose history failed a consistency check
//!
//! Records are never updated or deleted. The store exposes no operation that
//! could do either, and the SQLite backend refuses such statements at the
//! schema level.

pub mod memory;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::Utc;

use crate::hasher::sha256_hex;
use crate::types::{AuditRecord, LedgerOrigin, NewAuditRecord, Receipt, SubjectRef};

pub use memory::MemoryAuditStore;
pub use sqlite::SqliteAuditStore;

/// Chain hash preceding the first record of every subject.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Error types for audit store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Consistency violation for {subject}: {reason}")]
    ConsistencyViolation { subject: String, reason: String },

    #[error("Subject {subject} is halted pending operator review: {reason}")]
    SubjectHalted { subject: String, reason: String },

    #[error("Receipt already recorded: {0}")]
    DuplicateReceipt(String),

    #[error("Corrupt audit row: {0}")]
    Corrupt(String),
}

/// Append-only log of audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a record, assigning id, creation time and chain position.
    ///
    /// A consistency violation halts the subject before the error is returned.
    async fn append(&self, record: NewAuditRecord) -> Result<AuditRecord, StoreError>;

    /// Most recent record for a subject.
    async fn latest(&self, subject: &SubjectRef) -> Result<Option<AuditRecord>, StoreError>;

    /// All records for a subject, oldest first.
    async fn history(&self, subject: &SubjectRef) -> Result<Vec<AuditRecord>, StoreError>;

    /// Reverse lookup by ledger receipt id.
    async fn find_by_receipt(&self, receipt_id: &str) -> Result<Option<AuditRecord>, StoreError>;

    /// Every stored receipt issued by the given ledger, oldest first.
    async fn receipts_by_origin(&self, origin: LedgerOrigin) -> Result<Vec<Receipt>, StoreError>;

    /// Halt reason, if the subject is halted.
    async fn halt_reason(&self, subject: &SubjectRef) -> Result<Option<String>, StoreError>;

    /// Stop accepting appends for a subject.
    async fn halt(&self, subject: &SubjectRef, reason: &str) -> Result<(), StoreError>;

    /// Clear an operator halt. Returns whether the subject was halted.
    async fn release(&self, subject: &SubjectRef) -> Result<bool, StoreError>;
}

/// Chain hash linking a record to its predecessor.
pub fn chain_hash(prev_hash: &str, receipt: &Receipt) -> String {
    let sequence = receipt.sequence_number.to_string();
    sha256_hex([
        prev_hash.as_bytes(),
        b"|",
        receipt.digest.as_str().as_bytes(),
        b"|",
        receipt.receipt_id.as_bytes(),
        b"|",
        sequence.as_bytes(),
        b"|",
        receipt.origin.as_str().as_bytes(),
    ])
}

/// Reject appends that would break a subject's history.
pub(crate) fn check_append(
    latest: Option<&AuditRecord>,
    record: &NewAuditRecord,
) -> Result<(), String> {
    if record.digest != record.receipt.digest {
        return Err(format!(
            "receipt {} acknowledges digest {} but record carries {}",
            record.receipt.receipt_id, record.receipt.digest, record.digest
        ));
    }

    let Some(latest) = latest else {
        return Ok(());
    };

    if latest.receipt.origin != record.receipt.origin {
        return Err(format!(
            "history is anchored on the {} ledger, refusing a {} receipt",
            latest.receipt.origin, record.receipt.origin
        ));
    }

    if record.receipt.sequence_number <= latest.receipt.sequence_number {
        return Err(format!(
            "sequence number {} does not follow {}",
            record.receipt.sequence_number, latest.receipt.sequence_number
        ));
    }

    Ok(())
}

/// Materialise a new record on top of its predecessor.
pub(crate) fn build_record(latest: Option<&AuditRecord>, record: NewAuditRecord) -> AuditRecord {
    let prev_hash = latest
        .map(|r| r.chain_hash.clone())
        .unwrap_or_else(|| GENESIS_HASH.to_string());
    let chain_hash = chain_hash(&prev_hash, &record.receipt);

    AuditRecord {
        id: uuid::Uuid::new_v4().to_string(),
        subject: record.subject,
        kind: record.kind,
        digest: record.digest,
        receipt: record.receipt,
        created_at: Utc::now(),
        prev_hash,
        chain_hash,
    }
}
