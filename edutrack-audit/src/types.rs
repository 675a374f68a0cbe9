//! Common types for the edutrack-audit crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::hasher::Digest;

/// Reference to a domain entity owned by the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectRef {
    /// Entity kind, e.g. `student` or `student_progress`
    pub kind: String,
    /// Entity id as the CRUD layer knows it
    pub id: String,
}

impl SubjectRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// What kind of change an audit record attests to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Profile,
    Progress,
    Achievement,
    Voice,
    Assignment,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Profile => "profile",
            RecordKind::Progress => "progress",
            RecordKind::Achievement => "achievement",
            RecordKind::Voice => "voice",
            RecordKind::Assignment => "assignment",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(RecordKind::Profile),
            "progress" => Ok(RecordKind::Progress),
            "achievement" => Ok(RecordKind::Achievement),
            "voice" => Ok(RecordKind::Voice),
            "assignment" => Ok(RecordKind::Assignment),
            other => Err(format!("unknown record kind: {}", other)),
        }
    }
}

/// Which ledger issued a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerOrigin {
    Remote,
    Simulated,
}

impl LedgerOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOrigin::Remote => "remote",
            LedgerOrigin::Simulated => "simulated",
        }
    }
}

impl fmt::Display for LedgerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote" => Ok(LedgerOrigin::Remote),
            "simulated" => Ok(LedgerOrigin::Simulated),
            other => Err(format!("unknown ledger origin: {}", other)),
        }
    }
}

/// Metadata carried alongside a digest on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionMetadata {
    pub subject: SubjectRef,
    pub kind: RecordKind,
}

/// A ledger's acknowledgment of a submitted digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Ledger-assigned unique id (transaction hash or simulated id)
    pub receipt_id: String,
    /// Digest the ledger acknowledged
    pub digest: Digest,
    /// Ledger position, monotonic within one ledger
    pub sequence_number: u64,
    /// When the submission was made
    pub submitted_at: DateTime<Utc>,
    /// Whether an external ledger confirmed the submission
    pub confirmed: bool,
    /// Which ledger issued the receipt
    pub origin: LedgerOrigin,
}

/// An audit record before the store assigns identity and chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditRecord {
    pub subject: SubjectRef,
    pub kind: RecordKind,
    pub digest: Digest,
    pub receipt: Receipt,
}

/// An entry in the append-only audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record ID
    pub id: String,
    /// Subject this record attests to
    pub subject: SubjectRef,
    /// Kind of change recorded
    pub kind: RecordKind,
    /// Digest of the snapshot at record time
    pub digest: Digest,
    /// Ledger receipt for the digest
    pub receipt: Receipt,
    /// When the record was appended
    pub created_at: DateTime<Utc>,
    /// Chain hash of the previous record for this subject
    pub prev_hash: String,
    /// Chain hash of this record
    pub chain_hash: String,
}

impl AuditRecord {
    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            digest: self.digest.clone(),
            receipt_id: self.receipt.receipt_id.clone(),
            sequence_number: self.receipt.sequence_number,
            created_at: self.created_at,
            confirmed: self.receipt.confirmed,
        }
    }
}

/// Outbound view of one audit record, as exposed to the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub digest: Digest,
    pub receipt_id: String,
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
    pub confirmed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_kind_round_trips_through_str() {
        for kind in [
            RecordKind::Profile,
            RecordKind::Progress,
            RecordKind::Achievement,
            RecordKind::Voice,
            RecordKind::Assignment,
        ] {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert!("grades".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_subject_display() {
        let subject = SubjectRef::new("student_progress", "17");
        assert_eq!(subject.to_string(), "student_progress/17");
    }
}
