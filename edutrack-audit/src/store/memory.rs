//! In-memory audit store for tests and ephemeral deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

use super::{build_record, check_append, AuditStore, StoreError};
use crate::types::{AuditRecord, LedgerOrigin, NewAuditRecord, Receipt, SubjectRef};

#[derive(Default)]
struct MemoryState {
    /// Records per subject, oldest first
    by_subject: HashMap<SubjectRef, Vec<AuditRecord>>,
    /// Receipt id → subject
    by_receipt: HashMap<String, SubjectRef>,
    /// Halted subjects and why
    halted: HashMap<SubjectRef, String>,
}

/// Audit store holding everything in process memory.
#[derive(Default)]
pub struct MemoryAuditStore {
    state: RwLock<MemoryState>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all subjects.
    pub async fn count(&self) -> usize {
        let state = self.state.read().await;
        state.by_subject.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: NewAuditRecord) -> Result<AuditRecord, StoreError> {
        let mut state = self.state.write().await;
        let subject = record.subject.clone();

        if let Some(reason) = state.halted.get(&subject) {
            return Err(StoreError::SubjectHalted {
                subject: subject.to_string(),
                reason: reason.clone(),
            });
        }

        if state.by_receipt.contains_key(&record.receipt.receipt_id) {
            return Err(StoreError::DuplicateReceipt(record.receipt.receipt_id.clone()));
        }

        let latest = state.by_subject.get(&subject).and_then(|records| records.last());
        if let Err(reason) = check_append(latest, &record) {
            warn!(subject = %subject, reason = %reason, "Halting subject after consistency violation");
            state.halted.insert(subject.clone(), reason.clone());
            return Err(StoreError::ConsistencyViolation {
                subject: subject.to_string(),
                reason,
            });
        }

        let stored = build_record(latest, record);
        state
            .by_receipt
            .insert(stored.receipt.receipt_id.clone(), subject.clone());
        state.by_subject.entry(subject).or_default().push(stored.clone());

        Ok(stored)
    }

    async fn latest(&self, subject: &SubjectRef) -> Result<Option<AuditRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_subject
            .get(subject)
            .and_then(|records| records.last())
            .cloned())
    }

    async fn history(&self, subject: &SubjectRef) -> Result<Vec<AuditRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.by_subject.get(subject).cloned().unwrap_or_default())
    }

    async fn find_by_receipt(&self, receipt_id: &str) -> Result<Option<AuditRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.by_receipt.get(receipt_id).and_then(|subject| {
            state
                .by_subject
                .get(subject)
                .and_then(|records| records.iter().find(|r| r.receipt.receipt_id == receipt_id))
                .cloned()
        }))
    }

    async fn receipts_by_origin(&self, origin: LedgerOrigin) -> Result<Vec<Receipt>, StoreError> {
        let state = self.state.read().await;
        let mut receipts: Vec<Receipt> = state
            .by_subject
            .values()
            .flatten()
            .filter(|r| r.receipt.origin == origin)
            .map(|r| r.receipt.clone())
            .collect();
        receipts.sort_by_key(|r| r.sequence_number);
        Ok(receipts)
    }

    async fn halt_reason(&self, subject: &SubjectRef) -> Result<Option<String>, StoreError> {
        Ok(self.state.read().await.halted.get(subject).cloned())
    }

    async fn halt(&self, subject: &SubjectRef, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.halted.insert(subject.clone(), reason.to_string());
        Ok(())
    }

    async fn release(&self, subject: &SubjectRef) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.halted.remove(subject).is_some())
    }
}
