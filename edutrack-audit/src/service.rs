//! IntegrityService - record and verify entry point for the CRUD layer.
//!
//! Orchestrates canonicalization, ledger submission and the audit store.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::canonical::Snapshot;
use crate::config::IntegrityConfig;
use crate::hasher::Digest;
use crate::ledger::{LedgerClient, LedgerError, LedgerMode, LedgerSet, LedgerStatus};
use crate::store::{chain_hash, AuditStore, StoreError, GENESIS_HASH};
use crate::types::{
    AuditRecord, HistoryEntry, LedgerOrigin, NewAuditRecord, Receipt, RecordKind,
    SubjectRef, SubmissionMetadata,
};

/// Error types for the integrity service.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// No ledger able to accept the submission could be reached
    #[error("Ledger unreachable: {0}")]
    LedgerUnreachable(String),

    /// The ledger refused the submission
    #[error("Ledger rejected submission: {0}")]
    LedgerRejected(String),

    /// Audit store error, including consistency violations and halts
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The detached record task did not complete
    #[error("Record task failed: {0}")]
    Task(String),
}

impl From<LedgerError> for IntegrityError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Unreachable(msg) => IntegrityError::LedgerUnreachable(msg),
            LedgerError::Rejected(msg) => IntegrityError::LedgerRejected(msg),
            LedgerError::InvalidResponse(msg) => IntegrityError::LedgerRejected(msg),
        }
    }
}

impl IntegrityError {
    /// Whether the subject refuses further writes until released.
    pub fn is_halt(&self) -> bool {
        matches!(
            self,
            IntegrityError::Store(StoreError::ConsistencyViolation { .. })
                | IntegrityError::Store(StoreError::SubjectHalted { .. })
        )
    }
}

/// Outcome of verifying a snapshot against the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Snapshot matches the latest recorded digest
    Verified,
    /// Snapshot differs from the latest recorded digest
    Mismatched,
    /// Subject has no audit records
    NeverRecorded,
    /// The issuing ledger no longer knows the receipt
    ReceiptLost,
}

/// Full verification result handed back to the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub status: VerificationStatus,
    pub computed_digest: Digest,
    pub recorded_digest: Option<Digest>,
    pub receipt_id: Option<String>,
    pub sequence_number: Option<u64>,
    /// Whether the issuing ledger was actually consulted
    pub ledger_checked: bool,
}

/// Result of walking a subject's hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub subject: SubjectRef,
    /// Number of records in the chain
    pub length: usize,
    /// Index of the first record whose links do not check out
    pub first_broken: Option<usize>,
    /// Id of that record
    pub broken_record_id: Option<String>,
    /// Sequence numbers strictly increase along the chain
    pub monotonic: bool,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none() && self.monotonic
    }
}

/// Record / verify orchestration over a ledger set and an audit store.
///
/// Cheap to clone; clones share ledgers, store and subject locks.
#[derive(Clone)]
pub struct IntegrityService {
    ledgers: LedgerSet,
    store: Arc<dyn AuditStore>,
    config: IntegrityConfig,
    /// One async mutex per subject with a record in flight
    locks: Arc<DashMap<SubjectRef, Arc<Mutex<()>>>>,
}

impl IntegrityService {
    /// Create a service over the given ledgers and store.
    pub fn new(ledgers: LedgerSet, store: Arc<dyn AuditStore>, config: IntegrityConfig) -> Self {
        Self {
            ledgers,
            store,
            config,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Create a service and restore the simulated ledger from the store.
    pub async fn initialize(
        ledgers: LedgerSet,
        store: Arc<dyn AuditStore>,
        config: IntegrityConfig,
    ) -> Result<Self, IntegrityError> {
        let service = Self::new(ledgers, store, config);
        let restored = service.hydrate().await?;
        info!(
            mode = %service.mode(),
            restored_receipts = restored,
            "Integrity service initialized"
        );
        Ok(service)
    }

    /// Reload persisted simulated receipts into the simulated ledger.
    pub async fn hydrate(&self) -> Result<usize, IntegrityError> {
        let receipts = self.store.receipts_by_origin(LedgerOrigin::Simulated).await?;
        let count = receipts.len();
        self.ledgers.hydrate(receipts).await;
        Ok(count)
    }

    pub fn mode(&self) -> LedgerMode {
        self.ledgers.mode()
    }

    pub fn config(&self) -> &IntegrityConfig {
        &self.config
    }

    /// Status of the ledger new submissions go to.
    pub async fn ledger_status(&self) -> LedgerStatus {
        self.ledgers.status().await
    }

    /// Status of the configured remote ledger, queried now.
    ///
    /// `None` when no remote is configured.
    pub async fn remote_status(&self) -> Option<LedgerStatus> {
        let remote = self.ledgers.for_origin(LedgerOrigin::Remote)?;
        let status = self
            .bounded(async { Ok(remote.status().await) })
            .await
            .unwrap_or_else(|_| LedgerStatus::unreachable());
        Some(status)
    }

    /// Record a snapshot of a subject.
    ///
    /// Returns the existing record unchanged when the latest record already
    /// carries the snapshot's digest. The submit and append run in a detached
    /// task, so dropping the returned future does not lose a ledger receipt.
    pub async fn record(
        &self,
        subject: &SubjectRef,
        snapshot: &Snapshot,
        kind: RecordKind,
    ) -> Result<AuditRecord, IntegrityError> {
        let digest = snapshot.digest();
        let service = self.clone();
        let subject = subject.clone();

        tokio::spawn(async move {
            let lock = service.subject_lock(&subject);
            let result = {
                let _guard = lock.lock().await;
                service.record_locked(&subject, digest, kind).await
            };
            drop(lock);
            service.release_lock(&subject);
            result
        })
        .await
        .map_err(|e| IntegrityError::Task(e.to_string()))?
    }

    /// Record a change only if the recording policy considers it significant.
    pub async fn record_with_policy(
        &self,
        subject: &SubjectRef,
        previous: Option<&Snapshot>,
        current: &Snapshot,
        kind: RecordKind,
    ) -> Result<Option<AuditRecord>, IntegrityError> {
        if !self.config.policy.should_record(kind, previous, current) {
            debug!(subject = %subject, kind = %kind, "Change below recording threshold");
            return Ok(None);
        }
        self.record(subject, current, kind).await.map(Some)
    }

    async fn record_locked(
        &self,
        subject: &SubjectRef,
        digest: Digest,
        kind: RecordKind,
    ) -> Result<AuditRecord, IntegrityError> {
        let latest = self.store.latest(subject).await?;
        if let Some(latest) = latest.as_ref().filter(|r| r.digest == digest) {
            debug!(
                subject = %subject,
                digest = %digest,
                receipt_id = %latest.receipt.receipt_id,
                "Snapshot unchanged, reusing existing record"
            );
            return Ok(latest.clone());
        }

        if let Some(reason) = self.store.halt_reason(subject).await? {
            return Err(StoreError::SubjectHalted {
                subject: subject.to_string(),
                reason,
            }
            .into());
        }

        let metadata = SubmissionMetadata {
            subject: subject.clone(),
            kind,
        };
        let bound = latest.as_ref().map(|r| r.receipt.origin);
        let receipt = self.submit(bound, &digest, &metadata).await?;

        let record = self
            .store
            .append(NewAuditRecord {
                subject: subject.clone(),
                kind,
                digest,
                receipt,
            })
            .await?;

        info!(
            subject = %subject,
            kind = %kind,
            digest = %record.digest,
            receipt_id = %record.receipt.receipt_id,
            sequence_number = record.receipt.sequence_number,
            origin = %record.receipt.origin,
            "Audit record appended"
        );

        Ok(record)
    }

    /// Submit on the ledger the subject's chain is bound to.
    ///
    /// Unbound subjects use the primary ledger and fall back to the simulated
    /// one when it cannot be reached.
    async fn submit(
        &self,
        bound: Option<LedgerOrigin>,
        digest: &Digest,
        metadata: &SubmissionMetadata,
    ) -> Result<Receipt, IntegrityError> {
        let ledger = match bound {
            Some(origin) => self.ledgers.for_origin(origin).ok_or_else(|| {
                IntegrityError::LedgerUnreachable(format!(
                    "{} is anchored on the {} ledger, which is not configured",
                    metadata.subject, origin
                ))
            })?,
            None => self.ledgers.primary(),
        };

        match self.bounded(ledger.submit(digest, metadata)).await {
            Ok(receipt) => Ok(receipt),
            Err(e) if e.is_unreachable() && ledger.has_pending(digest, metadata) => {
                warn!(
                    subject = %metadata.subject,
                    error = %e,
                    "Ledger accepted the submission but has not confirmed it"
                );
                Err(IntegrityError::LedgerUnreachable(format!(
                    "submission for {} awaits confirmation: {}",
                    metadata.subject, e
                )))
            }
            Err(e) if e.is_unreachable() && bound.is_none() && ledger.origin() != LedgerOrigin::Simulated => {
                warn!(
                    subject = %metadata.subject,
                    error = %e,
                    "Ledger unreachable, recording on simulated ledger"
                );
                Ok(self.ledgers.simulated().submit(digest, metadata).await?)
            }
            Err(e) if e.is_unreachable() => {
                warn!(subject = %metadata.subject, error = %e, "Ledger unreachable");
                Err(e.into())
            }
            Err(e) => {
                error!(subject = %metadata.subject, error = %e, "Ledger rejected submission");
                Err(e.into())
            }
        }
    }

    /// Apply the configured ledger timeout to a ledger call.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        tokio::time::timeout(self.config.ledger_timeout, call)
            .await
            .map_err(|_| {
                LedgerError::Unreachable(format!(
                    "no answer within {:?}",
                    self.config.ledger_timeout
                ))
            })?
    }

    /// Verify a snapshot against the latest record of the subject.
    ///
    /// Never writes to the store.
    pub async fn verify(
        &self,
        subject: &SubjectRef,
        snapshot: &Snapshot,
    ) -> Result<VerificationReport, IntegrityError> {
        let computed_digest = snapshot.digest();

        let Some(latest) = self.store.latest(subject).await? else {
            return Ok(VerificationReport {
                status: VerificationStatus::NeverRecorded,
                computed_digest,
                recorded_digest: None,
                receipt_id: None,
                sequence_number: None,
                ledger_checked: false,
            });
        };

        let mut report = VerificationReport {
            status: VerificationStatus::Verified,
            computed_digest,
            recorded_digest: Some(latest.digest.clone()),
            receipt_id: Some(latest.receipt.receipt_id.clone()),
            sequence_number: Some(latest.receipt.sequence_number),
            ledger_checked: false,
        };

        if report.computed_digest != latest.digest {
            warn!(
                subject = %subject,
                computed = %report.computed_digest,
                recorded = %latest.digest,
                "Snapshot does not match audit trail"
            );
            report.status = VerificationStatus::Mismatched;
            return Ok(report);
        }

        if self.config.confirm_on_verify {
            self.confirm(&latest, &mut report).await;
        }

        Ok(report)
    }

    /// Re-query the ledger that issued the latest receipt.
    async fn confirm(&self, latest: &AuditRecord, report: &mut VerificationReport) {
        let receipt_id = &latest.receipt.receipt_id;
        let Some(ledger) = self.ledgers.for_origin(latest.receipt.origin) else {
            debug!(receipt_id = %receipt_id, "Issuing ledger not configured, skipping confirmation");
            return;
        };

        match self.bounded(ledger.query(receipt_id)).await {
            Ok(Some(found)) => {
                report.ledger_checked = true;
                if found.digest != latest.digest {
                    warn!(
                        subject = %latest.subject,
                        receipt_id = %receipt_id,
                        ledger_digest = %found.digest,
                        "Ledger holds a different digest for receipt"
                    );
                    report.status = VerificationStatus::Mismatched;
                }
            }
            Ok(None) => {
                warn!(subject = %latest.subject, receipt_id = %receipt_id, "Receipt not found on ledger");
                report.ledger_checked = true;
                report.status = VerificationStatus::ReceiptLost;
            }
            Err(e) => {
                debug!(receipt_id = %receipt_id, error = %e, "Ledger confirmation unavailable");
            }
        }
    }

    /// Audit history of a subject, oldest first.
    pub async fn history(&self, subject: &SubjectRef) -> Result<Vec<HistoryEntry>, IntegrityError> {
        let records = self.store.history(subject).await?;
        Ok(records.iter().map(AuditRecord::history_entry).collect())
    }

    /// Look up the record holding a ledger receipt.
    pub async fn find_by_receipt(&self, receipt_id: &str) -> Result<Option<AuditRecord>, IntegrityError> {
        Ok(self.store.find_by_receipt(receipt_id).await?)
    }

    /// Recompute the subject's hash chain and report the first broken link.
    pub async fn verify_chain(&self, subject: &SubjectRef) -> Result<ChainReport, IntegrityError> {
        let records = self.store.history(subject).await?;

        let mut first_broken = None;
        let mut monotonic = true;
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut last_sequence: Option<u64> = None;

        for (index, record) in records.iter().enumerate() {
            let linked = record.prev_hash == expected_prev
                && record.chain_hash == chain_hash(&record.prev_hash, &record.receipt)
                && record.digest == record.receipt.digest;
            if !linked && first_broken.is_none() {
                first_broken = Some(index);
            }

            if last_sequence.is_some_and(|last| record.receipt.sequence_number <= last) {
                monotonic = false;
            }
            last_sequence = Some(record.receipt.sequence_number);
            expected_prev = record.chain_hash.clone();
        }

        let report = ChainReport {
            subject: subject.clone(),
            length: records.len(),
            broken_record_id: first_broken.map(|i| records[i].id.clone()),
            first_broken,
            monotonic,
        };

        if !report.is_intact() {
            warn!(
                subject = %subject,
                first_broken = ?report.first_broken,
                monotonic = report.monotonic,
                "Audit chain failed verification"
            );
        }

        Ok(report)
    }

    /// Clear an operator halt on a subject.
    pub async fn release(&self, subject: &SubjectRef) -> Result<bool, IntegrityError> {
        let released = self.store.release(subject).await?;
        if released {
            info!(subject = %subject, "Subject released for recording");
        }
        Ok(released)
    }

    fn subject_lock(&self, subject: &SubjectRef) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(subject.clone()).or_default().value())
    }

    /// Drop the subject's lock entry once nobody else holds it.
    fn release_lock(&self, subject: &SubjectRef) {
        self.locks
            .remove_if(subject, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SimulatedLedger;
    use crate::store::MemoryAuditStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Accept,
        Unreachable,
        Reject,
        Hang,
    }

    /// Remote-origin ledger whose behaviour can be switched mid-test.
    struct ScriptedRemote {
        behaviour: std::sync::Mutex<Behaviour>,
        delay: Duration,
        sequence: AtomicU64,
        receipts: std::sync::Mutex<HashMap<String, Receipt>>,
        submits: AtomicU32,
    }

    impl ScriptedRemote {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Self::with_delay(behaviour, Duration::ZERO)
        }

        fn with_delay(behaviour: Behaviour, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                behaviour: std::sync::Mutex::new(behaviour),
                delay,
                sequence: AtomicU64::new(1 << 20),
                receipts: std::sync::Mutex::new(HashMap::new()),
                submits: AtomicU32::new(0),
            })
        }

        fn set(&self, behaviour: Behaviour) {
            *self.behaviour.lock().unwrap() = behaviour;
        }

        fn forget(&self) {
            self.receipts.lock().unwrap().clear();
        }

        fn behaviour(&self) -> Behaviour {
            *self.behaviour.lock().unwrap()
        }
    }

    #[async_trait]
    impl LedgerClient for ScriptedRemote {
        fn origin(&self) -> LedgerOrigin {
            LedgerOrigin::Remote
        }

        async fn submit(
            &self,
            digest: &Digest,
            _metadata: &SubmissionMetadata,
        ) -> Result<Receipt, LedgerError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            match self.behaviour() {
                Behaviour::Unreachable => return Err(LedgerError::Unreachable("connection refused".into())),
                Behaviour::Reject => return Err(LedgerError::Rejected("out of gas".into())),
                Behaviour::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
                Behaviour::Accept => {}
            }
            tokio::time::sleep(self.delay).await;

            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
            let receipt = Receipt {
                receipt_id: format!("0x{:064x}", sequence),
                digest: digest.clone(),
                sequence_number: sequence,
                submitted_at: Utc::now(),
                confirmed: true,
                origin: LedgerOrigin::Remote,
            };
            self.receipts
                .lock()
                .unwrap()
                .insert(receipt.receipt_id.clone(), receipt.clone());
            Ok(receipt)
        }

        async fn query(&self, receipt_id: &str) -> Result<Option<Receipt>, LedgerError> {
            match self.behaviour() {
                Behaviour::Unreachable => Err(LedgerError::Unreachable("connection refused".into())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
                _ => Ok(self.receipts.lock().unwrap().get(receipt_id).cloned()),
            }
        }

        async fn status(&self) -> LedgerStatus {
            if self.behaviour() == Behaviour::Unreachable {
                LedgerStatus::unreachable()
            } else {
                LedgerStatus {
                    reachable: true,
                    height: Some(1),
                    chain_id: Some(1337),
                    account: None,
                }
            }
        }
    }

    fn simulated_service() -> (IntegrityService, Arc<SimulatedLedger>) {
        let simulated = Arc::new(SimulatedLedger::new());
        let service = IntegrityService::new(
            LedgerSet::simulated_only(Arc::clone(&simulated)),
            Arc::new(MemoryAuditStore::new()),
            IntegrityConfig::default(),
        );
        (service, simulated)
    }

    fn remote_service(remote: Arc<ScriptedRemote>) -> IntegrityService {
        IntegrityService::new(
            LedgerSet::remote(remote, Arc::new(SimulatedLedger::new())),
            Arc::new(MemoryAuditStore::new()),
            IntegrityConfig::default().with_ledger_timeout(Duration::from_millis(200)),
        )
    }

    fn progress(percent: f64, completed: bool) -> Snapshot {
        Snapshot::new().with("progress", percent).with("completed", completed)
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let (service, simulated) = simulated_service();
        let subject = SubjectRef::new("student_progress", "1");

        let first = service
            .record(&subject, &progress(42.0, false), RecordKind::Progress)
            .await
            .unwrap();
        let second = service
            .record(&subject, &progress(42.0, false), RecordKind::Progress)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(simulated.submit_count(), 1);
        assert_eq!(service.history(&subject).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_then_verify() {
        let (service, _) = simulated_service();
        let subject = SubjectRef::new("student_progress", "2");

        service
            .record(&subject, &progress(42.0, false), RecordKind::Progress)
            .await
            .unwrap();

        let report = service.verify(&subject, &progress(42.0, false)).await.unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
        assert!(report.ledger_checked);

        let report = service.verify(&subject, &progress(42.0, true)).await.unwrap();
        assert_eq!(report.status, VerificationStatus::Mismatched);
        assert_ne!(Some(report.computed_digest), report.recorded_digest);
    }

    #[tokio::test]
    async fn test_verify_never_recorded() {
        let (service, _) = simulated_service();
        let report = service
            .verify(&SubjectRef::new("student", "404"), &Snapshot::new())
            .await
            .unwrap();
        assert_eq!(report.status, VerificationStatus::NeverRecorded);
        assert!(report.receipt_id.is_none());
    }

    #[tokio::test]
    async fn test_history_sequence_increases() {
        let (service, _) = simulated_service();
        let subject = SubjectRef::new("student_progress", "3");

        for percent in [10.0, 20.0, 30.0, 40.0] {
            service
                .record(&subject, &progress(percent, false), RecordKind::Progress)
                .await
                .unwrap();
        }

        let history = service.history(&subject).await.unwrap();
        assert_eq!(history.len(), 4);
        assert!(history
            .windows(2)
            .all(|w| w[0].sequence_number < w[1].sequence_number));
        assert!(service.verify_chain(&subject).await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_unreachable_remote_falls_back_to_simulated() {
        let remote = ScriptedRemote::new(Behaviour::Unreachable);
        let service = remote_service(Arc::clone(&remote));
        let subject = SubjectRef::new("student", "5");
        let snapshot = Snapshot::new().with("name", "Asha").with("grade", 7);

        let record = service.record(&subject, &snapshot, RecordKind::Profile).await.unwrap();
        assert!(!record.receipt.confirmed);
        assert_eq!(record.receipt.origin, LedgerOrigin::Simulated);

        let report = service.verify(&subject, &snapshot).await.unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_unreachable() {
        let remote = ScriptedRemote::new(Behaviour::Hang);
        let service = remote_service(remote);
        let subject = SubjectRef::new("student", "6");

        let record = service
            .record(&subject, &Snapshot::new().with("name", "Bo"), RecordKind::Profile)
            .await
            .unwrap();
        assert_eq!(record.receipt.origin, LedgerOrigin::Simulated);
    }

    #[tokio::test]
    async fn test_remote_bound_subject_does_not_mix_ledgers() {
        let remote = ScriptedRemote::new(Behaviour::Accept);
        let service = remote_service(Arc::clone(&remote));
        let subject = SubjectRef::new("student", "7");

        let first = service
            .record(&subject, &Snapshot::new().with("grade", 7), RecordKind::Profile)
            .await
            .unwrap();
        assert_eq!(first.receipt.origin, LedgerOrigin::Remote);
        assert!(first.receipt.confirmed);

        remote.set(Behaviour::Unreachable);
        let err = service
            .record(&subject, &Snapshot::new().with("grade", 8), RecordKind::Profile)
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrityError::LedgerUnreachable(_)));
        assert_eq!(service.history(&subject).await.unwrap().len(), 1);

        // Verification still answers from the store
        let report = service
            .verify(&subject, &Snapshot::new().with("grade", 7))
            .await
            .unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
        assert!(!report.ledger_checked);
    }

    #[tokio::test]
    async fn test_rejection_is_surfaced() {
        let remote = ScriptedRemote::new(Behaviour::Reject);
        let service = remote_service(remote);
        let subject = SubjectRef::new("assignment", "9");

        let err = service
            .record(&subject, &Snapshot::new().with("title", "Essay"), RecordKind::Assignment)
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrityError::LedgerRejected(_)));
        assert!(service.history(&subject).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receipt_lost() {
        let remote = ScriptedRemote::new(Behaviour::Accept);
        let service = remote_service(Arc::clone(&remote));
        let subject = SubjectRef::new("achievement", "3");
        let snapshot = Snapshot::new().with("title", "Reading streak");

        service.record(&subject, &snapshot, RecordKind::Achievement).await.unwrap();
        remote.forget();

        let report = service.verify(&subject, &snapshot).await.unwrap();
        assert_eq!(report.status, VerificationStatus::ReceiptLost);
        assert!(report.ledger_checked);
    }

    #[tokio::test]
    async fn test_verify_without_confirmation() {
        let remote = ScriptedRemote::new(Behaviour::Accept);
        let service = IntegrityService::new(
            LedgerSet::remote(remote.clone(), Arc::new(SimulatedLedger::new())),
            Arc::new(MemoryAuditStore::new()),
            IntegrityConfig::default().with_confirm_on_verify(false),
        );
        let subject = SubjectRef::new("achievement", "4");
        let snapshot = Snapshot::new().with("title", "Perfect week");

        service.record(&subject, &snapshot, RecordKind::Achievement).await.unwrap();
        remote.forget();

        let report = service.verify(&subject, &snapshot).await.unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
        assert!(!report.ledger_checked);
    }

    #[tokio::test]
    async fn test_concurrent_records_serialize_per_subject() {
        let (service, _) = simulated_service();
        let subject = SubjectRef::new("student_progress", "8");

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let service = service.clone();
                let subject = subject.clone();
                tokio::spawn(async move {
                    service
                        .record(&subject, &progress(f64::from(i) * 10.0, false), RecordKind::Progress)
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let report = service.verify_chain(&subject).await.unwrap();
        assert_eq!(report.length, 8);
        assert!(report.is_intact());
        assert!(service.locks.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_record_still_persists() {
        let remote = ScriptedRemote::with_delay(Behaviour::Accept, Duration::from_millis(100));
        let service = remote_service(Arc::clone(&remote));
        let subject = SubjectRef::new("student", "11");
        let snapshot = Snapshot::new().with("name", "Kofi");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            service.record(&subject, &snapshot, RecordKind::Profile),
        )
        .await;
        assert!(abandoned.is_err());

        // The next call waits for the in-flight one and reuses its record
        let record = service.record(&subject, &snapshot, RecordKind::Profile).await.unwrap();
        assert_eq!(record.receipt.origin, LedgerOrigin::Remote);
        assert_eq!(remote.submits.load(Ordering::SeqCst), 1);
        assert_eq!(service.history(&subject).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_halted_subject_refuses_records_until_released() {
        let simulated = Arc::new(SimulatedLedger::new());
        let store = Arc::new(MemoryAuditStore::new());
        let service = IntegrityService::new(
            LedgerSet::simulated_only(simulated),
            store.clone(),
            IntegrityConfig::default(),
        );
        let subject = SubjectRef::new("student", "12");

        store.halt(&subject, "operator review").await.unwrap();
        let err = service
            .record(&subject, &Snapshot::new().with("name", "Lin"), RecordKind::Profile)
            .await
            .unwrap_err();
        assert!(err.is_halt());

        assert!(service.release(&subject).await.unwrap());
        service
            .record(&subject, &Snapshot::new().with("name", "Lin"), RecordKind::Profile)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_record_with_policy_skips_small_progress() {
        let (service, simulated) = simulated_service();
        let subject = SubjectRef::new("student_progress", "13");
        let before = Snapshot::new().with("progress_percentage", 41.0).with("completed", false);
        let after = Snapshot::new().with("progress_percentage", 44.0).with("completed", false);

        assert!(service
            .record_with_policy(&subject, None, &before, RecordKind::Progress)
            .await
            .unwrap()
            .is_some());
        assert!(service
            .record_with_policy(&subject, Some(&before), &after, RecordKind::Progress)
            .await
            .unwrap()
            .is_none());
        assert_eq!(simulated.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_hydrates_simulated_ledger() {
        let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let subject = SubjectRef::new("student", "14");
        let snapshot = Snapshot::new().with("name", "Ama");

        let first = IntegrityService::initialize(
            LedgerSet::simulated_only(Arc::new(SimulatedLedger::new())),
            Arc::clone(&store),
            IntegrityConfig::default(),
        )
        .await
        .unwrap();
        let recorded = first.record(&subject, &snapshot, RecordKind::Profile).await.unwrap();

        // A fresh process sees the same receipts
        let second = IntegrityService::initialize(
            LedgerSet::simulated_only(Arc::new(SimulatedLedger::new())),
            Arc::clone(&store),
            IntegrityConfig::default(),
        )
        .await
        .unwrap();
        let report = second.verify(&subject, &snapshot).await.unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
        assert!(report.ledger_checked);

        let next = second
            .record(&subject, &Snapshot::new().with("name", "Ama K."), RecordKind::Profile)
            .await
            .unwrap();
        assert!(next.receipt.sequence_number > recorded.receipt.sequence_number);
    }
}
