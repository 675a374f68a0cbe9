//! Local deterministic ledger.
//!
//! Used when no chain node is configured or reachable. Never fails and never
//! touches the network.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::*;
use crate::hasher::{sha256_hex, Digest};
use crate::types::{LedgerOrigin, Receipt, SubmissionMetadata};

/// Prefix distinguishing simulated receipt ids from transaction hashes.
pub const SIMULATED_RECEIPT_PREFIX: &str = "sim-";

struct SimulatedState {
    /// Last assigned sequence number (0 = none yet)
    sequence: u64,
    /// Receipts by id
    receipts: HashMap<String, Receipt>,
}

/// Simulated ledger with a monotonically increasing local sequence.
pub struct SimulatedLedger {
    state: RwLock<SimulatedState>,
    submit_count: AtomicU32,
}

impl SimulatedLedger {
    /// Create an empty simulated ledger.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SimulatedState {
                sequence: 0,
                receipts: HashMap::new(),
            }),
            submit_count: AtomicU32::new(0),
        }
    }

    /// Deterministic receipt id for a digest at a sequence position.
    pub fn receipt_id_for(digest: &Digest, sequence: u64) -> String {
        let seq = sequence.to_string();
        format!(
            "{}{}",
            SIMULATED_RECEIPT_PREFIX,
            sha256_hex([digest.as_str().as_bytes(), b":", seq.as_bytes()])
        )
    }

    /// Reload receipts persisted by an earlier process.
    ///
    /// Non-simulated receipts are ignored. The sequence resumes after the
    /// highest restored position.
    pub async fn hydrate(&self, receipts: impl IntoIterator<Item = Receipt>) {
        let mut state = self.state.write().await;
        for receipt in receipts {
            if receipt.origin != LedgerOrigin::Simulated {
                continue;
            }
            state.sequence = state.sequence.max(receipt.sequence_number);
            state.receipts.insert(receipt.receipt_id.clone(), receipt);
        }
        debug!(
            sequence = state.sequence,
            receipts = state.receipts.len(),
            "Hydrated simulated ledger"
        );
    }

    /// Current sequence height.
    pub async fn height(&self) -> u64 {
        self.state.read().await.sequence
    }

    /// Get the number of times submit was called.
    pub fn submit_count(&self) -> u32 {
        self.submit_count.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    fn origin(&self) -> LedgerOrigin {
        LedgerOrigin::Simulated
    }

    async fn submit(
        &self,
        digest: &Digest,
        metadata: &SubmissionMetadata,
    ) -> Result<Receipt, LedgerError> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write().await;
        state.sequence += 1;
        let sequence = state.sequence;

        let receipt = Receipt {
            receipt_id: Self::receipt_id_for(digest, sequence),
            digest: digest.clone(),
            sequence_number: sequence,
            submitted_at: Utc::now(),
            confirmed: false,
            origin: LedgerOrigin::Simulated,
        };
        state
            .receipts
            .insert(receipt.receipt_id.clone(), receipt.clone());

        debug!(
            subject = %metadata.subject,
            sequence,
            receipt_id = %receipt.receipt_id,
            "Simulated ledger accepted digest"
        );

        Ok(receipt)
    }

    async fn query(&self, receipt_id: &str) -> Result<Option<Receipt>, LedgerError> {
        Ok(self.state.read().await.receipts.get(receipt_id).cloned())
    }

    async fn status(&self) -> LedgerStatus {
        LedgerStatus {
            reachable: true,
            height: Some(self.height().await),
            chain_id: None,
            account: None,
        }
    }
}
