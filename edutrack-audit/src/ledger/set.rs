//! Process-wide ledger selection.
//!
//! The ledger backing submissions is decided once, at startup, from the
//! configured remote's reachability. Every receipt a process issues therefore
//! comes from the same ledger unless the simulated fallback is taken for an
//! individual unreachable submission.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::simulated::SimulatedLedger;
use super::traits::{LedgerClient, LedgerStatus};
use crate::types::{LedgerOrigin, Receipt};

/// Which ledger the process submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    /// Submissions go to the remote node
    Remote,
    /// No remote configured, or it was unreachable at startup
    Simulated,
}

impl fmt::Display for LedgerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerMode::Remote => f.write_str("remote"),
            LedgerMode::Simulated => f.write_str("simulated"),
        }
    }
}

/// The ledgers available to this process.
#[derive(Clone)]
pub struct LedgerSet {
    mode: LedgerMode,
    remote: Option<Arc<dyn LedgerClient>>,
    simulated: Arc<SimulatedLedger>,
}

impl LedgerSet {
    /// Check the remote (if any) and fix the ledger mode for the process lifetime.
    pub async fn initialize(
        remote: Option<Arc<dyn LedgerClient>>,
        simulated: Arc<SimulatedLedger>,
    ) -> Self {
        let mode = match &remote {
            Some(client) => {
                let status = client.status().await;
                if status.reachable {
                    info!(
                        height = ?status.height,
                        chain_id = ?status.chain_id,
                        "Remote ledger reachable, anchoring digests remotely"
                    );
                    LedgerMode::Remote
                } else {
                    warn!("Remote ledger unreachable at startup, using simulated ledger");
                    LedgerMode::Simulated
                }
            }
            None => {
                info!("No remote ledger configured, using simulated ledger");
                LedgerMode::Simulated
            }
        };

        Self {
            mode,
            remote,
            simulated,
        }
    }

    /// A set that only ever uses the simulated ledger.
    pub fn simulated_only(simulated: Arc<SimulatedLedger>) -> Self {
        Self {
            mode: LedgerMode::Simulated,
            remote: None,
            simulated,
        }
    }

    /// A set pinned to the given remote without probing it.
    pub fn remote(remote: Arc<dyn LedgerClient>, simulated: Arc<SimulatedLedger>) -> Self {
        Self {
            mode: LedgerMode::Remote,
            remote: Some(remote),
            simulated,
        }
    }

    pub fn mode(&self) -> LedgerMode {
        self.mode
    }

    /// Ledger new submissions go to.
    pub fn primary(&self) -> Arc<dyn LedgerClient> {
        match (self.mode, &self.remote) {
            (LedgerMode::Remote, Some(remote)) => Arc::clone(remote),
            _ => self.simulated.clone() as Arc<dyn LedgerClient>,
        }
    }

    /// Local fallback ledger.
    pub fn simulated(&self) -> Arc<SimulatedLedger> {
        Arc::clone(&self.simulated)
    }

    /// Ledger that issued receipts of the given origin, if this process has it.
    pub fn for_origin(&self, origin: LedgerOrigin) -> Option<Arc<dyn LedgerClient>> {
        match origin {
            LedgerOrigin::Simulated => Some(self.simulated.clone() as Arc<dyn LedgerClient>),
            LedgerOrigin::Remote => self.remote.clone(),
        }
    }

    /// Restore simulated receipts persisted by an earlier process.
    pub async fn hydrate(&self, receipts: impl IntoIterator<Item = Receipt>) {
        self.simulated.hydrate(receipts).await;
    }

    /// Status of the primary ledger.
    pub async fn status(&self) -> LedgerStatus {
        self.primary().status().await
    }
}
