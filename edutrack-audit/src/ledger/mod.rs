//! Ledger abstraction layer.
//!
//! Provides a trait-based interface over the systems that acknowledge digests:
//! - JSON-RPC chain node (Ganache / any Ethereum-compatible endpoint)
//! - Local deterministic simulation, used when no node is reachable

pub mod remote;
pub mod set;
pub mod simulated;
pub mod traits;

pub use remote::{RemoteLedger, RemoteLedgerConfig};
pub use set::{LedgerMode, LedgerSet};
pub use simulated::SimulatedLedger;
pub use traits::{LedgerClient, LedgerError, LedgerStatus};
