//! EduTrack Audit - integrity audit log for school records
//!
//! Provides tamper evidence for records owned by the CRUD layer:
//! - Deterministic canonical bytes and SHA-256 digests for record snapshots
//! - Trait-based ledger clients (JSON-RPC node, local simulation)
//! - Append-only audit store (in-memory, SQLite) with per-subject hash chains
//! - Record / verify orchestration with idempotent submission
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            IntegrityService             │
//! │   (record / verify / history entry)     │
//! └────────────────┬────────────────────────┘
//!                  │
//!      ┌───────────┴───────────┐
//!      ▼                       ▼
//! ┌─────────────┐       ┌─────────────┐
//! │ LedgerSet   │       │ AuditStore  │
//! │ (Remote /   │       │ (Memory /   │
//! │  Simulated) │       │  SQLite)    │
//! └─────────────┘       └─────────────┘
//! ```

pub mod canonical;
pub mod config;
pub mod hasher;
pub mod ledger;
pub mod policy;
pub mod service;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use canonical::{canonicalize, Scalar, Snapshot, SnapshotError};
pub use config::IntegrityConfig;
pub use hasher::{hash, Digest};
pub use ledger::{
    LedgerClient, LedgerError, LedgerMode, LedgerSet, LedgerStatus, RemoteLedger,
    RemoteLedgerConfig, SimulatedLedger,
};
pub use policy::RecordingPolicy;
pub use service::{
    ChainReport, IntegrityError, IntegrityService, VerificationReport, VerificationStatus,
};
pub use store::{AuditStore, MemoryAuditStore, SqliteAuditStore, StoreError};
pub use types::*;
