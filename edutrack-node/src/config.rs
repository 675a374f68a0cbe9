//! Node configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use edutrack_audit::{IntegrityConfig, RecordingPolicy, RemoteLedgerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub integrity: IntegritySection,
    #[serde(default)]
    pub policy: RecordingPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Audit database file name inside the data directory
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

/// Remote ledger node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint; unset means simulated ledger only
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Sending account (defaults to the node's first unlocked account)
    #[serde(default)]
    pub account: Option<String>,

    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    #[serde(default = "default_gas_price_gwei")]
    pub gas_price_gwei: u64,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Receipt polls before a submission counts as not mined
    #[serde(default = "default_confirmation_attempts")]
    pub confirmation_attempts: u32,

    /// Delay between receipt polls in milliseconds
    #[serde(default = "default_confirmation_interval")]
    pub confirmation_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegritySection {
    /// Upper bound on a single ledger call in seconds
    #[serde(default = "default_ledger_timeout")]
    pub ledger_timeout_secs: u64,

    /// Re-query the issuing ledger when verifying
    #[serde(default = "default_true")]
    pub confirm_on_verify: bool,
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("./edutrack-data") }
fn default_database_file() -> String { "audit.db".to_string() }
fn default_gas_limit() -> u64 { 100_000 }
fn default_gas_price_gwei() -> u64 { 20 }
fn default_request_timeout() -> u64 { 5 }
fn default_confirmation_attempts() -> u32 { 20 }
fn default_confirmation_interval() -> u64 { 250 }
fn default_ledger_timeout() -> u64 { 10 }
fn default_true() -> bool { true }

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            account: None,
            gas_limit: default_gas_limit(),
            gas_price_gwei: default_gas_price_gwei(),
            request_timeout_secs: default_request_timeout(),
            confirmation_attempts: default_confirmation_attempts(),
            confirmation_interval_ms: default_confirmation_interval(),
        }
    }
}

impl Default for IntegritySection {
    fn default() -> Self {
        Self {
            ledger_timeout_secs: default_ledger_timeout(),
            confirm_on_verify: true,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.node.database_file)
    }

    /// Remote ledger settings, if a remote URL is configured.
    pub fn remote_ledger(&self) -> Option<RemoteLedgerConfig> {
        let url = self.ledger.remote_url.as_deref().map(str::trim)?;
        if url.is_empty() {
            return None;
        }

        Some(RemoteLedgerConfig {
            url: url.to_string(),
            account: self.ledger.account.clone(),
            gas_limit: self.ledger.gas_limit,
            gas_price_gwei: self.ledger.gas_price_gwei,
            request_timeout: Duration::from_secs(self.ledger.request_timeout_secs),
            confirmation_attempts: self.ledger.confirmation_attempts,
            confirmation_interval: Duration::from_millis(self.ledger.confirmation_interval_ms),
        })
    }

    pub fn integrity(&self) -> IntegrityConfig {
        IntegrityConfig::default()
            .with_ledger_timeout(Duration::from_secs(self.integrity.ledger_timeout_secs))
            .with_confirm_on_verify(self.integrity.confirm_on_verify)
            .with_policy(self.policy.clone())
    }
}
