//! edutrack-node: command-line front end for the EduTrack integrity audit log
//!
//! Opens the SQLite audit store in the data directory, picks the ledger
//! (remote JSON-RPC node when configured and reachable, simulated otherwise)
//! and runs one audit command:
//! - `status` shows the ledger mode and network info
//! - `record` / `verify` anchor and check record snapshots
//! - `history` / `chain` inspect a subject's audit trail
//! - `release` clears an operator halt

mod cli;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use config::Config;
use edutrack_audit::{
    IntegrityService, LedgerClient, LedgerSet, RemoteLedger, SimulatedLedger, SqliteAuditStore,
};

#[derive(Parser)]
#[command(name = "edutrack-node")]
#[command(about = "Integrity audit log for EduTrack school records")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "edutrack-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long, env = "EDUTRACK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON-RPC ledger node URL (overrides config file; empty disables)
    #[arg(long, env = "EDUTRACK_LEDGER_URL")]
    ledger_url: Option<String>,

    #[command(subcommand)]
    command: cli::AuditCommands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edutrack_node=info".parse()?)
                .add_directive("edutrack_audit=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("Config file: {}", cli.config.display());
    let mut config = Config::load(&cli.config)?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(url) = cli.ledger_url {
        config.ledger.remote_url = Some(url);
    }

    std::fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("creating {}", config.node.data_dir.display()))?;
    info!("Data dir: {}", config.node.data_dir.display());

    let store = SqliteAuditStore::open(&config.database_path())?;

    let remote = match config.remote_ledger() {
        Some(remote_config) => {
            info!(url = %remote_config.url, "Remote ledger configured");
            Some(Arc::new(RemoteLedger::new(remote_config)?) as Arc<dyn LedgerClient>)
        }
        None => None,
    };
    let ledgers = LedgerSet::initialize(remote, Arc::new(SimulatedLedger::new())).await;

    let service =
        IntegrityService::initialize(ledgers, Arc::new(store), config.integrity()).await?;

    let output = cli::execute_command(&service, cli.command).await?;
    println!("{}", output.text.trim_end());

    if output.exit_code != 0 {
        std::process::exit(output.exit_code);
    }
    Ok(())
}
