//! Audit CLI commands
//!
//! Operator-facing commands over the integrity service.

use anyhow::Context;
use clap::{Args, Subcommand};

use edutrack_audit::{
    AuditRecord, ChainReport, HistoryEntry, IntegrityService, LedgerMode, LedgerStatus,
    RecordKind, Snapshot, SubjectRef, VerificationReport, VerificationStatus,
};

/// Exit code for a verification that did not come back verified
pub const EXIT_NOT_VERIFIED: i32 = 2;

/// Audit CLI commands
#[derive(Debug, Subcommand)]
pub enum AuditCommands {
    /// Show ledger mode and network info
    Status,

    /// Record a snapshot of a subject
    Record {
        /// Subject as kind/id, e.g. student_progress/12
        #[arg(value_parser = parse_subject)]
        subject: SubjectRef,

        /// Record kind (profile, progress, achievement, voice, assignment)
        #[arg(short, long)]
        kind: RecordKind,

        #[command(flatten)]
        snapshot: SnapshotArgs,

        /// Previous snapshot as JSON; applies the recording policy when given
        #[arg(long)]
        previous: Option<String>,
    },

    /// Verify a snapshot against the audit trail
    Verify {
        /// Subject as kind/id
        #[arg(value_parser = parse_subject)]
        subject: SubjectRef,

        #[command(flatten)]
        snapshot: SnapshotArgs,
    },

    /// List the audit history of a subject
    History {
        /// Subject as kind/id
        #[arg(value_parser = parse_subject)]
        subject: SubjectRef,
    },

    /// Check the hash chain of a subject
    Chain {
        /// Subject as kind/id
        #[arg(value_parser = parse_subject)]
        subject: SubjectRef,
    },

    /// Clear an operator halt on a subject
    Release {
        /// Subject as kind/id
        #[arg(value_parser = parse_subject)]
        subject: SubjectRef,
    },
}

/// Where a snapshot comes from
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct SnapshotArgs {
    /// Snapshot as a JSON object
    #[arg(short, long)]
    snapshot: Option<String>,

    /// File holding the snapshot JSON object
    #[arg(long)]
    snapshot_file: Option<std::path::PathBuf>,
}

impl SnapshotArgs {
    fn load(&self) -> anyhow::Result<Snapshot> {
        let text = match (&self.snapshot, &self.snapshot_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
            (None, None) => anyhow::bail!("a snapshot is required"),
        };
        parse_snapshot(&text)
    }
}

/// Result of running a command
pub struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok(text: String) -> Self {
        Self { text, exit_code: 0 }
    }
}

fn parse_subject(value: &str) -> Result<SubjectRef, String> {
    match value.split_once('/') {
        Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(SubjectRef::new(kind, id)),
        _ => Err(format!("expected kind/id, got {:?}", value)),
    }
}

fn parse_snapshot(text: &str) -> anyhow::Result<Snapshot> {
    let value: serde_json::Value = serde_json::from_str(text).context("snapshot is not valid JSON")?;
    Ok(Snapshot::from_json(&value)?)
}

/// Execute an audit CLI command
pub async fn execute_command(
    service: &IntegrityService,
    command: AuditCommands,
) -> anyhow::Result<CommandOutput> {
    match command {
        AuditCommands::Status => {
            let status = service.ledger_status().await;
            let mut text = format_status(service.mode(), &status);
            if service.mode() == LedgerMode::Simulated {
                if let Some(remote) = service.remote_status().await {
                    text.push_str(&format_remote_status(&remote));
                }
            }
            Ok(CommandOutput::ok(text))
        }

        AuditCommands::Record {
            subject,
            kind,
            snapshot,
            previous,
        } => {
            let current = snapshot.load()?;
            let record = match previous {
                Some(previous) => {
                    let previous = parse_snapshot(&previous)?;
                    service
                        .record_with_policy(&subject, Some(&previous), &current, kind)
                        .await?
                }
                None => Some(service.record(&subject, &current, kind).await?),
            };

            Ok(CommandOutput::ok(match record {
                Some(record) => format_record(&record),
                None => format!("{}: change below recording threshold, nothing recorded", subject),
            }))
        }

        AuditCommands::Verify { subject, snapshot } => {
            let report = service.verify(&subject, &snapshot.load()?).await?;
            let exit_code = if report.status == VerificationStatus::Verified {
                0
            } else {
                EXIT_NOT_VERIFIED
            };
            Ok(CommandOutput {
                text: format_report(&subject, &report),
                exit_code,
            })
        }

        AuditCommands::History { subject } => {
            let history = service.history(&subject).await?;
            Ok(CommandOutput::ok(format_history(&subject, &history)))
        }

        AuditCommands::Chain { subject } => {
            let report = service.verify_chain(&subject).await?;
            let exit_code = if report.is_intact() { 0 } else { EXIT_NOT_VERIFIED };
            Ok(CommandOutput {
                text: format_chain(&report),
                exit_code,
            })
        }

        AuditCommands::Release { subject } => {
            let released = service.release(&subject).await?;
            Ok(CommandOutput::ok(if released {
                format!("{} released", subject)
            } else {
                format!("{} was not halted", subject)
            }))
        }
    }
}

// Formatting helpers

fn format_status(mode: LedgerMode, status: &LedgerStatus) -> String {
    let mut out = String::new();
    out.push_str("=== Ledger Status ===\n");
    out.push_str(&format!("Mode: {}\n", mode));
    out.push_str(&format!("Reachable: {}\n", status.reachable));
    if let Some(height) = status.height {
        out.push_str(&format!("Height: {}\n", height));
    }
    if let Some(chain_id) = status.chain_id {
        out.push_str(&format!("Chain ID: {}\n", chain_id));
    }
    if let Some(account) = &status.account {
        out.push_str(&format!("Account: {}\n", account));
    }
    out
}

fn format_remote_status(status: &LedgerStatus) -> String {
    let mut out = String::new();
    out.push_str("\n=== Remote Ledger ===\n");
    out.push_str(&format!("Reachable: {}\n", status.reachable));
    if let Some(height) = status.height {
        out.push_str(&format!("Height: {}\n", height));
    }
    if let Some(chain_id) = status.chain_id {
        out.push_str(&format!("Chain ID: {}\n", chain_id));
    }
    if !status.reachable {
        out.push_str("Receipts issued while the remote is down are simulated\n");
    }
    out
}

fn format_record(record: &AuditRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("Recorded {} ({})\n", record.subject, record.kind));
    out.push_str(&format!("  Digest:    {}\n", record.digest));
    out.push_str(&format!("  Receipt:   {}\n", record.receipt.receipt_id));
    out.push_str(&format!("  Sequence:  {}\n", record.receipt.sequence_number));
    out.push_str(&format!("  Origin:    {}\n", record.receipt.origin));
    out.push_str(&format!("  Confirmed: {}\n", record.receipt.confirmed));
    out
}

fn format_report(subject: &SubjectRef, report: &VerificationReport) -> String {
    let status = serde_json::to_value(report.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", report.status));

    let mut out = format!("{}: {}\n", subject, status);
    out.push_str(&format!("  Computed: {}\n", report.computed_digest));
    if let Some(recorded) = &report.recorded_digest {
        out.push_str(&format!("  Recorded: {}\n", recorded));
    }
    if let Some(receipt_id) = &report.receipt_id {
        out.push_str(&format!("  Receipt:  {}\n", receipt_id));
    }
    out.push_str(&format!("  Ledger checked: {}\n", report.ledger_checked));
    out
}

fn format_history(subject: &SubjectRef, history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return format!("No audit records for {}", subject);
    }

    let mut out = format!("=== History of {} ({} records) ===\n", subject, history.len());
    for entry in history {
        let confirmed = if entry.confirmed { "confirmed" } else { "unconfirmed" };
        out.push_str(&format!(
            "[{}] #{} {} {} ({})\n",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.sequence_number,
            entry.digest,
            entry.receipt_id,
            confirmed
        ));
    }
    out
}

fn format_chain(report: &ChainReport) -> String {
    let mut out = format!("{}: {} records\n", report.subject, report.length);
    match (&report.first_broken, &report.broken_record_id) {
        (Some(index), Some(id)) => {
            out.push_str(&format!("  Broken link at #{} (record {})\n", index, id))
        }
        _ => out.push_str("  Links intact\n"),
    }
    out.push_str(&format!("  Sequence monotonic: {}\n", report.monotonic));
    out
}
