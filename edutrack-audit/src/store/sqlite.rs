//! SQLite-backed audit store.
//!
//! Rows are keyed by `(subject_kind, subject_id, sequence_number)` with a
//! unique secondary index on `receipt_id`. Append-only triggers abort any
//! UPDATE or DELETE on `audit_records`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::{build_record, check_append, schema, AuditStore, StoreError};
use crate::hasher::Digest;
use crate::types::{AuditRecord, LedgerOrigin, NewAuditRecord, Receipt, SubjectRef};

const RECORD_COLUMNS: &str = "id, subject_kind, subject_id, sequence_number, record_kind, digest, \
     receipt_id, receipt_digest, submitted_at, confirmed, origin, created_at, prev_hash, chain_hash";

/// Audit store persisted in a SQLite database file.
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    /// Open or create the audit database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Opening audit database at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| StoreError::Database(format!("Failed to open SQLite: {}", e)))?;

        // WAL lets verification reads proceed while an append is in flight
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Database(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory audit database");

        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }
}

/// Column values of one `audit_records` row.
struct RawRecord {
    id: String,
    subject_kind: String,
    subject_id: String,
    sequence_number: i64,
    record_kind: String,
    digest: String,
    receipt_id: String,
    receipt_digest: String,
    submitted_at: String,
    confirmed: bool,
    origin: String,
    created_at: String,
    prev_hash: String,
    chain_hash: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_kind: row.get(1)?,
            subject_id: row.get(2)?,
            sequence_number: row.get(3)?,
            record_kind: row.get(4)?,
            digest: row.get(5)?,
            receipt_id: row.get(6)?,
            receipt_digest: row.get(7)?,
            submitted_at: row.get(8)?,
            confirmed: row.get(9)?,
            origin: row.get(10)?,
            created_at: row.get(11)?,
            prev_hash: row.get(12)?,
            chain_hash: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<AuditRecord, StoreError> {
        let corrupt = |what: &str, value: &str| {
            StoreError::Corrupt(format!("record {}: bad {} {:?}", self.id, what, value))
        };

        let digest = Digest::from_hex(&self.digest).ok_or_else(|| corrupt("digest", &self.digest))?;
        let receipt_digest = Digest::from_hex(&self.receipt_digest)
            .ok_or_else(|| corrupt("receipt digest", &self.receipt_digest))?;
        let kind = self
            .record_kind
            .parse()
            .map_err(|_| corrupt("record kind", &self.record_kind))?;
        let origin: LedgerOrigin = self.origin.parse().map_err(|_| corrupt("origin", &self.origin))?;
        let sequence_number = u64::try_from(self.sequence_number)
            .map_err(|_| corrupt("sequence number", &self.sequence_number.to_string()))?;
        let submitted_at = parse_timestamp(&self.submitted_at)
            .ok_or_else(|| corrupt("submitted_at", &self.submitted_at))?;
        let created_at =
            parse_timestamp(&self.created_at).ok_or_else(|| corrupt("created_at", &self.created_at))?;

        Ok(AuditRecord {
            id: self.id,
            subject: SubjectRef::new(self.subject_kind, self.subject_id),
            kind,
            digest,
            receipt: Receipt {
                receipt_id: self.receipt_id,
                digest: receipt_digest,
                sequence_number,
                submitted_at,
                confirmed: self.confirmed,
                origin,
            },
            created_at,
            prev_hash: self.prev_hash,
            chain_hash: self.chain_hash,
        })
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_sql_sequence(sequence: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence)
        .map_err(|_| StoreError::Database(format!("Sequence number {} exceeds storage range", sequence)))
}

fn query_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(format!("Query failed: {}", e))
}

fn latest_for(conn: &Connection, subject: &SubjectRef) -> Result<Option<AuditRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM audit_records WHERE subject_kind = ?1 AND subject_id = ?2 \
         ORDER BY sequence_number DESC LIMIT 1",
        RECORD_COLUMNS
    );
    conn.query_row(&sql, params![subject.kind, subject.id], RawRecord::from_row)
        .optional()
        .map_err(query_err)?
        .map(RawRecord::into_record)
        .transpose()
}

fn halt_reason_for(conn: &Connection, subject: &SubjectRef) -> Result<Option<String>, StoreError> {
    conn.query_row(
        "SELECT reason FROM halted_subjects WHERE subject_kind = ?1 AND subject_id = ?2",
        params![subject.kind, subject.id],
        |row| row.get(0),
    )
    .optional()
    .map_err(query_err)
}

fn insert_halt(conn: &Connection, subject: &SubjectRef, reason: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO halted_subjects (subject_kind, subject_id, reason, halted_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![subject.kind, subject.id, reason, format_timestamp(&Utc::now())],
    )
    .map_err(|e| StoreError::Database(format!("Failed to halt subject: {}", e)))?;
    Ok(())
}

fn insert_record(conn: &Connection, stored: &AuditRecord) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO audit_records ({}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        RECORD_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            stored.id,
            stored.subject.kind,
            stored.subject.id,
            to_sql_sequence(stored.receipt.sequence_number)?,
            stored.kind.as_str(),
            stored.digest.as_str(),
            stored.receipt.receipt_id,
            stored.receipt.digest.as_str(),
            format_timestamp(&stored.receipt.submitted_at),
            stored.receipt.confirmed,
            stored.receipt.origin.as_str(),
            format_timestamp(&stored.created_at),
            stored.prev_hash,
            stored.chain_hash,
        ],
    )
    .map_err(|e| StoreError::Database(format!("Insert failed: {}", e)))?;
    Ok(())
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, record: NewAuditRecord) -> Result<AuditRecord, StoreError> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| StoreError::Database(format!("Failed to begin transaction: {}", e)))?;
            let subject = record.subject.clone();

            if let Some(reason) = halt_reason_for(&tx, &subject)? {
                return Err(StoreError::SubjectHalted {
                    subject: subject.to_string(),
                    reason,
                });
            }

            let duplicate: Option<String> = tx
                .query_row(
                    "SELECT id FROM audit_records WHERE receipt_id = ?1",
                    params![record.receipt.receipt_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(query_err)?;
            if duplicate.is_some() {
                return Err(StoreError::DuplicateReceipt(record.receipt.receipt_id.clone()));
            }

            let latest = latest_for(&tx, &subject)?;
            if let Err(reason) = check_append(latest.as_ref(), &record) {
                warn!(subject = %subject, reason = %reason, "Halting subject after consistency violation");
                insert_halt(&tx, &subject, &reason)?;
                tx.commit()
                    .map_err(|e| StoreError::Database(format!("Failed to commit halt: {}", e)))?;
                return Err(StoreError::ConsistencyViolation {
                    subject: subject.to_string(),
                    reason,
                });
            }

            let stored = build_record(latest.as_ref(), record);
            insert_record(&tx, &stored)?;

            tx.commit()
                .map_err(|e| StoreError::Database(format!("Failed to commit append: {}", e)))?;

            Ok(stored)
        })
    }

    async fn latest(&self, subject: &SubjectRef) -> Result<Option<AuditRecord>, StoreError> {
        self.with_conn(|conn| latest_for(conn, subject))
    }

    async fn history(&self, subject: &SubjectRef) -> Result<Vec<AuditRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM audit_records WHERE subject_kind = ?1 AND subject_id = ?2 \
                 ORDER BY rowid ASC",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(query_err)?;
            let rows = stmt
                .query_map(params![subject.kind, subject.id], RawRecord::from_row)
                .map_err(query_err)?;

            let records = rows
                .map(|row| row.map_err(query_err).and_then(RawRecord::into_record))
                .collect::<Result<Vec<_>, _>>();
            records
        })
    }

    async fn find_by_receipt(&self, receipt_id: &str) -> Result<Option<AuditRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM audit_records WHERE receipt_id = ?1",
                RECORD_COLUMNS
            );
            conn.query_row(&sql, params![receipt_id], RawRecord::from_row)
                .optional()
                .map_err(query_err)?
                .map(RawRecord::into_record)
                .transpose()
        })
    }

    async fn receipts_by_origin(&self, origin: LedgerOrigin) -> Result<Vec<Receipt>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM audit_records WHERE origin = ?1 ORDER BY sequence_number ASC",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(query_err)?;
            let rows = stmt
                .query_map(params![origin.as_str()], RawRecord::from_row)
                .map_err(query_err)?;

            let receipts = rows
                .map(|row| {
                    row.map_err(query_err)
                        .and_then(RawRecord::into_record)
                        .map(|record| record.receipt)
                })
                .collect::<Result<Vec<_>, _>>();
            receipts
        })
    }

    async fn halt_reason(&self, subject: &SubjectRef) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| halt_reason_for(conn, subject))
    }

    async fn halt(&self, subject: &SubjectRef, reason: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| insert_halt(conn, subject, reason))
    }

    async fn release(&self, subject: &SubjectRef) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM halted_subjects WHERE subject_kind = ?1 AND subject_id = ?2",
                    params![subject.kind, subject.id],
                )
                .map_err(|e| StoreError::Database(format!("Failed to release subject: {}", e)))?;
            if removed > 0 {
                info!(subject = %subject, "Released halted subject");
            }
            Ok(removed > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::IntegrityConfig;
    use crate::ledger::{LedgerSet, SimulatedLedger};
    use crate::service::IntegrityService;
    use crate::store::chain_hash;
    use crate::store::test_support::new_record;

    #[tokio::test]
    async fn test_append_latest_history() {
        let store = SqliteAuditStore::open_in_memory().unwrap();
        let subject = SubjectRef::new("student_progress", "12");

        let first = store
            .append(new_record(&subject, b"a", 1, LedgerOrigin::Simulated))
            .await
            .unwrap();
        let second = store
            .append(new_record(&subject, b"b", 2, LedgerOrigin::Simulated))
            .await
            .unwrap();

        assert_eq!(store.latest(&subject).await.unwrap(), Some(second.clone()));
        assert_eq!(store.history(&subject).await.unwrap(), vec![first, second]);
        assert!(store
            .latest(&SubjectRef::new("student_progress", "13"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rows_cannot_be_updated_or_deleted() {
        let store = SqliteAuditStore::open_in_memory().unwrap();
        let subject = SubjectRef::new("student", "1");
        store
            .append(new_record(&subject, b"a", 1, LedgerOrigin::Simulated))
            .await
            .unwrap();

        store
            .with_conn(|conn| {
                let update = conn.execute("UPDATE audit_records SET digest = 'x'", []);
                assert!(update.is_err());
                let delete = conn.execute("DELETE FROM audit_records", []);
                assert!(delete.is_err());
                Ok(())
            })
            .unwrap();

        assert_eq!(store.history(&subject).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_receipt_rejected() {
        let store = SqliteAuditStore::open_in_memory().unwrap();
        let a = SubjectRef::new("student", "1");
        let record = new_record(&a, b"a", 1, LedgerOrigin::Simulated);

        store.append(record.clone()).await.unwrap();
        let err = store.append(record).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReceipt(_)));
    }

    #[tokio::test]
    async fn test_halt_persists_and_releases() {
        let store = SqliteAuditStore::open_in_memory().unwrap();
        let subject = SubjectRef::new("student", "4");

        store
            .append(new_record(&subject, b"a", 1, LedgerOrigin::Simulated))
            .await
            .unwrap();
        let err = store
            .append(new_record(&subject, b"b", 2, LedgerOrigin::Remote))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConsistencyViolation { .. }));
        assert!(store.halt_reason(&subject).await.unwrap().is_some());

        assert!(store.release(&subject).await.unwrap());
        assert!(!store.release(&subject).await.unwrap());
        assert!(store.halt_reason(&subject).await.unwrap().is_none());
    }

    async fn chained_store(subject: &SubjectRef) -> (Arc<SqliteAuditStore>, Vec<AuditRecord>) {
        let store = Arc::new(SqliteAuditStore::open_in_memory().unwrap());
        let mut records = Vec::new();
        for (payload, sequence) in [(b"a", 1), (b"b", 2), (b"c", 3)] {
            let record = store
                .append(new_record(subject, payload, sequence, LedgerOrigin::Simulated))
                .await
                .unwrap();
            records.push(record);
        }
        (store, records)
    }

    fn service_over(store: Arc<SqliteAuditStore>) -> IntegrityService {
        IntegrityService::new(
            LedgerSet::simulated_only(Arc::new(SimulatedLedger::new())),
            store,
            IntegrityConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_inserted_row_breaks_chain() {
        let subject = SubjectRef::new("student_progress", "20");
        let (store, records) = chained_store(&subject).await;

        // Copy of the second record slipped in behind the append path
        let mut forged = records[1].clone();
        forged.id = "forged".to_string();
        forged.receipt.receipt_id = "forged-receipt".to_string();
        forged.receipt.sequence_number = 99;
        store.with_conn(|conn| insert_record(conn, &forged)).unwrap();

        let report = service_over(store).verify_chain(&subject).await.unwrap();
        assert_eq!(report.length, 4);
        assert_eq!(report.first_broken, Some(3));
        assert_eq!(report.broken_record_id.as_deref(), Some("forged"));
        assert!(report.monotonic);
        assert!(!report.is_intact());
    }

    #[tokio::test]
    async fn test_rewound_sequence_is_not_monotonic() {
        let subject = SubjectRef::new("student_progress", "21");
        let (store, records) = chained_store(&subject).await;

        // Correctly linked, but earlier on the ledger than its predecessor
        let last = &records[2];
        let mut rewound = last.clone();
        rewound.id = "rewound".to_string();
        rewound.receipt.receipt_id = "rewound-receipt".to_string();
        rewound.receipt.sequence_number = 0;
        rewound.prev_hash = last.chain_hash.clone();
        rewound.chain_hash = chain_hash(&rewound.prev_hash, &rewound.receipt);
        store.with_conn(|conn| insert_record(conn, &rewound)).unwrap();

        let report = service_over(store).verify_chain(&subject).await.unwrap();
        assert_eq!(report.length, 4);
        assert_eq!(report.first_broken, None);
        assert!(!report.monotonic);
        assert!(!report.is_intact());
    }
}
