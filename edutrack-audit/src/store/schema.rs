//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new audit schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version == SCHEMA_VERSION {
        info!("Audit schema is up to date (v{})", current_version);
    } else {
        return Err(StoreError::Database(format!(
            "Unsupported audit schema v{} (this build understands v{})",
            current_version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::Database(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| StoreError::Database(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| StoreError::Database(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(AUDIT_SCHEMA)
        .map_err(|e| StoreError::Database(format!("Failed to create audit tables: {}", e)))?;

    conn.execute_batch(APPEND_ONLY_TRIGGERS)
        .map_err(|e| StoreError::Database(format!("Failed to create append-only triggers: {}", e)))?;

    Ok(())
}

/// Audit record and halt tables
const AUDIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_records (
    id TEXT NOT NULL UNIQUE,
    subject_kind TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    record_kind TEXT NOT NULL,
    digest TEXT NOT NULL,
    receipt_id TEXT NOT NULL,
    receipt_digest TEXT NOT NULL,
    submitted_at TEXT NOT NULL,
    confirmed INTEGER NOT NULL,
    origin TEXT NOT NULL,
    created_at TEXT NOT NULL,
    prev_hash TEXT NOT NULL,
    chain_hash TEXT NOT NULL,
    PRIMARY KEY (subject_kind, subject_id, sequence_number)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_records_receipt ON audit_records(receipt_id);
CREATE INDEX IF NOT EXISTS idx_audit_records_origin ON audit_records(origin, sequence_number);

CREATE TABLE IF NOT EXISTS halted_subjects (
    subject_kind TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    halted_at TEXT NOT NULL,
    PRIMARY KEY (subject_kind, subject_id)
);
"#;

/// Audit rows can be inserted, never changed
const APPEND_ONLY_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS audit_records_no_update
BEFORE UPDATE ON audit_records
BEGIN
    SELECT RAISE(ABORT, 'audit_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_records_no_delete
BEFORE DELETE ON audit_records
BEGIN
    SELECT RAISE(ABORT, 'audit_records is append-only');
END;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_unknown_version_refused() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();

        let err = init_schema(&conn).unwrap_err();
        assert!(matches!(err, StoreError::Database(msg) if msg.contains("Unsupported")));
    }
}
