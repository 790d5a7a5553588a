use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::{Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::LedgerError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::LedgerError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::LedgerError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::LedgerError::RusqliteError)?;
    Ok(conn)
}

pub fn ledger_db_path(root: &Path) -> PathBuf {
    root.join(schemas::LEDGER_DB_NAME)
}

/// Create tables and indexes up to `LEDGER_SCHEMA_VERSION`. Idempotent.
pub fn ensure_schema(conn: &Connection) -> Result<(), error::LedgerError> {
    conn.execute(schemas::LEDGER_DB_SCHEMA_META, [])?;

    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(error::LedgerError::RusqliteError)?;

    let current_version: u32 = current
        .as_deref()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    if current_version >= schemas::LEDGER_SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute(schemas::LEDGER_DB_SCHEMA_COMMAND_RECORDS, [])?;
    conn.execute(schemas::LEDGER_DB_SCHEMA_INDEX_NAME, [])?;

    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [schemas::LEDGER_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub fn initialize_ledger_db(root: &Path) -> Result<PathBuf, error::LedgerError> {
    fs::create_dir_all(root).map_err(error::LedgerError::IoError)?;
    let db_path = ledger_db_path(root);

    let broker = DbBroker::new(root);
    broker
        .with_conn(&db_path, "runledger", "ledger.init", ensure_schema)
        .map_err(|e| error::LedgerError::DatabaseInitializationError(e.to_string()))?;

    Ok(db_path)
}
