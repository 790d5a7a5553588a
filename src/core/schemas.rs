//! Database schema definitions for the ledger store.
//!
//! A single SQLite database (`ledger.db`) holds one row per command
//! invocation attempt plus a `meta` table tracking the schema version.

pub const LEDGER_DB_NAME: &str = "ledger.db";
pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

pub const LEDGER_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const LEDGER_DB_SCHEMA_COMMAND_RECORDS: &str = "
    CREATE TABLE IF NOT EXISTS command_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        arguments TEXT NOT NULL, -- JSON object
        options TEXT NOT NULL, -- JSON object
        started_at TEXT,
        completed_at TEXT,
        result TEXT NOT NULL DEFAULT '',
        created_by TEXT NOT NULL DEFAULT '',
        updated_by TEXT NOT NULL DEFAULT '',
        deleted_at TEXT, -- withdrawn (failed) marker
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const LEDGER_DB_SCHEMA_INDEX_NAME: &str =
    "CREATE INDEX IF NOT EXISTS idx_command_records_name ON command_records(name, deleted_at)";

/// Columns in the order `CommandRecord::from_row` reads them.
pub const COMMAND_RECORD_COLUMNS: &str = "id, name, arguments, options, started_at, completed_at, result, created_by, updated_by, deleted_at, created_at, updated_at";
