//! Command records: one row per invocation attempt of a named command.
//!
//! `RecordOps` is the set of reads and lifecycle writes over records, run
//! against one unit of storage work. `RecordStore` hands out that view inside
//! an atomic unit, so a read-then-write sequence (the admission claim) sees no
//! interleaved writers. `SqliteRecordStore` is the durable implementation.

use crate::core::broker::DbBroker;
use crate::core::config;
use crate::core::db;
use crate::core::error::LedgerError;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

pub type RecordId = i64;
pub type JsonMap = serde_json::Map<String, JsonValue>;

/// Argument key carrying the record id into a re-entered invocation.
pub const RECORD_ID_ARG: &str = "--command-record-id";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub id: RecordId,
    pub name: String,
    pub arguments: JsonMap,
    pub options: JsonMap,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub result: String,
    pub created_by: String,
    pub updated_by: String,
    /// Set when the attempt failed or was rejected.
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CommandRecord {
    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_withdrawn(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.is_completed() || self.is_withdrawn()
    }

    pub fn is_in_progress(&self) -> bool {
        self.has_started() && !self.is_finalized()
    }

    /// Lifecycle label for display: `pending`, `running`, `completed`, `failed`.
    pub fn status(&self) -> &'static str {
        if self.is_withdrawn() {
            "failed"
        } else if self.is_completed() {
            "completed"
        } else if self.has_started() {
            "running"
        } else {
            "pending"
        }
    }

    /// The arguments snapshot plus the record id, for handing to a re-entered run.
    pub fn command_arguments(&self) -> JsonMap {
        let mut args = self.arguments.clone();
        args.insert(RECORD_ID_ARG.to_string(), JsonValue::from(self.id));
        args
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CommandRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            arguments: json_column(row, 2)?,
            options: json_column(row, 3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            result: row.get(6)?,
            created_by: row.get(7)?,
            updated_by: row.get(8)?,
            deleted_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<JsonMap> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Reads and lifecycle writes over command records.
///
/// Withdrawn records are excluded from every query except `find_by_id`,
/// `all_by_name(.., true)` and the requested counts.
pub trait RecordOps {
    fn create(
        &self,
        name: &str,
        arguments: &JsonMap,
        options: &JsonMap,
    ) -> Result<CommandRecord, LedgerError>;

    fn find_by_id(&self, id: RecordId) -> Result<Option<CommandRecord>, LedgerError>;

    fn find_latest_by_name(&self, name: &str) -> Result<Option<CommandRecord>, LedgerError>;

    /// Most recent first.
    fn all_by_name(
        &self,
        name: &str,
        include_withdrawn: bool,
    ) -> Result<Vec<CommandRecord>, LedgerError>;

    fn is_in_progress(&self, name: &str) -> Result<bool, LedgerError>;

    fn completed_count(&self, name: &str) -> Result<u64, LedgerError>;

    /// Every attempt, withdrawn ones included.
    fn requested_count(&self, name: &str) -> Result<u64, LedgerError>;

    fn has_completed(&self, name: &str) -> Result<bool, LedgerError> {
        Ok(self.completed_count(name)? > 0)
    }

    fn has_been_requested(&self, name: &str) -> Result<bool, LedgerError> {
        Ok(self.requested_count(name)? > 0)
    }

    /// Set `started_at` once. Starting a started record is a no-op; starting
    /// an unstarted finalized record is `AlreadyFinalized`.
    fn start(&self, record: &CommandRecord) -> Result<CommandRecord, LedgerError>;

    fn complete(&self, record: &CommandRecord, message: &str)
    -> Result<CommandRecord, LedgerError>;

    fn fail(&self, record: &CommandRecord, message: &str) -> Result<CommandRecord, LedgerError>;
}

/// A store that can run a closure against `RecordOps` atomically.
///
/// The closure's writes are committed only when it returns `Ok`.
pub trait RecordStore {
    fn with_records<R, F>(&self, op: &str, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&dyn RecordOps) -> Result<R, LedgerError>;

    fn create(
        &self,
        name: &str,
        arguments: &JsonMap,
        options: &JsonMap,
    ) -> Result<CommandRecord, LedgerError> {
        self.with_records("record.create", |r| r.create(name, arguments, options))
    }

    fn find_by_id(&self, id: RecordId) -> Result<Option<CommandRecord>, LedgerError> {
        self.with_records("record.get", |r| r.find_by_id(id))
    }

    fn find_latest_by_name(&self, name: &str) -> Result<Option<CommandRecord>, LedgerError> {
        self.with_records("record.latest", |r| r.find_latest_by_name(name))
    }

    fn all_by_name(
        &self,
        name: &str,
        include_withdrawn: bool,
    ) -> Result<Vec<CommandRecord>, LedgerError> {
        self.with_records("record.list", |r| r.all_by_name(name, include_withdrawn))
    }

    fn is_in_progress(&self, name: &str) -> Result<bool, LedgerError> {
        self.with_records("record.in_progress", |r| r.is_in_progress(name))
    }

    fn has_completed(&self, name: &str) -> Result<bool, LedgerError> {
        self.with_records("record.has_completed", |r| r.has_completed(name))
    }

    fn completed_count(&self, name: &str) -> Result<u64, LedgerError> {
        self.with_records("record.completed_count", |r| r.completed_count(name))
    }

    fn has_been_requested(&self, name: &str) -> Result<bool, LedgerError> {
        self.with_records("record.has_been_requested", |r| r.has_been_requested(name))
    }

    fn requested_count(&self, name: &str) -> Result<u64, LedgerError> {
        self.with_records("record.requested_count", |r| r.requested_count(name))
    }

    fn start(&self, record: &CommandRecord) -> Result<CommandRecord, LedgerError> {
        self.with_records("record.start", |r| r.start(record))
    }

    fn complete(
        &self,
        record: &CommandRecord,
        message: &str,
    ) -> Result<CommandRecord, LedgerError> {
        self.with_records("record.complete", |r| r.complete(record, message))
    }

    fn fail(&self, record: &CommandRecord, message: &str) -> Result<CommandRecord, LedgerError> {
        self.with_records("record.fail", |r| r.fail(record, message))
    }
}

/// Durable record store backed by `ledger.db`.
pub struct SqliteRecordStore {
    db_path: PathBuf,
    broker: DbBroker,
    actor: String,
}

impl SqliteRecordStore {
    /// Open (creating if needed) the ledger database under `root`.
    pub fn open(root: &Path) -> Result<Self, LedgerError> {
        Self::open_as(root, &config::current_actor())
    }

    pub fn open_as(root: &Path, actor: &str) -> Result<Self, LedgerError> {
        let db_path = db::initialize_ledger_db(root)?;
        Ok(Self {
            db_path,
            broker: DbBroker::new(root),
            actor: actor.to_string(),
        })
    }

    pub fn broker(&self) -> &DbBroker {
        &self.broker
    }
}

impl RecordStore for SqliteRecordStore {
    fn with_records<R, F>(&self, op: &str, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&dyn RecordOps) -> Result<R, LedgerError>,
    {
        self.broker
            .with_immediate_tx(&self.db_path, &self.actor, op, |conn| {
                f(&SqlRecords {
                    conn,
                    actor: &self.actor,
                })
            })
    }
}

/// `RecordOps` over one open connection (normally inside a transaction).
struct SqlRecords<'a> {
    conn: &'a Connection,
    actor: &'a str,
}

impl<'a> SqlRecords<'a> {
    fn reload(&self, id: RecordId) -> Result<CommandRecord, LedgerError> {
        self.find_by_id(id)?
            .ok_or_else(|| LedgerError::NotFound(format!("command record {}", id)))
    }

    fn count(&self, sql: &str, name: &str) -> Result<u64, LedgerError> {
        let n: i64 = self.conn.query_row(sql, [name], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Run a finalizing update guarded on the record being open; map a miss
    /// to `NotFound` or `AlreadyFinalized`.
    fn finalize(&self, sql: &str, record: &CommandRecord, message: &str) -> Result<CommandRecord, LedgerError> {
        let ts = time::now_epoch_z();
        let changed = self
            .conn
            .execute(sql, params![ts, message, self.actor, record.id])?;
        let current = self.reload(record.id)?;
        if changed == 0 {
            return Err(LedgerError::AlreadyFinalized { id: record.id });
        }
        Ok(current)
    }
}

impl RecordOps for SqlRecords<'_> {
    fn create(
        &self,
        name: &str,
        arguments: &JsonMap,
        options: &JsonMap,
    ) -> Result<CommandRecord, LedgerError> {
        let ts = time::now_epoch_z();
        self.conn.execute(
            "INSERT INTO command_records(name, arguments, options, result, created_by, updated_by, created_at, updated_at)
             VALUES(?1, ?2, ?3, '', ?4, ?4, ?5, ?5)",
            params![
                name,
                serde_json::to_string(arguments)?,
                serde_json::to_string(options)?,
                self.actor,
                ts
            ],
        )?;
        self.reload(self.conn.last_insert_rowid())
    }

    fn find_by_id(&self, id: RecordId) -> Result<Option<CommandRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM command_records WHERE id = ?1",
            schemas::COMMAND_RECORD_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, [id], CommandRecord::from_row)
            .optional()?)
    }

    fn find_latest_by_name(&self, name: &str) -> Result<Option<CommandRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM command_records WHERE name = ?1 AND deleted_at IS NULL ORDER BY id DESC LIMIT 1",
            schemas::COMMAND_RECORD_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, [name], CommandRecord::from_row)
            .optional()?)
    }

    fn all_by_name(
        &self,
        name: &str,
        include_withdrawn: bool,
    ) -> Result<Vec<CommandRecord>, LedgerError> {
        let mut sql = format!(
            "SELECT {} FROM command_records WHERE name = ?1",
            schemas::COMMAND_RECORD_COLUMNS
        );
        if !include_withdrawn {
            sql.push_str(" AND deleted_at IS NULL");
        }
        sql.push_str(" ORDER BY id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([name], CommandRecord::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn is_in_progress(&self, name: &str) -> Result<bool, LedgerError> {
        Ok(self.count(
            "SELECT COUNT(*) FROM command_records
             WHERE name = ?1 AND deleted_at IS NULL AND started_at IS NOT NULL AND completed_at IS NULL",
            name,
        )? > 0)
    }

    fn completed_count(&self, name: &str) -> Result<u64, LedgerError> {
        self.count(
            "SELECT COUNT(*) FROM command_records
             WHERE name = ?1 AND deleted_at IS NULL AND completed_at IS NOT NULL",
            name,
        )
    }

    fn requested_count(&self, name: &str) -> Result<u64, LedgerError> {
        self.count("SELECT COUNT(*) FROM command_records WHERE name = ?1", name)
    }

    fn start(&self, record: &CommandRecord) -> Result<CommandRecord, LedgerError> {
        let ts = time::now_epoch_z();
        self.conn.execute(
            "UPDATE command_records SET started_at = ?1, updated_at = ?1, updated_by = ?2
             WHERE id = ?3 AND started_at IS NULL AND completed_at IS NULL AND deleted_at IS NULL",
            params![ts, self.actor, record.id],
        )?;
        let current = self.reload(record.id)?;
        if !current.has_started() {
            return Err(LedgerError::AlreadyFinalized { id: record.id });
        }
        Ok(current)
    }

    fn complete(
        &self,
        record: &CommandRecord,
        message: &str,
    ) -> Result<CommandRecord, LedgerError> {
        self.finalize(
            "UPDATE command_records SET completed_at = ?1, result = ?2, updated_at = ?1, updated_by = ?3
             WHERE id = ?4 AND completed_at IS NULL AND deleted_at IS NULL",
            record,
            message,
        )
    }

    fn fail(&self, record: &CommandRecord, message: &str) -> Result<CommandRecord, LedgerError> {
        self.finalize(
            "UPDATE command_records SET deleted_at = ?1, result = ?2, updated_at = ?1, updated_by = ?3
             WHERE id = ?4 AND completed_at IS NULL AND deleted_at IS NULL",
            record,
            message,
        )
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "records",
        "version": "0.1.0",
        "description": "Run history of monitored commands",
        "commands": [
            { "name": "status", "parameters": ["name"] },
            { "name": "list", "parameters": ["name", "with_withdrawn"] },
            { "name": "get", "parameters": ["id"] }
        ],
        "storage": [schemas::LEDGER_DB_NAME]
    })
}
