use crate::core::db;
use crate::core::error;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The DB Broker is the single door to ledger state.
/// Access is serialized in-process and every operation lands in the audit log.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(schemas::BROKER_EVENTS_NAME),
        }
    }

    /// Execute a closure with a serialized connection to the specified DB.
    ///
    /// The audit line is written after `f` returns. A failed audit write is
    /// reported on stderr and never replaces `f`'s result: by then the
    /// database work may already be committed.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, error::LedgerError>
    where
        F: FnOnce(&Connection) -> Result<R, error::LedgerError>,
    {
        static DB_LOCK: Mutex<()> = Mutex::new(());
        let _lock = DB_LOCK
            .lock()
            .map_err(|_| error::LedgerError::LockPoisoned("ledger broker".to_string()))?;

        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let conn = db::db_connect(&db_path.to_string_lossy())?;

        let result = f(&conn);

        let status = if result.is_ok() { "success" } else { "error" };
        if let Err(e) = self.log_event(actor, op_name, &db_id, status) {
            eprintln!(
                "warning: audit log {} not written for {} ({}): {}",
                self.audit_log_path.display(),
                op_name,
                status,
                e
            );
        }

        result
    }

    /// Like `with_conn`, inside a `BEGIN IMMEDIATE` transaction committed
    /// only when `f` returns `Ok`.
    pub fn with_immediate_tx<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, error::LedgerError>
    where
        F: FnOnce(&Connection) -> Result<R, error::LedgerError>,
    {
        self.with_conn(db_path, actor, op_name, |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    fn log_event(
        &self,
        actor: &str,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), error::LedgerError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };

        if let Some(parent) = self.audit_log_path.parent() {
            fs::create_dir_all(parent).map_err(error::LedgerError::IoError)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::LedgerError::IoError)?;

        writeln!(f, "{}", serde_json::to_string(&ev)?).map_err(error::LedgerError::IoError)?;
        Ok(())
    }

    pub fn read_events(&self) -> Result<Vec<BrokerEvent>, error::LedgerError> {
        if !self.audit_log_path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.audit_log_path).map_err(error::LedgerError::IoError)?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(error::LedgerError::IoError)?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "broker",
        "version": "0.1.0",
        "description": "Serialized ledger access with an append-only audit log",
        "commands": [],
        "storage": [schemas::BROKER_EVENTS_NAME]
    })
}
