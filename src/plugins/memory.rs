//! In-process record store for embedding and tests.
//!
//! The whole store sits behind one mutex held for the duration of a
//! `with_records` unit; a unit that returns `Err` is rolled back to the
//! snapshot taken when it began.

use crate::core::error::LedgerError;
use crate::core::time;
use crate::plugins::records::{CommandRecord, JsonMap, RecordId, RecordOps, RecordStore};
use std::cell::RefCell;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    rows: Vec<CommandRecord>,
    next_id: RecordId,
}

pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
    actor: String,
}

impl MemoryRecordStore {
    pub fn new(actor: &str) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            actor: actor.to_string(),
        }
    }

    /// Copy of every row, oldest first.
    pub fn snapshot(&self) -> Vec<CommandRecord> {
        match self.state.lock() {
            Ok(state) => state.rows.clone(),
            Err(poisoned) => poisoned.into_inner().rows.clone(),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new("runledger")
    }
}

impl RecordStore for MemoryRecordStore {
    fn with_records<R, F>(&self, _op: &str, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&dyn RecordOps) -> Result<R, LedgerError>,
    {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| LedgerError::LockPoisoned("memory record store".to_string()))?;
        let snapshot = guard.clone();
        let result = {
            let view = MemoryRecords {
                state: RefCell::new(&mut *guard),
                actor: &self.actor,
            };
            f(&view)
        };
        if result.is_err() {
            *guard = snapshot;
        }
        result
    }
}

struct MemoryRecords<'a> {
    state: RefCell<&'a mut MemoryState>,
    actor: &'a str,
}

impl MemoryRecords<'_> {
    fn count_where(&self, name: &str, pred: impl Fn(&CommandRecord) -> bool) -> u64 {
        self.state
            .borrow()
            .rows
            .iter()
            .filter(|r| r.name == name && pred(*r))
            .count() as u64
    }

    /// Apply `update` to an open record; `AlreadyFinalized` if it is closed.
    fn finalize(
        &self,
        id: RecordId,
        update: impl FnOnce(&mut CommandRecord, &str),
    ) -> Result<CommandRecord, LedgerError> {
        let mut state = self.state.borrow_mut();
        let row = state
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("command record {}", id)))?;
        if row.is_finalized() {
            return Err(LedgerError::AlreadyFinalized { id });
        }
        let ts = time::now_epoch_z();
        update(&mut *row, &ts);
        row.updated_at = ts;
        row.updated_by = self.actor.to_string();
        Ok(row.clone())
    }
}

impl RecordOps for MemoryRecords<'_> {
    fn create(
        &self,
        name: &str,
        arguments: &JsonMap,
        options: &JsonMap,
    ) -> Result<CommandRecord, LedgerError> {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let ts = time::now_epoch_z();
        let rec = CommandRecord {
            id: state.next_id,
            name: name.to_string(),
            arguments: arguments.clone(),
            options: options.clone(),
            started_at: None,
            completed_at: None,
            result: String::new(),
            created_by: self.actor.to_string(),
            updated_by: self.actor.to_string(),
            deleted_at: None,
            created_at: ts.clone(),
            updated_at: ts,
        };
        state.rows.push(rec.clone());
        Ok(rec)
    }

    fn find_by_id(&self, id: RecordId) -> Result<Option<CommandRecord>, LedgerError> {
        Ok(self
            .state
            .borrow()
            .rows
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    fn find_latest_by_name(&self, name: &str) -> Result<Option<CommandRecord>, LedgerError> {
        Ok(self
            .state
            .borrow()
            .rows
            .iter()
            .rev()
            .find(|r| r.name == name && !r.is_withdrawn())
            .cloned())
    }

    fn all_by_name(
        &self,
        name: &str,
        include_withdrawn: bool,
    ) -> Result<Vec<CommandRecord>, LedgerError> {
        Ok(self
            .state
            .borrow()
            .rows
            .iter()
            .rev()
            .filter(|r| r.name == name && (include_withdrawn || !r.is_withdrawn()))
            .cloned()
            .collect())
    }

    fn is_in_progress(&self, name: &str) -> Result<bool, LedgerError> {
        Ok(self.count_where(name, CommandRecord::is_in_progress) > 0)
    }

    fn completed_count(&self, name: &str) -> Result<u64, LedgerError> {
        Ok(self.count_where(name, |r| r.is_completed() && !r.is_withdrawn()))
    }

    fn requested_count(&self, name: &str) -> Result<u64, LedgerError> {
        Ok(self.count_where(name, |_| true))
    }

    fn start(&self, record: &CommandRecord) -> Result<CommandRecord, LedgerError> {
        let mut state = self.state.borrow_mut();
        let row = state
            .rows
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| LedgerError::NotFound(format!("command record {}", record.id)))?;
        if row.has_started() {
            return Ok(row.clone());
        }
        if row.is_finalized() {
            return Err(LedgerError::AlreadyFinalized { id: record.id });
        }
        let ts = time::now_epoch_z();
        row.started_at = Some(ts.clone());
        row.updated_at = ts;
        row.updated_by = self.actor.to_string();
        Ok(row.clone())
    }

    fn complete(
        &self,
        record: &CommandRecord,
        message: &str,
    ) -> Result<CommandRecord, LedgerError> {
        self.finalize(record.id, |row, ts| {
            row.completed_at = Some(ts.to_string());
            row.result = message.to_string();
        })
    }

    fn fail(&self, record: &CommandRecord, message: &str) -> Result<CommandRecord, LedgerError> {
        self.finalize(record.id, |row, ts| {
            row.deleted_at = Some(ts.to_string());
            row.result = message.to_string();
        })
    }
}
