//! Failure notification hook.
//!
//! When a monitored command runs under a scheduler (a queue worker, cron, a
//! supervisor) and dies where the controller cannot catch it, the scheduler
//! reports the failure here so the record stops reading as in progress.

use crate::core::error::LedgerError;
use crate::plugins::records::{CommandRecord, RecordId, RecordStore};
use serde::{Deserialize, Serialize};

/// A job failure observed outside the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailed {
    pub record_id: RecordId,
    pub message: String,
}

pub struct FailureHook<'a, S: RecordStore> {
    store: &'a S,
}

impl<'a, S: RecordStore> FailureHook<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Withdraw the record with the event's message.
    ///
    /// Returns `None` when the record was already completed or withdrawn;
    /// the first terminal state wins.
    pub fn job_failed(&self, event: &JobFailed) -> Result<Option<CommandRecord>, LedgerError> {
        self.store.with_records("hook.job_failed", |r| {
            let record = r.find_by_id(event.record_id)?.ok_or_else(|| {
                LedgerError::NotFound(format!("command record {}", event.record_id))
            })?;
            if record.is_finalized() {
                return Ok(None);
            }
            Ok(Some(r.fail(&record, &event.message)?))
        })
    }
}
