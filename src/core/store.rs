//! Project store layout for the ledger.
//!
//! A project opts in by carrying a `.runledger/` directory. Ledger state lives
//! under `.runledger/data/`, configuration in `.runledger/config.toml`.

use crate::core::error::LedgerError;
use std::fs;
use std::path::{Path, PathBuf};

pub const LEDGER_DIR_NAME: &str = ".runledger";
pub const DATA_DIR_NAME: &str = "data";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Store handle for one project's ledger.
#[derive(Debug, Clone)]
pub struct Store {
    /// Project root (parent of `.runledger/`)
    pub project_root: PathBuf,
    /// Absolute path to the data directory (`.runledger/data`)
    pub root: PathBuf,
}

impl Store {
    pub fn at(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            root: project_root.join(LEDGER_DIR_NAME).join(DATA_DIR_NAME),
        }
    }

    /// Walk up from `start_dir` to the first directory holding `.runledger/`.
    pub fn discover(start_dir: &Path) -> Result<Self, LedgerError> {
        let mut current_dir = PathBuf::from(start_dir);
        loop {
            if current_dir.join(LEDGER_DIR_NAME).is_dir() {
                return Ok(Self::at(&current_dir));
            }
            if !current_dir.pop() {
                return Err(LedgerError::NotFound(
                    "'.runledger' directory not found in current or parent directories. Run `runledger init` first.".to_string(),
                ));
            }
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.project_root
            .join(LEDGER_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    pub fn ensure_dirs(&self) -> Result<(), LedgerError> {
        fs::create_dir_all(&self.root).map_err(LedgerError::IoError)
    }
}
