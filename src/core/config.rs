//! `.runledger/config.toml` loading.
//!
//! ```toml
//! [[command]]
//! name = "db:migrate"
//! runs_once = true
//! exec = "./bin/migrate"
//! args = ["--all"]
//!
//! [[command]]
//! name = "db:seed"
//! runs_if = ["db:migrate"]
//! run_limit = 1
//! ```

use crate::core::error::LedgerError;
use crate::plugins::admission::{CommandDefinition, validate_command_name};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const ACTOR_ENV: &str = "RUNLEDGER_ACTOR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default, rename = "command")]
    pub commands: Vec<CommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub name: String,
    #[serde(default)]
    pub runs_once: bool,
    #[serde(default)]
    pub runs_if: Vec<String>,
    #[serde(default)]
    pub doesnt_run_if: Vec<String>,
    #[serde(default = "default_run_limit")]
    pub run_limit: i64,
    #[serde(default)]
    pub recursive: bool,
    /// Program to run for `runledger run`; absent means the command is
    /// definition-only (checked by other commands' `runs_if`).
    pub exec: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_run_limit() -> i64 {
    -1
}

impl CommandConfig {
    pub fn definition(&self) -> CommandDefinition {
        CommandDefinition::new(&self.name)
            .runs_once(self.runs_once)
            .runs_if(self.runs_if.iter().cloned())
            .doesnt_run_if(self.doesnt_run_if.iter().cloned())
            .run_limit(self.run_limit)
            .recursive(self.recursive)
    }
}

impl LedgerConfig {
    pub fn parse(content: &str) -> Result<Self, LedgerError> {
        let config: LedgerConfig =
            toml::from_str(content).map_err(|e| LedgerError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file. No file means no commands configured (not an error).
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(LedgerError::IoError)?;
        Self::parse(&content)
    }

    pub fn command(&self, name: &str) -> Result<&CommandConfig, LedgerError> {
        self.commands
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| LedgerError::NotFound(format!("command '{}' is not configured", name)))
    }

    fn validate(&self) -> Result<(), LedgerError> {
        let mut seen = HashSet::new();
        for cmd in &self.commands {
            validate_command_name(&cmd.name)?;
            for dep in cmd.runs_if.iter().chain(cmd.doesnt_run_if.iter()) {
                validate_command_name(dep)?;
            }
            if !seen.insert(cmd.name.as_str()) {
                return Err(LedgerError::ConfigError(format!(
                    "command '{}' is defined more than once",
                    cmd.name
                )));
            }
        }
        Ok(())
    }
}

/// Actor recorded in editor stamps: `RUNLEDGER_ACTOR`, then `USER`.
pub fn current_actor() -> String {
    std::env::var(ACTOR_ENV)
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}
