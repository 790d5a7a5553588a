//! Work unit that runs an external program.
//!
//! The child receives its configured args, the invocation's positional
//! arguments, then `--command-record-id <id>`. The id is also exported as
//! `RUNLEDGER_COMMAND_RECORD_ID` so a recursive child can re-enter with
//! `runledger run <name> --record-id $RUNLEDGER_COMMAND_RECORD_ID --nested`.

use crate::core::output;
use crate::plugins::admission::{RunContext, WorkOutput, WorkUnit};
use crate::plugins::records::RECORD_ID_ARG;
use anyhow::{Context, bail};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

pub const RECORD_ID_ENV: &str = "RUNLEDGER_COMMAND_RECORD_ID";
pub const COMMAND_NAME_ENV: &str = "RUNLEDGER_COMMAND_NAME";

/// Invocation argument key holding positional arguments (a JSON array).
pub const POSITIONAL_ARGS_KEY: &str = "args";

const MAX_CAPTURED_CHARS: usize = 1000;

#[derive(Debug, Clone)]
pub struct ProcessWork {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessWork {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, dir: PathBuf) -> Self {
        self.cwd = Some(dir);
        self
    }

    fn command_line(&self, ctx: &RunContext) -> Vec<String> {
        let mut argv = self.args.clone();
        if let Some(JsonValue::Array(items)) = ctx.arguments.get(POSITIONAL_ARGS_KEY) {
            argv.extend(items.iter().map(|v| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            }));
        }
        argv.push(RECORD_ID_ARG.to_string());
        argv.push(ctx.record_id.to_string());
        argv
    }
}

impl WorkUnit for ProcessWork {
    fn run(&self, ctx: &RunContext) -> anyhow::Result<WorkOutput> {
        let start_time = Instant::now();
        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_line(ctx))
            .env(RECORD_ID_ENV, ctx.record_id.to_string())
            .env(COMMAND_NAME_ENV, &ctx.name);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let out = cmd
            .output()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        let stdout = String::from_utf8_lossy(&out.stdout);
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let code = out
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            bail!(
                "'{}' exited with {} after {}ms: {}",
                self.program,
                code,
                start_time.elapsed().as_millis(),
                output::compact_line(&stderr, MAX_CAPTURED_CHARS)
            );
        }

        Ok(WorkOutput::Text(output::bounded_block(
            &stdout,
            MAX_CAPTURED_CHARS,
        )))
    }
}
