//! runledger: run history and admission control for one-off commands.
//!
//! Migrations, backfills and batch jobs are usually meant to run once, or
//! only after something else ran, or at most N times. runledger keeps one
//! `CommandRecord` per invocation attempt and answers, before any work
//! starts: has this command already run, is it running now, how often has it
//! run, and may this invocation proceed?
//!
//! # Architecture
//!
//! - [`plugins::records`]: the record store (`RecordStore`/`RecordOps`),
//!   SQLite-backed by default, with an in-memory store in [`plugins::memory`].
//! - [`plugins::admission`]: `AdmissionController`, which checks run rules,
//!   claims the record atomically, runs the work unit and finalizes the record.
//! - [`plugins::hooks`]: `FailureHook`, for failures detected by a scheduler.
//! - [`plugins::exec`]: `ProcessWork`, a work unit that runs an external program.
//!
//! All database access goes through `core::broker::DbBroker`, which appends
//! one line per operation to `broker.events.jsonl`.
//!
//! # Examples
//!
//! ```bash
//! runledger init
//! runledger run db:migrate
//! runledger status db:migrate
//! runledger list db:migrate --with-withdrawn
//! ```

mod cli;
pub mod core;
pub mod plugins;

use cli::{Cli, Command, RunCli};
use core::{
    broker, config::LedgerConfig, db, error::LedgerError, output, store::Store, time,
};
use plugins::{
    admission::{self, AdmissionController, Invocation, Outcome, validate_command_name},
    exec::{POSITIONAL_ARGS_KEY, ProcessWork},
    hooks::{FailureHook, JobFailed},
    records::{self, RecordStore, SqliteRecordStore},
};

use clap::Parser;
use colored::Colorize;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::Path;
use std::process::ExitCode;

const CONFIG_TEMPLATE: &str = r#"# runledger command definitions.
#
# [[command]]
# name = "db:migrate"
# runs_once = true
# exec = "./bin/migrate"
# args = []
# runs_if = []
# doesnt_run_if = []
# run_limit = -1
# recursive = false
"#;

pub fn run() -> Result<ExitCode, LedgerError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;

    match cli.command {
        Command::Init { dir } => {
            let target = dir.unwrap_or(current_dir);
            init_project(&target)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Capabilities => {
            emit(&time::command_envelope(
                "capabilities",
                "ok",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "subsystems": [
                        records::schema(),
                        admission::schema(),
                        broker::schema()
                    ]
                }),
            ));
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let store = Store::discover(&current_dir)?;
            let records = SqliteRecordStore::open(&store.root)?;
            dispatch(&store, records, command)
        }
    }
}

fn dispatch(
    store: &Store,
    records: SqliteRecordStore,
    command: Command,
) -> Result<ExitCode, LedgerError> {
    match command {
        Command::Run(run) => run_command(store, records, run),
        Command::Status { name } => {
            validate_command_name(&name)?;
            let summary = records.with_records("record.status", |r| {
                Ok(serde_json::json!({
                    "name": name,
                    "in_progress": r.is_in_progress(&name)?,
                    "has_completed": r.has_completed(&name)?,
                    "completed_count": r.completed_count(&name)?,
                    "has_been_requested": r.has_been_requested(&name)?,
                    "requested_count": r.requested_count(&name)?,
                    "latest": r.find_latest_by_name(&name)?,
                }))
            })?;
            emit(&time::command_envelope("status", "ok", summary));
            Ok(ExitCode::SUCCESS)
        }
        Command::List {
            name,
            with_withdrawn,
        } => {
            validate_command_name(&name)?;
            let items = records.all_by_name(&name, with_withdrawn)?;
            emit(&time::command_envelope(
                "list",
                "ok",
                serde_json::json!({ "name": name, "items": items }),
            ));
            Ok(ExitCode::SUCCESS)
        }
        Command::Get { id } => {
            let item = records.find_by_id(id)?;
            emit(&time::command_envelope(
                "get",
                if item.is_some() { "ok" } else { "not_found" },
                serde_json::json!({ "id": id, "item": item }),
            ));
            Ok(if item.is_some() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Fail { id, message } => {
            let hook = FailureHook::new(&records);
            let failed = hook.job_failed(&JobFailed {
                record_id: id,
                message,
            })?;
            emit(&time::command_envelope(
                "fail",
                if failed.is_some() { "ok" } else { "noop" },
                serde_json::json!({ "id": id, "item": failed }),
            ));
            Ok(ExitCode::SUCCESS)
        }
        Command::Init { .. } | Command::Capabilities => Ok(ExitCode::SUCCESS),
    }
}

fn run_command(
    store: &Store,
    records: SqliteRecordStore,
    run: RunCli,
) -> Result<ExitCode, LedgerError> {
    validate_command_name(&run.name)?;
    let config = LedgerConfig::load(&store.config_path())?;
    let cmd = config.command(&run.name)?;
    let program = cmd.exec.as_deref().ok_or_else(|| {
        LedgerError::ValidationError(format!("command '{}' has no `exec` configured", cmd.name))
    })?;

    let mut invocation = match (run.record_id, run.nested) {
        (Some(id), true) => Invocation::nested(id),
        (Some(id), false) => Invocation::resume(id),
        (None, _) => Invocation::new(),
    };
    invocation = invocation.with_argument(POSITIONAL_ARGS_KEY, run.args.clone());
    for (key, value) in run.options {
        invocation = invocation.with_option(&key, value);
    }

    let work = ProcessWork::new(program, &cmd.args).in_dir(store.project_root.clone());
    let controller = AdmissionController::new(records);
    let outcome = controller.execute(&cmd.definition(), invocation, &work)?;

    report(&run.name, &outcome);
    emit(&time::command_envelope(
        "run",
        outcome.status(),
        outcome.to_json(),
    ));
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_project(target: &Path) -> Result<(), LedgerError> {
    let store = Store::at(target);
    store.ensure_dirs()?;
    let config_path = store.config_path();
    let wrote_config = if config_path.exists() {
        false
    } else {
        fs::write(&config_path, CONFIG_TEMPLATE)?;
        true
    };
    let db_path = db::initialize_ledger_db(&store.root)?;

    emit(&time::command_envelope(
        "init",
        "ok",
        serde_json::json!({
            "root": store.project_root.to_string_lossy(),
            "db": db_path.to_string_lossy(),
            "config": config_path.to_string_lossy(),
            "config_created": wrote_config,
        }),
    ));
    Ok(())
}

/// Human-readable status line on stderr; stdout stays machine-readable.
fn report(name: &str, outcome: &Outcome) {
    let message = output::compact_line(&outcome.message(), 200);
    if outcome.is_success() {
        eprintln!("{} {} {}", "✔".green().bold(), name.bold(), message);
    } else {
        eprintln!(
            "{} {} [{}] {}",
            "✘".red().bold(),
            name.bold(),
            outcome.status().red(),
            message
        );
    }
}

fn emit(value: &JsonValue) {
    println!("{}", value);
}
