//! CLI struct definitions for the runledger command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "runledger",
    version = env!("CARGO_PKG_VERSION"),
    about = "Run-history ledger and admission control for one-off operational commands."
)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create `.runledger/` with an empty config and ledger database
    Init {
        /// Directory to initialize (defaults to current working directory).
        #[clap(short, long)]
        dir: Option<PathBuf>,
    },
    /// Run a configured command through admission control
    Run(RunCli),
    /// Show run history aggregates for a command name
    Status {
        #[clap(value_name = "NAME")]
        name: String,
    },
    /// List records for a command name, most recent first
    List {
        #[clap(value_name = "NAME")]
        name: String,
        /// Include withdrawn (failed or rejected) records.
        #[clap(long)]
        with_withdrawn: bool,
    },
    /// Show one record
    Get {
        #[clap(value_name = "ID")]
        id: i64,
    },
    /// Report a failure detected outside the runner (crashed worker, killed job)
    Fail {
        #[clap(value_name = "ID")]
        id: i64,
        #[clap(long)]
        message: String,
    },
    /// Print subsystem schemas
    Capabilities,
}

#[derive(clap::Args, Debug)]
pub(crate) struct RunCli {
    /// Configured command name.
    #[clap(value_name = "NAME")]
    pub name: String,
    /// Attach to an existing record instead of creating one.
    #[clap(long)]
    pub record_id: Option<i64>,
    /// Re-enter a running record from inside its own work (requires --record-id).
    #[clap(long, requires = "record_id")]
    pub nested: bool,
    /// Option recorded with the run, as key=value. Repeatable.
    #[clap(long = "option", value_parser = parse_key_value)]
    pub options: Vec<(String, String)>,
    /// Positional arguments passed through to the program.
    #[clap(last = true)]
    pub args: Vec<String>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}
