use colored::Colorize;
use std::process::ExitCode;

fn main() -> ExitCode {
    match runledger::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::from(2)
        }
    }
}
