//! Firmware updater for monome crow.
//!
//! Usage:
//!   crow-updater                 check, download and flash the latest release
//!   crow-updater check           only compare versions
//!   crow-updater init-config     write a settings file to edit

mod cache;
mod cli;
mod dfu;
mod error;
mod serial;
mod settings;
mod traits;
mod update;
mod version;

#[cfg(test)]
mod test_helpers;

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let args = cli::Cli::parse();

    if let Err(e) = cli::init_logging(&args.log_level, args.json_logs) {
        eprintln!("error: failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match cli::run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            cli::report_error(&e);
            ExitCode::FAILURE
        }
    }
}
