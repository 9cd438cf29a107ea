//! cctrace - Claude Code hook that sends conversation turns to Langfuse
//!
//! Registered as a `Stop`, `Notification`, `PreToolUse` and `PostToolUse`
//! hook it reads the payload from stdin. The utility subcommands inspect
//! and reset the local state.

mod cli;
mod commands;
mod config;
mod logging;
mod output;
mod payload;
mod pipeline;

use std::process::ExitCode;

use clap::Parser;

use cli::{Cli, Command};
use output::colors;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version still print; a bad hook setup must not fail the hook
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    let result = match &cli.command {
        None | Some(Command::Hook) => {
            commands::hook::run(&cli.settings);
            return ExitCode::SUCCESS;
        }
        Some(Command::Doctor) => commands::doctor::run(&cli),
        Some(Command::Status { transcript }) => {
            commands::status::run(&cli, transcript.as_ref()).map(|()| true)
        }
        Some(Command::Reset { transcript, buffer }) => {
            commands::reset::run(&cli, transcript.as_ref(), *buffer).map(|()| true)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", colors::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}
