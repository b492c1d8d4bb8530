//! `tideline` binary for SQL-file migrations
//!
//! Code migrations need their own binary that calls
//! [`tideline_cli::run`] with a populated registry.

use std::process::ExitCode;
use tideline::migration::Registry;

fn main() -> ExitCode {
    tideline_cli::run(Registry::new())
}
