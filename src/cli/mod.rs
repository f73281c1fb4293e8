//! CLI module for jms-bridge
//!
//! Provides command-line interface for:
//! - loopback: publish and receive over the in-memory domain
//! - check-config: validate a connection configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, loopback, run, run_command, LoopbackOptions};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_json};
