//! CLI argument definitions using clap
//!
//! Commands:
//! - jms-bridge loopback --count <n> --ack-mode <auto|dups-ok|client> [--recover]
//! - jms-bridge check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// jms-bridge - JMS-style delivery over a condition-driven pub/sub layer
#[derive(Parser, Debug)]
#[command(name = "jms-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log lifecycle events to stderr
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish messages over the in-memory domain and receive them back
    Loopback {
        /// Number of messages to publish
        #[arg(long, default_value_t = 10)]
        count: usize,

        /// Acknowledgment mode of the receiving session
        #[arg(long, default_value = "auto")]
        ack_mode: String,

        /// Recover the session once and receive the redelivered messages
        /// (client mode only)
        #[arg(long)]
        recover: bool,

        /// Receive timeout in milliseconds
        #[arg(long, default_value_t = 500)]
        timeout_ms: i64,

        /// Optional connection configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a connection configuration file and print it with defaults
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./jms-bridge.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
