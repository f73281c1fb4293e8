//! jms-bridge CLI entry point
//!
//! Parses arguments and dispatches through `cli::run`; errors are reported
//! as a JSON line on stdout and a non-zero exit status.

use jms_bridge::cli;

fn main() {
    if cli::run().is_err() {
        std::process::exit(1);
    }
}
