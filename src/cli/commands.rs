//! CLI command implementations
//!
//! `loopback` wires a connection, a session, one consumer and one producer
//! over an in-memory domain, publishes messages with rotating priorities and
//! prints what comes back. With `--recover` in client mode the session is
//! recovered once before acknowledging, so every message is printed twice:
//! first fresh, then flagged as redelivered.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::config::{AcknowledgeMode, ConnectionConfig, SessionConfig};
use crate::connection::Connection;
use crate::consumer::MessageConsumer;
use crate::destination::Destination;
use crate::facade::memory::MemoryDomain;
use crate::message::{Message, MAX_PRIORITY};
use crate::observability::{Logger, MetricsSnapshot, Severity};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_json};

/// Topic used by the loopback command
pub const LOOPBACK_TOPIC: &str = "jms-bridge.loopback";

/// Parsed loopback arguments
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub count: usize,
    pub acknowledge_mode: AcknowledgeMode,
    pub recover: bool,
    pub timeout_ms: i64,
    pub config: ConnectionConfig,
}

/// One received message as printed
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedRecord {
    pub sequence: Option<String>,
    pub priority: u8,
    pub redelivered: bool,
    pub message: Message,
}

/// Outcome of a loopback run
#[derive(Debug, Clone, Serialize)]
pub struct LoopbackReport {
    pub status: &'static str,
    pub sent: usize,
    pub received: usize,
    pub redelivered: usize,
    pub metrics: MetricsSnapshot,
    #[serde(skip)]
    pub records: Vec<ReceivedRecord>,
}

/// Parse args and run
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    if cli.verbose {
        Logger::set_min_severity(Severity::Info);
    }
    let result = run_command(cli.command);
    if let Err(e) = &result {
        write_error(e.code_str(), e.message())?;
    }
    result
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Loopback {
            count,
            ack_mode,
            recover,
            timeout_ms,
            config,
        } => {
            let options = LoopbackOptions {
                count,
                acknowledge_mode: ack_mode.parse()?,
                recover,
                timeout_ms,
                config: load_config(config.as_deref())?,
            };
            let report = loopback(&options)?;
            for record in &report.records {
                write_json(record)?;
            }
            write_json(&report)
        }
        Command::CheckConfig { config } => {
            let config = check_config(&config)?;
            write_json(&config)
        }
    }
}

fn load_config(path: Option<&Path>) -> CliResult<ConnectionConfig> {
    match path {
        Some(path) => check_config(path),
        None => Ok(ConnectionConfig::default()),
    }
}

/// Load and validate a connection configuration file
pub fn check_config(path: &Path) -> CliResult<ConnectionConfig> {
    let json = fs::read_to_string(path).map_err(|e| {
        CliError::config_error(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(ConnectionConfig::from_json(&json)?)
}

/// Publish `count` messages and receive them back
pub fn loopback(options: &LoopbackOptions) -> CliResult<LoopbackReport> {
    if options.timeout_ms <= 0 {
        return Err(CliError::usage_error("--timeout-ms must be positive"));
    }
    if options.recover && !options.acknowledge_mode.is_client() {
        return Err(CliError::usage_error("--recover requires --ack-mode client"));
    }

    let domain = MemoryDomain::new();
    let connection = Connection::new(domain.create_participant(), options.config.clone())?;
    let session = connection.create_session(SessionConfig::new(options.acknowledge_mode))?;
    let destination = Destination::topic(LOOPBACK_TOPIC);
    let consumer = session.create_consumer(&destination)?;
    let producer = session.create_producer(&destination)?;

    for sequence in 0..options.count {
        let mut message = Message::text(format!("message {}", sequence))
            .with_property("sequence", sequence as i64);
        let priority = (sequence % (MAX_PRIORITY as usize + 1)) as u8;
        producer.send_with(
            &mut message,
            options.config.default_delivery_mode,
            priority,
            options.config.default_time_to_live_ms,
        )?;
    }
    connection.start()?;

    let mut records = drain(&consumer, options.timeout_ms)?;
    if options.recover {
        session.recover()?;
        records.extend(drain(&consumer, options.timeout_ms)?);
    }
    session.acknowledge()?;

    let metrics = connection.metrics()?;
    connection.close()?;

    let redelivered = records.iter().filter(|r| r.redelivered).count();
    Ok(LoopbackReport {
        status: "ok",
        sent: options.count,
        received: records.len(),
        redelivered,
        metrics,
        records,
    })
}

fn drain(consumer: &MessageConsumer, timeout_ms: i64) -> CliResult<Vec<ReceivedRecord>> {
    let mut records = Vec::new();
    while let Some(message) = consumer.receive_timeout(timeout_ms)? {
        records.push(ReceivedRecord {
            sequence: message.property("sequence").map(|v| v.to_string()),
            priority: message.priority(),
            redelivered: message.redelivered,
            message,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(mode: AcknowledgeMode, recover: bool) -> LoopbackOptions {
        LoopbackOptions {
            count: 12,
            acknowledge_mode: mode,
            recover,
            timeout_ms: 50,
            config: ConnectionConfig::default(),
        }
    }

    #[test]
    fn test_loopback_receives_everything_by_priority() {
        let report = loopback(&options(AcknowledgeMode::Auto, false)).unwrap();
        assert_eq!(report.sent, 12);
        assert_eq!(report.received, 12);
        assert_eq!(report.redelivered, 0);
        let priorities: Vec<u8> = report.records.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
        assert_eq!(report.metrics.messages_acknowledged, 12);
    }

    #[test]
    fn test_loopback_recover_redelivers_in_order() {
        let report = loopback(&options(AcknowledgeMode::Client, true)).unwrap();
        assert_eq!(report.received, 24);
        assert_eq!(report.redelivered, 12);
        let (first, second) = report.records.split_at(12);
        let first: Vec<_> = first.iter().map(|r| r.sequence.clone()).collect();
        let second: Vec<_> = second.iter().map(|r| r.sequence.clone()).collect();
        assert_eq!(first, second);
        assert!(report.records[12..].iter().all(|r| r.redelivered));
    }

    #[test]
    fn test_recover_requires_client_mode() {
        let err = loopback(&options(AcknowledgeMode::DupsOk, true)).unwrap_err();
        assert_eq!(err.code_str(), "JMS_CLI_USAGE_ERROR");
    }

    #[test]
    fn test_check_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jms-bridge.json");
        fs::write(&path, r#"{"client_id":"loopback","default_priority":6}"#).unwrap();

        let config = check_config(&path).unwrap();
        assert_eq!(config.client_id.as_deref(), Some("loopback"));
        assert_eq!(config.default_priority, 6);
        assert!(!config.start_on_create);
    }

    #[test]
    fn test_invalid_config_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jms-bridge.json");
        fs::write(&path, r#"{"default_priority":42}"#).unwrap();
        let err = check_config(&path).unwrap_err();
        assert_eq!(err.code_str(), "JMS_CLI_CONFIG_ERROR");
    }

    #[test]
    fn test_missing_config_file_is_config_error() {
        let err = check_config(Path::new("/nonexistent/jms-bridge.json")).unwrap_err();
        assert_eq!(err.code_str(), "JMS_CLI_CONFIG_ERROR");
    }
}
