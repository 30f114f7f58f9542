//! Logging infrastructure for the CSFB transport
//!
//! This module provides configurable logging using the `tracing` crate and
//! payload logging helpers for SGsAP messages carried over SCTP.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level - most verbose, includes payload hex dumps
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level - least verbose
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

/// Initialize the tracing subscriber with the specified log level.
///
/// This should be called once at process startup. The level can be
/// overridden by the `RUST_LOG` environment variable.
///
/// # Example
///
/// ```no_run
/// use csfb_common::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::Debug);
/// ```
pub fn init_logging(level: LogLevel) {
    init_logging_with_filter(&level.to_string());
}

/// Initialize logging with a custom filter string.
///
/// # Example
///
/// ```no_run
/// use csfb_common::logging::init_logging_with_filter;
///
/// // Default to info, but show every datagram from the SCTP driver
/// init_logging_with_filter("info,csfb_sctp=trace");
/// ```
pub fn init_logging_with_filter(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_span_events(FmtSpan::NONE)
        .init();
}

/// Message direction relative to this gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the peer
    Rx,
    /// Sent to the peer
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// Log a protocol payload at debug level, with a hex dump at trace level.
///
/// The payload is opaque to this layer, so only its length and raw bytes
/// are recorded.
pub fn log_protocol_message(protocol: &str, direction: Direction, peer: &str, data: &[u8]) {
    tracing::debug!(
        protocol = protocol,
        direction = %direction,
        peer = peer,
        len = data.len(),
        "{} {} message",
        direction,
        protocol
    );
    tracing::trace!(
        protocol = protocol,
        hex = %HexDump(data),
        "{} payload",
        protocol
    );
}

/// Log an SGsAP payload exchanged with the VLR
pub fn log_sgsap_message(direction: Direction, peer: &str, data: &[u8]) {
    log_protocol_message("SGsAP", direction, peer, data);
}

/// Wrapper for hex dump formatting
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
