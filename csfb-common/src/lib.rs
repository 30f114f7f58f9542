//! Common types and utilities for the CSFB SGs transport
//!
//! This crate provides the configuration structures, logging setup and the
//! shared error type used by the SCTP session crate and its callers.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    GatewayConfig, ListenerConfig, TransportSettings, VlrConfig, DEFAULT_VLR_IP_ADDRESS,
    DEFAULT_VLR_PORT, LISTENER_RECORD_HEADER_LEN, LOCAL_IP_ADDRESS, LOCAL_PORT, VLR_ADDR_ENV,
};
pub use error::Error;
pub use logging::{
    init_logging, init_logging_with_filter, log_protocol_message, log_sgsap_message, Direction,
    HexDump, LogLevel,
};
