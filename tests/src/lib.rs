//! Integration test framework for the CSFB SGs transport
//!
//! Client and server sessions are exercised against each other on loopback
//! with ephemeral ports.
//!
//! # Test Categories
//!
//! 1. **Session lifecycle** - listener and association state transitions
//! 2. **Message exchange** - payloads in both directions and size limits

pub mod test_utils;

pub use test_utils::{
    connected_pair, init_test_logging, test_sctp_config, wait_for_condition, TestResult,
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT, LOOPBACK,
};
