//! Test utility functions for integration tests
//!
//! Provides common utilities for test setup, logging, and session pairing.

use std::future::Future;
use std::time::Duration;

use csfb_sctp::{ClientSession, SctpConfig, ServerSession};
use tokio::time::{sleep, timeout};
use tracing_subscriber::{fmt, EnvFilter};

/// Result type for integration tests
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Default timeout for test operations
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default poll interval for condition checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Address every test binds and dials
pub const LOOPBACK: &str = "127.0.0.1";

/// Initialize logging for tests
///
/// Uses RUST_LOG environment variable if set, otherwise defaults to "info"
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Session configuration with timers short enough for loopback tests
pub fn test_sctp_config() -> SctpConfig {
    SctpConfig {
        connect_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(2),
        receive_timeout: Some(Duration::from_secs(5)),
        rto_initial_ms: 200,
        rto_min_ms: 100,
        rto_max_ms: 1000,
        ..SctpConfig::default()
    }
}

/// Wait for a condition to become true with timeout
///
/// # Returns
/// * `Ok(())` if condition became true within timeout
/// * `Err` if timeout elapsed
pub async fn wait_for_condition<F, Fut>(
    mut condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> TestResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = timeout(timeout_duration, async {
        loop {
            if condition().await {
                return;
            }
            sleep(poll_interval).await;
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(_) => Err("Condition not met within timeout".into()),
    }
}

/// Starts a listener on loopback and connects a client to it.
///
/// Returns the connected client and the server with the association accepted.
pub async fn connected_pair(config: SctpConfig) -> TestResult<(ClientSession, ServerSession)> {
    let mut server = ServerSession::with_config(config.clone());
    let port = server.start_listener(LOOPBACK, 0).await?;

    let mut client = ClientSession::with_config(LOOPBACK, port, config);
    let (connected, accepted) = timeout(DEFAULT_TEST_TIMEOUT, async {
        tokio::join!(client.establish_conn(), server.accept_conn())
    })
    .await?;
    connected?;
    accepted?;

    Ok((client, server))
}
