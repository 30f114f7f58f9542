//! Runtime SCTP session configuration

use std::time::Duration;

use csfb_common::TransportSettings;
use sctp_proto::TransportConfig;

/// Default number of SCTP streams per direction
pub const DEFAULT_NUM_STREAMS: u16 = 2;
/// Default maximum message size the SCTP layer reassembles (64KB)
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 65536;
/// Default SCTP receive window (256KB)
pub const DEFAULT_RECEIVE_BUFFER_SIZE: u32 = 262144;
/// Default capacity of the application read buffer
pub const DEFAULT_RECEIVE_CAPACITY: usize = 254;
/// Default number of established associations waiting for an accept
pub const DEFAULT_ACCEPT_BACKLOG: usize = 16;

/// Configuration shared by client and server sessions
#[derive(Debug, Clone)]
pub struct SctpConfig {
    pub max_outbound_streams: u16,
    pub max_inbound_streams: u16,
    pub max_message_size: u32,
    /// SCTP receive window; also caps the bytes buffered per association
    /// while the session is not reading
    pub max_receive_buffer_size: u32,
    /// Largest record handed to the caller; longer messages are rejected
    /// with `MessageTooLarge`. On the server path the record includes the
    /// `SndRcvInfo` header.
    pub receive_capacity: usize,
    /// Handshake deadline, applied per peer address
    pub connect_timeout: Duration,
    /// Graceful shutdown deadline before the association is aborted
    pub shutdown_timeout: Duration,
    /// Established inbound associations beyond this many are aborted
    pub accept_backlog: usize,
    pub accept_timeout: Option<Duration>,
    pub receive_timeout: Option<Duration>,
    pub rto_initial_ms: u64,
    pub rto_min_ms: u64,
    pub rto_max_ms: u64,
}

impl Default for SctpConfig {
    fn default() -> Self {
        Self {
            max_outbound_streams: DEFAULT_NUM_STREAMS,
            max_inbound_streams: DEFAULT_NUM_STREAMS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            receive_capacity: DEFAULT_RECEIVE_CAPACITY,
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            accept_timeout: None,
            receive_timeout: None,
            rto_initial_ms: 3000,
            rto_min_ms: 1000,
            rto_max_ms: 60000,
        }
    }
}

impl From<&TransportSettings> for SctpConfig {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            max_outbound_streams: settings.max_outbound_streams,
            max_inbound_streams: settings.max_inbound_streams,
            max_message_size: settings.max_message_size,
            max_receive_buffer_size: settings.max_receive_buffer_size,
            receive_capacity: settings.receive_capacity,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            shutdown_timeout: Duration::from_millis(settings.shutdown_timeout_ms),
            accept_backlog: settings.accept_backlog,
            accept_timeout: settings.accept_timeout_ms.map(Duration::from_millis),
            receive_timeout: settings.receive_timeout_ms.map(Duration::from_millis),
            rto_initial_ms: settings.rto_initial_ms,
            rto_min_ms: settings.rto_min_ms,
            rto_max_ms: settings.rto_max_ms,
        }
    }
}

impl SctpConfig {
    /// Builds the `sctp-proto` transport parameters for an association.
    pub(crate) fn transport_config(&self) -> TransportConfig {
        TransportConfig::default()
            .with_max_num_outbound_streams(self.max_outbound_streams)
            .with_max_num_inbound_streams(self.max_inbound_streams)
            .with_max_message_size(self.max_message_size)
            .with_max_receive_buffer_size(self.max_receive_buffer_size)
            .with_rto_initial_ms(self.rto_initial_ms)
            .with_rto_min_ms(self.rto_min_ms)
            .with_rto_max_ms(self.rto_max_ms)
    }
}
