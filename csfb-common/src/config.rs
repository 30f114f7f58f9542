//! Configuration structures for the CSFB gateway transport
//!
//! The VLR peer address comes from the process environment (`VLR_ADDR`) with
//! fixed defaults, while transport tuning and the local listener can be
//! loaded from YAML.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::logging::LogLevel;

/// Environment variable holding the VLR address (`host[,host...][:port]`)
pub const VLR_ADDR_ENV: &str = "VLR_ADDR";
/// VLR address used when the environment does not provide one
pub const DEFAULT_VLR_IP_ADDRESS: &str = "127.0.0.1";
/// SGs port used when the environment does not provide one
pub const DEFAULT_VLR_PORT: u16 = 1357;
/// Local address the gateway listens on by default
pub const LOCAL_IP_ADDRESS: &str = "127.0.0.1";
/// Local port the gateway listens on by default (0 = any free port)
pub const LOCAL_PORT: u16 = 0;
/// Size of the ancillary header on every record read through the listener
pub const LISTENER_RECORD_HEADER_LEN: usize = 32;

/// VLR (Visitor Location Register) peer configuration.
///
/// `address` is a comma-separated host list; it is handed to the address
/// resolver verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlrConfig {
    /// Comma-separated host names or IP addresses of the VLR
    pub address: String,
    /// SCTP port of the VLR
    pub port: u16,
}

impl Default for VlrConfig {
    fn default() -> Self {
        Self::new(DEFAULT_VLR_IP_ADDRESS, DEFAULT_VLR_PORT)
    }
}

impl VlrConfig {
    /// Creates a new VLR configuration.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Builds the VLR configuration from the `VLR_ADDR` environment variable.
    pub fn from_env() -> Self {
        let value = std::env::var(VLR_ADDR_ENV).ok();
        Self::from_env_value(value.as_deref())
    }

    /// Builds the VLR configuration from a raw `VLR_ADDR` value.
    ///
    /// An unset or blank value yields the defaults. A trailing `:port` is
    /// honoured when the host part is unambiguous (no bare IPv6 literal);
    /// IPv6 literals may be bracketed as `[::1]:1357`. Anything else is taken
    /// as the host list with the default port.
    pub fn from_env_value(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Self::default();
        };

        if let Some(rest) = value.strip_prefix('[') {
            if let Some((host, port)) = rest.split_once("]:") {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::new(host, port);
                }
            }
            if let Some(host) = rest.strip_suffix(']') {
                return Self::new(host, DEFAULT_VLR_PORT);
            }
        }

        if let Some((hosts, port)) = value.rsplit_once(':') {
            if !hosts.is_empty() && !hosts.contains(':') {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::new(hosts, port);
                }
            }
        }

        Self::new(value, DEFAULT_VLR_PORT)
    }
}

/// Local listening endpoint configuration for the server role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Comma-separated local addresses; the first resolvable one is bound
    pub address: String,
    /// Requested port (0 = assign any free port)
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: LOCAL_IP_ADDRESS.to_string(),
            port: LOCAL_PORT,
        }
    }
}

/// SCTP transport tuning, in YAML-friendly units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Outbound streams requested per association
    pub max_outbound_streams: u16,
    /// Inbound streams accepted per association
    pub max_inbound_streams: u16,
    /// Largest message the SCTP layer will reassemble
    pub max_message_size: u32,
    /// SCTP receive window
    pub max_receive_buffer_size: u32,
    /// Capacity of the application read buffer
    pub receive_capacity: usize,
    /// Handshake deadline per peer address
    pub connect_timeout_ms: u64,
    /// Graceful shutdown deadline
    pub shutdown_timeout_ms: u64,
    /// Established inbound associations kept waiting for an accept
    pub accept_backlog: usize,
    /// Optional deadline for accepting an inbound association
    pub accept_timeout_ms: Option<u64>,
    /// Optional deadline for receiving one message
    pub receive_timeout_ms: Option<u64>,
    /// Initial retransmission timeout
    pub rto_initial_ms: u64,
    /// Lower bound of the retransmission timeout
    pub rto_min_ms: u64,
    /// Upper bound of the retransmission timeout
    pub rto_max_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_outbound_streams: 2,
            max_inbound_streams: 2,
            max_message_size: 65536,
            max_receive_buffer_size: 262144,
            receive_capacity: 254,
            connect_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            accept_backlog: 16,
            accept_timeout_ms: None,
            receive_timeout_ms: None,
            rto_initial_ms: 3000,
            rto_min_ms: 1000,
            rto_max_ms: 60000,
        }
    }
}

impl TransportSettings {
    /// Checks the settings for values the transport cannot work with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_outbound_streams == 0 || self.max_inbound_streams == 0 {
            return Err(Error::Config("stream counts must be at least 1".into()));
        }
        if self.receive_capacity <= LISTENER_RECORD_HEADER_LEN {
            return Err(Error::Config(format!(
                "receive_capacity ({}) must exceed the {} byte listener record header",
                self.receive_capacity, LISTENER_RECORD_HEADER_LEN
            )));
        }
        if self.accept_backlog == 0 {
            return Err(Error::Config("accept_backlog must be at least 1".into()));
        }
        if self.rto_min_ms > self.rto_max_ms {
            return Err(Error::Config(format!(
                "rto_min_ms ({}) exceeds rto_max_ms ({})",
                self.rto_min_ms, self.rto_max_ms
            )));
        }
        Ok(())
    }
}

/// Complete gateway transport configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Remote VLR peer
    #[serde(default)]
    pub vlr: VlrConfig,
    /// Local listener for the server role
    #[serde(default)]
    pub listener: ListenerConfig,
    /// SCTP tuning
    #[serde(default)]
    pub transport: TransportSettings,
    /// Default log level
    #[serde(default)]
    pub log_level: LogLevel,
}

impl GatewayConfig {
    /// Parses a gateway configuration from a YAML string.
    ///
    /// # Example
    /// ```
    /// use csfb_common::GatewayConfig;
    ///
    /// let yaml = r#"
    /// vlr:
    ///   address: 10.0.0.5,10.0.1.5
    ///   port: 29118
    /// transport:
    ///   receive_capacity: 1024
    /// "#;
    ///
    /// let config = GatewayConfig::from_yaml(yaml).unwrap();
    /// assert_eq!(config.vlr.port, 29118);
    /// assert_eq!(config.transport.receive_capacity, 1024);
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.transport.validate()?;
        Ok(config)
    }

    /// Loads a gateway configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Serializes the configuration to a YAML string.
    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Overrides the VLR peer from `VLR_ADDR` when the variable is set.
    pub fn apply_env(&mut self) {
        let value = std::env::var(VLR_ADDR_ENV).ok();
        self.apply_env_value(value.as_deref());
    }

    /// Overrides the VLR peer from a raw `VLR_ADDR` value, if non-blank.
    pub fn apply_env_value(&mut self, value: Option<&str>) {
        if value.is_some_and(|v| !v.trim().is_empty()) {
            self.vlr = VlrConfig::from_env_value(value);
        }
    }
}
