//! SCTP transport for CSFB SGs signaling
//!
//! This crate carries opaque SGsAP messages between a circuit-switched
//! fallback gateway and a VLR over SCTP. A [`ClientSession`] dials the VLR;
//! a [`ServerSession`] listens for the VLR and serves one accepted
//! association at a time.
//!
//! # Overview
//!
//! Associations are driven by `sctp-proto`'s Sans-IO state machine carried
//! over tokio UDP sockets (SCTP-over-UDP). Each socket is owned by an
//! endpoint driver task that keeps handshakes, acknowledgements and
//! shutdowns going between calls and buffers inbound messages until the
//! session reads them.
//!
//! Every message is sent on stream 0 with payload protocol identifier 0.
//!
//! # Example (gateway dialing the VLR)
//!
//! ```rust,no_run
//! use csfb_common::VlrConfig;
//! use csfb_sctp::{ClientSession, SctpConfig};
//!
//! async fn talk_to_vlr() -> Result<(), Box<dyn std::error::Error>> {
//!     let vlr = VlrConfig::from_env();
//!     let mut client = ClientSession::from_vlr_config(&vlr, SctpConfig::default());
//!
//!     client.establish_conn().await?;
//!     client.send(&[0x01, 0x02, 0x03]).await?;
//!     let reply = client.receive().await?;
//!     println!("VLR replied with {} bytes", reply.len());
//!
//!     client.close_conn().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example (gateway accepting the VLR)
//!
//! ```rust,no_run
//! use csfb_sctp::ServerSession;
//!
//! async fn serve_vlr() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = ServerSession::new();
//!     let port = server.start_listener("127.0.0.1", 0).await?;
//!     println!("listening on port {port}");
//!
//!     server.accept_conn().await?;
//!     let request = server.receive_through_listener().await?;
//!     server.send_from_server(&request).await?;
//!
//!     server.close_conn().await?;
//!     server.close_listener().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod server;

/// Payload protocol identifier used for SGs messages
pub const SGS_PPID: u32 = 0;
/// Stream every SGs message is sent on
pub const SGS_STREAM_ID: u16 = 0;

pub use address::{resolve_peer_address, PeerAddress, HOST_LIST_DELIMITER};
pub use client::ClientSession;
pub use config::{
    SctpConfig, DEFAULT_ACCEPT_BACKLOG, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_NUM_STREAMS,
    DEFAULT_RECEIVE_BUFFER_SIZE, DEFAULT_RECEIVE_CAPACITY,
};
pub use endpoint::{
    AssociationId, AssociationState, EndpointHandle, EndpointRole, EndpointStats, ReceivedMessage,
};
pub use error::{Result, SessionError};
pub use framing::{strip_sndrcvinfo, InfoWrappedConn, SndRcvInfo, SNDRCVINFO_LEN};
pub use server::{ListenerShutdown, ServerSession};
