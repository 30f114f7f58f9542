//! Server side of the VLR link
//!
//! A [`ServerSession`] owns an optional listener endpoint and at most one
//! accepted association. The accepted association lives on the listener's
//! UDP socket, so closing the listener also ends it.

use std::net::SocketAddr;

use bytes::Bytes;
use csfb_common::logging::{log_sgsap_message, Direction};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::address::resolve_peer_address;
use crate::config::SctpConfig;
use crate::endpoint::{AssociationLink, EndpointHandle, EndpointRole};
use crate::error::{Result, SessionError};
use crate::framing::{strip_sndrcvinfo, InfoWrappedConn};

/// Association handed out by the listener plus its framing-aware reader
struct AcceptedConn {
    link: AssociationLink,
    reader: InfoWrappedConn,
}

/// Handle that closes a listener from another task.
///
/// Closing unblocks a pending [`ServerSession::accept_conn`] with an
/// `Accept` error.
#[derive(Clone)]
pub struct ListenerShutdown {
    endpoint: EndpointHandle,
}

impl ListenerShutdown {
    pub fn close(&self) {
        info!("Closing listener on {} from shutdown handle", self.endpoint.local_addr());
        self.endpoint.close();
    }
}

/// Inbound SCTP session accepting one peer at a time
pub struct ServerSession {
    config: SctpConfig,
    listener: Option<EndpointHandle>,
    accepted: Option<AcceptedConn>,
}

impl Default for ServerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSession {
    pub fn new() -> Self {
        Self::with_config(SctpConfig::default())
    }

    pub fn with_config(config: SctpConfig) -> Self {
        Self {
            config,
            listener: None,
            accepted: None,
        }
    }

    /// Starts listening on `local_addr` (host list, first address bound).
    ///
    /// Returns the port actually bound, which differs from `port` when 0 was
    /// requested.
    pub async fn start_listener(&mut self, local_addr: &str, port: u16) -> Result<u16> {
        if self.is_listening() {
            return Err(SessionError::AlreadyListening);
        }

        let host_list = local_addr.to_string();
        let local = tokio::task::spawn_blocking(move || resolve_peer_address(&host_list, port))
            .await
            .map_err(|e| SessionError::Bind(format!("address resolution failed: {e}")))?;
        let bind_addr = local.primary().ok_or_else(|| {
            SessionError::Bind(format!("no resolvable local address in {local_addr:?}"))
        })?;

        let endpoint = EndpointHandle::bind(bind_addr, &self.config, EndpointRole::Server)
            .await
            .map_err(|e| SessionError::Bind(format!("{bind_addr}: {e}")))?;
        let bound_port = endpoint.local_addr().port();

        self.accepted = None;
        self.listener = Some(endpoint);
        Ok(bound_port)
    }

    /// Closes the listener together with any accepted association.
    pub async fn close_listener(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or(SessionError::NotListening)?;
        if let Some(conn) = self.accepted.take() {
            debug!(
                "Dropping accepted association with {} along with the listener",
                conn.link.remote_addr()
            );
        }
        listener.close();
        info!("Listener on {} closed", listener.local_addr());
        Ok(())
    }

    /// Waits for the next inbound association and makes it current.
    ///
    /// An association accepted earlier is aborted and replaced.
    pub async fn accept_conn(&mut self) -> Result<()> {
        let listener = self.listener.clone().ok_or(SessionError::NotListening)?;

        let (association_id, remote_addr) = match self.config.accept_timeout {
            Some(deadline) => timeout(deadline, listener.accept())
                .await
                .map_err(|_| SessionError::Accept(format!("no peer within {deadline:?}")))??,
            None => listener.accept().await?,
        };

        if let Some(previous) = self.accepted.take() {
            warn!(
                "Replacing accepted association with {} by {}",
                previous.link.remote_addr(),
                remote_addr
            );
            previous.link.abort();
        }

        let reader =
            InfoWrappedConn::new(listener.clone(), association_id, self.config.receive_timeout);
        let link = AssociationLink::new(listener, association_id, remote_addr);
        self.accepted = Some(AcceptedConn { link, reader });
        Ok(())
    }

    /// Handle for closing the listener from another task
    pub fn listener_shutdown_handle(&self) -> Option<ListenerShutdown> {
        self.listener.as_ref().map(|endpoint| ListenerShutdown {
            endpoint: endpoint.clone(),
        })
    }

    pub fn connection_established(&self) -> bool {
        self.accepted.is_some()
    }

    /// Receives one message from the accepted peer.
    pub async fn receive_through_listener(&mut self) -> Result<Bytes> {
        let conn = self.accepted.as_ref().ok_or(SessionError::NotConnected)?;

        let mut record = vec![0u8; self.config.receive_capacity];
        let len = conn.reader.read(&mut record).await?;
        let payload = strip_sndrcvinfo(&record[..len])?;

        log_sgsap_message(Direction::Rx, &conn.link.remote_addr().to_string(), payload);
        Ok(Bytes::copy_from_slice(payload))
    }

    /// Sends one message to the accepted peer on stream 0 with PPID 0.
    pub async fn send_from_server(&mut self, payload: &[u8]) -> Result<()> {
        let conn = self.accepted.as_mut().ok_or(SessionError::NotConnected)?;
        conn.link.send(payload).await
    }

    /// Shuts the accepted association down; the listener keeps running.
    pub async fn close_conn(&mut self) -> Result<()> {
        let conn = self.accepted.take().ok_or(SessionError::NotConnected)?;
        let remote = conn.link.remote_addr();
        let association_id = conn.link.association_id();

        let result = conn.link.shutdown(self.config.shutdown_timeout).await;
        info!("Server association {} with {} closed", association_id, remote);
        result
    }

    /// True while the listener endpoint is running
    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(|endpoint| !endpoint.is_closed())
    }

    /// Bound listener address, if listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(EndpointHandle::local_addr)
    }

    /// True once DATA_IO events were enabled on the accepted association
    pub fn data_io_subscribed(&self) -> bool {
        self.accepted
            .as_ref()
            .is_some_and(|conn| conn.link.data_io_subscribed())
    }
}
