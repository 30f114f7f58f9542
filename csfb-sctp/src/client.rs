//! Client side of the VLR link
//!
//! A [`ClientSession`] owns at most one association to a fixed peer. It is
//! single-owner: operations take `&mut self` and are not meant to be shared
//! across tasks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use csfb_common::VlrConfig;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::address::{resolve_peer_address, PeerAddress};
use crate::config::SctpConfig;
use crate::endpoint::{AssociationLink, EndpointHandle, EndpointRole};
use crate::error::{Result, SessionError};

/// Outbound SCTP session towards one peer
pub struct ClientSession {
    peer: PeerAddress,
    config: SctpConfig,
    link: Option<AssociationLink>,
}

impl ClientSession {
    /// Creates a session for `peer_host` (comma-separated host list) and port.
    /// Resolution happens here; nothing touches the network.
    pub fn new(peer_host: &str, peer_port: u16) -> Self {
        Self::with_config(peer_host, peer_port, SctpConfig::default())
    }

    pub fn with_config(peer_host: &str, peer_port: u16, config: SctpConfig) -> Self {
        let peer = resolve_peer_address(peer_host, peer_port);
        debug!("Client session peer address: {}", peer);
        Self {
            peer,
            config,
            link: None,
        }
    }

    /// Creates a session for the VLR described by `vlr`.
    pub fn from_vlr_config(vlr: &VlrConfig, config: SctpConfig) -> Self {
        Self::with_config(&vlr.address, vlr.port, config)
    }

    /// Establishes the association with the peer.
    ///
    /// Resolved addresses are tried in order; each attempt is bounded by the
    /// configured connect timeout. Local state is unchanged on failure.
    pub async fn establish_conn(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Err(SessionError::AlreadyConnected);
        }
        if self.peer.is_empty() {
            return Err(SessionError::Connect(format!(
                "no resolvable peer address (unresolved: {:?})",
                self.peer.unresolved()
            )));
        }

        let mut last_error = None;
        for remote in self.peer.socket_addrs() {
            match self.connect_to(remote).await {
                Ok(link) => {
                    info!(
                        "Client association established with {} from {}",
                        remote,
                        link.endpoint().local_addr()
                    );
                    self.link = Some(link);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", remote, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SessionError::Connect("no peer address".into())))
    }

    async fn connect_to(&self, remote: SocketAddr) -> Result<AssociationLink> {
        let local = SocketAddr::new(unspecified_for(remote.ip()), 0);
        let endpoint = EndpointHandle::bind(local, &self.config, EndpointRole::Client)
            .await
            .map_err(|e| SessionError::Connect(format!("bind {local}: {e}")))?;

        let connected = timeout(self.config.connect_timeout, endpoint.connect(remote)).await;
        match connected {
            Ok(Ok((association_id, remote_addr))) => {
                Ok(AssociationLink::new(endpoint, association_id, remote_addr))
            }
            Ok(Err(e)) => {
                endpoint.close();
                Err(e)
            }
            Err(_) => {
                endpoint.close();
                Err(SessionError::Connect(format!(
                    "handshake with {} timed out after {:?}",
                    remote, self.config.connect_timeout
                )))
            }
        }
    }

    /// Sends one message to the peer on stream 0 with PPID 0.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        link.send(payload).await
    }

    /// Receives one message from the peer.
    pub async fn receive(&mut self) -> Result<Bytes> {
        let link = self.link.as_ref().ok_or(SessionError::NotConnected)?;
        let message = link.recv(self.config.receive_timeout).await?;

        if message.data.len() > self.config.receive_capacity {
            return Err(SessionError::MessageTooLarge {
                size: message.data.len(),
                capacity: self.config.receive_capacity,
            });
        }
        Ok(message.data)
    }

    /// Shuts the association down gracefully.
    ///
    /// The session is idle afterwards even when the shutdown reports an error.
    pub async fn close_conn(&mut self) -> Result<()> {
        let link = self.link.take().ok_or(SessionError::NotConnected)?;
        let endpoint = link.endpoint().clone();
        let remote = link.remote_addr();

        let result = link.shutdown(self.config.shutdown_timeout).await;
        endpoint.close();
        info!("Client association with {} closed", remote);
        result
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn peer_address(&self) -> &PeerAddress {
        &self.peer
    }

    /// Local address of the current association, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().map(|link| link.endpoint().local_addr())
    }

    /// True once DATA_IO events were enabled on the current association
    pub fn data_io_subscribed(&self) -> bool {
        self.link.as_ref().is_some_and(AssociationLink::data_io_subscribed)
    }
}

fn unspecified_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
