//! SCTP endpoint driver
//!
//! Every UDP socket is owned by one driver task running the `sctp-proto`
//! state machines for all associations on that socket. The driver answers
//! handshakes, retransmits, acknowledges and completes shutdowns on its own,
//! so the peer sees a live SCTP stack even while the owning session is not
//! inside a call. Inbound messages are buffered per association until a
//! session asks for them.
//!
//! ```text
//! Session <--Command/oneshot--> EndpointDriver <--SCTP/UDP--> Peer
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use csfb_common::logging::{log_sgsap_message, Direction};
use sctp_proto::{
    Association, AssociationHandle, ClientConfig, DatagramEvent, Endpoint, EndpointConfig, Event,
    Payload, PayloadProtocolIdentifier, ServerConfig, Transmit, TransportConfig,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::SctpConfig;
use crate::error::{Result, SessionError};
use crate::{SGS_PPID, SGS_STREAM_ID};

/// Max UDP datagram size
const MAX_DATAGRAM_SIZE: usize = 65535;

const ENDPOINT_CLOSED: &str = "endpoint closed";

/// Identifier of an association within one endpoint
pub type AssociationId = u64;

/// SCTP association state as tracked by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Connecting,
    Established,
    ShuttingDown,
    Closed,
}

/// Whether the endpoint accepts inbound associations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Client,
    Server,
}

/// A message delivered on an association
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub stream_id: u16,
    /// Per-stream sequence number assigned on delivery
    pub ssn: u16,
    pub ppid: u32,
    pub data: Bytes,
}

enum Command {
    Connect {
        remote: SocketAddr,
        response_tx: oneshot::Sender<Result<(AssociationId, SocketAddr)>>,
    },
    Accept {
        response_tx: oneshot::Sender<Result<(AssociationId, SocketAddr)>>,
    },
    SubscribeDataIo {
        association_id: AssociationId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Send {
        association_id: AssociationId,
        stream_id: u16,
        ppid: u32,
        data: Bytes,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Recv {
        association_id: AssociationId,
        response_tx: oneshot::Sender<Result<ReceivedMessage>>,
    },
    Shutdown {
        association_id: AssociationId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Abort {
        association_id: AssociationId,
    },
    Stats {
        response_tx: oneshot::Sender<EndpointStats>,
    },
    Close,
}

/// Snapshot of what an endpoint driver is holding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Associations tracked by the driver, in any state
    pub associations: usize,
    /// Established inbound associations waiting for an accept
    pub backlog: usize,
    /// Payload bytes buffered across all inboxes
    pub buffered_bytes: usize,
    /// Messages reported as DATA_IO events on subscribed associations
    pub data_io_messages: u64,
}

/// Cloneable handle to a running endpoint driver.
///
/// The driver stops when [`EndpointHandle::close`] is called or when the
/// last handle is dropped; every association still open is aborted.
#[derive(Clone)]
pub struct EndpointHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
    role: EndpointRole,
}

impl EndpointHandle {
    /// Binds a UDP socket and spawns the driver task for it.
    pub async fn bind(
        local_addr: SocketAddr,
        config: &SctpConfig,
        role: EndpointRole,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        let local_addr = socket.local_addr()?;

        let transport = Arc::new(config.transport_config());
        let server_config = match role {
            EndpointRole::Server => {
                let mut server_config = ServerConfig::new();
                server_config.transport = Arc::clone(&transport);
                Some(Arc::new(server_config))
            }
            EndpointRole::Client => None,
        };
        let endpoint = Endpoint::new(Arc::new(EndpointConfig::new()), server_config);

        match role {
            EndpointRole::Server => {
                info!("SCTP endpoint listening on {} (sctp-proto over UDP)", local_addr)
            }
            EndpointRole::Client => debug!("SCTP endpoint bound to {}", local_addr),
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = EndpointDriver {
            socket,
            local_addr,
            role,
            endpoint,
            transport,
            associations: HashMap::new(),
            id_to_handle: HashMap::new(),
            next_association_id: 1,
            backlog: VecDeque::new(),
            accept_tx: None,
            accept_backlog: config.accept_backlog,
            max_buffered_bytes: config.max_receive_buffer_size as usize,
            transmits: VecDeque::new(),
        };
        tokio::spawn(driver.run(command_rx));

        Ok(Self {
            command_tx,
            local_addr,
            role,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn role(&self) -> EndpointRole {
        self.role
    }

    /// True once the driver has stopped
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    /// Starts an outbound association and waits for the handshake.
    pub async fn connect(&self, remote: SocketAddr) -> Result<(AssociationId, SocketAddr)> {
        self.request(
            |response_tx| Command::Connect { remote, response_tx },
            SessionError::Connect,
        )
        .await
    }

    /// Waits for the next established inbound association.
    pub async fn accept(&self) -> Result<(AssociationId, SocketAddr)> {
        self.request(|response_tx| Command::Accept { response_tx }, SessionError::Accept)
            .await
    }

    /// Enables DATA_IO notifications on an association. Idempotent.
    pub async fn subscribe_data_io(&self, association_id: AssociationId) -> Result<()> {
        self.request(
            |response_tx| Command::SubscribeDataIo {
                association_id,
                response_tx,
            },
            SessionError::Transmit,
        )
        .await
    }

    /// Queues one message on a stream and flushes it to the network.
    pub async fn send(
        &self,
        association_id: AssociationId,
        stream_id: u16,
        ppid: u32,
        data: Bytes,
    ) -> Result<()> {
        self.request(
            |response_tx| Command::Send {
                association_id,
                stream_id,
                ppid,
                data,
                response_tx,
            },
            SessionError::Transmit,
        )
        .await
    }

    /// Waits for the next message on an association.
    pub async fn recv(&self, association_id: AssociationId) -> Result<ReceivedMessage> {
        self.request(
            |response_tx| Command::Recv {
                association_id,
                response_tx,
            },
            SessionError::Receive,
        )
        .await
    }

    /// Gracefully shuts an association down and waits for completion.
    pub async fn shutdown(&self, association_id: AssociationId) -> Result<()> {
        self.request(
            |response_tx| Command::Shutdown {
                association_id,
                response_tx,
            },
            SessionError::Close,
        )
        .await
    }

    /// Aborts an association without waiting.
    pub fn abort(&self, association_id: AssociationId) {
        let _ = self.command_tx.send(Command::Abort { association_id });
    }

    /// Reports how many associations and buffered bytes the driver holds.
    pub async fn stats(&self) -> Result<EndpointStats> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Stats { response_tx })
            .map_err(|_| SessionError::Receive(ENDPOINT_CLOSED.into()))?;
        response_rx
            .await
            .map_err(|_| SessionError::Receive(ENDPOINT_CLOSED.into()))
    }

    /// Stops the driver, aborting every association on the endpoint.
    pub fn close(&self) {
        let _ = self.command_tx.send(Command::Close);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
        on_closed: fn(String) -> SessionError,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(response_tx))
            .map_err(|_| on_closed(ENDPOINT_CLOSED.into()))?;
        response_rx
            .await
            .map_err(|_| on_closed(ENDPOINT_CLOSED.into()))?
    }
}

/// One association as seen by a session: the endpoint it lives on plus its id.
pub(crate) struct AssociationLink {
    endpoint: EndpointHandle,
    association_id: AssociationId,
    remote_addr: SocketAddr,
    data_io_subscribed: bool,
}

impl AssociationLink {
    pub(crate) fn new(
        endpoint: EndpointHandle,
        association_id: AssociationId,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            endpoint,
            association_id,
            remote_addr,
            data_io_subscribed: false,
        }
    }

    pub(crate) fn endpoint(&self) -> &EndpointHandle {
        &self.endpoint
    }

    pub(crate) fn association_id(&self) -> AssociationId {
        self.association_id
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub(crate) fn data_io_subscribed(&self) -> bool {
        self.data_io_subscribed
    }

    /// Sends one SGs message on stream 0 with PPID 0.
    pub(crate) async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(SessionError::Transmit("empty payload".into()));
        }

        if !self.data_io_subscribed {
            self.endpoint.subscribe_data_io(self.association_id).await?;
            self.data_io_subscribed = true;
        }

        self.endpoint
            .send(
                self.association_id,
                SGS_STREAM_ID,
                SGS_PPID,
                Bytes::copy_from_slice(payload),
            )
            .await?;
        log_sgsap_message(Direction::Tx, &self.remote_addr.to_string(), payload);
        Ok(())
    }

    /// Receives one message, bounded by `deadline` when given.
    pub(crate) async fn recv(&self, deadline: Option<Duration>) -> Result<ReceivedMessage> {
        let message = match deadline {
            Some(deadline) => timeout(deadline, self.endpoint.recv(self.association_id))
                .await
                .map_err(|_| {
                    SessionError::Receive(format!("no message within {deadline:?}"))
                })??,
            None => self.endpoint.recv(self.association_id).await?,
        };
        log_sgsap_message(Direction::Rx, &self.remote_addr.to_string(), &message.data);
        Ok(message)
    }

    /// Graceful shutdown, falling back to an abort after `deadline`.
    pub(crate) async fn shutdown(self, deadline: Duration) -> Result<()> {
        match timeout(deadline, self.endpoint.shutdown(self.association_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Graceful shutdown of association {} with {} timed out, aborting",
                    self.association_id, self.remote_addr
                );
                self.endpoint.abort(self.association_id);
                Err(SessionError::Close(format!(
                    "graceful shutdown timed out after {deadline:?}"
                )))
            }
        }
    }

    /// Aborts the association without waiting for the peer.
    pub(crate) fn abort(self) {
        self.endpoint.abort(self.association_id);
    }
}

/// Managed association state
struct ManagedAssociation {
    id: AssociationId,
    handle: AssociationHandle,
    association: Association,
    remote_addr: SocketAddr,
    state: AssociationState,
    inbound: bool,
    accepted: bool,
    /// Set once the owning session shut the association down; a closed
    /// association is dropped only when nobody can ask about it anymore.
    released: bool,
    /// DATA_IO notifications: each message moved to the inbox is reported
    data_io_subscribed: bool,
    data_io_messages: u64,
    /// Streams known to carry data in either direction
    streams: BTreeSet<u16>,
    next_ssn: HashMap<u16, u16>,
    inbox: VecDeque<ReceivedMessage>,
    inbox_bytes: usize,
    close_reason: Option<String>,
    connect_tx: Option<oneshot::Sender<Result<(AssociationId, SocketAddr)>>>,
    recv_tx: Option<oneshot::Sender<Result<ReceivedMessage>>>,
    shutdown_tx: Option<oneshot::Sender<Result<()>>>,
}

impl ManagedAssociation {
    fn new(
        id: AssociationId,
        handle: AssociationHandle,
        association: Association,
        remote_addr: SocketAddr,
        inbound: bool,
    ) -> Self {
        Self {
            id,
            handle,
            association,
            remote_addr,
            state: AssociationState::Connecting,
            inbound,
            accepted: false,
            released: false,
            data_io_subscribed: false,
            data_io_messages: 0,
            streams: BTreeSet::new(),
            next_ssn: HashMap::new(),
            inbox: VecDeque::new(),
            inbox_bytes: 0,
            close_reason: None,
            connect_tx: None,
            recv_tx: None,
            shutdown_tx: None,
        }
    }

    fn established(&mut self) {
        if self.state != AssociationState::Connecting {
            return;
        }
        self.state = AssociationState::Established;
        info!(
            "SCTP association {} established with {}",
            self.id, self.remote_addr
        );
        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Ok((self.id, self.remote_addr)));
        }
    }

    fn closed(&mut self, reason: String) {
        if self.state == AssociationState::Closed {
            return;
        }
        let was = self.state;
        self.state = AssociationState::Closed;
        debug!("Association {} closed: {}", self.id, reason);

        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Err(SessionError::Connect(reason.clone())));
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(Ok(()));
        }
        if was != AssociationState::ShuttingDown && self.inbox.is_empty() {
            if let Some(tx) = self.recv_tx.take() {
                let _ = tx.send(Err(SessionError::Receive(reason.clone())));
            }
        }
        self.close_reason = Some(reason);
    }

    /// Fails every parked waiter; used when the association is torn down.
    fn fail_waiters(&mut self, reason: &str) {
        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Err(SessionError::Connect(reason.to_string())));
        }
        if let Some(tx) = self.recv_tx.take() {
            let _ = tx.send(Err(SessionError::Receive(reason.to_string())));
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(Err(SessionError::Close(reason.to_string())));
        }
    }

    /// Moves readable messages from the association into the inbox until it
    /// holds `limit` bytes. Anything left stays in `sctp-proto`, which then
    /// shrinks the advertised receive window.
    fn read_streams(&mut self, limit: usize) {
        while let Some(stream) = self.association.accept_stream() {
            let stream_id = stream.stream_identifier();
            if self.streams.insert(stream_id) {
                debug!("Accepted stream {} on association {}", stream_id, self.id);
            }
        }

        let stream_ids: Vec<u16> = self.streams.iter().copied().collect();
        for stream_id in stream_ids {
            let Ok(mut stream) = self.association.stream(stream_id) else {
                continue;
            };

            while self.inbox_bytes < limit {
                match stream.read() {
                    Ok(Some(chunks)) => {
                        let total_len = chunks.len();
                        if total_len == 0 {
                            continue;
                        }
                        let mut buf = vec![0u8; total_len];
                        match chunks.read(&mut buf) {
                            Ok(n) => {
                                buf.truncate(n);
                                let ssn = self.next_ssn.entry(stream_id).or_insert(0);
                                let message = ReceivedMessage {
                                    stream_id,
                                    ssn: *ssn,
                                    ppid: ppid_value(&chunks.ppi),
                                    data: Bytes::from(buf),
                                };
                                *ssn = ssn.wrapping_add(1);
                                if self.data_io_subscribed {
                                    self.data_io_messages += 1;
                                    debug!(
                                        "DATA_IO: {} bytes on stream {} (ssn {}) of association {}",
                                        message.data.len(),
                                        stream_id,
                                        message.ssn,
                                        self.id
                                    );
                                } else {
                                    trace!(
                                        "Buffered {} bytes from stream {} on association {}",
                                        message.data.len(),
                                        stream_id,
                                        self.id
                                    );
                                }
                                self.inbox_bytes += message.data.len();
                                self.inbox.push_back(message);
                            }
                            Err(e) => {
                                warn!("Failed to read chunks on stream {}: {}", stream_id, e);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        trace!("Stream {} not readable: {}", stream_id, e);
                        break;
                    }
                }
            }
        }
    }

    fn pop_message(&mut self) -> Option<ReceivedMessage> {
        let message = self.inbox.pop_front()?;
        self.inbox_bytes -= message.data.len();
        Some(message)
    }

    fn requeue_front(&mut self, message: ReceivedMessage) {
        self.inbox_bytes += message.data.len();
        self.inbox.push_front(message);
    }

    fn write(&mut self, stream_id: u16, ppid: u32, data: &[u8]) -> Result<()> {
        if self.state != AssociationState::Established {
            return Err(SessionError::Transmit(format!(
                "association {} is {:?}",
                self.id, self.state
            )));
        }

        let ppi = PayloadProtocolIdentifier::from(ppid);
        let exists = self.association.stream(stream_id).is_ok();
        let mut stream = if exists {
            self.association.stream(stream_id)
        } else {
            self.association.open_stream(stream_id, ppi)
        }
        .map_err(|e| SessionError::Transmit(e.to_string()))?;

        stream
            .write_with_ppi(data, ppi)
            .map_err(|e| SessionError::Transmit(e.to_string()))?;
        self.streams.insert(stream_id);

        debug!(
            "Queued {} bytes on stream {} with PPID {} (association {})",
            data.len(),
            stream_id,
            ppid,
            self.id
        );
        Ok(())
    }
}

fn ppid_value(ppi: &PayloadProtocolIdentifier) -> u32 {
    match ppi {
        PayloadProtocolIdentifier::Dcep => 50,
        PayloadProtocolIdentifier::String => 51,
        PayloadProtocolIdentifier::Binary => 53,
        PayloadProtocolIdentifier::StringEmpty => 56,
        PayloadProtocolIdentifier::BinaryEmpty => 57,
        _ => SGS_PPID,
    }
}

enum Wake {
    Command(Option<Command>),
    Datagram(io::Result<(usize, SocketAddr)>),
    Timer,
}

/// Task owning one UDP socket and every association on it
struct EndpointDriver {
    socket: UdpSocket,
    local_addr: SocketAddr,
    role: EndpointRole,
    endpoint: Endpoint,
    transport: Arc<TransportConfig>,
    associations: HashMap<AssociationHandle, ManagedAssociation>,
    id_to_handle: HashMap<AssociationId, AssociationHandle>,
    next_association_id: AssociationId,
    /// Established inbound associations not yet handed to a session
    backlog: VecDeque<AssociationId>,
    accept_tx: Option<oneshot::Sender<Result<(AssociationId, SocketAddr)>>>,
    /// Established inbound associations beyond this many are aborted
    accept_backlog: usize,
    /// Inbox size per association above which reads from `sctp-proto` pause
    max_buffered_bytes: usize,
    transmits: VecDeque<Transmit>,
}

impl EndpointDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Endpoint driver started on {}", self.local_addr);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let deadline = self.next_timeout();
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                result = self.socket.recv_from(&mut buf) => Wake::Datagram(result),
                _ = sleep_until(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Close)) => break,
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Datagram(Ok((len, from))) => {
                    self.handle_datagram(from, Bytes::copy_from_slice(&buf[..len]));
                }
                Wake::Datagram(Err(e)) => {
                    warn!("UDP receive error on {}: {}", self.local_addr, e);
                }
                Wake::Timer => {}
            }

            self.drive(Instant::now());
            self.flush_transmits().await;
        }

        self.teardown().await;
    }

    fn next_timeout(&mut self) -> Option<Instant> {
        self.associations
            .values_mut()
            .filter_map(|managed| managed.association.poll_timeout())
            .min()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { remote, response_tx } => self.start_connect(remote, response_tx),
            Command::Accept { response_tx } => {
                if self.role != EndpointRole::Server {
                    let _ = response_tx.send(Err(SessionError::Accept(
                        "endpoint is not listening".into(),
                    )));
                } else if self.accept_tx.as_ref().is_some_and(|tx| !tx.is_closed()) {
                    let _ = response_tx.send(Err(SessionError::Accept(
                        "another accept is already pending".into(),
                    )));
                } else {
                    self.accept_tx = Some(response_tx);
                }
            }
            Command::SubscribeDataIo {
                association_id,
                response_tx,
            } => {
                let result = match self.managed_mut(association_id) {
                    Some(managed) => {
                        if !managed.data_io_subscribed {
                            managed.data_io_subscribed = true;
                            debug!("DATA_IO events enabled on association {}", association_id);
                        }
                        Ok(())
                    }
                    None => Err(SessionError::Transmit(format!(
                        "unknown association {association_id}"
                    ))),
                };
                let _ = response_tx.send(result);
            }
            Command::Send {
                association_id,
                stream_id,
                ppid,
                data,
                response_tx,
            } => {
                let result = match self.managed_mut(association_id) {
                    Some(managed) => managed.write(stream_id, ppid, &data[..]),
                    None => Err(SessionError::Transmit(format!(
                        "unknown association {association_id}"
                    ))),
                };
                let _ = response_tx.send(result);
            }
            Command::Recv {
                association_id,
                response_tx,
            } => match self.managed_mut(association_id) {
                Some(managed) => {
                    if managed.recv_tx.as_ref().is_some_and(|tx| !tx.is_closed()) {
                        let _ = response_tx.send(Err(SessionError::Receive(
                            "another receive is already pending".into(),
                        )));
                    } else {
                        managed.recv_tx = Some(response_tx);
                    }
                }
                None => {
                    let _ = response_tx.send(Err(SessionError::Receive(format!(
                        "unknown association {association_id}"
                    ))));
                }
            },
            Command::Shutdown {
                association_id,
                response_tx,
            } => self.start_shutdown(association_id, response_tx),
            Command::Abort { association_id } => self.abort(association_id),
            Command::Stats { response_tx } => {
                let _ = response_tx.send(self.stats());
            }
            Command::Close => {}
        }
    }

    fn start_connect(
        &mut self,
        remote: SocketAddr,
        response_tx: oneshot::Sender<Result<(AssociationId, SocketAddr)>>,
    ) {
        info!("Connecting to SCTP endpoint at {}", remote);

        let mut client_config = ClientConfig::new();
        client_config.transport = Arc::clone(&self.transport);

        match self.endpoint.connect(client_config, remote) {
            Ok((handle, association)) => {
                let id = self.allocate_id(handle);
                let mut managed = ManagedAssociation::new(id, handle, association, remote, false);
                managed.connect_tx = Some(response_tx);
                self.associations.insert(handle, managed);
            }
            Err(e) => {
                let _ = response_tx.send(Err(SessionError::Connect(e.to_string())));
            }
        }
    }

    fn stats(&self) -> EndpointStats {
        EndpointStats {
            associations: self.associations.len(),
            backlog: self.backlog.len(),
            buffered_bytes: self.associations.values().map(|m| m.inbox_bytes).sum(),
            data_io_messages: self.associations.values().map(|m| m.data_io_messages).sum(),
        }
    }

    fn start_shutdown(
        &mut self,
        association_id: AssociationId,
        response_tx: oneshot::Sender<Result<()>>,
    ) {
        let Some(managed) = self.managed_mut(association_id) else {
            // Already gone, nothing left to release
            let _ = response_tx.send(Ok(()));
            return;
        };

        if managed.state == AssociationState::Closed {
            let _ = response_tx.send(Ok(()));
            self.remove(association_id);
            return;
        }

        info!("Initiating SCTP shutdown of association {}", association_id);
        managed.released = true;
        match managed.association.shutdown() {
            Ok(()) => {
                managed.state = AssociationState::ShuttingDown;
                managed.shutdown_tx = Some(response_tx);
            }
            Err(e) => {
                let _ = response_tx.send(Err(SessionError::Close(e.to_string())));
                self.abort(association_id);
            }
        }
    }

    fn abort(&mut self, association_id: AssociationId) {
        let Some(managed) = self.managed_mut(association_id) else {
            return;
        };
        if managed.state != AssociationState::Closed {
            let _ = managed.association.close();
        }
        managed.fail_waiters("association aborted");

        let now = Instant::now();
        let mut pending = Vec::new();
        while let Some(transmit) = managed.association.poll_transmit(now) {
            pending.push(transmit);
        }
        let mut endpoint_events = Vec::new();
        while let Some(event) = managed.association.poll_endpoint_event() {
            endpoint_events.push(event);
        }
        let handle = managed.handle;
        for event in endpoint_events {
            let _ = self.endpoint.handle_event(handle, event);
        }
        self.transmits.extend(pending);
        self.remove(association_id);
        debug!("Aborted association {}", association_id);
    }

    fn handle_datagram(&mut self, from: SocketAddr, data: Bytes) {
        trace!("Received {} bytes from {}", data.len(), from);

        let now = Instant::now();
        let Some((handle, event)) = self.endpoint.handle(now, from, None, None, data) else {
            return;
        };

        match event {
            DatagramEvent::NewAssociation(association) => {
                let id = self.allocate_id(handle);
                info!("New SCTP association from {} (id: {})", from, id);
                self.associations
                    .insert(handle, ManagedAssociation::new(id, handle, association, from, true));
            }
            DatagramEvent::AssociationEvent(event) => {
                if let Some(managed) = self.associations.get_mut(&handle) {
                    managed.association.handle_event(event);
                }
            }
        }
    }

    /// Runs every association state machine and settles parked waiters.
    fn drive(&mut self, now: Instant) {
        let mut overflow = Vec::new();
        for managed in self.associations.values_mut() {
            if let Some(deadline) = managed.association.poll_timeout() {
                if now >= deadline {
                    managed.association.handle_timeout(now);
                }
            }

            while let Some(event) = managed.association.poll_endpoint_event() {
                if let Some(event) = self.endpoint.handle_event(managed.handle, event) {
                    managed.association.handle_event(event);
                }
            }

            while let Some(event) = managed.association.poll() {
                match event {
                    Event::Connected => managed.established(),
                    Event::AssociationLost { reason } => {
                        if managed.state != AssociationState::ShuttingDown {
                            warn!("Association {} lost: {}", managed.id, reason);
                        }
                        managed.closed(format!("association lost: {reason}"));
                    }
                    Event::Stream(stream_event) => {
                        trace!("Stream event: {:?}", stream_event);
                    }
                    Event::DatagramReceived => {
                        trace!("Datagram received event");
                    }
                }
            }

            if !managed.inbound
                && managed.state == AssociationState::Connecting
                && !managed.association.is_handshaking()
                && !managed.association.is_closed()
            {
                managed.established();
            }

            if managed.state == AssociationState::Established {
                if managed.inbound && !managed.accepted && !self.backlog.contains(&managed.id) {
                    if self.backlog.len() < self.accept_backlog {
                        self.backlog.push_back(managed.id);
                    } else {
                        overflow.push(managed.id);
                    }
                }
                managed.read_streams(self.max_buffered_bytes);
            }

            if managed.association.is_closed() {
                managed.closed("association closed".into());
            }

            while let Some(transmit) = managed.association.poll_transmit(now) {
                self.transmits.push_back(transmit);
            }
        }

        for id in overflow {
            warn!(
                "Accept backlog of {} is full, aborting association {}",
                self.accept_backlog, id
            );
            self.abort(id);
        }

        while let Some(transmit) = self.endpoint.poll_transmit() {
            self.transmits.push_back(transmit);
        }

        self.settle_waiters();
        self.reap_closed();
    }

    fn settle_waiters(&mut self) {
        if let Some(tx) = self.accept_tx.take() {
            if !tx.is_closed() {
                match self.pop_backlog() {
                    Some(id) => {
                        let remote = self.managed_mut(id).map(|managed| managed.remote_addr);
                        if let Some(remote) = remote {
                            match tx.send(Ok((id, remote))) {
                                Ok(()) => {
                                    if let Some(managed) = self.managed_mut(id) {
                                        managed.accepted = true;
                                    }
                                    info!("Accepted SCTP association {} from {}", id, remote);
                                }
                                Err(_) => self.backlog.push_front(id),
                            }
                        }
                    }
                    None => self.accept_tx = Some(tx),
                }
            }
        }

        for managed in self.associations.values_mut() {
            let Some(tx) = managed.recv_tx.take() else {
                continue;
            };
            if tx.is_closed() {
                continue;
            }
            if let Some(message) = managed.pop_message() {
                if let Err(Ok(message)) = tx.send(Ok(message)) {
                    managed.requeue_front(message);
                }
            } else if managed.state == AssociationState::Closed {
                let reason = managed
                    .close_reason
                    .clone()
                    .unwrap_or_else(|| "association closed".into());
                let _ = tx.send(Err(SessionError::Receive(reason)));
            } else {
                managed.recv_tx = Some(tx);
            }
        }
    }

    fn pop_backlog(&mut self) -> Option<AssociationId> {
        while let Some(id) = self.backlog.pop_front() {
            let usable = self
                .managed_mut(id)
                .is_some_and(|managed| managed.state == AssociationState::Established);
            if usable {
                return Some(id);
            }
        }
        None
    }

    /// Drops closed associations no session holds: inbound ones nobody
    /// accepted and ones whose session already shut them down.
    fn reap_closed(&mut self) {
        let stale: Vec<AssociationId> = self
            .associations
            .values()
            .filter(|managed| {
                managed.state == AssociationState::Closed
                    && managed.shutdown_tx.is_none()
                    && (managed.released || (managed.inbound && !managed.accepted))
            })
            .map(|managed| managed.id)
            .collect();

        for id in stale {
            debug!("Dropping closed association {}", id);
            self.remove(id);
        }
    }

    async fn flush_transmits(&mut self) {
        while let Some(transmit) = self.transmits.pop_front() {
            match &transmit.payload {
                Payload::RawEncode(chunks) => {
                    for chunk in chunks {
                        match self.socket.send_to(chunk, transmit.remote).await {
                            Ok(_) => trace!("Sent {} bytes to {}", chunk.len(), transmit.remote),
                            Err(e) => warn!("Failed to send to {}: {}", transmit.remote, e),
                        }
                    }
                }
                Payload::PartialDecode(_) => {
                    // PartialDecode is for incoming packets, skip for outgoing
                    trace!("Skipping PartialDecode payload for transmit");
                }
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(tx) = self.accept_tx.take() {
            let _ = tx.send(Err(SessionError::Accept("listener closed".into())));
        }

        let now = Instant::now();
        for (_, mut managed) in self.associations.drain() {
            if managed.state != AssociationState::Closed {
                let _ = managed.association.close();
            }
            managed.fail_waiters(ENDPOINT_CLOSED);
            while let Some(transmit) = managed.association.poll_transmit(now) {
                self.transmits.push_back(transmit);
            }
        }
        self.id_to_handle.clear();
        self.backlog.clear();
        self.flush_transmits().await;

        info!("SCTP endpoint on {} stopped", self.local_addr);
    }

    fn allocate_id(&mut self, handle: AssociationHandle) -> AssociationId {
        let id = self.next_association_id;
        self.next_association_id += 1;
        self.id_to_handle.insert(id, handle);
        id
    }

    fn managed_mut(&mut self, id: AssociationId) -> Option<&mut ManagedAssociation> {
        let handle = self.id_to_handle.get(&id)?;
        self.associations.get_mut(handle)
    }

    fn remove(&mut self, id: AssociationId) {
        if let Some(handle) = self.id_to_handle.remove(&id) {
            self.associations.remove(&handle);
        }
        self.backlog.retain(|queued| *queued != id);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
