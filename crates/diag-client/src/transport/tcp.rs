//! DoIP TCP connection to one diagnostic server
//!
//! A background receiver task reads the socket, splits frames, answers alive
//! checks and forwards everything else to the connection over a channel.
//! Request/response matching happens on the caller side by payload type and
//! logical addresses; frames that do not match are logged and dropped.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{
    generic_nack_code, AliveCheckResponse, Codec, DiagnosticMessage, GenericNack, LogicalAddress,
    Payload, RoutingActivationCode, RoutingActivationRequest, RoutingActivationType, WireMessage,
};
use crate::config::ConversationConfig;
use crate::error::{ActivationError, CodecError, ConnectError, ReceiveError, SendError};
use crate::timer::{SyncTimer, TimerOutcome};

const INCOMING_QUEUE_DEPTH: usize = 64;
const READ_BUFFER_SIZE: usize = 4096;

/// Lifecycle of a [`TcpConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Activating,
    Activated,
    Faulted,
}

/// Diagnostic message acknowledgement from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Positive,
    Negative(u8),
}

/// Per-connection parameters derived from the conversation configuration
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub client_address: LogicalAddress,
    pub activation_type: RoutingActivationType,
    pub connect_timeout: Duration,
    pub activation_timeout: Duration,
    pub codec: Codec,
}

impl ConnectionSettings {
    pub fn from_config(config: &ConversationConfig, protocol_version: u8) -> Self {
        Self {
            client_address: config.source_address,
            activation_type: config.activation_type.into(),
            connect_timeout: config.connect_timeout(),
            activation_timeout: config.activation_timeout(),
            codec: Codec::new(protocol_version).with_max_payload_len(config.max_payload_size),
        }
    }
}

type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

/// One TCP session to a DoIP entity
pub struct TcpConnection {
    settings: ConnectionSettings,
    server_address: LogicalAddress,
    state: Arc<Mutex<ConnectionState>>,
    timer: Arc<SyncTimer>,
    closed: CancellationToken,
    writer: Option<SharedWriter>,
    incoming: Option<mpsc::Receiver<WireMessage>>,
    /// Diagnostic responses that overtook their acknowledgement
    early_responses: VecDeque<Bytes>,
    receiver_handle: Option<JoinHandle<()>>,
}

impl TcpConnection {
    /// `closed` is cancelled when the connection is torn down; pass a child of
    /// the manager shutdown token so shutdown reaches every socket.
    pub fn new(
        settings: ConnectionSettings,
        server_address: LogicalAddress,
        timer: Arc<SyncTimer>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            settings,
            server_address,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            timer,
            closed,
            writer: None,
            incoming: None,
            early_responses: VecDeque::new(),
            receiver_handle: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Shared view of the state, updated by the receiver task as well
    pub fn state_handle(&self) -> Arc<Mutex<ConnectionState>> {
        self.state.clone()
    }

    pub fn server_address(&self) -> LogicalAddress {
        self.server_address
    }

    pub fn client_address(&self) -> LogicalAddress {
        self.settings.client_address
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Open the TCP socket
    pub async fn connect(&mut self, addr: SocketAddr) -> Result<(), ConnectError> {
        self.set_state(ConnectionState::Connecting);
        info!(%addr, server = format!("0x{:04X}", self.server_address), "Connecting to DoIP entity");

        let stream = match self
            .timer
            .wait(self.settings.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectError::Io(e.to_string()));
            }
            Err(TimerOutcome::TimedOut) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectError::Timeout(addr.to_string()));
            }
            Err(TimerOutcome::Cancelled) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectError::Cancelled);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(AsyncMutex::new(write_half));
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);

        let receiver = Receiver {
            reader: read_half,
            writer: writer.clone(),
            codec: self.settings.codec,
            client_address: self.settings.client_address,
            incoming_tx,
            closed: self.closed.clone(),
            state: self.state.clone(),
        };
        self.receiver_handle = Some(tokio::spawn(receiver.run()));
        self.writer = Some(writer);
        self.incoming = Some(incoming_rx);
        Ok(())
    }

    /// Perform the routing activation handshake
    pub async fn activate_routing(&mut self) -> Result<(), ActivationError> {
        self.set_state(ConnectionState::Activating);

        let request = RoutingActivationRequest {
            source_address: self.settings.client_address,
            activation_type: self.settings.activation_type,
            oem_specific: None,
        };
        let frame = self.settings.codec.encode_payload(&request);
        if let Err(e) = self.write(&frame).await {
            warn!(%e, "Failed to send routing activation request");
            self.set_state(ConnectionState::Faulted);
            return Err(ActivationError::ConnectionLost);
        }

        let client = self.settings.client_address;
        let server = self.server_address;
        let timeout = self.settings.activation_timeout;
        let response = self
            .await_message(timeout, |msg| match Payload::parse(msg) {
                Ok(Payload::RoutingActivationResponse(resp))
                    if resp.client_address == client && resp.server_address == server =>
                {
                    Some(resp)
                }
                Ok(Payload::RoutingActivationResponse(resp)) => {
                    debug!(
                        client = format!("0x{:04X}", resp.client_address),
                        server = format!("0x{:04X}", resp.server_address),
                        "Discarding routing activation response for another pair"
                    );
                    None
                }
                other => {
                    discard(msg, other);
                    None
                }
            })
            .await;

        match response {
            Ok(resp) if resp.code == RoutingActivationCode::RoutingSuccessful => {
                self.set_state(ConnectionState::Activated);
                info!(
                    client = format!("0x{:04X}", client),
                    server = format!("0x{:04X}", server),
                    "Routing activated"
                );
                Ok(())
            }
            Ok(resp) => {
                warn!(code = %resp.code, "Routing activation rejected");
                self.set_state(ConnectionState::Faulted);
                Err(ActivationError::ActivationRejected(resp.code))
            }
            Err(e) => {
                warn!(%e, "Routing activation failed");
                self.set_state(ConnectionState::Faulted);
                Err(e.into())
            }
        }
    }

    /// Frame and write a diagnostic message to the server
    pub async fn send_diagnostic_message(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if self.state() != ConnectionState::Activated {
            return Err(SendError::NotActivated);
        }

        let message = DiagnosticMessage {
            source_address: self.settings.client_address,
            target_address: self.server_address,
            user_data: Bytes::copy_from_slice(payload),
        };
        let frame = self
            .settings
            .codec
            .try_encode_payload(&message)
            .map_err(|e| {
                warn!(%e, "Diagnostic message not sent");
                match e {
                    CodecError::PayloadTooLarge { length, limit } => {
                        SendError::PayloadTooLarge { length, limit }
                    }
                    _ => SendError::PayloadTooLarge {
                        length: payload.len(),
                        limit: self.settings.codec.max_payload_len(),
                    },
                }
            })?;
        self.write(&frame).await.map_err(|e| {
            warn!(%e, "Failed to send diagnostic message");
            self.set_state(ConnectionState::Faulted);
            SendError::ConnectionLost
        })?;
        debug!(len = payload.len(), "Diagnostic message sent");
        Ok(())
    }

    /// Drop frames left over from earlier exchanges
    ///
    /// A response that arrives after its request timed out stays queued; it
    /// must not be taken as the answer to the next request.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = self.early_responses.len();
        self.early_responses.clear();
        if let Some(incoming) = self.incoming.as_mut() {
            while let Ok(msg) = incoming.try_recv() {
                debug!(payload_type = ?msg.payload_type, "Discarding stale frame");
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(
                server = format!("0x{:04X}", self.server_address),
                dropped, "Discarded frames from earlier exchanges"
            );
        }
        dropped
    }

    /// Wait for the DoIP acknowledgement of the last diagnostic message
    pub async fn wait_for_acknowledgement(
        &mut self,
        timeout: Duration,
    ) -> Result<Acknowledgement, ReceiveError> {
        let client = self.settings.client_address;
        let server = self.server_address;
        let mut early = Vec::new();

        let result = self
            .await_message(timeout, |msg| match Payload::parse(msg) {
                Ok(Payload::DiagnosticMessageAck(ack))
                    if ack.source_address == server && ack.target_address == client =>
                {
                    Some(Acknowledgement::Positive)
                }
                Ok(Payload::DiagnosticMessageNack(nack))
                    if nack.source_address == server && nack.target_address == client =>
                {
                    Some(Acknowledgement::Negative(nack.nack_code))
                }
                Ok(Payload::DiagnosticMessage(diag))
                    if diag.source_address == server && diag.target_address == client =>
                {
                    early.push(diag.user_data);
                    None
                }
                other => {
                    discard(msg, other);
                    None
                }
            })
            .await;

        self.early_responses.extend(early);
        self.fault_on_loss(result)
    }

    /// Wait for the next diagnostic message addressed to this client
    pub async fn receive_diagnostic_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Bytes, ReceiveError> {
        if let Some(data) = self.early_responses.pop_front() {
            return Ok(data);
        }
        if self.state() != ConnectionState::Activated {
            return Err(ReceiveError::ConnectionLost);
        }

        let client = self.settings.client_address;
        let server = self.server_address;
        let result = self
            .await_message(timeout, |msg| match Payload::parse(msg) {
                Ok(Payload::DiagnosticMessage(diag))
                    if diag.source_address == server && diag.target_address == client =>
                {
                    Some(diag.user_data)
                }
                other => {
                    discard(msg, other);
                    None
                }
            })
            .await;
        self.fault_on_loss(result)
    }

    /// Close the socket; always succeeds
    pub async fn disconnect(&mut self) {
        self.closed.cancel();
        if let Some(writer) = self.writer.take() {
            let mut writer = writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(%e, "Socket shutdown failed");
            }
        }
        if let Some(handle) = self.receiver_handle.take() {
            handle.abort();
        }
        self.incoming = None;
        self.early_responses.clear();
        self.set_state(ConnectionState::Disconnected);
        debug!(server = format!("0x{:04X}", self.server_address), "Disconnected");
    }

    async fn write(&self, frame: &[u8]) -> std::io::Result<()> {
        let writer = self.writer.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "socket not open")
        })?;
        let mut writer = writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    fn fault_on_loss<T>(&self, result: Result<T, ReceiveError>) -> Result<T, ReceiveError> {
        if matches!(result, Err(ReceiveError::ConnectionLost)) {
            self.set_state(ConnectionState::Faulted);
        }
        result
    }

    /// Consume inbound frames until `select` accepts one or the timer ends the wait
    async fn await_message<T, F>(
        &mut self,
        timeout: Duration,
        mut select: F,
    ) -> Result<T, ReceiveError>
    where
        F: FnMut(&WireMessage) -> Option<T>,
    {
        let timer = self.timer.clone();
        let incoming = self
            .incoming
            .as_mut()
            .ok_or(ReceiveError::ConnectionLost)?;

        let search = async {
            while let Some(msg) = incoming.recv().await {
                if let Some(found) = select(&msg) {
                    return Ok(found);
                }
            }
            Err(ReceiveError::ConnectionLost)
        };

        match timer.wait(timeout, search).await {
            Ok(result) => result,
            Err(TimerOutcome::TimedOut) => Err(ReceiveError::Timeout),
            Err(TimerOutcome::Cancelled) => Err(ReceiveError::Cancelled),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.closed.cancel();
        if let Some(handle) = self.receiver_handle.take() {
            handle.abort();
        }
    }
}

fn discard(msg: &WireMessage, parsed: Result<Payload, CodecError>) {
    match parsed {
        Ok(Payload::GenericNack(nack)) => {
            warn!(code = format!("0x{:02X}", nack.code), "Generic NACK received")
        }
        Ok(_) => debug!(payload_type = ?msg.payload_type, "Discarding unrelated frame"),
        Err(e) => warn!(%e, "Discarding malformed frame"),
    }
}

/// Background socket reader owned by the receiver task
struct Receiver {
    reader: OwnedReadHalf,
    writer: SharedWriter,
    codec: Codec,
    client_address: LogicalAddress,
    incoming_tx: mpsc::Sender<WireMessage>,
    closed: CancellationToken,
    state: Arc<Mutex<ConnectionState>>,
}

impl Receiver {
    async fn run(mut self) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            loop {
                match self.codec.decode_frame(&mut buf) {
                    Ok(Some(msg)) => {
                        if !self.dispatch(msg).await {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Framing is lost; the stream cannot be resynchronized.
                        warn!(%e, "Invalid DoIP header, closing connection");
                        let code = match e {
                            CodecError::MalformedLength { .. } => generic_nack_code::MESSAGE_TOO_LARGE,
                            _ => generic_nack_code::INCORRECT_PATTERN_FORMAT,
                        };
                        self.reply(&GenericNack { code }).await;
                        self.fault();
                        return;
                    }
                }
            }

            let read = tokio::select! {
                _ = self.closed.cancelled() => return,
                read = self.reader.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    info!("Connection closed by DoIP entity");
                    self.fault();
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%e, "Receive error");
                    self.fault();
                    return;
                }
            }
        }
    }

    /// Returns false once nobody listens anymore
    async fn dispatch(&self, msg: WireMessage) -> bool {
        if !msg.payload_type.is_known() {
            debug!(payload_type = ?msg.payload_type, "Unknown payload type");
            self.reply(&GenericNack {
                code: generic_nack_code::UNKNOWN_PAYLOAD_TYPE,
            })
            .await;
            return true;
        }

        if matches!(Payload::parse(&msg), Ok(Payload::AliveCheckRequest)) {
            debug!("Answering alive check");
            self.reply(&AliveCheckResponse {
                source_address: self.client_address,
            })
            .await;
            return true;
        }

        match self.incoming_tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(payload_type = ?msg.payload_type, "Inbound queue full, dropping frame");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn reply<P: crate::codec::DoipPayload>(&self, payload: &P) {
        let frame = self.codec.encode_payload(payload);
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&frame).await {
            debug!(%e, "Failed to send reply");
        }
    }

    fn fault(&self) {
        if !self.closed.is_cancelled() {
            *self.state.lock() = ConnectionState::Faulted;
        }
    }
}
