//! Test utilities for diag-client
//!
//! [`TestEntity`] is a scripted DoIP entity listening on loopback. It answers
//! vehicle identification requests over UDP and serves routing activation and
//! diagnostic messages over TCP, following an [`EntityScript`].
//!
//! ```ignore
//! use diag_client::testing::{EntityScript, TestEntity};
//!
//! let entity = TestEntity::start(EntityScript::new(0xFA25))?;
//! let config = entity.client_config(&[("DiagTesterOne", 0x0001)]);
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{
    diagnostic_nack_code, Codec, DiagnosticMessage, DiagnosticMessageAck, DiagnosticMessageNack,
    DoipPayload, LogicalAddress, Payload, PayloadType, RoutingActivationCode,
    RoutingActivationResponse, VehicleAnnouncement, VehicleIdentificationRequest,
};
use crate::config::{ConversationConfig, DiagClientConfig, ServerConfig};

/// How the entity answers one diagnostic request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagReply {
    /// Positive DoIP ack followed by this diagnostic response
    Respond(Vec<u8>),
    /// DoIP negative ack with this code
    Nack(u8),
    /// Positive DoIP ack, no diagnostic response
    Silent,
    /// Positive DoIP ack now, diagnostic response after the delay
    Delayed(Duration, Vec<u8>),
    /// Raw frames written right after the acknowledgement, before the
    /// diagnostic response of `reply`
    Interleaved {
        frames: Vec<Vec<u8>>,
        reply: Box<DiagReply>,
    },
}

impl DiagReply {
    /// UDS-style positive response: SID + 0x40, echoing the rest
    pub fn positive(request: &[u8]) -> Self {
        let mut response = request.to_vec();
        if let Some(sid) = response.first_mut() {
            *sid = sid.wrapping_add(0x40);
        }
        Self::Respond(response)
    }

    /// Precede this reply's response with raw `frames`
    pub fn after(self, frames: Vec<Vec<u8>>) -> Self {
        Self::Interleaved {
            frames,
            reply: Box::new(self),
        }
    }
}

type Handler = Arc<dyn Fn(&[u8]) -> DiagReply + Send + Sync>;

/// Behaviour of a [`TestEntity`]
#[derive(Clone)]
pub struct EntityScript {
    pub logical_address: LogicalAddress,
    pub activation_code: RoutingActivationCode,
    /// Send a response for a foreign client address before the real one
    pub mismatched_activation_first: bool,
    /// Send an alive check request before answering routing activation
    pub alive_check_before_activation: bool,
    /// Never answer routing activation
    pub ignore_activation: bool,
    pub announcements: Vec<VehicleAnnouncement>,
    /// Repeat the first announcement after the full list
    pub duplicate_announcement: bool,
    /// Diagnostic messages from a foreign source sent after activation,
    /// followed by an alive check request
    pub unsolicited_after_activation: usize,
    handler: Handler,
}

impl EntityScript {
    /// Entity that activates every tester and answers positively
    pub fn new(logical_address: LogicalAddress) -> Self {
        Self {
            logical_address,
            activation_code: RoutingActivationCode::RoutingSuccessful,
            mismatched_activation_first: false,
            alive_check_before_activation: false,
            ignore_activation: false,
            announcements: Vec::new(),
            duplicate_announcement: false,
            unsolicited_after_activation: 0,
            handler: Arc::new(DiagReply::positive),
        }
    }

    pub fn activation_code(mut self, code: RoutingActivationCode) -> Self {
        self.activation_code = code;
        self
    }

    pub fn mismatched_activation_first(mut self) -> Self {
        self.mismatched_activation_first = true;
        self
    }

    pub fn alive_check_before_activation(mut self) -> Self {
        self.alive_check_before_activation = true;
        self
    }

    pub fn ignore_activation(mut self) -> Self {
        self.ignore_activation = true;
        self
    }

    pub fn announce(mut self, announcement: VehicleAnnouncement) -> Self {
        self.announcements.push(announcement);
        self
    }

    pub fn duplicate_announcement(mut self) -> Self {
        self.duplicate_announcement = true;
        self
    }

    pub fn unsolicited_after_activation(mut self, count: usize) -> Self {
        self.unsolicited_after_activation = count;
        self
    }

    pub fn on_request<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8]) -> DiagReply + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }
}

/// What the entity observed, for assertions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityLog {
    pub connections: usize,
    pub activation_requests: Vec<LogicalAddress>,
    pub diagnostic_requests: Vec<(LogicalAddress, Vec<u8>)>,
    pub alive_check_responses: Vec<LogicalAddress>,
    /// Codes of generic NACKs sent by the client
    pub generic_nacks: Vec<u8>,
    /// TCP sessions that have ended, by either side
    pub sessions_ended: usize,
    pub identification_requests: usize,
}

/// A scripted DoIP entity that shuts down when dropped
pub struct TestEntity {
    pub logical_address: LogicalAddress,
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    log: Arc<Mutex<EntityLog>>,
    shutdown: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestEntity {
    /// Bind TCP and UDP on `127.0.0.1:0` and start serving
    pub fn start(script: EntityScript) -> std::io::Result<Self> {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0")?;
        tcp.set_nonblocking(true)?;
        let udp = std::net::UdpSocket::bind("127.0.0.1:0")?;
        udp.set_nonblocking(true)?;
        let tcp_addr = tcp.local_addr()?;
        let udp_addr = udp.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let logical_address = script.logical_address;
        let log = Arc::new(Mutex::new(EntityLog::default()));
        let shutdown = CancellationToken::new();

        let thread = {
            let log = log.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("doip-test-entity".into())
                .spawn(move || {
                    runtime.block_on(async move {
                        let script = Arc::new(script);
                        let (tcp, udp) =
                            match (TcpListener::from_std(tcp), UdpSocket::from_std(udp)) {
                                (Ok(tcp), Ok(udp)) => (tcp, udp),
                                _ => return,
                            };
                        tokio::spawn(accept_loop(tcp, script.clone(), log.clone(), shutdown.clone()));
                        tokio::spawn(announce_loop(udp, script, log, shutdown.clone()));
                        shutdown.cancelled().await;
                    });
                })?
        };

        Ok(Self {
            logical_address,
            tcp_addr,
            udp_addr,
            log,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn log(&self) -> EntityLog {
        self.log.lock().clone()
    }

    /// Client configuration pointing discovery and the server mapping at this entity
    pub fn client_config(&self, testers: &[(&str, LogicalAddress)]) -> DiagClientConfig {
        let mut config = DiagClientConfig::default();
        config.discovery.broadcast_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.discovery.local_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.discovery.port = self.udp_addr.port();
        config.discovery.timeout_ms = 300;
        config.conversations = testers
            .iter()
            .map(|(name, address)| {
                let mut conv = ConversationConfig::new(*name, *address);
                conv.tcp_port = self.tcp_addr.port();
                conv.connect_timeout_ms = 1000;
                conv.activation_timeout_ms = 1000;
                conv.ack_timeout_ms = 1000;
                conv.response_timeout_ms = 1000;
                conv
            })
            .collect();
        self.map_server(&mut config, self.logical_address);
        config
    }

    /// Add a server mapping for `logical_address` to this entity
    pub fn map_server(&self, config: &mut DiagClientConfig, logical_address: LogicalAddress) {
        config.servers.retain(|s| s.logical_address != logical_address);
        config.servers.push(ServerConfig {
            logical_address,
            host: self.tcp_addr.ip(),
            port: self.tcp_addr.port(),
        });
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TestEntity {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Announcement with the given address and VIN, fixed EID/GID
pub fn announcement(logical_address: LogicalAddress, vin: &[u8; 17]) -> VehicleAnnouncement {
    VehicleAnnouncement {
        logical_address,
        vin: *vin,
        eid: [0x00, 0x02, 0x36, 0x31, 0x00, 0x1c],
        gid: [0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f],
        further_action: 0x00,
        sync_status: None,
    }
}

async fn accept_loop(
    listener: TcpListener,
    script: Arc<EntityScript>,
    log: Arc<Mutex<EntityLog>>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "Test entity accepted connection");
                log.lock().connections += 1;
                let session = serve_session(stream, script.clone(), log.clone(), shutdown.clone());
                let log = log.clone();
                tokio::spawn(async move {
                    session.await;
                    log.lock().sessions_ended += 1;
                });
            }
            Err(e) => {
                debug!(%e, "Test entity accept failed");
                return;
            }
        }
    }
}

async fn serve_session(
    mut stream: TcpStream,
    script: Arc<EntityScript>,
    log: Arc<Mutex<EntityLog>>,
    shutdown: CancellationToken,
) {
    let codec = Codec::default();
    let own = script.logical_address;
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        loop {
            let msg = match codec.decode_frame(&mut buf) {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    debug!(%e, "Test entity dropping desynchronized session");
                    return;
                }
            };
            let mut out = BytesMut::new();
            let mut close = false;
            let mut late = None;

            match Payload::parse(&msg) {
                Ok(Payload::RoutingActivationRequest(req)) => {
                    log.lock().activation_requests.push(req.source_address);
                    if script.ignore_activation {
                        continue;
                    }
                    if script.alive_check_before_activation {
                        out.extend_from_slice(&codec.encode(PayloadType::AliveCheckRequest, &[]));
                    }
                    if script.mismatched_activation_first {
                        push(&mut out, &codec, &RoutingActivationResponse {
                            client_address: req.source_address.wrapping_add(1),
                            server_address: own,
                            code: RoutingActivationCode::RoutingSuccessful,
                            oem_specific: None,
                        });
                    }
                    push(&mut out, &codec, &RoutingActivationResponse {
                        client_address: req.source_address,
                        server_address: own,
                        code: script.activation_code,
                        oem_specific: None,
                    });
                    close = script.activation_code != RoutingActivationCode::RoutingSuccessful;
                    if !close && script.unsolicited_after_activation > 0 {
                        for _ in 0..script.unsolicited_after_activation {
                            push(&mut out, &codec, &DiagnosticMessage {
                                source_address: own.wrapping_add(1),
                                target_address: req.source_address,
                                user_data: Bytes::from_static(&[0x7E, 0x00]),
                            });
                        }
                        out.extend_from_slice(&codec.encode(PayloadType::AliveCheckRequest, &[]));
                    }
                }
                Ok(Payload::DiagnosticMessage(diag)) => {
                    log.lock()
                        .diagnostic_requests
                        .push((diag.source_address, diag.user_data.to_vec()));
                    let reply = if diag.target_address == own {
                        (script.handler)(&diag.user_data)
                    } else {
                        DiagReply::Nack(diagnostic_nack_code::UNKNOWN_TARGET_ADDRESS)
                    };
                    late = answer(&mut out, &codec, own, diag, reply);
                }
                Ok(Payload::AliveCheckResponse(resp)) => {
                    log.lock().alive_check_responses.push(resp.source_address);
                }
                Ok(Payload::GenericNack(nack)) => {
                    log.lock().generic_nacks.push(nack.code);
                }
                other => debug!(?other, "Test entity ignoring frame"),
            }

            if !out.is_empty() && stream.write_all(&out).await.is_err() {
                return;
            }
            if close {
                let _ = stream.shutdown().await;
                return;
            }
            if let Some((delay, frame)) = late {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }

        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = stream.read_buf(&mut buf) => read,
        };
        if !matches!(read, Ok(n) if n > 0) {
            return;
        }
    }
}

fn push<P: DoipPayload>(out: &mut BytesMut, codec: &Codec, payload: &P) {
    out.extend_from_slice(&codec.encode_payload(payload));
}

/// Write the acknowledgement and response to `out`; a delayed response is
/// returned instead
fn answer(
    out: &mut BytesMut,
    codec: &Codec,
    own: LogicalAddress,
    request: DiagnosticMessage,
    mut reply: DiagReply,
) -> Option<(Duration, Bytes)> {
    let mut noise = Vec::new();
    while let DiagReply::Interleaved { frames, reply: inner } = reply {
        noise.extend(frames);
        reply = *inner;
    }

    let tester = request.source_address;
    if let DiagReply::Nack(nack_code) = reply {
        push(out, codec, &DiagnosticMessageNack {
            source_address: own,
            target_address: tester,
            nack_code,
            previous_message: request.user_data,
        });
    } else {
        push(out, codec, &DiagnosticMessageAck {
            source_address: own,
            target_address: tester,
            ack_code: 0x00,
            previous_message: request.user_data,
        });
    }
    for frame in noise {
        out.extend_from_slice(&frame);
    }

    let response = |data: Vec<u8>| {
        codec.encode_payload(&DiagnosticMessage {
            source_address: own,
            target_address: tester,
            user_data: data.into(),
        })
    };
    match reply {
        DiagReply::Respond(data) => {
            out.extend_from_slice(&response(data));
            None
        }
        DiagReply::Delayed(delay, data) => Some((delay, response(data))),
        _ => None,
    }
}

/// Frame with arbitrary header fields, for feeding the client broken input
pub fn raw_frame(version: u8, inverse: u8, payload_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(version);
    frame.push(inverse);
    frame.extend_from_slice(&payload_type.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

async fn announce_loop(
    socket: UdpSocket,
    script: Arc<EntityScript>,
    log: Arc<Mutex<EntityLog>>,
    shutdown: CancellationToken,
) {
    let codec = Codec::default();
    let mut buf = [0u8; 1500];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        let Ok((len, from)) = received else { return };

        let request = match codec.decode(&buf[..len]).and_then(|m| Payload::parse(&m)) {
            Ok(Payload::VehicleIdentificationRequest(request)) => request,
            other => {
                debug!(?other, "Test entity ignoring datagram");
                continue;
            }
        };
        log.lock().identification_requests += 1;

        let selected = script.announcements.iter().filter(|vam| match &request {
            VehicleIdentificationRequest::Any => true,
            VehicleIdentificationRequest::Vin(vin) => &vam.vin == vin,
            VehicleIdentificationRequest::Eid(eid) => &vam.eid == eid,
        });
        let repeat = script
            .announcements
            .first()
            .filter(|_| script.duplicate_announcement);

        for vam in selected.chain(repeat) {
            let _ = socket.send_to(&codec.encode_payload(vam), from).await;
        }
    }
}
