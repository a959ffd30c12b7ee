//! Named diagnostic conversation between one tester identity and one server
//!
//! All methods block the calling thread; the I/O runs on the manager's
//! execution context. One request is in flight per conversation at a time,
//! a second caller gets [`DiagError::Busy`] instead of queueing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::LogicalAddress;
use crate::config::{ConversationConfig, ServerConfig};
use crate::error::{DiagError, ReceiveError};
use crate::runtime::ExecutionContext;
use crate::timer::SyncTimer;
use crate::transport::{Acknowledgement, ConnectionSettings, ConnectionState, TcpConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectResult {
    Success,
    Failed,
    AlreadyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectResult {
    Success,
    /// There was no connection to close
    Failed,
}

/// Diagnostic response received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagResponse {
    pub source_address: LogicalAddress,
    pub target_address: LogicalAddress,
    pub payload: Bytes,
}

/// Handles of the live connection that must be reachable without its lock
struct Link {
    closed: CancellationToken,
    state: Arc<Mutex<ConnectionState>>,
    server_address: LogicalAddress,
}

struct Inner {
    running: Mutex<bool>,
    connection: AsyncMutex<Option<TcpConnection>>,
    link: Mutex<Option<Link>>,
    timer: Arc<SyncTimer>,
}

pub struct Conversation {
    config: ConversationConfig,
    protocol_version: u8,
    servers: Vec<ServerConfig>,
    context: Arc<ExecutionContext>,
    inner: Arc<Inner>,
}

impl Conversation {
    pub fn new(
        config: ConversationConfig,
        protocol_version: u8,
        servers: Vec<ServerConfig>,
        context: Arc<ExecutionContext>,
    ) -> Self {
        let timer = Arc::new(SyncTimer::new(context.shutdown_token()));
        Self {
            config,
            protocol_version,
            servers,
            context,
            inner: Arc::new(Inner {
                running: Mutex::new(false),
                connection: AsyncMutex::new(None),
                link: Mutex::new(None),
                timer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn source_address(&self) -> LogicalAddress {
        self.config.source_address
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.lock()
    }

    /// Current connection state; never blocks on an in-flight request
    pub fn state(&self) -> ConnectionState {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| *link.state.lock())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Logical address of the connected server, if any
    pub fn server_address(&self) -> Option<LogicalAddress> {
        self.inner.link.lock().as_ref().map(|l| l.server_address)
    }

    pub fn startup(&self) {
        let mut running = self.inner.running.lock();
        if !*running {
            *running = true;
            debug!(conversation = %self.config.name, "Conversation started");
        }
    }

    /// Stop accepting requests and tear down any live connection
    pub fn shutdown(&self) {
        {
            let mut running = self.inner.running.lock();
            if !*running {
                return;
            }
            *running = false;
        }
        self.cancel_link();
        if let Ok(mut slot) = self.inner.connection.try_lock() {
            slot.take();
        }
        debug!(conversation = %self.config.name, "Conversation shut down");
    }

    /// Connect and activate routing towards `target`
    ///
    /// `host` overrides the configured server mapping. Any failure tears the
    /// partial connection down.
    pub fn connect_to_diag_server(
        &self,
        target: LogicalAddress,
        host: Option<IpAddr>,
    ) -> ConnectResult {
        if !self.is_running() {
            warn!(conversation = %self.config.name, "Connect on a stopped conversation");
            return ConnectResult::Failed;
        }
        if self.state() == ConnectionState::Activated {
            return ConnectResult::AlreadyConnected;
        }
        let Some(addr) = self.resolve(target, host) else {
            warn!(
                conversation = %self.config.name,
                target = format!("0x{:04X}", target),
                "No IP address known for server"
            );
            return ConnectResult::Failed;
        };

        let inner = self.inner.clone();
        let settings = ConnectionSettings::from_config(&self.config, self.protocol_version);
        let shutdown = self.context.shutdown_token();
        let name = self.config.name.clone();

        let result = self.context.run(async move {
            let Ok(mut slot) = inner.connection.try_lock() else {
                warn!(conversation = %name, "Connect while a request is in flight");
                return ConnectResult::Failed;
            };
            if let Some(conn) = slot.as_ref() {
                if conn.state() == ConnectionState::Activated {
                    return ConnectResult::AlreadyConnected;
                }
            }
            if let Some(mut stale) = slot.take() {
                debug!(conversation = %name, "Replacing faulted connection");
                stale.disconnect().await;
            }

            let closed = shutdown.child_token();
            let mut conn = TcpConnection::new(settings, target, inner.timer.clone(), closed.clone());
            *inner.link.lock() = Some(Link {
                closed,
                state: conn.state_handle(),
                server_address: target,
            });

            let outcome = match conn.connect(addr).await {
                Ok(()) => conn.activate_routing().await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(()) => {
                    info!(conversation = %name, %addr, "Connected to diagnostic server");
                    *slot = Some(conn);
                    ConnectResult::Success
                }
                Err(e) => {
                    warn!(conversation = %name, %addr, error = %e, "Connect failed");
                    conn.disconnect().await;
                    inner.link.lock().take();
                    ConnectResult::Failed
                }
            }
        });

        result.unwrap_or_else(|e| {
            warn!(conversation = %self.config.name, %e, "Connect not executed");
            self.inner.link.lock().take();
            ConnectResult::Failed
        })
    }

    /// Close the connection; `Failed` only when none exists
    pub fn disconnect_from_diag_server(&self) -> DisconnectResult {
        if !self.cancel_link() {
            return DisconnectResult::Failed;
        }

        let inner = self.inner.clone();
        let closed = self.context.run(async move {
            let mut slot = inner.connection.lock().await;
            if let Some(mut conn) = slot.take() {
                conn.disconnect().await;
            }
        });
        if let Err(e) = closed {
            debug!(conversation = %self.config.name, %e, "Disconnect not executed");
        }
        info!(conversation = %self.config.name, "Disconnected from diagnostic server");
        DisconnectResult::Success
    }

    /// Send one diagnostic request and wait for the server's response
    pub fn send_diagnostic_request(&self, payload: &[u8]) -> Result<DiagResponse, DiagError> {
        if payload.is_empty() {
            return Err(DiagError::EmptyPayload);
        }
        if !self.is_running() {
            return Err(DiagError::NotConnected);
        }

        let inner = self.inner.clone();
        let request = Bytes::copy_from_slice(payload);
        let ack_timeout = self.config.ack_timeout();
        let response_timeout = self.config.response_timeout();
        let name = self.config.name.clone();

        self.context.run(exchange(
            inner,
            request,
            ack_timeout,
            response_timeout,
            name,
        ))?
    }

    fn resolve(&self, target: LogicalAddress, host: Option<IpAddr>) -> Option<SocketAddr> {
        let mapping = self.servers.iter().find(|s| s.logical_address == target);
        match (host, mapping) {
            (Some(ip), Some(server)) => Some(SocketAddr::new(ip, server.port)),
            (Some(ip), None) => Some(SocketAddr::new(ip, self.config.tcp_port)),
            (None, Some(server)) => Some(SocketAddr::new(server.host, server.port)),
            (None, None) => None,
        }
    }

    /// Cancel waits on the current connection; false when there is none
    fn cancel_link(&self) -> bool {
        let Some(link) = self.inner.link.lock().take() else {
            return false;
        };
        link.closed.cancel();
        self.inner.timer.stop();
        true
    }
}

/// Request, acknowledgement and response on the activated connection
///
/// A connection left behind by a shutdown that raced this request is closed
/// here, since shutdown cannot take it while the request holds the lock.
async fn exchange(
    inner: Arc<Inner>,
    request: Bytes,
    ack_timeout: Duration,
    response_timeout: Duration,
    name: String,
) -> Result<DiagResponse, DiagError> {
    let mut slot = inner.connection.try_lock().map_err(|_| DiagError::Busy)?;
    let result = match slot
        .as_mut()
        .filter(|c| c.state() == ConnectionState::Activated)
    {
        Some(conn) => transact(conn, &request, ack_timeout, response_timeout, &name).await,
        None => Err(DiagError::NotConnected),
    };

    let running = *inner.running.lock();
    if !running {
        if let Some(mut conn) = slot.take() {
            debug!(conversation = %name, "Releasing connection after shutdown");
            conn.disconnect().await;
        }
    }
    result
}

async fn transact(
    conn: &mut TcpConnection,
    request: &[u8],
    ack_timeout: Duration,
    response_timeout: Duration,
    name: &str,
) -> Result<DiagResponse, DiagError> {
    conn.discard_pending();
    conn.send_diagnostic_message(request).await?;

    match conn.wait_for_acknowledgement(ack_timeout).await {
        Ok(Acknowledgement::Positive) => {}
        Ok(Acknowledgement::Negative(code)) => {
            warn!(
                conversation = %name,
                code = format!("0x{:02X}", code),
                "Diagnostic message rejected"
            );
            return Err(DiagError::NegativeAck(code));
        }
        Err(ReceiveError::Timeout) => return Err(DiagError::AckTimeout),
        Err(e) => return Err(e.into()),
    }

    let payload = conn.receive_diagnostic_message(response_timeout).await?;
    debug!(conversation = %name, len = payload.len(), "Diagnostic response received");
    Ok(DiagResponse {
        source_address: conn.server_address(),
        target_address: conn.client_address(),
        payload,
    })
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("name", &self.config.name)
            .field("source_address", &self.config.source_address)
            .field("state", &self.state())
            .finish()
    }
}
