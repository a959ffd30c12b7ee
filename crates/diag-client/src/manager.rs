//! Diagnostic client manager
//!
//! Owns the execution context, the configured conversations and the
//! discovery channel. Lifecycle is one-way: `Created → Running → ShutDown`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::Codec;
use crate::config::DiagClientConfig;
use crate::conversation::Conversation;
use crate::error::{ConfigError, DiscoveryError, ManagerError};
use crate::runtime::ExecutionContext;
use crate::timer::SyncTimer;
use crate::transport::{UdpDiscoveryChannel, VehicleIdentificationFilter, VehicleInfo};

struct Running {
    context: Arc<ExecutionContext>,
    conversations: HashMap<String, Arc<Conversation>>,
    discovery: Arc<UdpDiscoveryChannel>,
}

enum Lifecycle {
    Created,
    Running(Running),
    ShutDown,
}

/// Entry point of the diagnostic client
///
/// # Example
///
/// ```no_run
/// use diag_client::{ConnectResult, DiagClientConfig, DiagnosticManager};
///
/// let config = DiagClientConfig::load("diag-client.json")?;
/// let manager = DiagnosticManager::new(config)?;
/// manager.initialize()?;
///
/// let tester = manager.conversation("DiagTesterOne")?;
/// if tester.connect_to_diag_server(0xFA25, None) == ConnectResult::Success {
///     let response = tester.send_diagnostic_request(&[0x10, 0x01])?;
///     println!("{:02X?}", response.payload);
///     tester.disconnect_from_diag_server();
/// }
/// manager.deinitialize();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct DiagnosticManager {
    config: DiagClientConfig,
    shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    server_list: Mutex<Vec<VehicleInfo>>,
}

impl DiagnosticManager {
    pub fn new(config: DiagClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
            server_list: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &DiagClientConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Start the execution context and create every configured conversation
    pub fn initialize(&self) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => return Err(ManagerError::AlreadyInitialized),
            Lifecycle::ShutDown => return Err(ManagerError::ShutDown),
        }

        let context = Arc::new(ExecutionContext::start(self.shutdown.clone())?);

        let conversations = self
            .config
            .conversations
            .iter()
            .map(|conv| {
                let conversation = Arc::new(Conversation::new(
                    conv.clone(),
                    self.config.protocol_version,
                    self.config.servers.clone(),
                    context.clone(),
                ));
                conversation.startup();
                (conv.name.clone(), conversation)
            })
            .collect::<HashMap<_, _>>();

        let discovery = Arc::new(UdpDiscoveryChannel::new(
            self.config.discovery.clone(),
            Codec::new(self.config.protocol_version),
            Arc::new(SyncTimer::new(self.shutdown.clone())),
        ));

        info!(
            conversations = conversations.len(),
            "Diagnostic client initialized"
        );
        *lifecycle = Lifecycle::Running(Running {
            context,
            conversations,
            discovery,
        });
        Ok(())
    }

    /// Stop all conversations and join the execution context; idempotent
    pub fn deinitialize(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::ShutDown);
        let Lifecycle::Running(running) = previous else {
            return;
        };

        for conversation in running.conversations.values() {
            conversation.shutdown();
        }
        running.context.stop();
        info!("Diagnostic client shut down");
    }

    /// Look up a conversation by its configured name
    pub fn conversation(&self, name: &str) -> Result<Arc<Conversation>, ManagerError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => running
                .conversations
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::ConversationNotFound(name.to_string()).into()),
            Lifecycle::Created => Err(ManagerError::NotInitialized),
            Lifecycle::ShutDown => Err(ManagerError::ShutDown),
        }
    }

    /// Names of all configured conversations
    pub fn conversation_names(&self) -> Vec<String> {
        self.config
            .conversations
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Broadcast an identification request using the configured window
    pub fn send_vehicle_identification_request(
        &self,
        filter: VehicleIdentificationFilter,
    ) -> Result<Vec<VehicleInfo>, DiscoveryError> {
        self.discover(filter, None)
    }

    /// Broadcast an identification request, optionally overriding the window
    pub fn discover(
        &self,
        filter: VehicleIdentificationFilter,
        timeout: Option<Duration>,
    ) -> Result<Vec<VehicleInfo>, DiscoveryError> {
        let (context, discovery) = match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => (running.context.clone(), running.discovery.clone()),
            _ => return Err(DiscoveryError::Cancelled),
        };

        let vehicles = context
            .run(async move { discovery.discover(&filter, timeout).await })
            .map_err(|e| {
                warn!(%e, "Discovery not executed");
                DiscoveryError::Cancelled
            })??;

        *self.server_list.lock() = vehicles.clone();
        Ok(vehicles)
    }

    /// Result of the last successful discovery
    pub fn diagnostic_server_list(&self) -> Vec<VehicleInfo> {
        self.server_list.lock().clone()
    }
}

impl Drop for DiagnosticManager {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
