//! diag-client - DoIP (ISO 13400-2) diagnostic client
//!
//! Lets an external tester discover DoIP entities on the network, open
//! routing-activated TCP sessions to them and exchange opaque diagnostic
//! payloads through a blocking API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   DiagnosticManager                         │
//! │                                                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ Conversation │  │ Conversation │  │UdpDiscoveryChannel│  │
//! │  │ (tester 1)   │  │ (tester 2)   │  │ (VIR / VAM)      │   │
//! │  └──────┬───────┘  └──────┬───────┘  └────────┬─────────┘   │
//! │         │                 │                   │             │
//! │  ┌──────┴───────┐  ┌──────┴───────┐           │             │
//! │  │TcpConnection │  │TcpConnection │           │             │
//! │  └──────┬───────┘  └──────┬───────┘           │             │
//! │         └────────┬────────┴───────────────────┘             │
//! │          ┌───────┴──────────┐                               │
//! │          │ ExecutionContext │  thread "diag-client-main"    │
//! │          │ (tokio runtime)  │                               │
//! │          └──────────────────┘                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Application threads call into [`Conversation`] and [`DiagnosticManager`];
//! each call is handed to the execution context and the caller blocks until
//! its result arrives. Every network wait is bounded by a [`SyncTimer`].

pub mod codec;
pub mod config;
pub mod conversation;
pub mod error;
pub mod manager;
pub mod runtime;
pub mod testing;
pub mod timer;
pub mod transport;

pub use codec::{Codec, LogicalAddress, PayloadType, RoutingActivationCode, WireMessage};
pub use config::{ConversationConfig, DiagClientConfig, DiscoveryConfig, ServerConfig};
pub use conversation::{ConnectResult, Conversation, DiagResponse, DisconnectResult};
pub use error::{
    ActivationError, CodecError, ConfigError, ConnectError, DiagError, DiscoveryError,
    ManagerError, ReceiveError, SendError, SubmitError,
};
pub use manager::DiagnosticManager;
pub use timer::{SyncTimer, TimerOutcome};
pub use transport::{ConnectionState, VehicleIdentificationFilter, VehicleInfo};
