//! Diagnostic client errors
//!
//! One error type per layer. Transport failures always surface to the calling
//! conversation operation; nothing below the application retries.

use thiserror::Error;

use crate::codec::{PayloadType, RoutingActivationCode};

/// Outcome of decoding a malformed or partial DoIP frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Inverse protocol version is not the complement of the version
    #[error("Invalid protocol version 0x{version:02X} (inverse 0x{inverse:02X})")]
    InvalidVersion { version: u8, inverse: u8 },

    /// More bytes are needed before the frame can be decoded
    #[error("Incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    /// Declared payload length exceeds what the receiver accepts
    #[error("Payload length {length} exceeds limit {limit}")]
    MalformedLength { length: u32, limit: u32 },

    /// Payload content does not match the layout of its type
    #[error("Malformed {payload_type:?} payload: {reason}")]
    MalformedPayload {
        payload_type: PayloadType,
        reason: String,
    },

    #[error("Unknown payload type 0x{0:04X}")]
    UnknownType(u16),

    /// Outbound payload does not fit the configured limit
    #[error("Payload of {length} bytes exceeds limit {limit}")]
    PayloadTooLarge { length: usize, limit: u32 },
}

/// TCP connection establishment failure
#[derive(Debug, Error, Clone)]
pub enum ConnectError {
    #[error("Connection failed: {0}")]
    Io(String),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Connection cancelled")]
    Cancelled,
}

/// Routing activation failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("Routing activation rejected: {0}")]
    ActivationRejected(RoutingActivationCode),

    #[error("Routing activation timed out")]
    ActivationTimeout,

    #[error("Connection lost during routing activation")]
    ConnectionLost,

    #[error("Routing activation cancelled")]
    Cancelled,
}

/// Failure to transmit a diagnostic message
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Routing is not activated")]
    NotActivated,

    #[error("Payload of {length} bytes exceeds limit {limit}")]
    PayloadTooLarge { length: usize, limit: u32 },

    #[error("Connection lost")]
    ConnectionLost,
}

/// Failure while waiting for an inbound message
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Wait cancelled")]
    Cancelled,
}

/// Vehicle discovery failure
///
/// Zero responders is not an error; discovery returns an empty list.
#[derive(Debug, Error, Clone)]
pub enum DiscoveryError {
    #[error("Failed to send vehicle identification request: {0}")]
    Send(String),

    #[error("Invalid preselection filter: {0}")]
    InvalidFilter(String),

    #[error("Discovery cancelled")]
    Cancelled,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
}

/// Failure of a diagnostic request on a conversation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiagError {
    #[error("Conversation is not connected")]
    NotConnected,

    /// Another request is already in flight on this conversation
    #[error("Conversation busy")]
    Busy,

    #[error("Request payload is empty")]
    EmptyPayload,

    #[error("Request of {length} bytes exceeds payload limit {limit}")]
    PayloadTooLarge { length: usize, limit: u32 },

    #[error("Diagnostic message negatively acknowledged (0x{0:02X})")]
    NegativeAck(u8),

    #[error("Timeout waiting for diagnostic message acknowledgement")]
    AckTimeout,

    #[error("Timeout waiting for diagnostic response")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Request cancelled")]
    Cancelled,
}

/// Manager lifecycle failure
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Manager is not initialized")]
    NotInitialized,

    #[error("Manager is already initialized")]
    AlreadyInitialized,

    /// The execution context is never restarted once stopped
    #[error("Manager has been shut down")]
    ShutDown,

    #[error("Failed to start execution context: {0}")]
    Runtime(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure to hand work to the execution context
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Execution context is shut down")]
    ShutDown,

    #[error("Blocking call issued from inside an async runtime")]
    InsideRuntime,
}

impl From<SendError> for DiagError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::NotActivated => Self::NotConnected,
            SendError::PayloadTooLarge { length, limit } => Self::PayloadTooLarge { length, limit },
            SendError::ConnectionLost => Self::ConnectionLost,
        }
    }
}

impl From<ReceiveError> for DiagError {
    fn from(err: ReceiveError) -> Self {
        match err {
            ReceiveError::Timeout => Self::Timeout,
            ReceiveError::ConnectionLost => Self::ConnectionLost,
            ReceiveError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<SubmitError> for DiagError {
    fn from(_: SubmitError) -> Self {
        Self::Cancelled
    }
}

impl From<ReceiveError> for ActivationError {
    fn from(err: ReceiveError) -> Self {
        match err {
            ReceiveError::Timeout => Self::ActivationTimeout,
            ReceiveError::ConnectionLost => Self::ConnectionLost,
            ReceiveError::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_timeout_maps_per_phase() {
        assert_eq!(DiagError::from(ReceiveError::Timeout), DiagError::Timeout);
        assert_eq!(
            ActivationError::from(ReceiveError::Timeout),
            ActivationError::ActivationTimeout
        );
    }

    #[test]
    fn test_rejection_message_carries_code() {
        let err = ActivationError::ActivationRejected(RoutingActivationCode::UnknownSourceAddress);
        assert_eq!(
            err.to_string(),
            "Routing activation rejected: Unknown source address (0x00)"
        );
    }
}
