//! Typed DoIP payloads

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::{LogicalAddress, PayloadType, WireMessage};
use crate::error::CodecError;

/// Generic DoIP header negative acknowledgement codes
pub mod generic_nack_code {
    pub const INCORRECT_PATTERN_FORMAT: u8 = 0x00;
    pub const UNKNOWN_PAYLOAD_TYPE: u8 = 0x01;
    pub const MESSAGE_TOO_LARGE: u8 = 0x02;
    pub const OUT_OF_MEMORY: u8 = 0x03;
    pub const INVALID_PAYLOAD_LENGTH: u8 = 0x04;
}

/// Diagnostic message negative acknowledgement codes
pub mod diagnostic_nack_code {
    pub const INVALID_SOURCE_ADDRESS: u8 = 0x02;
    pub const UNKNOWN_TARGET_ADDRESS: u8 = 0x03;
    pub const DIAGNOSTIC_MESSAGE_TOO_LARGE: u8 = 0x04;
    pub const OUT_OF_MEMORY: u8 = 0x05;
    pub const TARGET_UNREACHABLE: u8 = 0x06;
    pub const UNKNOWN_NETWORK: u8 = 0x07;
    pub const TRANSPORT_PROTOCOL_ERROR: u8 = 0x08;
}

/// A payload that can be framed by [`super::Codec::encode_payload`]
pub trait DoipPayload {
    fn payload_type(&self) -> PayloadType;

    fn encode_into(&self, buf: &mut BytesMut);
}

fn malformed(payload_type: PayloadType, reason: impl Into<String>) -> CodecError {
    CodecError::MalformedPayload {
        payload_type,
        reason: reason.into(),
    }
}

fn require_len(
    payload_type: PayloadType,
    bytes: &[u8],
    min: usize,
) -> Result<(), CodecError> {
    if bytes.len() < min {
        return Err(malformed(
            payload_type,
            format!("expected at least {} bytes, got {}", min, bytes.len()),
        ));
    }
    Ok(())
}

fn read_address(bytes: &[u8], offset: usize) -> LogicalAddress {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

// =============================================================================
// Generic NACK
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericNack {
    pub code: u8,
}

impl GenericNack {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        require_len(PayloadType::GenericNack, bytes, 1)?;
        Ok(Self { code: bytes[0] })
    }
}

impl DoipPayload for GenericNack {
    fn payload_type(&self) -> PayloadType {
        PayloadType::GenericNack
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code);
    }
}

// =============================================================================
// Vehicle identification
// =============================================================================

/// Vehicle identification request, optionally filtered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VehicleIdentificationRequest {
    /// Every entity answers
    Any,
    /// Only entities with this EID answer
    Eid([u8; 6]),
    /// Only entities of the vehicle with this VIN answer
    Vin([u8; 17]),
}

impl VehicleIdentificationRequest {
    pub fn parse(payload_type: PayloadType, bytes: &[u8]) -> Result<Self, CodecError> {
        match payload_type {
            PayloadType::VehicleIdentificationRequest => Ok(Self::Any),
            PayloadType::VehicleIdentificationRequestEid if bytes.len() == 6 => {
                Ok(Self::Eid(read_array(bytes, 0)))
            }
            PayloadType::VehicleIdentificationRequestVin if bytes.len() == 17 => {
                Ok(Self::Vin(read_array(bytes, 0)))
            }
            other => Err(malformed(other, format!("unexpected length {}", bytes.len()))),
        }
    }
}

impl DoipPayload for VehicleIdentificationRequest {
    fn payload_type(&self) -> PayloadType {
        match self {
            Self::Any => PayloadType::VehicleIdentificationRequest,
            Self::Eid(_) => PayloadType::VehicleIdentificationRequestEid,
            Self::Vin(_) => PayloadType::VehicleIdentificationRequestVin,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Any => {}
            Self::Eid(eid) => buf.put_slice(eid),
            Self::Vin(vin) => buf.put_slice(vin),
        }
    }
}

/// Vehicle identification response (vehicle announcement message)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleAnnouncement {
    pub logical_address: LogicalAddress,
    pub vin: [u8; 17],
    pub eid: [u8; 6],
    pub gid: [u8; 6],
    pub further_action: u8,
    pub sync_status: Option<u8>,
}

impl VehicleAnnouncement {
    const LEN: usize = 32;

    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != Self::LEN && bytes.len() != Self::LEN + 1 {
            return Err(malformed(
                PayloadType::VehicleAnnouncement,
                format!("expected 32 or 33 bytes, got {}", bytes.len()),
            ));
        }
        Ok(Self {
            logical_address: read_address(bytes, 0),
            vin: read_array(bytes, 2),
            eid: read_array(bytes, 19),
            gid: read_array(bytes, 25),
            further_action: bytes[31],
            sync_status: bytes.get(32).copied(),
        })
    }
}

impl DoipPayload for VehicleAnnouncement {
    fn payload_type(&self) -> PayloadType {
        PayloadType::VehicleAnnouncement
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.logical_address);
        buf.put_slice(&self.vin);
        buf.put_slice(&self.eid);
        buf.put_slice(&self.gid);
        buf.put_u8(self.further_action);
        if let Some(sync) = self.sync_status {
            buf.put_u8(sync);
        }
    }
}

// =============================================================================
// Routing activation
// =============================================================================

/// Requested routing activation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingActivationType {
    Default,
    WwhObd,
    CentralSecurity,
    Other(u8),
}

impl From<u8> for RoutingActivationType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Default,
            0x01 => Self::WwhObd,
            0xE0 => Self::CentralSecurity,
            other => Self::Other(other),
        }
    }
}

impl From<RoutingActivationType> for u8 {
    fn from(value: RoutingActivationType) -> Self {
        match value {
            RoutingActivationType::Default => 0x00,
            RoutingActivationType::WwhObd => 0x01,
            RoutingActivationType::CentralSecurity => 0xE0,
            RoutingActivationType::Other(raw) => raw,
        }
    }
}

/// Routing activation response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingActivationCode {
    UnknownSourceAddress,
    AllSocketsRegistered,
    DifferentSourceAddress,
    SourceAddressAlreadyActive,
    MissingAuthentication,
    RejectedConfirmation,
    UnsupportedActivationType,
    TlsRequired,
    RoutingSuccessful,
    ConfirmationRequired,
    Other(u8),
}

impl From<u8> for RoutingActivationCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::UnknownSourceAddress,
            0x01 => Self::AllSocketsRegistered,
            0x02 => Self::DifferentSourceAddress,
            0x03 => Self::SourceAddressAlreadyActive,
            0x04 => Self::MissingAuthentication,
            0x05 => Self::RejectedConfirmation,
            0x06 => Self::UnsupportedActivationType,
            0x07 => Self::TlsRequired,
            0x10 => Self::RoutingSuccessful,
            0x11 => Self::ConfirmationRequired,
            other => Self::Other(other),
        }
    }
}

impl From<RoutingActivationCode> for u8 {
    fn from(value: RoutingActivationCode) -> Self {
        match value {
            RoutingActivationCode::UnknownSourceAddress => 0x00,
            RoutingActivationCode::AllSocketsRegistered => 0x01,
            RoutingActivationCode::DifferentSourceAddress => 0x02,
            RoutingActivationCode::SourceAddressAlreadyActive => 0x03,
            RoutingActivationCode::MissingAuthentication => 0x04,
            RoutingActivationCode::RejectedConfirmation => 0x05,
            RoutingActivationCode::UnsupportedActivationType => 0x06,
            RoutingActivationCode::TlsRequired => 0x07,
            RoutingActivationCode::RoutingSuccessful => 0x10,
            RoutingActivationCode::ConfirmationRequired => 0x11,
            RoutingActivationCode::Other(raw) => raw,
        }
    }
}

impl fmt::Display for RoutingActivationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Self::UnknownSourceAddress => "Unknown source address",
            Self::AllSocketsRegistered => "All TCP sockets registered and active",
            Self::DifferentSourceAddress => "Source address differs from active one",
            Self::SourceAddressAlreadyActive => "Source address already active",
            Self::MissingAuthentication => "Missing authentication",
            Self::RejectedConfirmation => "Rejected confirmation",
            Self::UnsupportedActivationType => "Unsupported routing activation type",
            Self::TlsRequired => "TLS connection required",
            Self::RoutingSuccessful => "Routing successfully activated",
            Self::ConfirmationRequired => "Routing activated, confirmation required",
            Self::Other(_) => "Reserved/manufacturer specific",
        };
        write!(f, "{} (0x{:02X})", desc, u8::from(*self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingActivationRequest {
    pub source_address: LogicalAddress,
    pub activation_type: RoutingActivationType,
    pub oem_specific: Option<[u8; 4]>,
}

impl RoutingActivationRequest {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let oem_specific = match bytes.len() {
            7 => None,
            11 => Some(read_array(bytes, 7)),
            len => {
                return Err(malformed(
                    PayloadType::RoutingActivationRequest,
                    format!("expected 7 or 11 bytes, got {}", len),
                ))
            }
        };
        Ok(Self {
            source_address: read_address(bytes, 0),
            activation_type: bytes[2].into(),
            oem_specific,
        })
    }
}

impl DoipPayload for RoutingActivationRequest {
    fn payload_type(&self) -> PayloadType {
        PayloadType::RoutingActivationRequest
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.source_address);
        buf.put_u8(self.activation_type.into());
        buf.put_u32(0);
        if let Some(oem) = self.oem_specific {
            buf.put_slice(&oem);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingActivationResponse {
    /// Logical address of the tester the response is meant for
    pub client_address: LogicalAddress,
    /// Logical address of the responding entity
    pub server_address: LogicalAddress,
    pub code: RoutingActivationCode,
    pub oem_specific: Option<[u8; 4]>,
}

impl RoutingActivationResponse {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        // The reserved block is mandatory in ISO 13400 but some entities omit it.
        require_len(PayloadType::RoutingActivationResponse, bytes, 5)?;
        let oem_specific = (bytes.len() >= 13).then(|| read_array(bytes, 9));
        Ok(Self {
            client_address: read_address(bytes, 0),
            server_address: read_address(bytes, 2),
            code: bytes[4].into(),
            oem_specific,
        })
    }
}

impl DoipPayload for RoutingActivationResponse {
    fn payload_type(&self) -> PayloadType {
        PayloadType::RoutingActivationResponse
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.client_address);
        buf.put_u16(self.server_address);
        buf.put_u8(self.code.into());
        buf.put_u32(0);
        if let Some(oem) = self.oem_specific {
            buf.put_slice(&oem);
        }
    }
}

// =============================================================================
// Alive check
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliveCheckResponse {
    pub source_address: LogicalAddress,
}

impl AliveCheckResponse {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        require_len(PayloadType::AliveCheckResponse, bytes, 2)?;
        Ok(Self {
            source_address: read_address(bytes, 0),
        })
    }
}

impl DoipPayload for AliveCheckResponse {
    fn payload_type(&self) -> PayloadType {
        PayloadType::AliveCheckResponse
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.source_address);
    }
}

// =============================================================================
// Diagnostic messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    pub source_address: LogicalAddress,
    pub target_address: LogicalAddress,
    /// Opaque diagnostic service data
    pub user_data: Bytes,
}

impl DiagnosticMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        require_len(PayloadType::DiagnosticMessage, bytes, 4)?;
        Ok(Self {
            source_address: read_address(bytes, 0),
            target_address: read_address(bytes, 2),
            user_data: Bytes::copy_from_slice(&bytes[4..]),
        })
    }
}

impl DoipPayload for DiagnosticMessage {
    fn payload_type(&self) -> PayloadType {
        PayloadType::DiagnosticMessage
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.source_address);
        buf.put_u16(self.target_address);
        buf.put_slice(&self.user_data);
    }
}

/// Positive acknowledgement of a diagnostic message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessageAck {
    pub source_address: LogicalAddress,
    pub target_address: LogicalAddress,
    pub ack_code: u8,
    pub previous_message: Bytes,
}

/// Negative acknowledgement of a diagnostic message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessageNack {
    pub source_address: LogicalAddress,
    pub target_address: LogicalAddress,
    pub nack_code: u8,
    pub previous_message: Bytes,
}

macro_rules! diagnostic_ack_payload {
    ($ty:ident, $payload_type:expr, $code:ident) => {
        impl $ty {
            pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
                require_len($payload_type, bytes, 5)?;
                Ok(Self {
                    source_address: read_address(bytes, 0),
                    target_address: read_address(bytes, 2),
                    $code: bytes[4],
                    previous_message: Bytes::copy_from_slice(&bytes[5..]),
                })
            }
        }

        impl DoipPayload for $ty {
            fn payload_type(&self) -> PayloadType {
                $payload_type
            }

            fn encode_into(&self, buf: &mut BytesMut) {
                buf.put_u16(self.source_address);
                buf.put_u16(self.target_address);
                buf.put_u8(self.$code);
                buf.put_slice(&self.previous_message);
            }
        }
    };
}

diagnostic_ack_payload!(DiagnosticMessageAck, PayloadType::DiagnosticMessageAck, ack_code);
diagnostic_ack_payload!(DiagnosticMessageNack, PayloadType::DiagnosticMessageNack, nack_code);

// =============================================================================
// Dispatch
// =============================================================================

/// Typed view of a [`WireMessage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    GenericNack(GenericNack),
    VehicleIdentificationRequest(VehicleIdentificationRequest),
    VehicleAnnouncement(VehicleAnnouncement),
    RoutingActivationRequest(RoutingActivationRequest),
    RoutingActivationResponse(RoutingActivationResponse),
    AliveCheckRequest,
    AliveCheckResponse(AliveCheckResponse),
    DiagnosticMessage(DiagnosticMessage),
    DiagnosticMessageAck(DiagnosticMessageAck),
    DiagnosticMessageNack(DiagnosticMessageNack),
    /// Assigned payload type the client never consumes (entity status, power mode)
    Unhandled(PayloadType),
}

impl Payload {
    pub fn parse(message: &WireMessage) -> Result<Self, CodecError> {
        let bytes = message.payload.as_ref();
        let payload = match message.payload_type {
            PayloadType::GenericNack => Self::GenericNack(GenericNack::parse(bytes)?),
            t @ (PayloadType::VehicleIdentificationRequest
            | PayloadType::VehicleIdentificationRequestEid
            | PayloadType::VehicleIdentificationRequestVin) => {
                Self::VehicleIdentificationRequest(VehicleIdentificationRequest::parse(t, bytes)?)
            }
            PayloadType::VehicleAnnouncement => {
                Self::VehicleAnnouncement(VehicleAnnouncement::parse(bytes)?)
            }
            PayloadType::RoutingActivationRequest => {
                Self::RoutingActivationRequest(RoutingActivationRequest::parse(bytes)?)
            }
            PayloadType::RoutingActivationResponse => {
                Self::RoutingActivationResponse(RoutingActivationResponse::parse(bytes)?)
            }
            PayloadType::AliveCheckRequest => Self::AliveCheckRequest,
            PayloadType::AliveCheckResponse => {
                Self::AliveCheckResponse(AliveCheckResponse::parse(bytes)?)
            }
            PayloadType::DiagnosticMessage => {
                Self::DiagnosticMessage(DiagnosticMessage::parse(bytes)?)
            }
            PayloadType::DiagnosticMessageAck => {
                Self::DiagnosticMessageAck(DiagnosticMessageAck::parse(bytes)?)
            }
            PayloadType::DiagnosticMessageNack => {
                Self::DiagnosticMessageNack(DiagnosticMessageNack::parse(bytes)?)
            }
            PayloadType::Unknown(raw) => return Err(CodecError::UnknownType(raw)),
            other => Self::Unhandled(other),
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use pretty_assertions::assert_eq;

    fn reparse<P: DoipPayload>(payload: &P) -> Payload {
        let codec = Codec::default();
        let msg = codec.decode(&codec.encode_payload(payload)).unwrap();
        Payload::parse(&msg).unwrap()
    }

    #[test]
    fn test_routing_activation_request_layout() {
        let req = RoutingActivationRequest {
            source_address: 0x0001,
            activation_type: RoutingActivationType::Default,
            oem_specific: None,
        };
        let mut buf = BytesMut::new();
        req.encode_into(&mut buf);
        assert_eq!(buf.as_ref(), &[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(reparse(&req), Payload::RoutingActivationRequest(req));
    }

    #[test]
    fn test_routing_activation_request_rejects_odd_length() {
        let err = RoutingActivationRequest::parse(&[0x00, 0x01, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload { .. }));
    }

    #[test]
    fn test_routing_activation_response_short_form() {
        let resp = RoutingActivationResponse::parse(&[0x00, 0x01, 0xFA, 0x25, 0x10]).unwrap();
        assert_eq!(resp.client_address, 0x0001);
        assert_eq!(resp.server_address, 0xFA25);
        assert_eq!(resp.code, RoutingActivationCode::RoutingSuccessful);
        assert_eq!(resp.oem_specific, None);
    }

    #[test]
    fn test_routing_activation_response_too_short() {
        assert!(matches!(
            RoutingActivationResponse::parse(&[0x00, 0x01, 0xFA, 0x25]),
            Err(CodecError::MalformedPayload {
                payload_type: PayloadType::RoutingActivationResponse,
                ..
            })
        ));
    }

    #[test]
    fn test_activation_code_unknown_values_preserved() {
        let code = RoutingActivationCode::from(0xA5);
        assert_eq!(code, RoutingActivationCode::Other(0xA5));
        assert_eq!(u8::from(code), 0xA5);
        assert!(code.to_string().contains("0xA5"));
    }

    #[test]
    fn test_vehicle_announcement_parse() {
        let mut bytes = vec![0xFA, 0x25];
        bytes.extend_from_slice(b"ABCDEFGH123456789");
        bytes.extend_from_slice(&[0x00, 0x02, 0x36, 0x31, 0x00, 0x1C]);
        bytes.extend_from_slice(&[0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]);
        bytes.push(0x00);

        let vam = VehicleAnnouncement::parse(&bytes).unwrap();
        assert_eq!(vam.logical_address, 0xFA25);
        assert_eq!(&vam.vin, b"ABCDEFGH123456789");
        assert_eq!(vam.eid, [0x00, 0x02, 0x36, 0x31, 0x00, 0x1C]);
        assert_eq!(vam.gid, [0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]);
        assert_eq!(vam.sync_status, None);

        assert!(VehicleAnnouncement::parse(&bytes[..20]).is_err());
    }

    #[test]
    fn test_vehicle_identification_request_variants() {
        assert_eq!(
            reparse(&VehicleIdentificationRequest::Vin(*b"WVWZZZ3CZWE123456")),
            Payload::VehicleIdentificationRequest(VehicleIdentificationRequest::Vin(
                *b"WVWZZZ3CZWE123456"
            ))
        );
        assert!(VehicleIdentificationRequest::parse(
            PayloadType::VehicleIdentificationRequestVin,
            b"SHORT"
        )
        .is_err());
    }

    #[test]
    fn test_diagnostic_message_keeps_user_data_opaque() {
        let msg = DiagnosticMessage {
            source_address: 0x0001,
            target_address: 0xFA25,
            user_data: Bytes::from_static(&[0x10, 0x01]),
        };
        assert_eq!(reparse(&msg), Payload::DiagnosticMessage(msg));
        assert!(DiagnosticMessage::parse(&[0x00, 0x01, 0xFA]).is_err());
    }

    #[test]
    fn test_diagnostic_nack_parse() {
        let nack = DiagnosticMessageNack::parse(&[0xFA, 0x25, 0x00, 0x01, 0x02, 0x10]).unwrap();
        assert_eq!(nack.source_address, 0xFA25);
        assert_eq!(nack.target_address, 0x0001);
        assert_eq!(nack.nack_code, diagnostic_nack_code::INVALID_SOURCE_ADDRESS);
        assert_eq!(nack.previous_message.as_ref(), &[0x10]);
    }

    #[test]
    fn test_unhandled_types_are_not_errors() {
        let msg = WireMessage::new(0x02, PayloadType::EntityStatusResponse, vec![0u8; 7]);
        assert_eq!(
            Payload::parse(&msg).unwrap(),
            Payload::Unhandled(PayloadType::EntityStatusResponse)
        );
    }
}
