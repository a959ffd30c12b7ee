//! DoIP wire codec
//!
//! Stateless framing of ISO 13400-2 messages. Every message starts with the
//! generic DoIP header:
//!
//! ```text
//! +---------+-----------------+--------------+----------------+---------
//! | version | inverse version | payload type | payload length | payload
//! |   1 B   |       1 B       |   2 B (BE)   |    4 B (BE)    |   N B
//! +---------+-----------------+--------------+----------------+---------
//! ```
//!
//! [`Codec::decode`] never panics on arbitrary input; it reports a typed
//! [`CodecError`] instead. Typed payloads live in [`payload`].

pub mod payload;

use bytes::{BufMut, Bytes, BytesMut};

pub use payload::{
    diagnostic_nack_code, generic_nack_code, AliveCheckResponse, DiagnosticMessage,
    DiagnosticMessageAck, DiagnosticMessageNack, DoipPayload, GenericNack, Payload,
    RoutingActivationCode, RoutingActivationRequest, RoutingActivationResponse,
    RoutingActivationType, VehicleAnnouncement, VehicleIdentificationRequest,
};

pub use crate::error::CodecError;

/// Size of the generic DoIP header
pub const HEADER_LEN: usize = 8;

/// ISO 13400-2:2012
pub const DEFAULT_PROTOCOL_VERSION: u8 = 0x02;

/// Largest payload accepted unless configured otherwise
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 0xFFFF;

/// 16-bit logical address of a tester or DoIP entity
pub type LogicalAddress = u16;

/// DoIP payload types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    GenericNack,
    VehicleIdentificationRequest,
    VehicleIdentificationRequestEid,
    VehicleIdentificationRequestVin,
    /// Vehicle identification response / vehicle announcement
    VehicleAnnouncement,
    RoutingActivationRequest,
    RoutingActivationResponse,
    AliveCheckRequest,
    AliveCheckResponse,
    EntityStatusRequest,
    EntityStatusResponse,
    PowerModeRequest,
    PowerModeResponse,
    DiagnosticMessage,
    DiagnosticMessageAck,
    DiagnosticMessageNack,
    /// Structurally valid frame with an unassigned payload type
    Unknown(u16),
}

impl PayloadType {
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<u16> for PayloadType {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => Self::GenericNack,
            0x0001 => Self::VehicleIdentificationRequest,
            0x0002 => Self::VehicleIdentificationRequestEid,
            0x0003 => Self::VehicleIdentificationRequestVin,
            0x0004 => Self::VehicleAnnouncement,
            0x0005 => Self::RoutingActivationRequest,
            0x0006 => Self::RoutingActivationResponse,
            0x0007 => Self::AliveCheckRequest,
            0x0008 => Self::AliveCheckResponse,
            0x4001 => Self::EntityStatusRequest,
            0x4002 => Self::EntityStatusResponse,
            0x4003 => Self::PowerModeRequest,
            0x4004 => Self::PowerModeResponse,
            0x8001 => Self::DiagnosticMessage,
            0x8002 => Self::DiagnosticMessageAck,
            0x8003 => Self::DiagnosticMessageNack,
            other => Self::Unknown(other),
        }
    }
}

impl From<PayloadType> for u16 {
    fn from(value: PayloadType) -> Self {
        match value {
            PayloadType::GenericNack => 0x0000,
            PayloadType::VehicleIdentificationRequest => 0x0001,
            PayloadType::VehicleIdentificationRequestEid => 0x0002,
            PayloadType::VehicleIdentificationRequestVin => 0x0003,
            PayloadType::VehicleAnnouncement => 0x0004,
            PayloadType::RoutingActivationRequest => 0x0005,
            PayloadType::RoutingActivationResponse => 0x0006,
            PayloadType::AliveCheckRequest => 0x0007,
            PayloadType::AliveCheckResponse => 0x0008,
            PayloadType::EntityStatusRequest => 0x4001,
            PayloadType::EntityStatusResponse => 0x4002,
            PayloadType::PowerModeRequest => 0x4003,
            PayloadType::PowerModeResponse => 0x4004,
            PayloadType::DiagnosticMessage => 0x8001,
            PayloadType::DiagnosticMessageAck => 0x8002,
            PayloadType::DiagnosticMessageNack => 0x8003,
            PayloadType::Unknown(raw) => raw,
        }
    }
}

/// One decoded DoIP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub protocol_version: u8,
    pub inverse_protocol_version: u8,
    pub payload_type: PayloadType,
    pub payload: Bytes,
}

impl WireMessage {
    pub fn new(protocol_version: u8, payload_type: PayloadType, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol_version,
            inverse_protocol_version: !protocol_version,
            payload_type,
            payload: payload.into(),
        }
    }

    /// Declared payload length
    ///
    /// Saturates at `u32::MAX`; [`Codec::try_encode_payload`] refuses such
    /// payloads before they are framed.
    pub fn payload_length(&self) -> u32 {
        u32::try_from(self.payload.len()).unwrap_or(u32::MAX)
    }

    /// Header plus payload
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize header and payload into one buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.inverse_protocol_version);
        buf.put_u16(self.payload_type.into());
        buf.put_u32(self.payload_length());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Header fields validated before the payload is looked at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol_version: u8,
    pub payload_type: PayloadType,
    pub payload_length: u32,
}

/// Encoder/decoder bound to a protocol version and a payload size limit
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    protocol_version: u8,
    max_payload_len: u32,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_PROTOCOL_VERSION)
    }
}

impl Codec {
    pub fn new(protocol_version: u8) -> Self {
        Self {
            protocol_version,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }

    pub fn with_max_payload_len(mut self, max_payload_len: u32) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn max_payload_len(&self) -> u32 {
        self.max_payload_len
    }

    /// Prepend the generic header to `payload`
    pub fn encode(&self, payload_type: PayloadType, payload: &[u8]) -> Bytes {
        WireMessage::new(
            self.protocol_version,
            payload_type,
            Bytes::copy_from_slice(payload),
        )
        .to_bytes()
    }

    /// Encode a typed payload of bounded size (control messages)
    pub fn encode_payload<P: DoipPayload>(&self, payload: &P) -> Bytes {
        let mut body = BytesMut::new();
        payload.encode_into(&mut body);
        WireMessage::new(self.protocol_version, payload.payload_type(), body.freeze()).to_bytes()
    }

    /// Encode a typed payload, refusing bodies above the payload limit
    pub fn try_encode_payload<P: DoipPayload>(&self, payload: &P) -> Result<Bytes, CodecError> {
        let mut body = BytesMut::new();
        payload.encode_into(&mut body);
        let within_limit = u32::try_from(body.len()).is_ok_and(|len| len <= self.max_payload_len);
        if !within_limit {
            return Err(CodecError::PayloadTooLarge {
                length: body.len(),
                limit: self.max_payload_len,
            });
        }
        Ok(WireMessage::new(self.protocol_version, payload.payload_type(), body.freeze()).to_bytes())
    }

    /// Validate the generic header at the start of `buf`
    pub fn decode_header(&self, buf: &[u8]) -> Result<Header, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Incomplete {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }

        let version = buf[0];
        let inverse = buf[1];
        if inverse != !version {
            return Err(CodecError::InvalidVersion { version, inverse });
        }

        let payload_type = PayloadType::from(u16::from_be_bytes([buf[2], buf[3]]));
        let payload_length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if payload_length > self.max_payload_len {
            return Err(CodecError::MalformedLength {
                length: payload_length,
                limit: self.max_payload_len,
            });
        }

        Ok(Header {
            protocol_version: version,
            payload_type,
            payload_length,
        })
    }

    /// Decode one frame from the start of `buf`
    ///
    /// Trailing bytes beyond the frame are ignored; use
    /// [`WireMessage::frame_len`] to advance.
    pub fn decode(&self, buf: &[u8]) -> Result<WireMessage, CodecError> {
        let header = self.decode_header(buf)?;
        let frame_len = HEADER_LEN + header.payload_length as usize;
        if buf.len() < frame_len {
            return Err(CodecError::Incomplete {
                needed: frame_len,
                available: buf.len(),
            });
        }

        Ok(WireMessage::new(
            header.protocol_version,
            header.payload_type,
            Bytes::copy_from_slice(&buf[HEADER_LEN..frame_len]),
        ))
    }

    /// Split the next complete frame off a stream buffer
    ///
    /// Returns `Ok(None)` while more bytes are needed.
    pub fn decode_frame(&self, buf: &mut BytesMut) -> Result<Option<WireMessage>, CodecError> {
        let header = match self.decode_header(buf) {
            Ok(header) => header,
            Err(CodecError::Incomplete { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let frame_len = HEADER_LEN + header.payload_length as usize;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len);
        let payload = frame.split_off(HEADER_LEN).freeze();
        Ok(Some(WireMessage::new(
            header.protocol_version,
            header.payload_type,
            payload,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_header_layout() {
        let codec = Codec::default();
        let bytes = codec.encode(PayloadType::DiagnosticMessage, &[0x0E, 0x80, 0x10, 0x10, 0x22]);
        assert_eq!(
            bytes.as_ref(),
            &[0x02, 0xFD, 0x80, 0x01, 0x00, 0x00, 0x00, 0x05, 0x0E, 0x80, 0x10, 0x10, 0x22]
        );
    }

    #[test]
    fn test_round_trip() {
        let codec = Codec::default();
        for (payload_type, payload) in [
            (PayloadType::VehicleIdentificationRequest, vec![]),
            (PayloadType::RoutingActivationRequest, vec![0x00, 0x01, 0x00, 0, 0, 0, 0]),
            (PayloadType::DiagnosticMessage, vec![0x00, 0x01, 0xFA, 0x25, 0x10, 0x01]),
            (PayloadType::Unknown(0x1234), vec![0xAA; 16]),
        ] {
            let decoded = codec.decode(&codec.encode(payload_type, &payload)).unwrap();
            assert_eq!(decoded.payload_type, payload_type);
            assert_eq!(decoded.payload.as_ref(), payload.as_slice());
            assert_eq!(decoded.inverse_protocol_version, !decoded.protocol_version);
        }
    }

    #[test]
    fn test_short_buffers_are_incomplete() {
        let codec = Codec::default();
        let frame = codec.encode(PayloadType::AliveCheckRequest, &[]);
        for len in 0..HEADER_LEN {
            assert!(matches!(
                codec.decode(&frame[..len]),
                Err(CodecError::Incomplete { needed: HEADER_LEN, .. })
            ));
        }
    }

    #[test]
    fn test_truncated_payload_is_incomplete() {
        let codec = Codec::default();
        let frame = codec.encode(PayloadType::DiagnosticMessage, &[1, 2, 3, 4, 5, 6]);
        let err = codec.decode(&frame[..frame.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Incomplete {
                needed: 14,
                available: 13
            }
        );
    }

    #[test]
    fn test_inverse_version_mismatch() {
        let codec = Codec::default();
        let err = codec
            .decode(&[0x02, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00])
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::InvalidVersion {
                version: 0x02,
                inverse: 0x02
            }
        );
    }

    #[test]
    fn test_other_versions_accepted_when_consistent() {
        let codec = Codec::default();
        let msg = codec
            .decode(&[0xFF, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00])
            .unwrap();
        assert_eq!(msg.protocol_version, 0xFF);
        assert_eq!(msg.payload_type, PayloadType::VehicleIdentificationRequest);
    }

    #[test]
    fn test_implausible_length() {
        let codec = Codec::default().with_max_payload_len(4095);
        let err = codec
            .decode(&[0x02, 0xFD, 0x80, 0x01, 0xFF, 0xFF, 0xFF, 0xFF])
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedLength {
                length: 0xFFFF_FFFF,
                limit: 4095
            }
        );
    }

    #[test]
    fn test_oversized_payload_is_not_framed() {
        let codec = Codec::default().with_max_payload_len(8);
        let message = DiagnosticMessage {
            source_address: 0x0E80,
            target_address: 0x1010,
            user_data: Bytes::from_static(&[0x22, 0xF1, 0x90, 0x00, 0x01]),
        };
        assert_eq!(
            codec.try_encode_payload(&message).unwrap_err(),
            CodecError::PayloadTooLarge {
                length: 9,
                limit: 8
            }
        );

        let fits = Codec::default().with_max_payload_len(9);
        let frame = fits.try_encode_payload(&message).unwrap();
        assert_eq!(frame.as_ref(), codec.encode_payload(&message).as_ref());
        assert_eq!(&frame[4..8], &[0x00, 0x00, 0x00, 0x09]);
    }

    #[test]
    fn test_unknown_type_decodes_structurally() {
        let codec = Codec::default();
        let msg = codec
            .decode(&[0x02, 0xFD, 0x12, 0x34, 0x00, 0x00, 0x00, 0x01, 0x99])
            .unwrap();
        assert_eq!(msg.payload_type, PayloadType::Unknown(0x1234));
        assert!(!msg.payload_type.is_known());
        assert!(matches!(
            Payload::parse(&msg),
            Err(CodecError::UnknownType(0x1234))
        ));
    }

    #[test]
    fn test_decode_frame_splits_stream() {
        let codec = Codec::default();
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&codec.encode(PayloadType::AliveCheckRequest, &[]));
        let second = codec.encode(PayloadType::AliveCheckResponse, &[0x0E, 0x80]);
        stream.extend_from_slice(&second[..5]);

        let first = codec.decode_frame(&mut stream).unwrap().unwrap();
        assert_eq!(first.payload_type, PayloadType::AliveCheckRequest);
        assert!(codec.decode_frame(&mut stream).unwrap().is_none());

        stream.extend_from_slice(&second[5..]);
        let next = codec.decode_frame(&mut stream).unwrap().unwrap();
        assert_eq!(next.payload_type, PayloadType::AliveCheckResponse);
        assert_eq!(next.payload.as_ref(), &[0x0E, 0x80]);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_payload_type_mapping_is_symmetric() {
        for raw in [0x0000u16, 0x0004, 0x0006, 0x4002, 0x8001, 0x8003, 0x7777] {
            assert_eq!(u16::from(PayloadType::from(raw)), raw);
        }
    }
}
