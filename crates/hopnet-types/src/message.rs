//! I2NP-style message envelope.
//!
//! ## Layout
//!
//! ```text
//! type (1) | unique id (4) | expiration ms (8) | size (2) | checksum (1) | payload (size)
//! ```
//!
//! The checksum is the first byte of the SHA-256 of the payload. All integers
//! are big-endian.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::identity::TunnelId;
use crate::{Result, TypesError, CELL_SIZE};

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest payload the 2-byte size field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Message type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    DatabaseStore,
    DatabaseLookup,
    DatabaseSearchReply,
    DeliveryStatus,
    Garlic,
    TunnelData,
    TunnelGateway,
    Data,
    TunnelBuild,
    TunnelBuildReply,
    VariableTunnelBuild,
    VariableTunnelBuildReply,
    /// A code this router does not interpret.
    Other(u8),
}

impl MessageType {
    /// Decode a type code.
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => Self::DatabaseStore,
            2 => Self::DatabaseLookup,
            3 => Self::DatabaseSearchReply,
            10 => Self::DeliveryStatus,
            11 => Self::Garlic,
            18 => Self::TunnelData,
            19 => Self::TunnelGateway,
            20 => Self::Data,
            21 => Self::TunnelBuild,
            22 => Self::TunnelBuildReply,
            23 => Self::VariableTunnelBuild,
            24 => Self::VariableTunnelBuildReply,
            other => Self::Other(other),
        }
    }

    /// Encode as a type code.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::DatabaseStore => 1,
            Self::DatabaseLookup => 2,
            Self::DatabaseSearchReply => 3,
            Self::DeliveryStatus => 10,
            Self::Garlic => 11,
            Self::TunnelData => 18,
            Self::TunnelGateway => 19,
            Self::Data => 20,
            Self::TunnelBuild => 21,
            Self::TunnelBuildReply => 22,
            Self::VariableTunnelBuild => 23,
            Self::VariableTunnelBuildReply => 24,
            Self::Other(code) => code,
        }
    }

    /// Whether this is a reply to a tunnel build request.
    pub fn is_build_reply(self) -> bool {
        matches!(self, Self::TunnelBuildReply | Self::VariableTunnelBuildReply)
    }
}

/// A routable message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelMessage {
    pub kind: MessageType,
    pub unique_id: u32,
    /// Absolute expiration in milliseconds since the epoch.
    pub expiration: u64,
    pub payload: Vec<u8>,
}

impl TunnelMessage {
    /// Create a message with a random unique id.
    pub fn new(kind: MessageType, payload: Vec<u8>, expiration: u64) -> Self {
        Self {
            kind,
            unique_id: rand::thread_rng().gen(),
            expiration,
            payload,
        }
    }

    /// Total encoded size, header included.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Whether the message expired before `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration < now
    }

    /// Encode header and payload.
    ///
    /// # Errors
    ///
    /// - [`TypesError::PayloadTooLarge`] if the payload does not fit the size field
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TypesError::PayloadTooLarge(self.payload.len()));
        }
        let mut out = Vec::with_capacity(self.size());
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.unique_id.to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.push(checksum(&self.payload));
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a message, validating its length and checksum.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(TypesError::Truncated {
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }
        let kind = MessageType::from_u8(data[0]);
        let unique_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let mut exp = [0u8; 8];
        exp.copy_from_slice(&data[5..13]);
        let expiration = u64::from_be_bytes(exp);
        let size = u16::from_be_bytes([data[13], data[14]]) as usize;
        let payload = &data[HEADER_SIZE..];
        if payload.len() != size {
            return Err(TypesError::SizeMismatch {
                declared: size,
                actual: payload.len(),
            });
        }
        if checksum(payload) != data[15] {
            return Err(TypesError::ChecksumMismatch);
        }
        Ok(Self {
            kind,
            unique_id,
            expiration,
            payload: payload.to_vec(),
        })
    }

    fn expect_kind(&self, expected: MessageType) -> Result<()> {
        if self.kind != expected {
            return Err(TypesError::WrongMessageType {
                expected: expected.as_u8(),
                actual: self.kind.as_u8(),
            });
        }
        Ok(())
    }
}

fn checksum(payload: &[u8]) -> u8 {
    hopnet_crypto::sha256::hash(payload)[0]
}

/// One encrypted cell addressed to the receiving hop's tunnel id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelDataMessage {
    pub tunnel_id: TunnelId,
    pub data: Box<[u8; CELL_SIZE]>,
}

impl TunnelDataMessage {
    /// Payload size: tunnel id + cell.
    pub const PAYLOAD_SIZE: usize = 4 + CELL_SIZE;

    pub fn new(tunnel_id: TunnelId, data: Box<[u8; CELL_SIZE]>) -> Self {
        Self { tunnel_id, data }
    }

    /// Wrap into an envelope.
    pub fn into_message(self, expiration: u64) -> TunnelMessage {
        let mut payload = Vec::with_capacity(Self::PAYLOAD_SIZE);
        payload.extend_from_slice(&self.tunnel_id.to_be_bytes());
        payload.extend_from_slice(&self.data[..]);
        TunnelMessage::new(MessageType::TunnelData, payload, expiration)
    }

    /// Unwrap from an envelope.
    pub fn from_message(msg: &TunnelMessage) -> Result<Self> {
        msg.expect_kind(MessageType::TunnelData)?;
        if msg.payload.len() != Self::PAYLOAD_SIZE {
            return Err(TypesError::SizeMismatch {
                declared: Self::PAYLOAD_SIZE,
                actual: msg.payload.len(),
            });
        }
        let tunnel_id = TunnelId::from_be_bytes([
            msg.payload[0],
            msg.payload[1],
            msg.payload[2],
            msg.payload[3],
        ])?;
        let mut data = Box::new([0u8; CELL_SIZE]);
        data.copy_from_slice(&msg.payload[4..]);
        Ok(Self { tunnel_id, data })
    }
}

/// A message handed to an inbound gateway for injection into its tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelGatewayMessage {
    pub tunnel_id: TunnelId,
    pub message: TunnelMessage,
}

impl TunnelGatewayMessage {
    pub fn new(tunnel_id: TunnelId, message: TunnelMessage) -> Self {
        Self { tunnel_id, message }
    }

    /// Wrap into an envelope that expires with the inner message.
    pub fn into_message(self) -> Result<TunnelMessage> {
        let inner = self.message.to_bytes()?;
        if inner.len() > MAX_PAYLOAD_SIZE - 6 {
            return Err(TypesError::PayloadTooLarge(inner.len()));
        }
        let mut payload = Vec::with_capacity(6 + inner.len());
        payload.extend_from_slice(&self.tunnel_id.to_be_bytes());
        payload.extend_from_slice(&(inner.len() as u16).to_be_bytes());
        payload.extend_from_slice(&inner);
        Ok(TunnelMessage::new(
            MessageType::TunnelGateway,
            payload,
            self.message.expiration,
        ))
    }

    /// Unwrap from an envelope.
    pub fn from_message(msg: &TunnelMessage) -> Result<Self> {
        msg.expect_kind(MessageType::TunnelGateway)?;
        let p = &msg.payload;
        if p.len() < 6 {
            return Err(TypesError::Truncated {
                needed: 6,
                available: p.len(),
            });
        }
        let tunnel_id = TunnelId::from_be_bytes([p[0], p[1], p[2], p[3]])?;
        let len = u16::from_be_bytes([p[4], p[5]]) as usize;
        if p.len() - 6 != len {
            return Err(TypesError::SizeMismatch {
                declared: len,
                actual: p.len() - 6,
            });
        }
        let message = TunnelMessage::from_bytes(&p[6..])?;
        Ok(Self { tunnel_id, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        for code in 0..=u8::MAX {
            assert_eq!(MessageType::from_u8(code).as_u8(), code);
        }
        assert_eq!(MessageType::TunnelData.as_u8(), 18);
        assert!(MessageType::VariableTunnelBuildReply.is_build_reply());
        assert!(!MessageType::Data.is_build_reply());
    }

    #[test]
    fn test_header_layout() {
        let msg = TunnelMessage {
            kind: MessageType::Data,
            unique_id: 0x0A0B_0C0D,
            expiration: 0x0102_0304_0506_0708,
            payload: vec![0xEE; 3],
        };
        let bytes = msg.to_bytes().expect("encode");
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(bytes[0], 20);
        assert_eq!(&bytes[1..5], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[5..13], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[13..15], &[0, 3]);
        assert_eq!(TunnelMessage::from_bytes(&bytes).expect("decode"), msg);
    }

    #[test]
    fn test_checksum_enforced() {
        let msg = TunnelMessage::new(MessageType::Data, b"hello".to_vec(), 1);
        let mut bytes = msg.to_bytes().expect("encode");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            TunnelMessage::from_bytes(&bytes),
            Err(TypesError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_truncated_and_size_mismatch() {
        assert!(TunnelMessage::from_bytes(&[0u8; 5]).is_err());
        let msg = TunnelMessage::new(MessageType::Garlic, vec![1, 2, 3], 1);
        let bytes = msg.to_bytes().expect("encode");
        assert!(matches!(
            TunnelMessage::from_bytes(&bytes[..bytes.len() - 1]),
            Err(TypesError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_payload() {
        let msg = TunnelMessage::new(MessageType::DeliveryStatus, Vec::new(), 9);
        let bytes = msg.to_bytes().expect("encode");
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(TunnelMessage::from_bytes(&bytes).expect("decode"), msg);
    }

    #[test]
    fn test_tunnel_data_message() {
        let id = TunnelId::new(42).expect("id");
        let mut cell = Box::new([0u8; CELL_SIZE]);
        cell[0] = 0x55;
        cell[CELL_SIZE - 1] = 0x66;
        let msg = TunnelDataMessage::new(id, cell.clone()).into_message(100);
        assert_eq!(msg.kind, MessageType::TunnelData);
        assert_eq!(msg.payload.len(), TunnelDataMessage::PAYLOAD_SIZE);

        let back = TunnelDataMessage::from_message(&msg).expect("decode");
        assert_eq!(back.tunnel_id, id);
        assert_eq!(back.data, cell);
    }

    #[test]
    fn test_tunnel_data_rejects_wrong_type() {
        let msg = TunnelMessage::new(MessageType::Data, vec![0; 1028], 1);
        assert!(matches!(
            TunnelDataMessage::from_message(&msg),
            Err(TypesError::WrongMessageType { expected: 18, actual: 20 })
        ));
    }

    #[test]
    fn test_tunnel_gateway_message() {
        let inner = TunnelMessage::new(MessageType::Data, b"payload".to_vec(), 777);
        let id = TunnelId::new(9).expect("id");
        let outer = TunnelGatewayMessage::new(id, inner.clone())
            .into_message()
            .expect("wrap");
        assert_eq!(outer.expiration, 777);

        let back = TunnelGatewayMessage::from_message(&outer).expect("unwrap");
        assert_eq!(back.tunnel_id, id);
        assert_eq!(back.message, inner);
    }
}
