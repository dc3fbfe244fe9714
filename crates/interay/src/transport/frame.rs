use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::error::TransportError;

pub const PROTOCOL_MAGIC: u32 = 0x494E_5452;
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram the transport will put on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
/// Headroom reserved for the frame header and rkyv bookkeeping.
pub const FRAME_OVERHEAD: usize = 64;
/// Ceiling for a single payload so that its frame still fits a datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - FRAME_OVERHEAD;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u32,
    /// Newest payload sequence received from the other side.
    pub ack: u32,
    /// Bit `n` acknowledges `ack - n - 1`.
    pub ack_bitfield: u32,
}

impl FrameHeader {
    pub fn new(ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum FrameBody {
    Connect { client_salt: u64 },
    Accept { peer_id: u32, client_salt: u64 },
    Deny { reason: String },
    Disconnect,
    Payload { sequence: u32, data: Vec<u8> },
    Ack,
    KeepAlive,
}

impl FrameBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Accept { .. } => "accept",
            Self::Deny { .. } => "deny",
            Self::Disconnect => "disconnect",
            Self::Payload { .. } => "payload",
            Self::Ack => "ack",
            Self::KeepAlive => "keepalive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(header: FrameHeader, body: FrameBody) -> Self {
        Self { header, body }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(|e| TransportError::Frame(e.to_string()))
    }

    /// Decodes a datagram, rejecting foreign magic and version mismatches.
    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        // Receive buffers carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);

        let frame = rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(|e| TransportError::Frame(e.to_string()))?;
        if !frame.header.is_valid() {
            return Err(TransportError::Frame(format!(
                "bad header magic {:#x} version {}",
                frame.header.magic, frame.header.version
            )));
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_comparison_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
        assert!(!sequence_greater_than(7, 7));
    }

    #[test]
    fn frame_encode_decode() {
        let frame = Frame::new(
            FrameHeader::new(9, 0b101),
            FrameBody::Payload {
                sequence: 10,
                data: vec![1, 2, 3],
            },
        );
        let bytes = frame.encode().unwrap();
        assert!(bytes.len() < 3 + FRAME_OVERHEAD);

        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let mut header = FrameHeader::new(0, 0);
        header.magic = 0x4455_414C;
        let bytes = Frame::new(header, FrameBody::KeepAlive).encode().unwrap();
        assert!(matches!(Frame::decode(&bytes), Err(TransportError::Frame(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Frame::decode(&[0xFF; 5]).is_err());
        assert!(Frame::decode(&[]).is_err());
    }
}
