use bitflags::bitflags;

use super::NetworkId;
use super::method::MethodId;
use crate::error::PacketError;
use crate::packet::PacketBuffer;

/// Kind byte plus instance and method ids.
pub const ENVELOPE_HEADER_SIZE: usize = 9;
pub const RECIPIENT_SIZE: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageKind: u8 {
        const HAS_INSTANCE = 0b001;
        const HAS_PAYLOAD = 0b010;
        const HAS_RECIPIENT = 0b100;
    }
}

/// Addressing mode of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Recipient {
    #[default]
    Broadcast,
    Peer(u64),
}

impl Recipient {
    pub fn id(self) -> Option<u64> {
        match self {
            Self::Broadcast => None,
            Self::Peer(id) => Some(id),
        }
    }
}

impl From<Option<u64>> for Recipient {
    fn from(id: Option<u64>) -> Self {
        id.map_or(Self::Broadcast, Self::Peer)
    }
}

/// Header of one RPC message.
///
/// Layout, little-endian: `[kind u8][instance u32][method u32]`, then the
/// recipient as u64 when [`MessageKind::HAS_RECIPIENT`] is set. The payload,
/// if flagged, follows and belongs to the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub instance: NetworkId,
    pub method: MethodId,
    pub recipient: Recipient,
}

impl Envelope {
    pub fn new(instance: NetworkId, method: MethodId, recipient: Recipient, has_payload: bool) -> Self {
        let mut kind = MessageKind::empty();
        kind.set(MessageKind::HAS_INSTANCE, !instance.is_host());
        kind.set(MessageKind::HAS_PAYLOAD, has_payload);
        kind.set(MessageKind::HAS_RECIPIENT, recipient != Recipient::Broadcast);
        Self {
            kind,
            instance,
            method,
            recipient,
        }
    }

    pub fn has_payload(&self) -> bool {
        self.kind.contains(MessageKind::HAS_PAYLOAD)
    }

    /// Bytes the header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        if self.kind.contains(MessageKind::HAS_RECIPIENT) {
            ENVELOPE_HEADER_SIZE + RECIPIENT_SIZE
        } else {
            ENVELOPE_HEADER_SIZE
        }
    }

    pub fn encode(&self, packet: &mut PacketBuffer<'_>) -> Result<(), PacketError> {
        if packet.remaining() < self.encoded_len() {
            return Err(PacketError::OutOfRange {
                position: packet.position(),
                requested: self.encoded_len(),
                capacity: packet.size(),
            });
        }
        packet.write_byte(self.kind.bits())?;
        packet.write_u32(self.instance.0)?;
        packet.write_u32(self.method.0)?;
        if let Recipient::Peer(id) = self.recipient {
            packet.write_u64(id)?;
        }
        Ok(())
    }

    /// Reads a header; without [`MessageKind::HAS_INSTANCE`] the message
    /// targets the host entity whatever the instance field says.
    pub fn decode(packet: &mut PacketBuffer<'_>) -> Result<Self, PacketError> {
        let start = packet.position();
        let decoded = Self::read(packet);
        if decoded.is_err() {
            packet.seek(start)?;
        }
        decoded
    }

    fn read(packet: &mut PacketBuffer<'_>) -> Result<Self, PacketError> {
        let kind = MessageKind::from_bits_truncate(packet.read_byte()?);
        let instance = packet.read_u32()?;
        let method = MethodId(packet.read_u32()?);
        let recipient = if kind.contains(MessageKind::HAS_RECIPIENT) {
            Recipient::Peer(packet.read_u64()?)
        } else {
            Recipient::Broadcast
        };
        let instance = if kind.contains(MessageKind::HAS_INSTANCE) {
            NetworkId(instance)
        } else {
            NetworkId::HOST
        };

        Ok(Self {
            kind,
            instance,
            method,
            recipient,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::method_id;

    fn round_trip(envelope: Envelope) -> Envelope {
        let mut packet = PacketBuffer::new(envelope.encoded_len());
        envelope.encode(&mut packet).unwrap();
        assert_eq!(packet.remaining(), 0);
        packet.rewind();
        Envelope::decode(&mut packet).unwrap()
    }

    #[test]
    fn header_layout() {
        let envelope = Envelope::new(NetworkId(0x0102_0304), MethodId(0x0A0B_0C0D), Recipient::Broadcast, true);
        let mut packet = PacketBuffer::new(ENVELOPE_HEADER_SIZE);
        envelope.encode(&mut packet).unwrap();
        assert_eq!(
            packet.written(),
            &[0b011, 0x04, 0x03, 0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A]
        );
    }

    #[test]
    fn fields_survive_encoding() {
        let cases = [
            Envelope::new(NetworkId(7), method_id("say"), Recipient::Broadcast, true),
            Envelope::new(NetworkId::HOST, method_id("ping"), Recipient::Broadcast, false),
            Envelope::new(NetworkId(3), method_id("whisper"), Recipient::Peer(u64::MAX), true),
            Envelope::new(NetworkId::HOST, method_id("kick"), Recipient::Peer(2), false),
        ];
        for envelope in cases {
            assert_eq!(round_trip(envelope), envelope);
        }
    }

    #[test]
    fn host_messages_clear_the_instance_bit() {
        let envelope = Envelope::new(NetworkId::HOST, MethodId(1), Recipient::Broadcast, false);
        assert!(!envelope.kind.contains(MessageKind::HAS_INSTANCE));
        assert_eq!(envelope.encoded_len(), ENVELOPE_HEADER_SIZE);

        let envelope = Envelope::new(NetworkId(1), MethodId(1), Recipient::Peer(5), false);
        assert!(envelope.kind.contains(MessageKind::HAS_INSTANCE | MessageKind::HAS_RECIPIENT));
        assert_eq!(envelope.encoded_len(), ENVELOPE_HEADER_SIZE + RECIPIENT_SIZE);
    }

    #[test]
    fn missing_instance_bit_targets_host() {
        let mut packet = PacketBuffer::from_vec(vec![0b010, 9, 0, 0, 0, 1, 0, 0, 0]);
        let envelope = Envelope::decode(&mut packet).unwrap();
        assert_eq!(envelope.instance, NetworkId::HOST);
        assert!(envelope.has_payload());
    }

    #[test]
    fn truncated_header_leaves_cursor() {
        let mut packet = PacketBuffer::from_vec(vec![0b100, 1, 0, 0, 0, 2, 0, 0, 0, 1, 2]);
        assert!(Envelope::decode(&mut packet).is_err());
        assert_eq!(packet.position(), 0);

        let mut small = PacketBuffer::new(4);
        let envelope = Envelope::new(NetworkId(1), MethodId(1), Recipient::Broadcast, false);
        assert!(envelope.encode(&mut small).is_err());
        assert_eq!(small.position(), 0);
    }
}
