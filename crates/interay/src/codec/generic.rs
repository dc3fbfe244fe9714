use std::collections::HashMap;

use crate::codec::{
    ARRAY_BIT, DateTime, Decimal, EXTENSION_TAG_END, EXTENSION_TAG_START, Serializer, TypeTag,
    Value,
};
use crate::error::CodecError;
use crate::packet::PacketBuffer;

const LENGTH_PREFIX: usize = 2;
const TAG_BYTE: usize = 1;

/// Default serializer: one tag byte, then a little-endian body.
///
/// Scalars are written at their fixed width, strings and arrays carry a u16
/// byte-count prefix. Extension tags (`0x40..=0x7F`) must be registered
/// with their width before use and are copied through as opaque bytes.
#[derive(Debug, Clone, Default)]
pub struct GenericSerializer {
    extensions: HashMap<u8, usize>,
}

impl GenericSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_extension(&mut self, tag: u8, size: usize) -> Result<(), CodecError> {
        if !(EXTENSION_TAG_START..=EXTENSION_TAG_END).contains(&tag) {
            return Err(CodecError::ExtensionRange(tag));
        }
        if size == 0 || size > u16::MAX as usize {
            return Err(CodecError::TooLong(size));
        }
        self.extensions.insert(tag, size);
        Ok(())
    }

    fn element_size(&self, tag: TypeTag) -> Result<usize, CodecError> {
        match tag {
            TypeTag::String => Err(CodecError::UnsizedElement(tag)),
            TypeTag::Extension(code) => self
                .extensions
                .get(&code)
                .copied()
                .ok_or(CodecError::UnknownTag(code)),
            other => other.fixed_size().ok_or(CodecError::UnsizedElement(other)),
        }
    }

    fn body_len(&self, value: &Value) -> Result<usize, CodecError> {
        match value {
            Value::String(s) => {
                if s.len() > u16::MAX as usize {
                    return Err(CodecError::TooLong(s.len()));
                }
                Ok(LENGTH_PREFIX + s.len())
            }
            Value::Array { element, items } => {
                let body = items.len() * self.element_size(*element)?;
                if body > u16::MAX as usize {
                    return Err(CodecError::TooLong(body));
                }
                Ok(LENGTH_PREFIX + body)
            }
            scalar => self.element_size(scalar.tag()),
        }
    }

    fn write_scalar(&self, packet: &mut PacketBuffer<'_>, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Bool(v) => packet.write_byte(u8::from(*v))?,
            Value::Char(v) => packet.write_u16(*v)?,
            Value::I8(v) => packet.write_i8(*v)?,
            Value::U8(v) => packet.write_byte(*v)?,
            Value::I16(v) => packet.write_i16(*v)?,
            Value::U16(v) => packet.write_u16(*v)?,
            Value::I32(v) => packet.write_i32(*v)?,
            Value::U32(v) => packet.write_u32(*v)?,
            Value::I64(v) => packet.write_i64(*v)?,
            Value::U64(v) => packet.write_u64(*v)?,
            Value::F32(v) => packet.write_f32(*v)?,
            Value::F64(v) => packet.write_f64(*v)?,
            Value::Decimal(d) => {
                for word in [d.lo, d.mid, d.hi, d.flags] {
                    packet.write_u32(word)?;
                }
            }
            Value::DateTime(dt) => packet.write_i64(dt.ticks)?,
            Value::Extension { tag, bytes } => {
                let expected = self.element_size(TypeTag::Extension(*tag))?;
                if bytes.len() != expected {
                    return Err(CodecError::ExtensionSize {
                        tag: *tag,
                        expected,
                        found: bytes.len(),
                    });
                }
                packet.write_bytes(bytes)?;
            }
            Value::String(_) | Value::Array { .. } => {
                return Err(CodecError::UnsizedElement(value.tag()));
            }
        }
        Ok(())
    }

    fn read_scalar(&self, packet: &mut PacketBuffer<'_>, tag: TypeTag) -> Result<Value, CodecError> {
        Ok(match tag {
            TypeTag::Bool => Value::Bool(packet.read_byte()? != 0),
            TypeTag::Char => Value::Char(packet.read_u16()?),
            TypeTag::I8 => Value::I8(packet.read_i8()?),
            TypeTag::U8 => Value::U8(packet.read_byte()?),
            TypeTag::I16 => Value::I16(packet.read_i16()?),
            TypeTag::U16 => Value::U16(packet.read_u16()?),
            TypeTag::I32 => Value::I32(packet.read_i32()?),
            TypeTag::U32 => Value::U32(packet.read_u32()?),
            TypeTag::I64 => Value::I64(packet.read_i64()?),
            TypeTag::U64 => Value::U64(packet.read_u64()?),
            TypeTag::F32 => Value::F32(packet.read_f32()?),
            TypeTag::F64 => Value::F64(packet.read_f64()?),
            TypeTag::Decimal => Value::Decimal(Decimal {
                lo: packet.read_u32()?,
                mid: packet.read_u32()?,
                hi: packet.read_u32()?,
                flags: packet.read_u32()?,
            }),
            TypeTag::DateTime => Value::DateTime(DateTime::from_ticks(packet.read_i64()?)),
            TypeTag::Extension(code) => {
                let size = self.element_size(tag)?;
                Value::Extension {
                    tag: code,
                    bytes: packet.read_bytes(size)?,
                }
            }
            TypeTag::String => return Err(CodecError::UnsizedElement(tag)),
        })
    }
}

impl Serializer for GenericSerializer {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn encoded_len(&self, value: &Value) -> Result<usize, CodecError> {
        Ok(TAG_BYTE + self.body_len(value)?)
    }

    fn serialize(&self, packet: &mut PacketBuffer<'_>, value: &Value) -> Result<(), CodecError> {
        // Validate the whole value before touching the packet.
        let body = self.body_len(value)?;
        let tag = value.tag();

        match value {
            Value::Array { element, items } => {
                if let Some(item) = items.iter().find(|item| item.is_array() || item.tag() != *element) {
                    log::trace!("array element {:?} rejected", item.tag());
                    return Err(CodecError::MixedArray { expected: *element });
                }
                packet.write_byte(tag.code() | ARRAY_BIT)?;
                packet.write_u16((body - LENGTH_PREFIX) as u16)?;
                for item in items {
                    self.write_scalar(packet, item)?;
                }
            }
            Value::String(s) => {
                packet.write_byte(tag.code())?;
                packet.write_u16(s.len() as u16)?;
                packet.write_bytes(s.as_bytes())?;
            }
            scalar => {
                packet.write_byte(tag.code())?;
                self.write_scalar(packet, scalar)?;
            }
        }
        Ok(())
    }

    fn deserialize(&self, packet: &mut PacketBuffer<'_>) -> Result<Value, CodecError> {
        let tag_byte = packet.read_byte()?;
        let tag = TypeTag::from_code(tag_byte & !ARRAY_BIT)?;

        if tag_byte & ARRAY_BIT != 0 {
            let element = self.element_size(tag)?;
            let len = packet.read_u16()? as usize;
            if len % element != 0 {
                return Err(CodecError::ArrayLength { len, element });
            }
            let items = (0..len / element)
                .map(|_| self.read_scalar(packet, tag))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Value::Array {
                element: tag,
                items,
            });
        }

        if tag == TypeTag::String {
            let len = packet.read_u16()? as usize;
            let bytes = packet.read_bytes(len)?;
            return String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| CodecError::InvalidUtf8);
        }

        self.read_scalar(packet, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PacketError;

    fn round_trip(serializer: &GenericSerializer, value: Value) -> Value {
        let len = serializer.encoded_len(&value).unwrap();
        let mut packet = PacketBuffer::new(len);
        serializer.serialize(&mut packet, &value).unwrap();
        assert_eq!(packet.remaining(), 0, "encoded_len disagrees for {value:?}");
        packet.rewind();
        serializer.deserialize(&mut packet).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        let serializer = GenericSerializer::new();
        let values = vec![
            Value::Bool(true),
            Value::Char(0x263A),
            Value::I8(-5),
            Value::U8(250),
            Value::I16(-30_000),
            Value::U16(60_000),
            Value::I32(-7),
            Value::U32(0xFFFF_0000),
            Value::I64(i64::MIN),
            Value::U64(u64::MAX),
            Value::F32(1.5),
            Value::F64(-2.25),
            Value::Decimal(Decimal::new(42, 2, false)),
            Value::DateTime(DateTime::from_ticks(638_000_000_000_000_000)),
            Value::from("héllo"),
        ];
        for value in values {
            assert_eq!(round_trip(&serializer, value.clone()), value);
        }
    }

    #[test]
    fn string_layout() {
        let serializer = GenericSerializer::new();
        let mut packet = PacketBuffer::new(6);
        serializer.serialize(&mut packet, &Value::from("abc")).unwrap();
        assert_eq!(packet.written(), &[18, 3, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn array_layout_and_round_trip() {
        let serializer = GenericSerializer::new();
        let value = Value::array(TypeTag::U16, vec![Value::U16(1), Value::U16(0x0203)]);
        let mut packet = PacketBuffer::new(serializer.encoded_len(&value).unwrap());
        serializer.serialize(&mut packet, &value).unwrap();
        assert_eq!(packet.written(), &[8 | ARRAY_BIT, 4, 0, 1, 0, 3, 2]);

        packet.rewind();
        assert_eq!(serializer.deserialize(&mut packet).unwrap(), value);
    }

    #[test]
    fn string_arrays_are_rejected() {
        let serializer = GenericSerializer::new();
        let value = Value::array(TypeTag::String, vec![Value::from("x")]);
        assert_eq!(
            serializer.encoded_len(&value),
            Err(CodecError::UnsizedElement(TypeTag::String))
        );
    }

    #[test]
    fn mixed_arrays_are_rejected() {
        let serializer = GenericSerializer::new();
        let value = Value::array(TypeTag::I32, vec![Value::I32(1), Value::U8(2)]);
        let mut packet = PacketBuffer::new(64);
        assert_eq!(
            serializer.serialize(&mut packet, &value),
            Err(CodecError::MixedArray {
                expected: TypeTag::I32
            })
        );
        assert_eq!(packet.position(), 0);
    }

    #[test]
    fn extensions_need_registration() {
        let mut serializer = GenericSerializer::new();
        let value = Value::Extension {
            tag: 0x41,
            bytes: vec![0; 12],
        };
        assert_eq!(serializer.encoded_len(&value), Err(CodecError::UnknownTag(0x41)));

        serializer.register_extension(0x41, 12).unwrap();
        assert_eq!(round_trip(&serializer, value.clone()), value);

        let wrong = Value::Extension {
            tag: 0x41,
            bytes: vec![0; 3],
        };
        let mut packet = PacketBuffer::new(64);
        assert!(matches!(
            serializer.serialize(&mut packet, &wrong),
            Err(CodecError::ExtensionSize { expected: 12, found: 3, .. })
        ));

        assert_eq!(
            serializer.register_extension(0x10, 4),
            Err(CodecError::ExtensionRange(0x10))
        );
    }

    #[test]
    fn truncated_payload_fails() {
        let serializer = GenericSerializer::new();
        let mut packet = PacketBuffer::from_vec(vec![9, 1, 2]);
        assert!(matches!(
            serializer.deserialize(&mut packet),
            Err(CodecError::Packet(PacketError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn ragged_array_body_fails() {
        let serializer = GenericSerializer::new();
        let mut packet = PacketBuffer::from_vec(vec![9 | ARRAY_BIT, 3, 0, 1, 2, 3]);
        assert_eq!(
            serializer.deserialize(&mut packet),
            Err(CodecError::ArrayLength { len: 3, element: 4 })
        );
    }

    #[test]
    fn invalid_utf8_fails() {
        let serializer = GenericSerializer::new();
        let mut packet = PacketBuffer::from_vec(vec![18, 2, 0, 0xC3, 0x28]);
        assert_eq!(serializer.deserialize(&mut packet), Err(CodecError::InvalidUtf8));
    }
}
