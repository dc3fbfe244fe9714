//! Payload codec contract and the value model it operates on.

mod generic;

pub use generic::GenericSerializer;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::CodecError;
use crate::packet::PacketBuffer;

/// Set on the tag byte when the value is an array of the tagged type.
pub const ARRAY_BIT: u8 = 0x80;
/// First tag available to extension value types.
pub const EXTENSION_TAG_START: u8 = 0x40;
pub const EXTENSION_TAG_END: u8 = 0x7F;

/// Seven-bit type tag that prefixes every encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Decimal,
    DateTime,
    String,
    Extension(u8),
}

impl TypeTag {
    pub fn code(self) -> u8 {
        match self {
            Self::Bool => 3,
            Self::Char => 4,
            Self::I8 => 5,
            Self::U8 => 6,
            Self::I16 => 7,
            Self::U16 => 8,
            Self::I32 => 9,
            Self::U32 => 10,
            Self::I64 => 11,
            Self::U64 => 12,
            Self::F32 => 13,
            Self::F64 => 14,
            Self::Decimal => 15,
            Self::DateTime => 16,
            Self::String => 18,
            Self::Extension(tag) => tag,
        }
    }

    /// Parses the low seven bits of a tag byte.
    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        Ok(match code {
            3 => Self::Bool,
            4 => Self::Char,
            5 => Self::I8,
            6 => Self::U8,
            7 => Self::I16,
            8 => Self::U16,
            9 => Self::I32,
            10 => Self::U32,
            11 => Self::I64,
            12 => Self::U64,
            13 => Self::F32,
            14 => Self::F64,
            15 => Self::Decimal,
            16 => Self::DateTime,
            18 => Self::String,
            EXTENSION_TAG_START..=EXTENSION_TAG_END => Self::Extension(code),
            other => return Err(CodecError::UnknownTag(other)),
        })
    }

    /// Encoded width of one value, `None` for strings and extensions whose
    /// width lives in the serializer's extension table.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Bool | Self::I8 | Self::U8 => Some(1),
            Self::Char | Self::I16 | Self::U16 => Some(2),
            Self::I32 | Self::U32 | Self::F32 => Some(4),
            Self::I64 | Self::U64 | Self::F64 | Self::DateTime => Some(8),
            Self::Decimal => Some(16),
            Self::String | Self::Extension(_) => None,
        }
    }
}

/// 128-bit decimal in its raw four-word layout: a 96-bit magnitude
/// (`lo`, `mid`, `hi`) and a flags word carrying the scale in bits 16..24
/// and the sign in bit 31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decimal {
    pub lo: u32,
    pub mid: u32,
    pub hi: u32,
    pub flags: u32,
}

impl Decimal {
    const SIGN_MASK: u32 = 1 << 31;
    const SCALE_SHIFT: u32 = 16;

    pub fn new(magnitude: u128, scale: u8, negative: bool) -> Self {
        let mut flags = u32::from(scale.min(28)) << Self::SCALE_SHIFT;
        if negative {
            flags |= Self::SIGN_MASK;
        }
        Self {
            lo: magnitude as u32,
            mid: (magnitude >> 32) as u32,
            hi: (magnitude >> 64) as u32,
            flags,
        }
    }

    pub fn magnitude(&self) -> u128 {
        u128::from(self.lo) | u128::from(self.mid) << 32 | u128::from(self.hi) << 64
    }

    pub fn scale(&self) -> u8 {
        (self.flags >> Self::SCALE_SHIFT) as u8
    }

    pub fn is_negative(&self) -> bool {
        self.flags & Self::SIGN_MASK != 0
    }
}

/// Point in time as signed 100 ns ticks since 0001-01-01T00:00:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DateTime {
    pub ticks: i64,
}

impl DateTime {
    const TICKS_PER_SECOND: i64 = 10_000_000;
    const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

    pub fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let ticks = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self::UNIX_EPOCH_TICKS + (after.as_nanos() / 100) as i64,
            Err(before) => Self::UNIX_EPOCH_TICKS - (before.duration().as_nanos() / 100) as i64,
        };
        Self { ticks }
    }

    pub fn to_system_time(self) -> SystemTime {
        let since_epoch = self.ticks - Self::UNIX_EPOCH_TICKS;
        let magnitude = Duration::new(
            since_epoch.unsigned_abs() / Self::TICKS_PER_SECOND as u64,
            ((since_epoch.unsigned_abs() % Self::TICKS_PER_SECOND as u64) * 100) as u32,
        );
        if since_epoch >= 0 {
            UNIX_EPOCH + magnitude
        } else {
            UNIX_EPOCH - magnitude
        }
    }
}

/// A payload value. Arrays are homogeneous and only hold fixed-size types.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    /// One UTF-16 code unit.
    Char(u16),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    DateTime(DateTime),
    String(String),
    Extension { tag: u8, bytes: Vec<u8> },
    Array { element: TypeTag, items: Vec<Value> },
}

impl Value {
    /// Tag of the value, or of its elements for arrays.
    pub fn tag(&self) -> TypeTag {
        match self {
            Self::Bool(_) => TypeTag::Bool,
            Self::Char(_) => TypeTag::Char,
            Self::I8(_) => TypeTag::I8,
            Self::U8(_) => TypeTag::U8,
            Self::I16(_) => TypeTag::I16,
            Self::U16(_) => TypeTag::U16,
            Self::I32(_) => TypeTag::I32,
            Self::U32(_) => TypeTag::U32,
            Self::I64(_) => TypeTag::I64,
            Self::U64(_) => TypeTag::U64,
            Self::F32(_) => TypeTag::F32,
            Self::F64(_) => TypeTag::F64,
            Self::Decimal(_) => TypeTag::Decimal,
            Self::DateTime(_) => TypeTag::DateTime,
            Self::String(_) => TypeTag::String,
            Self::Extension { tag, .. } => TypeTag::Extension(*tag),
            Self::Array { element, .. } => *element,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array { .. })
    }

    pub fn array(element: TypeTag, items: Vec<Value>) -> Self {
        Self::Array { element, items }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Widens any integer variant that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I8(v) => Some(v.into()),
            Self::U8(v) => Some(v.into()),
            Self::I16(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::I32(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::I64(v) => Some(v),
            Self::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F32(v) => Some(v.into()),
            Self::F64(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Decimal => Decimal,
    DateTime => DateTime,
    String => String,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Translates payload values to and from packet bytes.
///
/// `encoded_len` must agree exactly with what `serialize` writes; the
/// manager sizes outbound packets from it.
pub trait Serializer {
    fn name(&self) -> &'static str;

    fn encoded_len(&self, value: &Value) -> Result<usize, CodecError>;

    fn serialize(&self, packet: &mut PacketBuffer<'_>, value: &Value) -> Result<(), CodecError>;

    fn deserialize(&self, packet: &mut PacketBuffer<'_>) -> Result<Value, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_codes_round_trip() {
        for code in 0..=0x7F {
            if let Ok(tag) = TypeTag::from_code(code) {
                assert_eq!(tag.code(), code);
            }
        }
        assert!(TypeTag::from_code(0).is_err());
        assert!(TypeTag::from_code(17).is_err());
        assert!(TypeTag::from_code(0x20).is_err());
        assert_eq!(TypeTag::from_code(0x40).unwrap(), TypeTag::Extension(0x40));
    }

    #[test]
    fn decimal_parts() {
        let decimal = Decimal::new(123_456_789_012_345_678_901, 4, true);
        assert_eq!(decimal.magnitude(), 123_456_789_012_345_678_901);
        assert_eq!(decimal.scale(), 4);
        assert!(decimal.is_negative());
    }

    #[test]
    fn datetime_system_time_round_trip() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let dt = DateTime::from_system_time(now);
        assert_eq!(dt.to_system_time(), now);
        assert_eq!(DateTime::from_system_time(UNIX_EPOCH).ticks, 621_355_968_000_000_000);
    }
}
