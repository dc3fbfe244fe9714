//! Bounds-checked byte cursor used for every message on the wire.
//!
//! A [`PacketBuffer`] either owns its bytes (optionally on loan from a
//! [`PacketPool`]) or borrows memory that belongs to the transport for the
//! length of one receive callback. Every read and write checks
//! `position + n <= size()` up front and leaves the cursor untouched when the
//! check fails.

use std::cell::RefCell;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use crate::error::PacketError;

const DEFAULT_POOL_SIZE: usize = 64;

/// Buffers that grew past this are dropped instead of pooled.
const MAX_POOLED_CAPACITY: usize = u16::MAX as usize + 1;

enum Storage<'a> {
    Owned {
        bytes: Vec<u8>,
        pool: Option<PacketPool>,
    },
    Borrowed(&'a mut [u8]),
    Released,
}

pub struct PacketBuffer<'a> {
    storage: Storage<'a>,
    capacity: usize,
    cursor: usize,
}

impl PacketBuffer<'static> {
    /// Zeroed heap buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::from_vec(vec![0; capacity])
    }

    /// Takes ownership of `bytes`; the capacity is the vector's length.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let capacity = bytes.len();
        Self {
            storage: Storage::Owned { bytes, pool: None },
            capacity,
            cursor: 0,
        }
    }
}

impl<'a> PacketBuffer<'a> {
    /// Wraps memory owned by someone else. Releasing never frees it.
    pub fn borrowed(bytes: &'a mut [u8]) -> Self {
        let capacity = bytes.len();
        Self {
            storage: Storage::Borrowed(bytes),
            capacity,
            cursor: 0,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Storage::Owned { .. })
    }

    pub fn is_released(&self) -> bool {
        matches!(self.storage, Storage::Released)
    }

    /// Total capacity in bytes, not the remaining space.
    pub fn size(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Bytes between the start of the buffer and the cursor.
    pub fn written(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned { bytes, .. } => &bytes[..self.cursor],
            Storage::Borrowed(bytes) => &bytes[..self.cursor],
            Storage::Released => &[],
        }
    }

    /// The whole region regardless of the cursor.
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned { bytes, .. } => bytes,
            Storage::Borrowed(bytes) => bytes,
            Storage::Released => &[],
        }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn seek(&mut self, position: usize) -> Result<(), PacketError> {
        if self.is_released() {
            return Err(PacketError::Released);
        }
        if position > self.capacity {
            return Err(PacketError::OutOfRange {
                position: self.cursor,
                requested: position.saturating_sub(self.cursor),
                capacity: self.capacity,
            });
        }
        self.cursor = position;
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, PacketError> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    /// Copies the next `len` bytes into a fresh vector.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, PacketError> {
        self.read_slice(len).map(<[u8]>::to_vec)
    }

    /// Zero-copy variant of [`read_bytes`](Self::read_bytes).
    pub fn read_slice(&mut self, len: usize) -> Result<&[u8], PacketError> {
        let range = self.claim(len)?;
        self.cursor = range.end;
        Ok(&self.bytes()?[range])
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let range = self.claim(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes()?[range.clone()]);
        self.cursor = range.end;
        Ok(out)
    }

    pub fn write_byte(&mut self, value: u8) -> Result<(), PacketError> {
        self.write_bytes(&[value])
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<(), PacketError> {
        let range = self.claim(value.len())?;
        self.bytes_mut()?[range.clone()].copy_from_slice(value);
        self.cursor = range.end;
        Ok(())
    }

    /// Gives the memory back. Owned bytes return to their pool (if any),
    /// borrowed bytes are simply forgotten. Calling it twice is a no-op.
    pub fn release(&mut self) {
        let storage = std::mem::replace(&mut self.storage, Storage::Released);
        if let Storage::Owned {
            bytes,
            pool: Some(pool),
        } = storage
        {
            pool.recycle(bytes);
        }
        self.cursor = 0;
    }

    fn claim(&self, len: usize) -> Result<Range<usize>, PacketError> {
        if self.is_released() {
            return Err(PacketError::Released);
        }
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.capacity)
            .ok_or(PacketError::OutOfRange {
                position: self.cursor,
                requested: len,
                capacity: self.capacity,
            })?;
        Ok(self.cursor..end)
    }

    fn bytes(&self) -> Result<&[u8], PacketError> {
        match &self.storage {
            Storage::Owned { bytes, .. } => Ok(bytes),
            Storage::Borrowed(bytes) => Ok(bytes),
            Storage::Released => Err(PacketError::Released),
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8], PacketError> {
        match &mut self.storage {
            Storage::Owned { bytes, .. } => Ok(bytes),
            Storage::Borrowed(bytes) => Ok(bytes),
            Storage::Released => Err(PacketError::Released),
        }
    }
}

macro_rules! le_accessors {
    ($($read:ident, $write:ident => $ty:ty, $size:literal;)*) => {
        impl PacketBuffer<'_> {
            $(
                pub fn $read(&mut self) -> Result<$ty, PacketError> {
                    self.read_array::<$size>().map(<$ty>::from_le_bytes)
                }

                pub fn $write(&mut self, value: $ty) -> Result<(), PacketError> {
                    self.write_bytes(&value.to_le_bytes())
                }
            )*
        }
    };
}

le_accessors! {
    read_i8, write_i8 => i8, 1;
    read_u16, write_u16 => u16, 2;
    read_i16, write_i16 => i16, 2;
    read_u32, write_u32 => u32, 4;
    read_i32, write_i32 => i32, 4;
    read_u64, write_u64 => u64, 8;
    read_i64, write_i64 => i64, 8;
    read_f32, write_f32 => f32, 4;
    read_f64, write_f64 => f64, 8;
}

impl Drop for PacketBuffer<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PacketBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = match &self.storage {
            Storage::Owned { pool: Some(_), .. } => "pooled",
            Storage::Owned { pool: None, .. } => "owned",
            Storage::Borrowed(_) => "borrowed",
            Storage::Released => "released",
        };
        f.debug_struct("PacketBuffer")
            .field("storage", &storage)
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// Recycling allocator that transports hand out packets from.
///
/// Single-threaded by construction (`Rc`), matching the tick-thread model.
#[derive(Clone)]
pub struct PacketPool {
    free: Rc<RefCell<Vec<Vec<u8>>>>,
    max_pooled: usize,
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl PacketPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Rc::new(RefCell::new(Vec::with_capacity(max_pooled))),
            max_pooled,
        }
    }

    /// Zeroed buffer of exactly `size` bytes that returns to the pool on release.
    pub fn acquire(&self, size: usize) -> PacketBuffer<'static> {
        let mut bytes = self.free.borrow_mut().pop().unwrap_or_default();
        bytes.clear();
        bytes.resize(size, 0);
        PacketBuffer {
            storage: Storage::Owned {
                bytes,
                pool: Some(self.clone()),
            },
            capacity: size,
            cursor: 0,
        }
    }

    /// Number of idle buffers waiting to be reused.
    pub fn available(&self) -> usize {
        self.free.borrow().len()
    }

    fn recycle(&self, bytes: Vec<u8>) {
        if bytes.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let mut free = self.free.borrow_mut();
        if free.len() < self.max_pooled {
            free.push(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let mut packet = PacketBuffer::new(16);
        packet.write_bytes(&[1, 2, 3, 4]).unwrap();
        packet.write_u32(0xDEAD_BEEF).unwrap();

        packet.rewind();
        assert_eq!(packet.read_bytes(4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(packet.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(packet.position(), 8);
        assert_eq!(packet.size(), 16);
    }

    #[test]
    fn overflow_leaves_cursor_untouched() {
        let mut packet = PacketBuffer::new(4);
        packet.write_bytes(&[9, 9, 9]).unwrap();

        let err = packet.write_bytes(&[1, 2]).unwrap_err();
        assert_eq!(
            err,
            PacketError::OutOfRange {
                position: 3,
                requested: 2,
                capacity: 4
            }
        );
        assert_eq!(packet.position(), 3);

        packet.write_byte(7).unwrap();
        assert!(packet.write_byte(8).is_err());
        assert_eq!(packet.position(), 4);

        packet.rewind();
        assert!(packet.read_bytes(5).is_err());
        assert_eq!(packet.position(), 0);
        assert_eq!(packet.read_u32().unwrap(), u32::from_le_bytes([9, 9, 9, 7]));
        assert!(packet.read_byte().is_err());
    }

    #[test]
    fn little_endian_layout() {
        let mut packet = PacketBuffer::new(2);
        packet.write_u16(0x0102).unwrap();
        assert_eq!(packet.written(), &[0x02, 0x01]);
    }

    #[test]
    fn borrowed_buffer_writes_through() {
        let mut backing = [0u8; 3];
        {
            let mut packet = PacketBuffer::borrowed(&mut backing);
            assert!(!packet.is_owned());
            packet.write_bytes(&[5, 6, 7]).unwrap();
        }
        assert_eq!(backing, [5, 6, 7]);
    }

    #[test]
    fn release_is_idempotent() {
        let mut packet = PacketBuffer::new(8);
        packet.release();
        packet.release();
        assert!(packet.is_released());
        assert_eq!(packet.read_byte(), Err(PacketError::Released));
        assert!(packet.written().is_empty());
    }

    #[test]
    fn pool_recycles_released_buffers() {
        let pool = PacketPool::new(2);
        let mut packet = pool.acquire(32);
        packet.write_bytes(&[1; 32]).unwrap();
        assert_eq!(pool.available(), 0);

        packet.release();
        assert_eq!(pool.available(), 1);

        let reused = pool.acquire(8);
        assert_eq!(pool.available(), 0);
        assert_eq!(reused.as_slice(), &[0; 8]);
        drop(reused);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn seek_past_end_is_rejected() {
        let mut packet = PacketBuffer::new(4);
        assert!(packet.seek(4).is_ok());
        assert!(packet.seek(5).is_err());
        assert_eq!(packet.position(), 4);
    }
}
