//! Packer: encodes scalars, strings and byte buffers into the tagged
//! wire form, always choosing the smallest tag the value fits in.

use bytes::{BufMut, BytesMut};

use super::tags;

/// Initial scratch buffer size for a fresh packer
pub const PACK_BUFFER_SIZE: usize = 512;

/// Byte order applied to multi-byte scalar payloads and explicit
/// length fields. Tag bytes are order-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

/// Encoder with an internal scratch buffer. Reusable: `clear` resets it
/// without releasing capacity, which is what makes pooling worthwhile.
#[derive(Debug)]
pub struct Packer {
    out: BytesMut,
    order: ByteOrder,
}

impl Packer {
    pub fn new() -> Self {
        Self::with_order(ByteOrder::default())
    }

    pub fn with_order(order: ByteOrder) -> Self {
        Self {
            out: BytesMut::with_capacity(PACK_BUFFER_SIZE),
            order,
        }
    }

    /// Encoded bytes written so far.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Reset for reuse, keeping the scratch buffer's capacity.
    pub fn clear(&mut self) {
        self.out.clear();
    }

    fn put_u16_ord(&mut self, value: u16) {
        match self.order {
            ByteOrder::LittleEndian => self.out.put_u16_le(value),
            ByteOrder::BigEndian => self.out.put_u16(value),
        }
    }

    fn put_u32_ord(&mut self, value: u32) {
        match self.order {
            ByteOrder::LittleEndian => self.out.put_u32_le(value),
            ByteOrder::BigEndian => self.out.put_u32(value),
        }
    }

    fn put_u64_ord(&mut self, value: u64) {
        match self.order {
            ByteOrder::LittleEndian => self.out.put_u64_le(value),
            ByteOrder::BigEndian => self.out.put_u64(value),
        }
    }

    /// Signed integer, smallest-fitting tag. Non-negative values up to
    /// 127 collapse into the fixnum tag byte; negatives down to -32
    /// collapse into the negative fixnum tag byte.
    pub fn pack_i64(&mut self, value: i64) {
        if value >= 0 {
            if value <= tags::MAX_7BIT as i64 {
                self.out.put_u8(value as u8 | tags::FIXNUM);
            } else if value <= tags::MAX_15BIT as i64 {
                self.out.put_u8(tags::INT16);
                self.put_u16_ord(value as i16 as u16);
            } else if value <= tags::MAX_31BIT as i64 {
                self.out.put_u8(tags::INT32);
                self.put_u32_ord(value as i32 as u32);
            } else {
                self.out.put_u8(tags::INT64);
                self.put_u64_ord(value as u64);
            }
        } else if value >= -(tags::MAX_5BIT as i64 + 1) {
            self.out.put_u8((value as i8 as u8) | tags::NEGATIVE_FIXNUM);
        } else if value >= -(tags::MAX_7BIT as i64 + 1) {
            self.out.put_u8(tags::INT8);
            self.out.put_i8(value as i8);
        } else if value >= -(tags::MAX_15BIT as i64 + 1) {
            self.out.put_u8(tags::INT16);
            self.put_u16_ord(value as i16 as u16);
        } else if value >= -(tags::MAX_31BIT as i64 + 1) {
            self.out.put_u8(tags::INT32);
            self.put_u32_ord(value as i32 as u32);
        } else {
            self.out.put_u8(tags::INT64);
            self.put_u64_ord(value as u64);
        }
    }

    pub fn pack_i32(&mut self, value: i32) {
        self.pack_i64(value as i64);
    }

    /// Unsigned integer, smallest-fitting tag.
    pub fn pack_u64(&mut self, value: u64) {
        if value <= tags::MAX_7BIT as u64 {
            self.out.put_u8(value as u8 | tags::FIXNUM);
        } else if value <= tags::MAX_8BIT as u64 {
            self.out.put_u8(tags::UINT8);
            self.out.put_u8(value as u8);
        } else if value <= tags::MAX_16BIT as u64 {
            self.out.put_u8(tags::UINT16);
            self.put_u16_ord(value as u16);
        } else if value <= u32::MAX as u64 {
            self.out.put_u8(tags::UINT32);
            self.put_u32_ord(value as u32);
        } else {
            self.out.put_u8(tags::UINT64);
            self.put_u64_ord(value);
        }
    }

    pub fn pack_u32(&mut self, value: u32) {
        self.pack_u64(value as u64);
    }

    pub fn pack_f32(&mut self, value: f32) {
        self.out.put_u8(tags::FLOAT32);
        self.put_u32_ord(value.to_bits());
    }

    pub fn pack_f64(&mut self, value: f64) {
        self.out.put_u8(tags::FLOAT64);
        self.put_u64_ord(value.to_bits());
    }

    pub fn pack_bool(&mut self, value: bool) {
        self.out
            .put_u8(if value { tags::TRUE } else { tags::FALSE });
    }

    pub fn pack_null(&mut self) {
        self.out.put_u8(tags::NULL);
    }

    /// Length-prefixed raw bytes: lengths up to 31 pack into the tag
    /// byte, larger lengths escalate through 16- and 32-bit forms.
    pub fn pack_bytes(&mut self, value: &[u8]) {
        let length = value.len() as u32;
        if length <= tags::MAX_5BIT {
            self.out.put_u8(length as u8 | tags::FIXBYTES);
        } else if length <= tags::MAX_16BIT {
            self.out.put_u8(tags::BYTES16);
            self.put_u16_ord(length as u16);
        } else {
            self.out.put_u8(tags::BYTES32);
            self.put_u32_ord(length);
        }
        self.out.put_slice(value);
    }

    pub fn pack_str(&mut self, value: &str) {
        self.pack_bytes(value.as_bytes());
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}
