//! Unpacker: decodes the tagged wire form back into typed values.
//!
//! Decoding is one dispatch over the tag byte. Truncated input and
//! type mismatches are reported as distinct errors; the only implicit
//! conversion is numeric widening (any decoded integer representable
//! in the requested type satisfies the request).

use bytes::{BufMut, BytesMut};

use super::pack::{ByteOrder, PACK_BUFFER_SIZE};
use super::tags;
use crate::error::CodecError;

/// One decoded wire value.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    UInt(u64),
    Int(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Null,
    Bytes(Vec<u8>),
}

/// Decoder with an internal scratch buffer. `attach` copies the input
/// in and rewinds, so one instance can be reused across many envelopes.
#[derive(Debug)]
pub struct Unpacker {
    buf: BytesMut,
    pos: usize,
    order: ByteOrder,
    /// Tag byte of the most recently decoded value, kept for error
    /// reporting.
    last_tag: u8,
}

impl Unpacker {
    pub fn new() -> Self {
        Self::with_order(ByteOrder::default())
    }

    pub fn with_order(order: ByteOrder) -> Self {
        Self {
            buf: BytesMut::with_capacity(PACK_BUFFER_SIZE),
            pos: 0,
            order,
            last_tag: 0,
        }
    }

    /// Load input for decoding, replacing whatever was attached before.
    pub fn attach(&mut self, data: &[u8]) {
        self.buf.clear();
        self.buf.put_slice(data);
        self.pos = 0;
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&[u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.take(2)?);
        Ok(match self.order {
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
        })
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(match self.order {
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
        })
    }

    fn take_u64(&mut self) -> Result<u64, CodecError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(match self.order {
            ByteOrder::LittleEndian => u64::from_le_bytes(bytes),
            ByteOrder::BigEndian => u64::from_be_bytes(bytes),
        })
    }

    fn take_bytes(&mut self, len: usize) -> Result<Value, CodecError> {
        Ok(Value::Bytes(self.take(len)?.to_vec()))
    }

    /// Decode the next value. One dispatch over the tag byte.
    fn decode_value(&mut self) -> Result<Value, CodecError> {
        let tag = self.take_u8()?;
        self.last_tag = tag;
        match tag {
            tags::UINT8 => Ok(Value::UInt(self.take_u8()? as u64)),
            tags::UINT16 => Ok(Value::UInt(self.take_u16()? as u64)),
            tags::UINT32 => Ok(Value::UInt(self.take_u32()? as u64)),
            tags::UINT64 => Ok(Value::UInt(self.take_u64()?)),
            tags::INT8 => Ok(Value::Int(self.take_u8()? as i8 as i64)),
            tags::INT16 => Ok(Value::Int(self.take_u16()? as i16 as i64)),
            tags::INT32 => Ok(Value::Int(self.take_u32()? as i32 as i64)),
            tags::INT64 => Ok(Value::Int(self.take_u64()? as i64)),
            tags::FLOAT32 => Ok(Value::F32(f32::from_bits(self.take_u32()?))),
            tags::FLOAT64 => Ok(Value::F64(f64::from_bits(self.take_u64()?))),
            tags::NULL => Ok(Value::Null),
            tags::FALSE => Ok(Value::Bool(false)),
            tags::TRUE => Ok(Value::Bool(true)),
            tags::BYTES16 => {
                let len = self.take_u16()? as usize;
                self.take_bytes(len)
            }
            tags::BYTES32 => {
                let len = self.take_u32()? as usize;
                self.take_bytes(len)
            }
            tags::ARRAY16 | tags::ARRAY32 | tags::MAP16 | tags::MAP32 => {
                Err(CodecError::Unsupported(tag))
            }
            _ => {
                if tag & 0xe0 == tags::FIXBYTES {
                    let len = (tag & 0x1f) as usize;
                    self.take_bytes(len)
                } else if tag & 0xe0 == tags::NEGATIVE_FIXNUM {
                    Ok(Value::Int((tag & 0x1f) as i64 - 32))
                } else if tag & 0xf0 == tags::FIXARRAY || tag & 0xf0 == tags::FIXMAP {
                    Err(CodecError::Unsupported(tag))
                } else if tag <= tags::MAX_7BIT as u8 {
                    Ok(Value::UInt(tag as u64))
                } else {
                    Err(CodecError::Unsupported(tag))
                }
            }
        }
    }

    fn mismatch(&self, requested: &'static str) -> CodecError {
        CodecError::TypeMismatch {
            tag: self.last_tag,
            requested,
        }
    }

    /// Decoded integer as u64 if its value is non-negative; signed and
    /// unsigned tags both qualify.
    pub fn unpack_u64(&mut self) -> Result<u64, CodecError> {
        match self.decode_value()? {
            Value::UInt(v) => Ok(v),
            Value::Int(v) if v >= 0 => Ok(v as u64),
            _ => Err(self.mismatch("u64")),
        }
    }

    pub fn unpack_u32(&mut self) -> Result<u32, CodecError> {
        match self.decode_value()? {
            Value::UInt(v) if v <= u32::MAX as u64 => Ok(v as u32),
            Value::Int(v) if v >= 0 && v <= u32::MAX as i64 => Ok(v as u32),
            _ => Err(self.mismatch("u32")),
        }
    }

    pub fn unpack_i64(&mut self) -> Result<i64, CodecError> {
        match self.decode_value()? {
            Value::Int(v) => Ok(v),
            Value::UInt(v) if v <= i64::MAX as u64 => Ok(v as i64),
            _ => Err(self.mismatch("i64")),
        }
    }

    pub fn unpack_i32(&mut self) -> Result<i32, CodecError> {
        match self.decode_value()? {
            Value::Int(v) if v >= i32::MIN as i64 && v <= i32::MAX as i64 => Ok(v as i32),
            Value::UInt(v) if v <= i32::MAX as u64 => Ok(v as i32),
            _ => Err(self.mismatch("i32")),
        }
    }

    /// Floats never cross-convert: a float64 tag does not satisfy the
    /// float32 accessor, nor the reverse.
    pub fn unpack_f32(&mut self) -> Result<f32, CodecError> {
        match self.decode_value()? {
            Value::F32(v) => Ok(v),
            _ => Err(self.mismatch("f32")),
        }
    }

    pub fn unpack_f64(&mut self) -> Result<f64, CodecError> {
        match self.decode_value()? {
            Value::F64(v) => Ok(v),
            _ => Err(self.mismatch("f64")),
        }
    }

    pub fn unpack_bool(&mut self) -> Result<bool, CodecError> {
        match self.decode_value()? {
            Value::Bool(v) => Ok(v),
            _ => Err(self.mismatch("bool")),
        }
    }

    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        match self.decode_value()? {
            Value::Bytes(v) => Ok(v),
            _ => Err(self.mismatch("bytes")),
        }
    }

    pub fn unpack_str(&mut self) -> Result<String, CodecError> {
        match self.decode_value()? {
            Value::Bytes(v) => Ok(String::from_utf8_lossy(&v).into_owned()),
            _ => Err(self.mismatch("string")),
        }
    }
}

impl Default for Unpacker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Packer;
    use super::*;

    fn unpacker_for(pack: impl FnOnce(&mut Packer)) -> Unpacker {
        let mut packer = Packer::new();
        pack(&mut packer);
        let mut unpacker = Unpacker::new();
        unpacker.attach(packer.as_bytes());
        unpacker
    }

    #[test]
    fn test_signed_round_trip_boundaries() {
        for &value in &[
            0i64,
            -1,
            127,
            -32,
            -33,
            128,
            -128,
            -129,
            32767,
            -32768,
            i32::MAX as i64,
            i32::MIN as i64,
            i64::MAX,
            i64::MIN,
        ] {
            let mut unpacker = unpacker_for(|p| p.pack_i64(value));
            assert_eq!(unpacker.unpack_i64().unwrap(), value, "value {}", value);
        }
    }

    #[test]
    fn test_unsigned_round_trip_boundaries() {
        for &value in &[
            0u64,
            127,
            128,
            255,
            256,
            65535,
            65536,
            u32::MAX as u64,
            u32::MAX as u64 + 1,
            u64::MAX,
        ] {
            let mut unpacker = unpacker_for(|p| p.pack_u64(value));
            assert_eq!(unpacker.unpack_u64().unwrap(), value, "value {}", value);
        }
    }

    #[test]
    fn test_float_round_trip() {
        let mut unpacker = unpacker_for(|p| {
            p.pack_f32(1.5);
            p.pack_f64(-2.25);
        });
        assert_eq!(unpacker.unpack_f32().unwrap(), 1.5);
        assert_eq!(unpacker.unpack_f64().unwrap(), -2.25);
    }

    #[test]
    fn test_float_no_cross_convert() {
        let mut unpacker = unpacker_for(|p| p.pack_f64(1.0));
        assert!(matches!(
            unpacker.unpack_f32(),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_bool_and_string_round_trip() {
        let mut unpacker = unpacker_for(|p| {
            p.pack_bool(true);
            p.pack_bool(false);
            p.pack_str("hello");
            p.pack_bytes(&[1, 2, 3]);
        });
        assert!(unpacker.unpack_bool().unwrap());
        assert!(!unpacker.unpack_bool().unwrap());
        assert_eq!(unpacker.unpack_str().unwrap(), "hello");
        assert_eq!(unpacker.unpack_bytes().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_long_bytes_round_trip() {
        let long = vec![0xabu8; 40000];
        let mut unpacker = unpacker_for(|p| p.pack_bytes(&long));
        assert_eq!(unpacker.unpack_bytes().unwrap(), long);
    }

    #[test]
    fn test_widening_signed_tag_to_unsigned_accessor() {
        // 200000 packs through the int32 path; the u32 accessor still
        // reads it back.
        let mut unpacker = unpacker_for(|p| p.pack_i32(200_000));
        assert_eq!(unpacker.unpack_u32().unwrap(), 200_000);
    }

    #[test]
    fn test_widening_u8_to_u64_accessor() {
        let mut unpacker = unpacker_for(|p| p.pack_u64(200));
        assert_eq!(unpacker.unpack_u64().unwrap(), 200);
    }

    #[test]
    fn test_negative_rejected_by_unsigned_accessor() {
        let mut unpacker = unpacker_for(|p| p.pack_i64(-5));
        assert!(matches!(
            unpacker.unpack_u32(),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut unpacker = unpacker_for(|p| p.pack_u64(1 << 40));
        assert!(matches!(
            unpacker.unpack_u32(),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_input() {
        let mut unpacker = Unpacker::new();
        unpacker.attach(&[tags::UINT32, 0x01, 0x02]);
        assert_eq!(unpacker.unpack_u32(), Err(CodecError::Truncated));

        let mut unpacker = Unpacker::new();
        unpacker.attach(&[]);
        assert_eq!(unpacker.unpack_u32(), Err(CodecError::Truncated));
    }

    #[test]
    fn test_truncated_bytes_payload() {
        let mut unpacker = Unpacker::new();
        unpacker.attach(&[0xa5, b'a', b'b']);
        assert_eq!(unpacker.unpack_bytes(), Err(CodecError::Truncated));
    }

    #[test]
    fn test_container_tags_unsupported() {
        for tag in [
            tags::ARRAY16,
            tags::ARRAY32,
            tags::MAP16,
            tags::MAP32,
            0x91, // fixarray of 1
            0x82, // fixmap of 2
        ] {
            let mut unpacker = Unpacker::new();
            unpacker.attach(&[tag]);
            assert_eq!(
                unpacker.unpack_u32(),
                Err(CodecError::Unsupported(tag)),
                "tag {:#x}",
                tag
            );
        }
    }

    #[test]
    fn test_type_mismatch_not_silently_coerced() {
        let mut unpacker = unpacker_for(|p| p.pack_bool(true));
        assert!(matches!(
            unpacker.unpack_u32(),
            Err(CodecError::TypeMismatch { .. })
        ));

        let mut unpacker = unpacker_for(|p| p.pack_null());
        assert!(matches!(
            unpacker.unpack_bytes(),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_attach_resets_state() {
        let mut unpacker = unpacker_for(|p| p.pack_u64(7));
        assert_eq!(unpacker.unpack_u64().unwrap(), 7);

        let mut packer = Packer::new();
        packer.pack_u64(9);
        unpacker.attach(packer.as_bytes());
        assert_eq!(unpacker.unpack_u64().unwrap(), 9);
        assert_eq!(unpacker.remaining(), 0);
    }

    #[test]
    fn test_big_endian_round_trip() {
        let mut packer = Packer::with_order(ByteOrder::BigEndian);
        packer.pack_i64(-70000);
        let mut unpacker = Unpacker::with_order(ByteOrder::BigEndian);
        unpacker.attach(packer.as_bytes());
        assert_eq!(unpacker.unpack_i64().unwrap(), -70000);
    }
}
