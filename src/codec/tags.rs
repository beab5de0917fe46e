//! Wire tag values. These must match the peer byte-for-byte.

/// Positive fixnum: the tag byte itself carries a 7-bit value.
pub const FIXNUM: u8 = 0x00;
/// Negative fixnum: low 5 bits carry the value, biased by -32.
pub const NEGATIVE_FIXNUM: u8 = 0xe0;

pub const INT8: u8 = 0xd0;
pub const INT16: u8 = 0xd1;
pub const INT32: u8 = 0xd2;
pub const INT64: u8 = 0xd3;

pub const UINT8: u8 = 0xcc;
pub const UINT16: u8 = 0xcd;
pub const UINT32: u8 = 0xce;
pub const UINT64: u8 = 0xcf;

pub const NULL: u8 = 0xc0;
pub const FALSE: u8 = 0xc2;
pub const TRUE: u8 = 0xc3;

pub const FLOAT32: u8 = 0xca;
pub const FLOAT64: u8 = 0xcb;

/// Short bytes: low 5 bits of the tag carry the length (0-31).
pub const FIXBYTES: u8 = 0xa0;
pub const BYTES16: u8 = 0xda;
pub const BYTES32: u8 = 0xdb;

// Container tags. Recognized so they can be rejected as unsupported
// rather than misread as something else.
pub const ARRAY16: u8 = 0xdc;
pub const ARRAY32: u8 = 0xdd;
pub const MAP16: u8 = 0xde;
pub const MAP32: u8 = 0xdf;
pub const FIXARRAY: u8 = 0x90;
pub const FIXMAP: u8 = 0x80;

pub const MAX_5BIT: u32 = 0x1f;
pub const MAX_7BIT: u32 = 0x7f;
pub const MAX_8BIT: u32 = 0xff;
pub const MAX_15BIT: u32 = 0x7fff;
pub const MAX_16BIT: u32 = 0xffff;
pub const MAX_31BIT: u32 = 0x7fff_ffff;
