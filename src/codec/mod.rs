//! Binary codec module
//!
//! A tag-prefixed variable-length encoding for scalars, strings and
//! byte buffers. Integers take the smallest tag that fits, floats are
//! fixed-width IEEE-754, and byte strings are length-prefixed. Only
//! scalar/bytes payloads are supported; container tags decode to an
//! unsupported-tag error by design.

pub mod pack;
pub mod pool;
pub mod tags;
pub mod unpack;

pub use pack::{ByteOrder, Packer};
pub use pool::CodecPool;
pub use unpack::Unpacker;
