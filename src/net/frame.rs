//! WebSocket frame codec
//!
//! Wire layout per frame: one header byte (fin bit | 3 reserved bits |
//! 4-bit opcode), one length byte (mask bit | 7-bit length class), an
//! optional extended length (16 or 64 bit big-endian), an optional
//! 4-byte masking key, then the payload. Payload bytes are XORed with
//! `mask[i % 4]` in both directions.

use bytes::{BufMut, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{GateError, NetworkError, ProtocolError};

/// Per-frame payload capacity for outbound messages. Larger logical
/// messages are split into continuation frames at this boundary.
pub const FRAME_CAPACITY: usize = 2048;

/// Worst-case frame header size: 2 header bytes + 8 length bytes +
/// 4 mask bytes.
pub const FRAME_HEADER_MAX: usize = 14;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const LEN_U16: u8 = 126;
const LEN_U64: u8 = 127;

/// Frame opcode. Continuation carries the middle and tail of a
/// fragmented message; the remaining values type a logical message or
/// a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xa => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    /// Masking key, present iff the frame came from a client role.
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

/// XOR the payload with the masking key. Involution: applying it twice
/// with the same key restores the original bytes.
pub fn apply_mask(mask: [u8; 4], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Fresh random masking key for a client-role frame.
pub fn random_mask() -> [u8; 4] {
    rand::thread_rng().gen()
}

/// `read_exact` with transport-error mapping: a clean EOF is a peer
/// close, anything else is a read failure.
pub(crate) async fn read_exact_net<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), GateError>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            GateError::Network(NetworkError::ConnectionClosed)
        } else {
            GateError::Network(NetworkError::ReadError(err.to_string()))
        }
    })?;
    Ok(())
}

/// Read and validate one frame header. Reserved bits or an unknown
/// opcode are protocol errors; the payload itself is left unread.
pub async fn read_header<R>(reader: &mut R) -> Result<FrameHeader, GateError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    read_exact_net(reader, &mut head).await?;
    let (first, second) = (head[0], head[1]);

    if first & RSV_BITS != 0 {
        return Err(ProtocolError::ReservedBits.into());
    }
    let opcode =
        Opcode::from_u8(first & 0x0f).ok_or(ProtocolError::InvalidOpcode(first & 0x0f))?;
    let fin = first & FIN_BIT != 0;
    let masked = second & MASK_BIT != 0;

    let payload_len = match second & 0x7f {
        LEN_U16 => {
            let mut ext = [0u8; 2];
            read_exact_net(reader, &mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        LEN_U64 => {
            let mut ext = [0u8; 8];
            read_exact_net(reader, &mut ext).await?;
            u64::from_be_bytes(ext)
        }
        len => len as u64,
    };

    let mask = if masked {
        let mut key = [0u8; 4];
        read_exact_net(reader, &mut key).await?;
        Some(key)
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        opcode,
        mask,
        payload_len,
    })
}

/// Append one encoded frame to `out`. When a mask is given the payload
/// is masked on the way in; the caller's slice is untouched.
pub fn write_frame(
    out: &mut BytesMut,
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    payload: &[u8],
) {
    out.reserve(FRAME_HEADER_MAX + payload.len());

    let fin_bit = if fin { FIN_BIT } else { 0 };
    out.put_u8(fin_bit | opcode as u8);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let length = payload.len();
    if length < LEN_U16 as usize {
        out.put_u8(length as u8 | mask_bit);
    } else if length <= u16::MAX as usize {
        out.put_u8(LEN_U16 | mask_bit);
        out.put_u16(length as u16);
    } else {
        out.put_u8(LEN_U64 | mask_bit);
        out.put_u64(length as u64);
    }

    match mask {
        Some(key) => {
            out.put_slice(&key);
            let start = out.len();
            out.put_slice(payload);
            apply_mask(key, &mut out[start..]);
        }
        None => out.put_slice(payload),
    }
}

/// Encode one logical message, fragmenting at [`FRAME_CAPACITY`]. The
/// first frame carries `opcode`, the rest continuation; fin is set only
/// on the last. A client role gets a fresh mask per frame.
pub fn write_message(out: &mut BytesMut, opcode: Opcode, masked: bool, payload: &[u8]) {
    let mask = || if masked { Some(random_mask()) } else { None };

    if payload.len() <= FRAME_CAPACITY {
        write_frame(out, true, opcode, mask(), payload);
        return;
    }

    let mut chunks = payload.chunks(FRAME_CAPACITY).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let fin = chunks.peek().is_none();
        let op = if first { opcode } else { Opcode::Continuation };
        write_frame(out, fin, op, mask(), chunk);
        first = false;
    }
}
