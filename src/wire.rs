//! Wire framing for coded symbols and control messages.
//!
//! All multi-byte fields are big-endian.
//!
//! # Symbol
//!
//! ```text
//! ┌───────┬─────────┬──────────┬───────────────┬──────────────┬───────────┬──────────┐
//! │ magic │ version │ flags    │ generation    │ [sequence]   │ coeffs    │ payload  │
//! │ (1B)  │ (1B)    │ (2B)     │ (4B)          │ (4B, opt.)   │ (N bytes) │ (S bytes)│
//! └───────┴─────────┴──────────┴───────────────┴──────────────┴───────────┴──────────┘
//! ```
//!
//! # Control
//!
//! * Ack: 4 bytes, generation id.
//! * Rank report: 6 bytes, generation id + u16 decode rank.
//!
//! Decoding never panics: wrong magic, wrong version, unknown flag bits or a
//! length that does not match `N` and `S` exactly yield `None`.

use bytes::{Buf, BufMut};

pub const MAGIC: u8 = 0xA7;
pub const VERSION: u8 = 1;

/// Fixed header bytes before the optional sequence field.
pub const HEADER_LEN: usize = 8;
pub const SEQUENCE_LEN: usize = 4;

pub const ACK_LEN: usize = 4;
pub const RANK_REPORT_LEN: usize = 6;

/// Header flag bits.
pub mod flags {
    /// A 4-byte sequence number follows the generation id.
    pub const HAS_SEQUENCE: u16 = 0x0001;
    /// Coefficients are a unit vector (raw source piece).
    pub const SYSTEMATIC: u16 = 0x0002;

    pub const KNOWN: u16 = HAS_SEQUENCE | SYSTEMATIC;
}

/// Total framed length of one symbol.
pub const fn symbol_len(piece_count: usize, piece_size: usize, with_sequence: bool) -> usize {
    HEADER_LEN + if with_sequence { SEQUENCE_LEN } else { 0 } + piece_count + piece_size
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolHeader {
    pub generation: u32,
    pub sequence: Option<u32>,
    pub systematic: bool,
}

impl SymbolHeader {
    pub fn new(generation: u32) -> Self {
        Self {
            generation,
            sequence: None,
            systematic: false,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_systematic(mut self, systematic: bool) -> Self {
        self.systematic = systematic;
        self
    }

    pub fn flags(&self) -> u16 {
        let mut bits = 0;
        if self.sequence.is_some() {
            bits |= flags::HAS_SEQUENCE;
        }
        if self.systematic {
            bits |= flags::SYSTEMATIC;
        }
        bits
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + if self.sequence.is_some() { SEQUENCE_LEN } else { 0 }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u16(self.flags());
        buf.put_u32(self.generation);
        if let Some(sequence) = self.sequence {
            buf.put_u32(sequence);
        }
    }

    /// Parse a header, leaving `buf` at the first coefficient byte.
    pub fn decode(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < HEADER_LEN {
            return None;
        }
        if buf.get_u8() != MAGIC || buf.get_u8() != VERSION {
            return None;
        }
        let bits = buf.get_u16();
        if bits & !flags::KNOWN != 0 {
            return None;
        }
        let generation = buf.get_u32();
        let sequence = if bits & flags::HAS_SEQUENCE != 0 {
            if buf.remaining() < SEQUENCE_LEN {
                return None;
            }
            Some(buf.get_u32())
        } else {
            None
        };
        Some(Self {
            generation,
            sequence,
            systematic: bits & flags::SYSTEMATIC != 0,
        })
    }
}

/// Borrowed view of a decoded symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolView<'a> {
    pub header: SymbolHeader,
    pub coefficients: &'a [u8],
    pub payload: &'a [u8],
}

/// Append a framed symbol to `buf`.
pub fn encode_symbol<B: BufMut>(buf: &mut B, header: &SymbolHeader, coefficients: &[u8], payload: &[u8]) {
    header.encode(buf);
    buf.put_slice(coefficients);
    buf.put_slice(payload);
}

/// Write `header` at the front of `dst` and hand back the coefficient and
/// payload regions so the encoder can fill them in place.
///
/// Returns `(framed_len, coefficients, payload)`, or `None` if `dst` is too
/// small.
pub fn frame_in_place<'a>(
    dst: &'a mut [u8],
    header: &SymbolHeader,
    piece_count: usize,
    piece_size: usize,
) -> Option<(usize, &'a mut [u8], &'a mut [u8])> {
    let header_len = header.encoded_len();
    let total = header_len + piece_count + piece_size;
    if dst.len() < total {
        return None;
    }
    let (head, body) = dst[..total].split_at_mut(header_len);
    let mut cursor: &mut [u8] = head;
    header.encode(&mut cursor);
    let (coefficients, payload) = body.split_at_mut(piece_count);
    Some((total, coefficients, payload))
}

/// Parse one symbol of exactly `N + S` body bytes.
pub fn decode_symbol(buf: &[u8], piece_count: usize, piece_size: usize) -> Option<SymbolView<'_>> {
    let mut cursor = buf;
    let header = SymbolHeader::decode(&mut cursor)?;
    if cursor.len() != piece_count + piece_size {
        return None;
    }
    let (coefficients, payload) = cursor.split_at(piece_count);
    Some(SymbolView {
        header,
        coefficients,
        payload,
    })
}

/// Generation id of a symbol without validating its body.
pub fn peek_generation(buf: &[u8]) -> Option<u32> {
    if buf.len() < HEADER_LEN || buf[0] != MAGIC || buf[1] != VERSION {
        return None;
    }
    Some(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]))
}

pub fn encode_ack(generation: u32) -> [u8; ACK_LEN] {
    generation.to_be_bytes()
}

pub fn decode_ack(buf: &[u8]) -> Option<u32> {
    if buf.len() != ACK_LEN {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Receiver → sender feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Generation fully decoded.
    Ack(u32),
    /// Current decode rank, for the sender's watchdog.
    Rank { generation: u32, rank: u16 },
}

impl ControlMessage {
    pub fn encoded_len(&self) -> usize {
        match self {
            ControlMessage::Ack(_) => ACK_LEN,
            ControlMessage::Rank { .. } => RANK_REPORT_LEN,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match *self {
            ControlMessage::Ack(generation) => buf.put_u32(generation),
            ControlMessage::Rank { generation, rank } => {
                buf.put_u32(generation);
                buf.put_u16(rank);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }

    /// Control messages are told apart by length.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut cursor = buf;
        match buf.len() {
            ACK_LEN => Some(ControlMessage::Ack(cursor.get_u32())),
            RANK_REPORT_LEN => Some(ControlMessage::Rank {
                generation: cursor.get_u32(),
                rank: cursor.get_u16(),
            }),
            _ => None,
        }
    }
}
