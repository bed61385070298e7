//! Integer and string codec (C1).
//!
//! Unsigned integers are encoded little-endian, 7 bits per byte, with the
//! high bit of each byte set on every byte but the last (the same shape as
//! the varints used throughout the flint on-disk format and wire protocol).
//! Decoding never reads past the end of the supplied slice; on partial
//! input it reports [`DecodeError::NeedMore`] distinctly from
//! [`DecodeError::Malformed`] so callers can tell "pull more bytes from the
//! transport" apart from "the peer sent garbage".

use bytes::BufMut;

/// Maximum number of varint bytes for a `u64` under 7-bits-per-byte encoding.
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer was fully consumed before the value finished decoding;
    /// the caller should pull more bytes and retry.
    NeedMore,
    /// The bytes present could never form a valid encoding (e.g. the varint
    /// continuation chain is too long, or a string's declared length
    /// exceeds the buffer even after being told there is no more input).
    Malformed,
}

/// A read-only cursor over an in-memory buffer, used to decode successive
/// fields without copying.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Whether every byte of the underlying buffer has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Decode a variable-width unsigned integer, advancing the cursor past
    /// it on success.
    pub fn decode_uint(&mut self) -> Result<u64, DecodeError> {
        let buf = self.remaining();
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        for (i, &byte) in buf.iter().enumerate() {
            if i >= MAX_VARINT_LEN {
                return Err(DecodeError::Malformed);
            }
            let payload = (byte & 0x7f) as u64;
            value |= payload
                .checked_shl(shift)
                .ok_or(DecodeError::Malformed)?;
            shift += 7;
            if byte & 0x80 == 0 {
                self.pos += i + 1;
                return Ok(value);
            }
        }
        Err(DecodeError::NeedMore)
    }

    /// Decode a single raw byte, advancing the cursor past it.
    pub fn decode_byte(&mut self) -> Result<u8, DecodeError> {
        match self.remaining().first() {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => Err(DecodeError::NeedMore),
        }
    }

    /// Decode a length-prefixed byte string.
    pub fn decode_string(&mut self) -> Result<&'a [u8], DecodeError> {
        let mark = self.pos;
        let len = match self.decode_uint() {
            Ok(len) => len,
            Err(e) => {
                self.pos = mark;
                return Err(e);
            }
        };
        let len = len as usize;
        if self.remaining().len() < len {
            self.pos = mark;
            return Err(DecodeError::NeedMore);
        }
        let s = &self.remaining()[..len];
        self.pos += len;
        Ok(s)
    }

    /// Take `n` raw bytes verbatim, advancing the cursor past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining().len() < n {
            return Err(DecodeError::NeedMore);
        }
        let s = &self.remaining()[..n];
        self.pos += n;
        Ok(s)
    }
}

/// Encode a variable-width unsigned integer, appending it to `out`.
pub fn encode_uint(mut value: u64, out: &mut impl BufMut) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode a variable-width unsigned integer into a freshly allocated vector.
pub fn encode_uint_vec(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    encode_uint(value, &mut out);
    out
}

/// Encode a length-prefixed byte string, appending it to `out`.
pub fn encode_string(s: &[u8], out: &mut impl BufMut) {
    encode_uint(s.len() as u64, out);
    out.put_slice(s);
}
