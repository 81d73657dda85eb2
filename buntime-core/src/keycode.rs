//! # Key Encoding
//!
//! Canonical, order-preserving byte encoding for the composite keys stateful
//! plugins persist. The encoding is type-tagged so keys of mixed types sort
//! in one total, deterministic order:
//!
//! ```text
//! bytes < string < number < bigint < bool
//! ```
//!
//! and within a type in the natural order. The guarantee callers rely on is
//! `encode(a) < encode(b)` (bytewise) iff `a < b` in the canonical order, so
//! range scans over an ordered store see keys exactly as the application
//! ordered them.
//!
//! Byte strings and text are escaped (`0x00` → `0x00 0xFF`) and terminated
//! with a lone `0x00`, which keeps prefixes ordered before their extensions.
//! Numbers are IEEE-754 bits with the sign fold applied so the byte order
//! matches numeric order; bigints are sign-folded big-endian two's
//! complement.

use std::cmp::Ordering;

const TAG_BYTES: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_NUMBER: u8 = 0x03;
const TAG_BIGINT: u8 = 0x04;
const TAG_BOOL: u8 = 0x05;

/// One element of a composite key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    Bytes(Vec<u8>),
    String(String),
    Number(f64),
    BigInt(i128),
    Bool(bool),
}

impl KeyPart {
    fn type_rank(&self) -> u8 {
        match self {
            KeyPart::Bytes(_) => TAG_BYTES,
            KeyPart::String(_) => TAG_STRING,
            KeyPart::Number(_) => TAG_NUMBER,
            KeyPart::BigInt(_) => TAG_BIGINT,
            KeyPart::Bool(_) => TAG_BOOL,
        }
    }

    /// Canonical comparison: type rank first, then the natural within-type
    /// order. Numbers use the IEEE total order, which is exactly the order
    /// the encoding produces.
    pub fn canonical_cmp(&self, other: &KeyPart) -> Ordering {
        match (self, other) {
            (KeyPart::Bytes(a), KeyPart::Bytes(b)) => a.cmp(b),
            (KeyPart::String(a), KeyPart::String(b)) => a.cmp(b),
            (KeyPart::Number(a), KeyPart::Number(b)) => a.total_cmp(b),
            (KeyPart::BigInt(a), KeyPart::BigInt(b)) => a.cmp(b),
            (KeyPart::Bool(a), KeyPart::Bool(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Errors produced when decoding a key buffer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyDecodeError {
    #[error("unknown type tag {0:#04x} at offset {1}")]
    UnknownTag(u8, usize),
    #[error("truncated key at offset {0}")]
    Truncated(usize),
    #[error("invalid utf-8 in string part at offset {0}")]
    InvalidUtf8(usize),
}

/// Encode a composite key. Parts concatenate; a key that is a prefix of
/// another sorts before it.
pub fn encode_key(parts: &[KeyPart]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.len() * 10);
    for part in parts {
        encode_part(part, &mut out);
    }
    out
}

fn encode_part(part: &KeyPart, out: &mut Vec<u8>) {
    match part {
        KeyPart::Bytes(b) => {
            out.push(TAG_BYTES);
            escape_into(b, out);
        }
        KeyPart::String(s) => {
            out.push(TAG_STRING);
            escape_into(s.as_bytes(), out);
        }
        KeyPart::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&fold_f64(*n));
        }
        KeyPart::BigInt(i) => {
            out.push(TAG_BIGINT);
            // flipping the sign bit turns two's complement into an
            // unsigned value with the same relative order
            let folded = (*i as u128) ^ (1u128 << 127);
            out.extend_from_slice(&folded.to_be_bytes());
        }
        KeyPart::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
    }
}

// 0x00 is the terminator, so embedded zeros become 0x00 0xFF. The escape
// sorts after the terminator, which keeps "a" < "a\0..." < "ab".
fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        out.push(byte);
        if byte == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
}

// Sign fold: negatives invert every bit, non-negatives set the sign bit.
// Resulting bytes sort -inf .. -0 .. +0 .. +inf, NaNs at the extremes.
fn fold_f64(n: f64) -> [u8; 8] {
    let bits = n.to_bits();
    let folded = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    folded.to_be_bytes()
}

fn unfold_f64(bytes: [u8; 8]) -> f64 {
    let folded = u64::from_be_bytes(bytes);
    let bits = if folded & (1 << 63) != 0 {
        folded & !(1 << 63)
    } else {
        !folded
    };
    f64::from_bits(bits)
}

/// Decode a buffer produced by [`encode_key`].
pub fn decode_key(buf: &[u8]) -> Result<Vec<KeyPart>, KeyDecodeError> {
    let mut parts = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let tag = buf[pos];
        pos += 1;
        match tag {
            TAG_BYTES => {
                let (bytes, next) = unescape_from(buf, pos)?;
                parts.push(KeyPart::Bytes(bytes));
                pos = next;
            }
            TAG_STRING => {
                let (bytes, next) = unescape_from(buf, pos)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| KeyDecodeError::InvalidUtf8(pos))?;
                parts.push(KeyPart::String(s));
                pos = next;
            }
            TAG_NUMBER => {
                let end = pos + 8;
                let bytes: [u8; 8] = buf
                    .get(pos..end)
                    .ok_or(KeyDecodeError::Truncated(pos))?
                    .try_into()
                    .unwrap();
                parts.push(KeyPart::Number(unfold_f64(bytes)));
                pos = end;
            }
            TAG_BIGINT => {
                let end = pos + 16;
                let bytes: [u8; 16] = buf
                    .get(pos..end)
                    .ok_or(KeyDecodeError::Truncated(pos))?
                    .try_into()
                    .unwrap();
                let folded = u128::from_be_bytes(bytes);
                parts.push(KeyPart::BigInt((folded ^ (1u128 << 127)) as i128));
                pos = end;
            }
            TAG_BOOL => {
                let byte = *buf.get(pos).ok_or(KeyDecodeError::Truncated(pos))?;
                parts.push(KeyPart::Bool(byte != 0));
                pos += 1;
            }
            other => return Err(KeyDecodeError::UnknownTag(other, pos - 1)),
        }
    }
    Ok(parts)
}

fn unescape_from(buf: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize), KeyDecodeError> {
    let mut out = Vec::new();
    loop {
        let byte = *buf.get(pos).ok_or(KeyDecodeError::Truncated(pos))?;
        pos += 1;
        if byte != 0x00 {
            out.push(byte);
            continue;
        }
        match buf.get(pos) {
            Some(0xFF) => {
                out.push(0x00);
                pos += 1;
            }
            _ => return Ok((out, pos)),
        }
    }
}
