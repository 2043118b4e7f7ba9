//! # Signature Format Conversion
//!
//! ECDSA produces a pair of integers `(r, s)`. Two serializations of that
//! pair cross the trust boundary:
//!
//! - **Structured (DER)** — `SEQUENCE { INTEGER r, INTEGER s }`. Variable
//!   length, each integer minimally encoded with a `0x00` prefix when its
//!   top bit is set. This is what signing emits and what gets stored.
//! - **Raw** — `r || s`, each left-padded to 48 bytes, 96 bytes total. This
//!   is what raw-form verifiers (WebCrypto among them) consume.
//!
//! The parser is an explicit stage-by-stage reader over a bounds-checked
//! cursor. Every failure names the stage it happened in; nothing panics on
//! hostile input.
//!
//! ```text
//! 30 len | 02 rlen [00] r... | 02 slen [00] s...
//! ^^       ^^                  ^^
//! SequenceTag / SequenceLength / IntegerTag(R) / IntegerLength(R) / ...
//! ```

use std::fmt;

use thiserror::Error;

use crate::config::{COORDINATE_SIZE, RAW_SIGNATURE_LENGTH};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;

/// Long-form lengths wider than this are rejected outright. A P-384
/// signature never needs more than one length byte.
const MAX_LENGTH_OCTETS: usize = 2;

/// Which half of the signature is being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    R,
    S,
}

/// Parser position, reported in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SequenceTag,
    SequenceLength,
    IntegerTag(Half),
    IntegerLength(Half),
    IntegerValue(Half),
    Trailing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::SequenceTag => write!(f, "sequence tag"),
            Stage::SequenceLength => write!(f, "sequence length"),
            Stage::IntegerTag(h) => write!(f, "{:?} tag", h),
            Stage::IntegerLength(h) => write!(f, "{:?} length", h),
            Stage::IntegerValue(h) => write!(f, "{:?} value", h),
            Stage::Trailing => write!(f, "end of input"),
        }
    }
}

/// Errors from signature format conversion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed signature at {stage}: {reason}")]
    MalformedSignature { stage: Stage, reason: &'static str },
}

fn malformed(stage: Stage, reason: &'static str) -> CodecError {
    CodecError::MalformedSignature { stage, reason }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over the DER bytes.
struct DerReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn byte(&mut self, stage: Stage) -> Result<u8, CodecError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| malformed(stage, "unexpected end of input"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize, stage: Stage) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(malformed(stage, "length exceeds remaining input"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn expect_tag(&mut self, tag: u8, stage: Stage) -> Result<(), CodecError> {
        if self.byte(stage)? != tag {
            return Err(malformed(stage, "unexpected tag"));
        }
        Ok(())
    }

    /// Reads a definite length in short or (at most two-octet) long form.
    fn length(&mut self, stage: Stage) -> Result<usize, CodecError> {
        let first = self.byte(stage)?;
        if first < 0x80 {
            return Ok(first as usize);
        }
        let octets = (first & 0x7f) as usize;
        if octets == 0 {
            return Err(malformed(stage, "indefinite length"));
        }
        if octets > MAX_LENGTH_OCTETS {
            return Err(malformed(stage, "length too wide"));
        }
        let mut len = 0usize;
        for &b in self.take(octets, stage)? {
            len = (len << 8) | b as usize;
        }
        if len < 0x80 {
            return Err(malformed(stage, "non-minimal long-form length"));
        }
        Ok(len)
    }

    /// Reads one INTEGER and returns its magnitude with sign padding
    /// stripped. The result is at most `COORDINATE_SIZE` bytes.
    fn integer(&mut self, half: Half) -> Result<&'a [u8], CodecError> {
        self.expect_tag(TAG_INTEGER, Stage::IntegerTag(half))?;
        let len = self.length(Stage::IntegerLength(half))?;
        let stage = Stage::IntegerValue(half);
        if len == 0 {
            return Err(malformed(stage, "empty integer"));
        }
        if len > COORDINATE_SIZE + 1 {
            return Err(malformed(stage, "integer wider than coordinate"));
        }
        let value = self.take(len, stage)?;
        if value[0] & 0x80 != 0 {
            return Err(malformed(stage, "negative integer"));
        }
        let magnitude = strip_leading_zeros(value);
        if magnitude.len() > COORDINATE_SIZE {
            return Err(malformed(stage, "integer wider than coordinate"));
        }
        Ok(magnitude)
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Converts a DER-encoded signature into the 96-byte `r || s` form.
///
/// The outer SEQUENCE length must account for exactly the rest of the
/// buffer, and the two INTEGERs must consume it completely.
pub fn to_raw(der: &[u8]) -> Result<[u8; RAW_SIGNATURE_LENGTH], CodecError> {
    let mut reader = DerReader::new(der);

    reader.expect_tag(TAG_SEQUENCE, Stage::SequenceTag)?;
    let body_len = reader.length(Stage::SequenceLength)?;
    if body_len != reader.remaining() {
        return Err(malformed(
            Stage::SequenceLength,
            "sequence length disagrees with buffer size",
        ));
    }

    let r = reader.integer(Half::R)?;
    let s = reader.integer(Half::S)?;

    if reader.remaining() != 0 {
        return Err(malformed(Stage::Trailing, "trailing bytes after s"));
    }

    let mut raw = [0u8; RAW_SIGNATURE_LENGTH];
    raw[COORDINATE_SIZE - r.len()..COORDINATE_SIZE].copy_from_slice(r);
    raw[RAW_SIGNATURE_LENGTH - s.len()..].copy_from_slice(s);
    Ok(raw)
}

/// Converts a 96-byte `r || s` signature into minimal DER.
///
/// Leading zeros are dropped and a single `0x00` is re-added to any half
/// whose top bit is set, so both integers stay non-negative.
pub fn to_structured(raw: &[u8; RAW_SIGNATURE_LENGTH]) -> Vec<u8> {
    let r = encode_integer(&raw[..COORDINATE_SIZE]);
    let s = encode_integer(&raw[COORDINATE_SIZE..]);

    // Body is at most 2 * (2 + 49) = 102 bytes: always short-form length.
    let mut out = Vec::with_capacity(2 + r.len() + s.len());
    out.push(TAG_SEQUENCE);
    out.push((r.len() + s.len()) as u8);
    out.extend_from_slice(&r);
    out.extend_from_slice(&s);
    out
}

fn encode_integer(coordinate: &[u8]) -> Vec<u8> {
    let mut magnitude = strip_leading_zeros(coordinate);
    if magnitude.is_empty() {
        magnitude = &[0];
    }
    let pad = magnitude[0] & 0x80 != 0;
    let len = magnitude.len() + usize::from(pad);

    let mut out = Vec::with_capacity(2 + len);
    out.push(TAG_INTEGER);
    out.push(len as u8);
    if pad {
        out.push(0);
    }
    out.extend_from_slice(magnitude);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use p384::ecdsa::signature::{Signer, Verifier};
    use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
    use rand::rngs::OsRng;

    fn sample_signature(msg: &[u8]) -> (SigningKey, Signature) {
        let sk = SigningKey::random(&mut OsRng);
        let sig: Signature = sk.sign(msg);
        (sk, sig)
    }

    /// Builds DER by hand so tests control every byte.
    fn der_from_parts(r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut body = vec![TAG_INTEGER, r.len() as u8];
        body.extend_from_slice(r);
        body.push(TAG_INTEGER);
        body.push(s.len() as u8);
        body.extend_from_slice(s);
        let mut out = vec![TAG_SEQUENCE, body.len() as u8];
        out.extend(body);
        out
    }

    #[test]
    fn real_signature_converts_to_library_raw_form() {
        let (_, sig) = sample_signature(b"alice@example.com");
        let der = sig.to_der();
        let raw = to_raw(der.as_bytes()).unwrap();
        assert_eq!(raw.as_slice(), sig.to_bytes().as_slice());
    }

    #[test]
    fn raw_form_verifies_where_der_verifies() {
        let msg = b"alice@example.com";
        let (sk, sig) = sample_signature(msg);
        let vk = VerifyingKey::from(&sk);

        let raw = to_raw(sig.to_der().as_bytes()).unwrap();
        let from_raw = Signature::from_slice(&raw).unwrap();
        assert!(vk.verify(msg, &from_raw).is_ok());
    }

    #[test]
    fn structured_roundtrip_matches_canonical_der() {
        // The library emits minimal DER, so converting back is byte-exact.
        for i in 0..16 {
            let (_, sig) = sample_signature(format!("user{i}@example.com").as_bytes());
            let der = sig.to_der();
            let raw = to_raw(der.as_bytes()).unwrap();
            assert_eq!(to_structured(&raw), der.as_bytes());
        }
    }

    #[test]
    fn high_bit_halves_get_sign_byte() {
        let mut raw = [0u8; RAW_SIGNATURE_LENGTH];
        raw[0] = 0x80;
        raw[COORDINATE_SIZE] = 0xff;
        let der = to_structured(&raw);

        assert_eq!(der[0], TAG_SEQUENCE);
        assert_eq!(der[2], TAG_INTEGER);
        assert_eq!(der[3], 49);
        assert_eq!(der[4], 0x00);
        assert_eq!(der[5], 0x80);
        assert_eq!(to_raw(&der).unwrap(), raw);
    }

    #[test]
    fn short_integers_are_left_padded() {
        let der = der_from_parts(&[0x01, 0x02], &[0x7f]);
        let raw = to_raw(&der).unwrap();

        assert!(raw[..COORDINATE_SIZE - 2].iter().all(|&b| b == 0));
        assert_eq!(&raw[COORDINATE_SIZE - 2..COORDINATE_SIZE], &[0x01, 0x02]);
        assert!(raw[COORDINATE_SIZE..RAW_SIGNATURE_LENGTH - 1]
            .iter()
            .all(|&b| b == 0));
        assert_eq!(raw[RAW_SIGNATURE_LENGTH - 1], 0x7f);
    }

    #[test]
    fn redundant_zero_padding_is_accepted_and_canonicalised() {
        // A non-minimal encoding still describes the same (r, s).
        let der = der_from_parts(&[0x00, 0x00, 0x05], &[0x00, 0x09]);
        let raw = to_raw(&der).unwrap();
        assert_eq!(raw[COORDINATE_SIZE - 1], 0x05);
        assert_eq!(raw[RAW_SIGNATURE_LENGTH - 1], 0x09);

        let canonical = to_structured(&raw);
        assert_eq!(canonical, der_from_parts(&[0x05], &[0x09]));
    }

    #[test]
    fn zero_halves_encode_as_single_zero_byte() {
        let raw = [0u8; RAW_SIGNATURE_LENGTH];
        assert_eq!(to_structured(&raw), der_from_parts(&[0x00], &[0x00]));
    }

    #[test]
    fn rejects_wrong_outer_tag() {
        let mut der = der_from_parts(&[0x01], &[0x02]);
        der[0] = 0x31;
        let err = to_raw(&der).unwrap_err();
        assert!(matches!(
            err,
            CodecError::MalformedSignature {
                stage: Stage::SequenceTag,
                ..
            }
        ));
    }

    #[test]
    fn rejects_sequence_length_mismatch() {
        let mut der = der_from_parts(&[0x01], &[0x02]);
        der[1] += 1;
        assert!(to_raw(&der).is_err());

        let mut der = der_from_parts(&[0x01], &[0x02]);
        der.push(0x00);
        assert!(to_raw(&der).is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        let (_, sig) = sample_signature(b"truncate me");
        let der = sig.to_der();
        let bytes = der.as_bytes();
        for cut in 0..bytes.len() {
            assert!(to_raw(&bytes[..cut]).is_err(), "accepted prefix of {cut}");
        }
    }

    #[test]
    fn rejects_integer_length_overrunning_sequence() {
        let mut der = der_from_parts(&[0x01], &[0x02]);
        // r claims 2 bytes, stealing s's tag.
        der[3] = 2;
        assert!(to_raw(&der).is_err());
    }

    #[test]
    fn rejects_negative_integer() {
        let der = der_from_parts(&[0x80], &[0x01]);
        let err = to_raw(&der).unwrap_err();
        assert!(matches!(
            err,
            CodecError::MalformedSignature {
                stage: Stage::IntegerValue(Half::R),
                ..
            }
        ));
    }

    #[test]
    fn rejects_oversized_integer() {
        let r = [0x01u8; COORDINATE_SIZE + 1];
        let der = der_from_parts(&r, &[0x01]);
        assert!(to_raw(&der).is_err());
    }

    #[test]
    fn rejects_empty_integer_and_indefinite_length() {
        assert!(to_raw(&der_from_parts(&[], &[0x01])).is_err());
        assert!(to_raw(&[TAG_SEQUENCE, 0x80, TAG_INTEGER, 0x01, 0x01]).is_err());
    }

    #[test]
    fn rejects_non_minimal_long_form_length() {
        // 0x81 in front of a body shorter than 128 bytes is not DER.
        let short = der_from_parts(&[0x01], &[0x02]);
        let mut long_form = vec![TAG_SEQUENCE, 0x81, short[1]];
        long_form.extend_from_slice(&short[2..]);
        assert!(to_raw(&long_form).is_err());
    }

    #[test]
    fn empty_input_is_malformed() {
        assert!(to_raw(&[]).is_err());
    }
}
