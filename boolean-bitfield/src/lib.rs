//! Decoding of the hex-encoded bitfields served by the beacon node API, plus the matching
//! encoders used to build fixtures.
//!
//! Two flavours exist on the wire:
//!
//! - A *bit-vector* has a length fixed by context (e.g. the sync committee size) and every bit is
//!   meaningful.
//! - A *bit-list* is variable length. Its length is encoded by a sentinel: the highest set bit
//!   marks one-past-the-end and is not itself part of the list.
//!
//! In both cases bits are read least-significant-bit first, in byte order.

use std::fmt;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// The input was not valid hex.
    InvalidHex(String),
    /// A bit-list contained no set bit, so its length cannot be determined.
    MissingSentinel,
    /// A decoded bitfield did not have the length required by its context.
    LengthMismatch { expected: usize, found: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An immutable, decoded sequence of bits.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Bitfield {
    bits: Vec<bool>,
}

impl Bitfield {
    /// Decode a fixed-length bit-vector. See `decode_bit_vector`.
    pub fn from_bit_vector_hex(hex: &str) -> Result<Self, Error> {
        decode_bit_vector(hex).map(|bits| Self { bits })
    }

    /// Decode a sentinel-terminated bit-list. See `decode_bit_list`.
    pub fn from_bit_list_hex(hex: &str) -> Result<Self, Error> {
        decode_bit_list(hex).map(|bits| Self { bits })
    }

    /// Returns an error unless the bitfield has exactly `expected` bits.
    pub fn expect_len(self, expected: usize) -> Result<Self, Error> {
        if self.bits.len() == expected {
            Ok(self)
        } else {
            Err(Error::LengthMismatch {
                expected,
                found: self.bits.len(),
            })
        }
    }

    /// Read the value of a bit. Out-of-range indices read as `false`.
    pub fn get(&self, i: usize) -> bool {
        self.bits.get(i).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn num_set_bits(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, Error> {
    let stripped = hex.strip_prefix("0x").unwrap_or(hex);
    hex::decode(stripped).map_err(|e| Error::InvalidHex(format!("{:?}", e)))
}

fn expand(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
        .collect()
}

/// Expand every bit of every byte, least-significant bit first.
///
/// The result always has `8 * bytes` entries; callers verify it against the length implied by
/// their context.
pub fn decode_bit_vector(hex: &str) -> Result<Vec<bool>, Error> {
    hex_to_bytes(hex).map(|bytes| expand(&bytes))
}

/// Expand the bytes like `decode_bit_vector`, then strip the length sentinel (the highest set
/// bit) along with all positions following it.
pub fn decode_bit_list(hex: &str) -> Result<Vec<bool>, Error> {
    let mut bits = decode_bit_vector(hex)?;
    let sentinel = bits.iter().rposition(|b| *b).ok_or(Error::MissingSentinel)?;
    bits.truncate(sentinel);
    Ok(bits)
}

fn pack(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// The inverse of `decode_bit_vector`. `bits` is zero-padded to a whole number of bytes.
pub fn encode_bit_vector(bits: &[bool]) -> String {
    format!("0x{}", hex::encode(pack(bits)))
}

/// The inverse of `decode_bit_list`: appends the sentinel after the last entry.
pub fn encode_bit_list(bits: &[bool]) -> String {
    let mut with_sentinel = bits.to_vec();
    with_sentinel.push(true);
    encode_bit_vector(&with_sentinel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_vector_is_lsb_first() {
        assert_eq!(
            decode_bit_vector("0x01").unwrap(),
            vec![true, false, false, false, false, false, false, false]
        );
        assert_eq!(
            decode_bit_vector("80").unwrap(),
            vec![false, false, false, false, false, false, false, true]
        );
    }

    #[test]
    fn bit_vector_keeps_byte_order() {
        let bits = decode_bit_vector("0x0001").unwrap();
        assert_eq!(bits.len(), 16);
        assert!(!bits[0]);
        assert!(bits[8]);
        assert_eq!(bits.iter().filter(|b| **b).count(), 1);
    }

    #[test]
    fn bit_list_strips_sentinel() {
        assert_eq!(decode_bit_list("0x03").unwrap(), vec![true]);
        assert_eq!(decode_bit_list("0x01").unwrap(), Vec::<bool>::new());
        // Sentinel in the second byte: eight real entries, the first set.
        assert_eq!(
            decode_bit_list("0x0101").unwrap(),
            vec![true, false, false, false, false, false, false, false]
        );
    }

    #[test]
    fn bit_list_ignores_trailing_zero_bytes() {
        assert_eq!(decode_bit_list("0x0500").unwrap(), vec![true, false]);
    }

    #[test]
    fn bit_list_without_sentinel_is_malformed() {
        assert_eq!(decode_bit_list("0x0000"), Err(Error::MissingSentinel));
        assert_eq!(decode_bit_list("0x"), Err(Error::MissingSentinel));
    }

    #[test]
    fn invalid_hex_is_malformed() {
        assert!(matches!(decode_bit_vector("0xzz"), Err(Error::InvalidHex(_))));
        assert!(matches!(decode_bit_list("0x123"), Err(Error::InvalidHex(_))));
    }

    #[test]
    fn encoders_match_wire_format() {
        assert_eq!(encode_bit_list(&[true]), "0x03");
        assert_eq!(encode_bit_list(&[]), "0x01");
        assert_eq!(encode_bit_vector(&[true, false, false]), "0x01");
        let bits = vec![false, true, true, false, false, false, false, false, true];
        assert_eq!(decode_bit_list(&encode_bit_list(&bits)).unwrap(), bits);
    }

    #[test]
    fn bitfield_length_check() {
        let field = Bitfield::from_bit_vector_hex("0xff00").unwrap();
        assert_eq!(field.num_set_bits(), 8);
        assert!(field.get(7));
        assert!(!field.get(8));
        assert!(!field.get(100));
        assert!(field.clone().expect_len(16).is_ok());
        assert_eq!(
            field.expect_len(512),
            Err(Error::LengthMismatch {
                expected: 512,
                found: 16
            })
        );
    }
}
