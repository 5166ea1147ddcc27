//! LEB128 variable-length integers, limited to 32-bit values.
//!
//! Unsigned values use 7 payload bits per byte with the high bit as the
//! continuation flag. Signed values use the sign-extending variant: the last
//! byte's bit 6 carries the sign. The byte codec is gimli's; this module
//! adds size prediction and the 32-bit range checks.

use gimli::{EndianSlice, LittleEndian, leb128};

use crate::error::{AssembleError, Result};

/// Number of bytes `value` occupies as an unsigned LEB128.
pub fn unsigned_leb128_size(value: u32) -> usize {
    let bits = 32 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Number of bytes `value` occupies as a signed LEB128.
pub fn signed_leb128_size(value: i32) -> usize {
    // Significant bits plus the sign bit.
    let x = (value ^ (value >> 31)) as u32;
    let bits = 33 - x.leading_zeros() as usize;
    bits.div_ceil(7)
}

pub fn encode_unsigned_leb128(out: &mut Vec<u8>, value: u32) {
    // Writes into a Vec cannot fail.
    let _ = leb128::write::unsigned(out, u64::from(value));
}

pub fn encode_signed_leb128(out: &mut Vec<u8>, value: i32) {
    let _ = leb128::write::signed(out, i64::from(value));
}

/// Decode an unsigned LEB128 starting at `*pos`, advancing `*pos`.
pub fn decode_unsigned_leb128(data: &[u8], pos: &mut usize) -> Result<u32> {
    let value = read_at(data, pos, leb128::read::unsigned)?;
    u32::try_from(value).map_err(|_| AssembleError::malformed("leb128", "value exceeds 32 bits"))
}

/// Decode a signed LEB128 starting at `*pos`, advancing `*pos`.
pub fn decode_signed_leb128(data: &[u8], pos: &mut usize) -> Result<i32> {
    let value = read_at(data, pos, leb128::read::signed)?;
    i32::try_from(value).map_err(|_| AssembleError::malformed("leb128", "value exceeds 32 bits"))
}

fn read_at<'a, T>(
    data: &'a [u8],
    pos: &mut usize,
    read: impl FnOnce(&mut EndianSlice<'a, LittleEndian>) -> gimli::Result<T>,
) -> Result<T> {
    let rest = data
        .get(*pos..)
        .ok_or_else(|| AssembleError::malformed("leb128", "unexpected end of data"))?;
    let mut reader = EndianSlice::new(rest, LittleEndian);
    let value = read(&mut reader).map_err(|e| AssembleError::malformed("leb128", e.to_string()))?;
    *pos += rest.len() - reader.slice().len();
    Ok(value)
}

/// Growable LEB128 byte sink.
#[derive(Debug, Default, Clone)]
pub struct Leb128Encoder {
    data: Vec<u8>,
}

impl Leb128Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_unsigned(&mut self, value: u32) {
        encode_unsigned_leb128(&mut self.data, value);
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_sizes() {
        assert_eq!(unsigned_leb128_size(0), 1);
        assert_eq!(unsigned_leb128_size(0x7f), 1);
        assert_eq!(unsigned_leb128_size(0x80), 2);
        assert_eq!(unsigned_leb128_size(0x3fff), 2);
        assert_eq!(unsigned_leb128_size(0x4000), 3);
        assert_eq!(unsigned_leb128_size(u32::MAX), 5);
    }

    #[test]
    fn test_signed_sizes() {
        assert_eq!(signed_leb128_size(0), 1);
        assert_eq!(signed_leb128_size(63), 1);
        assert_eq!(signed_leb128_size(64), 2);
        assert_eq!(signed_leb128_size(-64), 1);
        assert_eq!(signed_leb128_size(-65), 2);
        assert_eq!(signed_leb128_size(i32::MIN), 5);
        assert_eq!(signed_leb128_size(i32::MAX), 5);
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = Vec::new();
        encode_unsigned_leb128(&mut buf, 624485);
        assert_eq!(buf, vec![0xe5, 0x8e, 0x26]);

        buf.clear();
        encode_signed_leb128(&mut buf, -123456);
        assert_eq!(buf, vec![0xc0, 0xbb, 0x78]);

        buf.clear();
        encode_signed_leb128(&mut buf, -1);
        assert_eq!(buf, vec![0x7f]);
    }

    #[test]
    fn test_sizes_match_encoded_lengths() {
        for value in [0i32, 1, -1, 63, -64, 64, -65, 8191, -8192, 1 << 20, i32::MIN, i32::MAX] {
            let mut buf = Vec::new();
            encode_signed_leb128(&mut buf, value);
            assert_eq!(buf.len(), signed_leb128_size(value), "value {}", value);
            let mut pos = 0;
            assert_eq!(decode_signed_leb128(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
        for value in [0u32, 1, 127, 128, 16383, 16384, u32::MAX] {
            let mut buf = Vec::new();
            encode_unsigned_leb128(&mut buf, value);
            assert_eq!(buf.len(), unsigned_leb128_size(value), "value {}", value);
            let mut pos = 0;
            assert_eq!(decode_unsigned_leb128(&buf, &mut pos).unwrap(), value);
        }
    }

    #[test]
    fn test_truncated_input() {
        let mut pos = 0;
        assert!(decode_unsigned_leb128(&[0x80, 0x80], &mut pos).is_err());
        let mut pos = 0;
        assert!(decode_signed_leb128(&[], &mut pos).is_err());
        let mut pos = 3;
        assert!(decode_unsigned_leb128(&[0x01], &mut pos).is_err());
    }

    #[test]
    fn test_out_of_range_values() {
        // 2^32 and -(2^31) - 1
        let mut pos = 0;
        assert!(decode_unsigned_leb128(&[0x80, 0x80, 0x80, 0x80, 0x10], &mut pos).is_err());
        let mut pos = 0;
        assert!(decode_signed_leb128(&[0xff, 0xff, 0xff, 0xff, 0x77], &mut pos).is_err());
    }

    #[test]
    fn test_decode_advances_position() {
        let data = [0xe5, 0x8e, 0x26, 0x7f];
        let mut pos = 0;
        assert_eq!(decode_unsigned_leb128(&data, &mut pos).unwrap(), 624485);
        assert_eq!(pos, 3);
        assert_eq!(decode_signed_leb128(&data, &mut pos).unwrap(), -1);
        assert_eq!(pos, 4);
    }
}
