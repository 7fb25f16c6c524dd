//! Key and value codecs for the index layers.
//!
//! A codec turns one key or value into bytes and back. `SIZE` distinguishes
//! fixed-size types (encoded bare) from variable-size ones (the node
//! serializer writes an explicit length in front of them). Codecs are
//! zero-sized marker types so the tree layers monomorphize over them instead
//! of dispatching through trait objects.

use crate::error::{APIError, Result};
use crate::types::RowId;
use crate::util;

/// Encoding and decoding of a single key or value of type `T`.
pub trait Codec<T> {
    /// `Some(n)` iff every encoded `T` occupies exactly `n` bytes.
    const SIZE: Option<usize>;

    /// Append the encoding of `value` to `out`.
    fn encode(value: &T, out: &mut Vec<u8>) -> Result<()>;

    /// Decode a `T` from exactly the bytes in `bytes`.
    fn decode(bytes: &[u8]) -> Result<T>;
}

fn expect_len(bytes: &[u8], n: usize) -> Result<()> {
    if bytes.len() != n {
        return Err(APIError::Codec("encoded value has the wrong length"));
    }
    Ok(())
}

/// Fixed 4-byte codec for `u32`.
pub struct U32Codec;

impl Codec<u32> for U32Codec {
    const SIZE: Option<usize> = Some(4);

    fn encode(value: &u32, out: &mut Vec<u8>) -> Result<()> {
        util::push_u32(out, *value);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<u32> {
        expect_len(bytes, 4)?;
        util::read_u32(bytes, 0)
    }
}

/// Fixed 4-byte codec for `i32`.
pub struct I32Codec;

impl Codec<i32> for I32Codec {
    const SIZE: Option<usize> = Some(4);

    fn encode(value: &i32, out: &mut Vec<u8>) -> Result<()> {
        util::push_i32(out, *value);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<i32> {
        expect_len(bytes, 4)?;
        util::read_i32(bytes, 0)
    }
}

/// Fixed 8-byte codec for `u64`.
pub struct U64Codec;

impl Codec<u64> for U64Codec {
    const SIZE: Option<usize> = Some(8);

    fn encode(value: &u64, out: &mut Vec<u8>) -> Result<()> {
        util::push_u32(out, (*value & 0xFFFF_FFFF) as u32);
        util::push_u32(out, (*value >> 32) as u32);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<u64> {
        expect_len(bytes, 8)?;
        let lo = util::read_u32(bytes, 0)? as u64;
        let hi = util::read_u32(bytes, 4)? as u64;
        Ok(lo | (hi << 32))
    }
}

/// Fixed 16-byte codec for [`RowId`].
pub struct RowIdCodec;

impl Codec<RowId> for RowIdCodec {
    const SIZE: Option<usize> = Some(16);

    fn encode(value: &RowId, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<RowId> {
        expect_len(bytes, 16)?;
        let mut id = [0u8; 16];
        id.copy_from_slice(bytes);
        Ok(RowId(id))
    }
}

/// Variable-size codec for utf-8 `String` keys.
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    const SIZE: Option<usize> = None;

    fn encode(value: &String, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|_| APIError::Codec("invalid utf-8 in string key"))
    }
}

/// Variable-size codec for `(String, i32)` composite keys: the utf-8 bytes of
/// the string followed by the 4-byte little-endian integer.
pub struct StrI32Codec;

impl Codec<(String, i32)> for StrI32Codec {
    const SIZE: Option<usize> = None;

    fn encode(value: &(String, i32), out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value.0.as_bytes());
        util::push_i32(out, value.1);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<(String, i32)> {
        if bytes.len() < 4 {
            return Err(APIError::Codec("composite key shorter than its integer"));
        }
        let split = bytes.len() - 4;
        let s = String::from_utf8(bytes[..split].to_vec())
            .map_err(|_| APIError::Codec("invalid utf-8 in composite key"))?;
        let v = util::read_i32(bytes, split)?;
        Ok((s, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_codecs_roundtrip() {
        let mut out = Vec::new();
        U32Codec::encode(&7, &mut out).unwrap();
        assert_eq!(out, vec![7, 0, 0, 0]);
        assert_eq!(U32Codec::decode(&out).unwrap(), 7);
        assert!(U32Codec::decode(&out[..3]).is_err());

        let mut out = Vec::new();
        I32Codec::encode(&-7, &mut out).unwrap();
        assert_eq!(I32Codec::decode(&out).unwrap(), -7);

        let mut out = Vec::new();
        U64Codec::encode(&0x0102_0304_0506_0708, &mut out).unwrap();
        assert_eq!(out, vec![8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(U64Codec::decode(&out).unwrap(), 0x0102_0304_0506_0708);

        let id = RowId([3u8; 16]);
        let mut out = Vec::new();
        RowIdCodec::encode(&id, &mut out).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(RowIdCodec::decode(&out).unwrap(), id);
    }

    #[test]
    fn variable_codecs_roundtrip() {
        let mut out = Vec::new();
        Utf8Codec::encode(&"héllo".to_string(), &mut out).unwrap();
        assert_eq!(Utf8Codec::decode(&out).unwrap(), "héllo");
        assert!(Utf8Codec::decode(&[0xFF, 0xFE]).is_err());

        let key = ("US".to_string(), 30);
        let mut out = Vec::new();
        StrI32Codec::encode(&key, &mut out).unwrap();
        assert_eq!(out, vec![b'U', b'S', 30, 0, 0, 0]);
        assert_eq!(StrI32Codec::decode(&out).unwrap(), key);

        // An empty string still carries its integer
        let key = (String::new(), -1);
        let mut out = Vec::new();
        StrI32Codec::encode(&key, &mut out).unwrap();
        assert_eq!(StrI32Codec::decode(&out).unwrap(), key);
        assert!(StrI32Codec::decode(&out[..3]).is_err());
    }
}
