//! Conversions between typed keys/values and the opaque bytes the map
//! stores.
//!
//! | Codec | Encoding |
//! |-------|----------|
//! | [`BytesCodec`] | bytes as-is |
//! | [`U64Codec`] | 8 bytes, big-endian (byte order matches numeric order) |
//! | [`Utf8Codec`] | `u32` LE byte length, then the UTF-8 bytes |

use vmap_error::{Result, VmapError};

pub trait Codec<T> {
    fn encode(&self, value: &T) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Vec<u8> {
        value.clone()
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct U64Codec;

impl Codec<u64> for U64Codec {
    fn encode(&self, value: &u64) -> Vec<u8> {
        value.to_be_bytes().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            VmapError::Format(format!("u64 value needs 8 bytes, got {}", bytes.len()))
        })?;
        Ok(u64::from_be_bytes(raw))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> Vec<u8> {
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        let mut out = Vec::with_capacity(4 + value.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        let Some((prefix, body)) = bytes.split_first_chunk::<4>() else {
            return Err(VmapError::Format("string value shorter than its length prefix".into()));
        };
        let len = u32::from_le_bytes(*prefix) as usize;
        if body.len() != len {
            return Err(VmapError::Format(format!(
                "string length prefix {len} does not match {} payload bytes",
                body.len()
            )));
        }
        String::from_utf8(body.to_vec())
            .map_err(|err| VmapError::Format(format!("string value is not UTF-8: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_encoding_sorts_numerically() {
        let small = U64Codec.encode(&255);
        let large = U64Codec.encode(&256);
        assert!(small < large);
        assert_eq!(U64Codec.decode(&large).expect("decode"), 256);
    }

    #[test]
    fn u64_rejects_wrong_width() {
        assert!(matches!(U64Codec.decode(&[1, 2, 3]), Err(VmapError::Format(_))));
    }

    #[test]
    fn utf8_carries_length_prefix() {
        let bytes = Utf8Codec.encode(&"héllo".to_owned());
        assert_eq!(&bytes[..4], &6_u32.to_le_bytes());
        assert_eq!(Utf8Codec.decode(&bytes).expect("decode"), "héllo");
    }

    #[test]
    fn utf8_rejects_truncated_and_invalid() {
        let mut bytes = Utf8Codec.encode(&"abc".to_owned());
        bytes.pop();
        assert!(Utf8Codec.decode(&bytes).is_err());
        assert!(Utf8Codec.decode(&[1, 0]).is_err());
        assert!(Utf8Codec.decode(&[2, 0, 0, 0, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn empty_string_is_just_a_prefix() {
        let bytes = Utf8Codec.encode(&String::new());
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(Utf8Codec.decode(&bytes).expect("decode"), "");
    }
}
