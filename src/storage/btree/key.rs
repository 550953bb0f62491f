//! Keystr encoding: a sign byte followed by the user key bytes.
//!
//! The sign byte makes the two infinities ordinary byte strings, so fence
//! keys and record keys compare with plain lexicographic order.

use smallvec::SmallVec;
use std::fmt;

use crate::primitives::bytes::ord;
use crate::types::{FosterError, Result};

/// Sign byte of negative infinity.
pub const SIGN_NEG_INF: u8 = 0;
/// Sign byte of a regular key.
pub const SIGN_REGULAR: u8 = 1;
/// Sign byte of positive infinity.
pub const SIGN_POS_INF: u8 = 2;

/// Inline buffer used for keys on hot paths.
pub type KeyBuf = SmallVec<[u8; 32]>;

/// Two-byte search hint stored in each slot.
pub type PoorKey = u16;

/// A key in keystr form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyStr(KeyBuf);

impl KeyStr {
    /// Negative infinity; sorts before every regular key.
    pub fn neg_infinity() -> Self {
        Self(SmallVec::from_slice(&[SIGN_NEG_INF]))
    }

    /// Positive infinity; sorts after every regular key.
    pub fn pos_infinity() -> Self {
        Self(SmallVec::from_slice(&[SIGN_POS_INF]))
    }

    /// Wraps user key bytes.
    pub fn from_key(key: &[u8]) -> Self {
        let mut buf = KeyBuf::with_capacity(key.len() + 1);
        buf.push(SIGN_REGULAR);
        buf.extend_from_slice(key);
        Self(buf)
    }

    /// Validates raw keystr bytes.
    pub fn from_keystr(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&SIGN_REGULAR, _)) => Ok(Self(SmallVec::from_slice(bytes))),
            Some((&(SIGN_NEG_INF | SIGN_POS_INF), [])) => Ok(Self(SmallVec::from_slice(bytes))),
            _ => Err(FosterError::Corruption("malformed keystr")),
        }
    }

    /// Encodes a typed key.
    pub fn encode<K: KeyCodec + ?Sized>(key: &K) -> Self {
        let mut out = Vec::new();
        key.encode_key(&mut out);
        Self::from_key(&out)
    }

    /// Serialized bytes including the sign byte.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length as stored.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Never true for a well-formed keystr.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// User key bytes, `None` for the infinities.
    pub fn user_key(&self) -> Option<&[u8]> {
        match self.0.split_first() {
            Some((&SIGN_REGULAR, rest)) => Some(rest),
            _ => None,
        }
    }

    /// True for negative infinity.
    pub fn is_neg_infinity(&self) -> bool {
        self.0.as_slice() == [SIGN_NEG_INF]
    }

    /// True for positive infinity.
    pub fn is_pos_infinity(&self) -> bool {
        self.0.as_slice() == [SIGN_POS_INF]
    }
}

impl AsRef<[u8]> for KeyStr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KeyStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_neg_infinity() {
            return f.write_str("-inf");
        }
        if self.is_pos_infinity() {
            return f.write_str("+inf");
        }
        let body = self.user_key().unwrap_or_default();
        match std::str::from_utf8(body) {
            Ok(text) if text.chars().all(|c| !c.is_control()) => write!(f, "{text:?}"),
            _ => {
                f.write_str("0x")?;
                body.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
        }
    }
}

/// Number of leading bytes `a` and `b` share.
pub fn common_leading_bytes(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// First two bytes of a truncated key, big-endian, zero-padded.
pub fn extract_poor_man_key(key: &[u8]) -> PoorKey {
    match key {
        [] => 0,
        [b0] => u16::from(*b0) << 8,
        [b0, b1, ..] => (u16::from(*b0) << 8) | u16::from(*b1),
    }
}

/// Order-preserving key encoding for typed keys.
pub trait KeyCodec {
    /// Appends the encoded key.
    fn encode_key(&self, out: &mut Vec<u8>);
}

/// Decoding counterpart of [`KeyCodec`].
pub trait KeyDecode: Sized {
    /// Decodes a user key (keystr body without sign byte).
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

impl KeyCodec for u64 {
    fn encode_key(&self, out: &mut Vec<u8>) {
        ord::put_u64_be(out, *self);
    }
}

impl KeyDecode for u64 {
    fn decode_key(bytes: &[u8]) -> Result<Self> {
        ord::get_u64_be(bytes)
    }
}

impl KeyCodec for i64 {
    fn encode_key(&self, out: &mut Vec<u8>) {
        ord::put_i64_be(out, *self);
    }
}

impl KeyDecode for i64 {
    fn decode_key(bytes: &[u8]) -> Result<Self> {
        ord::get_i64_be(bytes)
    }
}

impl KeyCodec for str {
    fn encode_key(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl KeyCodec for String {
    fn encode_key(&self, out: &mut Vec<u8>) {
        self.as_str().encode_key(out);
    }
}

impl KeyDecode for String {
    fn decode_key(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|_| FosterError::Corruption("key is not UTF-8"))
    }
}

impl KeyCodec for [u8] {
    fn encode_key(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl KeyCodec for Vec<u8> {
    fn encode_key(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl KeyDecode for Vec<u8> {
    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinities_bracket_regular_keys() {
        let lo = KeyStr::neg_infinity();
        let hi = KeyStr::pos_infinity();
        for key in [&b""[..], b"\x00", b"a", b"\xff\xff"] {
            let k = KeyStr::from_key(key);
            assert!(lo < k && k < hi);
            assert_eq!(k.user_key(), Some(key));
        }
        assert!(lo.user_key().is_none());
    }

    #[test]
    fn from_keystr_validates_sign() -> Result<()> {
        assert_eq!(KeyStr::from_keystr(&[1, 7])?, KeyStr::from_key(&[7]));
        assert!(KeyStr::from_keystr(&[0])?.is_neg_infinity());
        assert!(KeyStr::from_keystr(&[2, 1]).is_err());
        assert!(KeyStr::from_keystr(&[]).is_err());
        assert!(KeyStr::from_keystr(&[9]).is_err());
        Ok(())
    }

    #[test]
    fn poor_man_key_pads_and_truncates() {
        assert_eq!(extract_poor_man_key(&[]), 0);
        assert_eq!(extract_poor_man_key(&[0xAB]), 0xAB00);
        assert_eq!(extract_poor_man_key(&[0xAB, 0xCD, 0xEF]), 0xABCD);
    }

    #[test]
    fn common_prefix_lengths() {
        assert_eq!(common_leading_bytes(b"apple", b"apricot"), 2);
        assert_eq!(common_leading_bytes(b"abc", b"abc"), 3);
        assert_eq!(common_leading_bytes(b"", b"x"), 0);
    }

    #[test]
    fn typed_keys_preserve_order() -> Result<()> {
        let a = KeyStr::encode(&-3i64);
        let b = KeyStr::encode(&2i64);
        assert!(a < b);
        assert_eq!(i64::decode_key(b.user_key().unwrap_or_default())?, 2);
        assert!(KeyStr::encode(&9u64) < KeyStr::encode(&10u64));
        assert!(KeyStr::encode("apple") < KeyStr::encode("banana"));
        Ok(())
    }

    #[test]
    fn debug_formats() {
        assert_eq!(format!("{:?}", KeyStr::encode("hi")), "\"hi\"");
        assert_eq!(format!("{:?}", KeyStr::from_key(&[0, 1])), "0x0001");
        assert_eq!(format!("{:?}", KeyStr::pos_infinity()), "+inf");
    }
}
