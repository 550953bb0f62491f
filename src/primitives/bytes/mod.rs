#![forbid(unsafe_code)]
//! Encoding, varint, and buffer utilities shared across storage layers.

pub mod ord {
    //! Order-preserving encoders for numeric keys.

    use crate::types::{FosterError, Result};

    const U64_LEN: usize = core::mem::size_of::<u64>();
    const SIGN_BIT: u64 = 1 << 63;

    /// Appends `v` big-endian so byte order matches numeric order.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a big-endian u64 from the first eight bytes.
    pub fn get_u64_be(src: &[u8]) -> Result<u64> {
        let head = src
            .get(..U64_LEN)
            .ok_or(FosterError::Corruption("u64 key shorter than 8 bytes"))?;
        let mut raw = [0u8; U64_LEN];
        raw.copy_from_slice(head);
        Ok(u64::from_be_bytes(raw))
    }

    /// Encodes a signed i64 with the sign bit flipped so negatives sort first.
    pub fn put_i64_be(dst: &mut Vec<u8>, v: i64) {
        put_u64_be(dst, (v as u64) ^ SIGN_BIT);
    }

    /// Inverse of [`put_i64_be`].
    pub fn get_i64_be(src: &[u8]) -> Result<i64> {
        Ok((get_u64_be(src)? ^ SIGN_BIT) as i64)
    }
}

pub mod var {
    //! Unsigned LEB128 varints.

    use crate::types::{FosterError, Result};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a varint from `src` at `*off`, advancing the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(FosterError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(FosterError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(FosterError::Corruption("varint longer than 10 bytes"))
    }
}

pub mod buf {
    //! Bounds-checked reader over a byte slice.

    use super::var;
    use crate::types::{FosterError, Result};

    /// Sequential reader that never panics on short input.
    pub struct Reader<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Reader<'a> {
        /// Starts reading at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Bytes not yet consumed.
        pub fn remaining(&self) -> usize {
            self.buf.len() - self.off
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(FosterError::Corruption("reader offset overflow"))?;
            let out = self
                .buf
                .get(self.off..end)
                .ok_or(FosterError::Corruption("read past end of buffer"))?;
            self.off = end;
            Ok(out)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(self.take(4)?);
            Ok(u32::from_be_bytes(raw))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(raw))
        }

        /// Reads a varint.
        pub fn var(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads a varint length followed by that many bytes.
        pub fn bytes(&mut self) -> Result<&'a [u8]> {
            let len = usize::try_from(self.var()?)
                .map_err(|_| FosterError::Corruption("length does not fit usize"))?;
            self.take(len)
        }
    }

    /// Appends a varint length and the bytes.
    pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
        var::encode_u64(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }
}
