#![forbid(unsafe_code)]
//! Page checksums.

use super::page::{clear_crc32, header, read_u32, PAGE_HDR_LEN};
use super::{FosterError, Result};

/// Incremental checksum.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 over a full page image, skipping the checksum field itself.
pub fn page_crc32(page: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    if page.len() < PAGE_HDR_LEN {
        hasher.update(page);
        return hasher.finalize();
    }
    hasher.update(&page[..header::CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[header::CRC32.end..]);
    hasher.finalize()
}

/// Computes and stores the page checksum.
pub fn seal_page(page: &mut [u8]) -> Result<()> {
    clear_crc32(page)?;
    let crc = page_crc32(page);
    page[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Checks the stored checksum against the page contents.
pub fn verify_page(page: &[u8]) -> Result<()> {
    if page.len() < PAGE_HDR_LEN {
        return Err(FosterError::Corruption("page shorter than header"));
    }
    let stored = read_u32(page, header::CRC32.start);
    if stored != page_crc32(page) {
        return Err(FosterError::Corruption("page checksum mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_trait_roundtrip() {
        let mut c = Crc32Fast::default();
        c.update(b"hello");
        let first = c.finalize();
        c.update(b" world");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"hello world");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn seal_then_verify_detects_flips() -> Result<()> {
        let mut page = vec![7u8; 512];
        seal_page(&mut page)?;
        verify_page(&page)?;
        page[300] ^= 1;
        assert!(verify_page(&page).is_err());
        Ok(())
    }

    #[test]
    fn crc_ignores_its_own_field() -> Result<()> {
        let mut page = vec![3u8; 512];
        let before = page_crc32(&page);
        page[header::CRC32].fill(0xAB);
        assert_eq!(before, page_crc32(&page));
        Ok(())
    }
}
