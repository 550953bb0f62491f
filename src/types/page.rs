//! Shared on-disk page header. Every page starts with these 32 bytes.

use core::convert::TryFrom;

use super::{FosterError, Lsn, PageId, Result};

/// Magic bytes identifying a formatted page.
pub const PAGE_MAGIC: [u8; 4] = *b"FOST";
/// Version of the page layout written by this crate.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 8192;
/// Smallest page size the B-tree layout accepts.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Largest page size; slot offsets are 15-bit.
pub const MAX_PAGE_SIZE: u32 = 32768;
/// Length of the generic page header.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// Magic bytes.
    pub const MAGIC: Range<usize> = 0..4;
    /// Layout version.
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    /// [`super::PageKind`] tag.
    pub const PAGE_KIND: usize = 6;
    /// Must be zero.
    pub const RESERVED: usize = 7;
    /// Page size in bytes.
    pub const PAGE_SIZE: Range<usize> = 8..12;
    /// Volume id.
    pub const VOL: Range<usize> = 12..16;
    /// Page number.
    pub const PAGE_NO: Range<usize> = 16..20;
    /// LSN of the last log record applied to the page.
    pub const LSN: Range<usize> = 20..28;
    /// CRC32 of the page with this field zeroed.
    pub const CRC32: Range<usize> = 28..32;
}

/// Kind tag stored in every page header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Allocated but never formatted.
    Free = 1,
    /// B-tree page (leaf or interior, see the level field).
    BTree = 2,
}

impl PageKind {
    /// Raw tag value.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = FosterError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Free),
            2 => Ok(PageKind::BTree),
            _ => Err(FosterError::Corruption("unknown page kind")),
        }
    }
}

/// Decoded page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Layout version.
    pub format_version: u16,
    /// Page kind.
    pub kind: PageKind,
    /// Page size in bytes.
    pub page_size: u32,
    /// Page identity.
    pub pid: PageId,
    /// Page LSN.
    pub lsn: Lsn,
    /// Stored checksum.
    pub crc32: u32,
}

impl PageHeader {
    /// Builds a header for a fresh page.
    pub fn new(pid: PageId, kind: PageKind, page_size: u32) -> Result<Self> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(FosterError::Invalid("page size out of range"));
        }
        Ok(Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            page_size,
            pid,
            lsn: Lsn::ZERO,
            crc32: 0,
        })
    }

    /// Sets the LSN.
    pub fn with_lsn(mut self, lsn: Lsn) -> Self {
        self.lsn = lsn;
        self
    }

    /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(FosterError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::RESERVED] = 0;
        hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        hdr[header::VOL].copy_from_slice(&self.pid.vol.to_be_bytes());
        hdr[header::PAGE_NO].copy_from_slice(&self.pid.page.to_be_bytes());
        hdr[header::LSN].copy_from_slice(&self.lsn.0.to_be_bytes());
        hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Parses and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(FosterError::Corruption("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        if hdr[header::MAGIC] != PAGE_MAGIC {
            return Err(FosterError::Corruption("invalid page magic"));
        }
        let format_version = read_u16(hdr, header::FORMAT_VERSION.start);
        if format_version != PAGE_FORMAT_VERSION {
            return Err(FosterError::Corruption("unsupported page format version"));
        }
        if hdr[header::RESERVED] != 0 {
            return Err(FosterError::Corruption("page header reserved byte not zero"));
        }
        let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
        let page_size = read_u32(hdr, header::PAGE_SIZE.start);
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(FosterError::Corruption("page size out of range"));
        }
        let pid = PageId::new(
            read_u32(hdr, header::VOL.start),
            read_u32(hdr, header::PAGE_NO.start),
        );
        Ok(Self {
            format_version,
            kind,
            page_size,
            pid,
            lsn: Lsn(read_u64(hdr, header::LSN.start)),
            crc32: read_u32(hdr, header::CRC32.start),
        })
    }
}

/// Reads the page LSN without validating the rest of the header.
pub fn page_lsn(buf: &[u8]) -> Lsn {
    if buf.len() < PAGE_HDR_LEN {
        return Lsn::ZERO;
    }
    Lsn(read_u64(buf, header::LSN.start))
}

/// Stamps a new page LSN.
pub fn set_page_lsn(buf: &mut [u8], lsn: Lsn) {
    if buf.len() >= PAGE_HDR_LEN {
        buf[header::LSN].copy_from_slice(&lsn.0.to_be_bytes());
    }
}

/// Zeroes the checksum field.
pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
    if buf.len() < header::CRC32.end {
        return Err(FosterError::Invalid("page header buffer too small"));
    }
    buf[header::CRC32].fill(0);
    Ok(())
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[off..off + 2]);
    u16::from_be_bytes(raw)
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(raw)
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_header_roundtrip() -> Result<()> {
        let mut buf = [0u8; PAGE_HDR_LEN];
        let header = PageHeader::new(PageId::new(1, 42), PageKind::BTree, DEFAULT_PAGE_SIZE)?
            .with_lsn(Lsn(99));
        header.encode(&mut buf)?;
        assert_eq!(PageHeader::decode(&buf)?, header);
        assert_eq!(page_lsn(&buf), Lsn(99));
        Ok(())
    }

    #[test]
    fn set_lsn_and_clear_crc() -> Result<()> {
        let mut buf = [0xFFu8; PAGE_HDR_LEN];
        set_page_lsn(&mut buf, Lsn(7));
        assert_eq!(page_lsn(&buf), Lsn(7));
        clear_crc32(&mut buf)?;
        assert!(buf[header::CRC32].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(PageHeader::decode(&[0u8; PAGE_HDR_LEN]).is_err());
        assert!(PageHeader::decode(&[0u8; 4]).is_err());
        assert!(PageKind::try_from(0).is_err());
    }

    #[test]
    fn page_size_bounds() {
        assert!(PageHeader::new(PageId::new(1, 1), PageKind::BTree, 256).is_err());
        assert!(PageHeader::new(PageId::new(1, 1), PageKind::BTree, 65536).is_err());
    }
}
