use parking_lot::RwLock;
use std::sync::Arc;

use crate::types::page::{PageHeader, PageKind};
use crate::types::{PageId, Result};

/// One resident page. The `RwLock` is the page latch.
pub struct Frame {
    pub id: PageId,
    pub buf: Arc<RwLock<Box<[u8]>>>,
}

impl Frame {
    /// A zeroed page carrying only a `Free` header.
    pub fn new(id: PageId, page_size: usize) -> Result<Self> {
        let mut buf = vec![0u8; page_size].into_boxed_slice();
        PageHeader::new(id, PageKind::Free, page_size as u32)?.encode(&mut buf)?;
        Ok(Self {
            id,
            buf: Arc::new(RwLock::new(buf)),
        })
    }

    /// Wraps an existing image.
    pub fn from_image(id: PageId, image: Box<[u8]>) -> Self {
        Self {
            id,
            buf: Arc::new(RwLock::new(image)),
        }
    }
}
