use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};
use serde::Serialize;
use tracing::{debug, trace};

use super::frame::Frame;
use crate::types::checksum::{seal_page, verify_page};
use crate::types::page::{PageHeader, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{FosterError, PageId, Result};

/// Latch mode requested when fixing a page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Any number of readers.
    Shared,
    /// A single writer.
    Exclusive,
}

/// Buffer pool contract used by the B-tree.
pub trait PageStore: Send + Sync {
    /// Page size in bytes.
    fn page_size(&self) -> usize;
    /// Fixes a page, blocking (up to the pool's latch timeout) for the latch.
    fn fix(&self, pid: PageId, mode: LatchMode) -> Result<PageHandle>;
    /// Fixes a page only if the latch is immediately available.
    fn try_fix(&self, pid: PageId, mode: LatchMode) -> Result<PageHandle>;
    /// Copies the page without waiting. `None` when a writer holds the latch.
    fn snapshot(&self, pid: PageId) -> Result<Option<Box<[u8]>>>;
    /// Fixes a page exclusively, materialising a blank frame if it does not
    /// exist yet. Recovery uses this for pages created after the last flush.
    fn fix_virgin(&self, pid: PageId) -> Result<PageHandle>;
}

/// Free-page allocator contract.
pub trait PageAllocator: Send + Sync {
    /// Returns the id of a fresh, unformatted page.
    fn allocate_page(&self) -> Result<PageId>;
}

enum Guard {
    Shared(ArcRwLockReadGuard<RawRwLock, Box<[u8]>>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>),
}

/// A fixed page. Dropping it (or calling [`PageHandle::unfix`]) releases the latch.
pub struct PageHandle {
    pid: PageId,
    guard: Guard,
}

impl PageHandle {
    /// Page identity.
    pub fn pid(&self) -> PageId {
        self.pid
    }

    /// Latch mode held.
    pub fn latch_mode(&self) -> LatchMode {
        match self.guard {
            Guard::Shared(_) => LatchMode::Shared,
            Guard::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        match &self.guard {
            Guard::Shared(g) => &g[..],
            Guard::Exclusive(g) => &g[..],
        }
    }

    /// Mutable page bytes; only available under an exclusive latch.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.guard {
            Guard::Exclusive(g) => Ok(&mut g[..]),
            Guard::Shared(_) => Err(FosterError::Invalid("page is not latched exclusively")),
        }
    }

    /// Releases the latch.
    pub fn unfix(self) {
        trace!(target: "fosterdb::pager", page = %self.pid, "unfix");
    }
}

/// Counters for the in-memory pool.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PoolStats {
    /// Successful fixes.
    pub fixes: u64,
    /// Fix attempts that hit a held latch.
    pub fix_conflicts: u64,
    /// Pages handed out by the allocator.
    pub allocations: u64,
    /// Snapshots taken.
    pub snapshots: u64,
    /// Snapshots refused because a writer held the latch.
    pub snapshot_misses: u64,
}

#[derive(Default)]
struct PoolCounters {
    fixes: AtomicU64,
    fix_conflicts: AtomicU64,
    allocations: AtomicU64,
    snapshots: AtomicU64,
    snapshot_misses: AtomicU64,
}

/// Memory-resident buffer pool and page allocator for one volume.
pub struct MemPool {
    vol: u32,
    page_size: usize,
    latch_timeout: Option<Duration>,
    frames: RwLock<HashMap<u32, Frame>>,
    next_page: AtomicU32,
    counters: PoolCounters,
}

impl MemPool {
    /// Creates an empty pool. Page numbers start at 1.
    pub fn new(vol: u32, page_size: usize) -> Result<Self> {
        if !(MIN_PAGE_SIZE as usize..=MAX_PAGE_SIZE as usize).contains(&page_size) {
            return Err(FosterError::Invalid("page size out of range"));
        }
        Ok(Self {
            vol,
            page_size,
            latch_timeout: None,
            frames: RwLock::new(HashMap::new()),
            next_page: AtomicU32::new(1),
            counters: PoolCounters::default(),
        })
    }

    /// Bounds how long [`PageStore::fix`] waits before returning a lock conflict.
    pub fn with_latch_timeout(mut self, timeout: Duration) -> Self {
        self.latch_timeout = Some(timeout);
        self
    }

    /// Volume served by this pool.
    pub fn vol(&self) -> u32 {
        self.vol
    }

    /// Number of resident pages.
    pub fn page_count(&self) -> usize {
        self.frames.read().len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            fixes: c.fixes.load(AtomicOrdering::Relaxed),
            fix_conflicts: c.fix_conflicts.load(AtomicOrdering::Relaxed),
            allocations: c.allocations.load(AtomicOrdering::Relaxed),
            snapshots: c.snapshots.load(AtomicOrdering::Relaxed),
            snapshot_misses: c.snapshot_misses.load(AtomicOrdering::Relaxed),
        }
    }

    /// Checksummed copies of every page, ordered by page number. Blocks on
    /// pages that are currently latched exclusively.
    pub fn page_images(&self) -> Result<Vec<(PageId, Vec<u8>)>> {
        let frames = self.frames.read();
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames.values() {
            let mut image = frame.buf.read().to_vec();
            seal_page(&mut image)?;
            out.push((frame.id, image));
        }
        out.sort_by_key(|(pid, _)| *pid);
        Ok(out)
    }

    /// Rebuilds a pool from images produced by [`MemPool::page_images`].
    pub fn from_images<I>(vol: u32, page_size: usize, images: I) -> Result<Self>
    where
        I: IntoIterator<Item = (PageId, Vec<u8>)>,
    {
        let pool = Self::new(vol, page_size)?;
        for (pid, image) in images {
            pool.install_image(pid, image)?;
        }
        Ok(pool)
    }

    /// Replaces (or creates) one page from a checksummed image.
    pub fn install_image(&self, pid: PageId, image: Vec<u8>) -> Result<()> {
        if pid.vol != self.vol || pid.is_null() {
            return Err(FosterError::Invalid("page id does not belong to this pool"));
        }
        if image.len() != self.page_size {
            return Err(FosterError::Corruption("page image has the wrong size"));
        }
        verify_page(&image)?;
        let header = PageHeader::decode(&image)?;
        if header.pid != pid {
            return Err(FosterError::Corruption("page image belongs to another page"));
        }
        let mut frames = self.frames.write();
        frames.insert(pid.page, Frame::from_image(pid, image.into_boxed_slice()));
        self.bump_next_page(pid.page);
        debug!(target: "fosterdb::pager", page = %pid, "installed page image");
        Ok(())
    }

    fn bump_next_page(&self, page: u32) {
        self.next_page
            .fetch_max(page.saturating_add(1), AtomicOrdering::AcqRel);
    }

    fn frame_buf(&self, pid: PageId) -> Result<Arc<RwLock<Box<[u8]>>>> {
        if pid.vol != self.vol {
            return Err(FosterError::PageNotFound(pid));
        }
        self.frames
            .read()
            .get(&pid.page)
            .map(|frame| Arc::clone(&frame.buf))
            .ok_or(FosterError::PageNotFound(pid))
    }

    fn conflict(&self, pid: PageId, mode: LatchMode) -> FosterError {
        self.counters
            .fix_conflicts
            .fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "fosterdb::pager", page = %pid, ?mode, "latch conflict");
        FosterError::LockConflict
    }

    fn granted(&self, pid: PageId, guard: Guard) -> PageHandle {
        self.counters.fixes.fetch_add(1, AtomicOrdering::Relaxed);
        PageHandle { pid, guard }
    }
}

impl PageStore for MemPool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn fix(&self, pid: PageId, mode: LatchMode) -> Result<PageHandle> {
        let buf = self.frame_buf(pid)?;
        let guard = match (mode, self.latch_timeout) {
            (LatchMode::Shared, None) => Guard::Shared(buf.read_arc()),
            (LatchMode::Exclusive, None) => Guard::Exclusive(buf.write_arc()),
            (LatchMode::Shared, Some(timeout)) => Guard::Shared(
                buf.try_read_arc_for(timeout)
                    .ok_or_else(|| self.conflict(pid, mode))?,
            ),
            (LatchMode::Exclusive, Some(timeout)) => Guard::Exclusive(
                buf.try_write_arc_for(timeout)
                    .ok_or_else(|| self.conflict(pid, mode))?,
            ),
        };
        Ok(self.granted(pid, guard))
    }

    fn try_fix(&self, pid: PageId, mode: LatchMode) -> Result<PageHandle> {
        let buf = self.frame_buf(pid)?;
        let guard = match mode {
            LatchMode::Shared => buf.try_read_arc().map(Guard::Shared),
            LatchMode::Exclusive => buf.try_write_arc().map(Guard::Exclusive),
        };
        match guard {
            Some(guard) => Ok(self.granted(pid, guard)),
            None => Err(self.conflict(pid, mode)),
        }
    }

    fn snapshot(&self, pid: PageId) -> Result<Option<Box<[u8]>>> {
        let buf = self.frame_buf(pid)?;
        let copy = buf.try_read().map(|guard| Box::<[u8]>::from(&guard[..]));
        let counter = if copy.is_some() {
            &self.counters.snapshots
        } else {
            &self.counters.snapshot_misses
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(copy)
    }

    fn fix_virgin(&self, pid: PageId) -> Result<PageHandle> {
        if pid.vol != self.vol || pid.is_null() {
            return Err(FosterError::Invalid("page id does not belong to this pool"));
        }
        {
            let mut frames = self.frames.write();
            if !frames.contains_key(&pid.page) {
                frames.insert(pid.page, Frame::new(pid, self.page_size)?);
                self.bump_next_page(pid.page);
            }
        }
        self.fix(pid, LatchMode::Exclusive)
    }
}

impl PageAllocator for MemPool {
    fn allocate_page(&self) -> Result<PageId> {
        let page = self.next_page.fetch_add(1, AtomicOrdering::AcqRel);
        if page == u32::MAX {
            return Err(FosterError::Invalid("volume has no free page numbers left"));
        }
        let pid = PageId::new(self.vol, page);
        let frame = Frame::new(pid, self.page_size)?;
        self.frames.write().insert(page, frame);
        self.counters.allocations.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(target: "fosterdb::pager", page = %pid, "allocated page");
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::page::PageKind;

    #[test]
    fn allocate_then_fix_exclusive_blocks_try_fix() -> Result<()> {
        let pool = MemPool::new(1, 1024)?;
        let pid = pool.allocate_page()?;
        assert_eq!(pid, PageId::new(1, 1));
        let mut page = pool.fix(pid, LatchMode::Exclusive)?;
        page.data_mut()?[100] = 9;
        assert!(matches!(
            pool.try_fix(pid, LatchMode::Shared),
            Err(FosterError::LockConflict)
        ));
        assert!(pool.snapshot(pid)?.is_none());
        page.unfix();
        let snap = pool.snapshot(pid)?.ok_or(FosterError::NotFound)?;
        assert_eq!(snap[100], 9);
        let stats = pool.stats();
        assert_eq!(stats.snapshot_misses, 1);
        assert_eq!(stats.fix_conflicts, 1);
        Ok(())
    }

    #[test]
    fn shared_handle_refuses_mutation() -> Result<()> {
        let pool = MemPool::new(1, 1024)?;
        let pid = pool.allocate_page()?;
        let mut page = pool.fix(pid, LatchMode::Shared)?;
        assert_eq!(page.latch_mode(), LatchMode::Shared);
        assert!(page.data_mut().is_err());
        Ok(())
    }

    #[test]
    fn latch_timeout_turns_into_conflict() -> Result<()> {
        let pool = MemPool::new(1, 1024)?.with_latch_timeout(Duration::from_millis(5));
        let pid = pool.allocate_page()?;
        let _held = pool.fix(pid, LatchMode::Exclusive)?;
        assert!(matches!(
            pool.fix(pid, LatchMode::Exclusive),
            Err(FosterError::LockConflict)
        ));
        Ok(())
    }

    #[test]
    fn images_roundtrip_and_reject_corruption() -> Result<()> {
        let pool = MemPool::new(2, 1024)?;
        let a = pool.allocate_page()?;
        let _b = pool.allocate_page()?;
        let mut images = pool.page_images()?;
        assert_eq!(images.len(), 2);
        let copy = MemPool::from_images(2, 1024, images.clone())?;
        let header = PageHeader::decode(copy.fix(a, LatchMode::Shared)?.data())?;
        assert_eq!(header.kind, PageKind::Free);
        assert_eq!(copy.allocate_page()?, PageId::new(2, 3));

        images[0].1[500] ^= 0xFF;
        assert!(MemPool::from_images(2, 1024, images).is_err());
        Ok(())
    }

    #[test]
    fn fix_virgin_creates_missing_page() -> Result<()> {
        let pool = MemPool::new(1, 1024)?;
        let pid = PageId::new(1, 7);
        assert!(matches!(
            pool.fix(pid, LatchMode::Shared),
            Err(FosterError::PageNotFound(_))
        ));
        let page = pool.fix_virgin(pid)?;
        assert_eq!(page.latch_mode(), LatchMode::Exclusive);
        drop(page);
        assert_eq!(pool.allocate_page()?, PageId::new(1, 8));
        Ok(())
    }
}
