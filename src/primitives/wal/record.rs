//! Log record payloads and their binary encoding.

use crate::primitives::bytes::buf::{put_bytes, Reader};
use crate::primitives::bytes::var;
use crate::types::{FosterError, Lsn, PageId, Result};

/// One physical change to one or two pages.
///
/// Keys are full keystrs (sign byte included, page prefix not removed).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogRecord {
    /// A brand-new live record.
    InsertNonGhost {
        /// Target leaf.
        page: PageId,
        /// Record key.
        key: Vec<u8>,
        /// Record element.
        element: Vec<u8>,
    },
    /// A ghost's payload was replaced and the ghost bit cleared.
    Insert {
        /// Target leaf.
        page: PageId,
        /// Record key.
        key: Vec<u8>,
        /// New element.
        element: Vec<u8>,
        /// Element the ghost carried before, restored on undo.
        prior: Vec<u8>,
    },
    /// A ghost slot sized for a future insert.
    GhostReserve {
        /// Target leaf.
        page: PageId,
        /// Record key.
        key: Vec<u8>,
        /// Element length to reserve.
        element_len: u32,
    },
    /// Live records turned into ghosts.
    GhostMark {
        /// Target leaf.
        page: PageId,
        /// Keys marked.
        keys: Vec<Vec<u8>>,
    },
    /// Ghosts removed by defragmentation.
    GhostReclaim {
        /// Target leaf.
        page: PageId,
        /// Keys reclaimed.
        keys: Vec<Vec<u8>>,
    },
    /// Element replaced in place.
    Update {
        /// Target leaf.
        page: PageId,
        /// Record key.
        key: Vec<u8>,
        /// Element before.
        old: Vec<u8>,
        /// Element after.
        new: Vec<u8>,
    },
    /// Byte range patched inside an element.
    Overwrite {
        /// Target leaf.
        page: PageId,
        /// Record key.
        key: Vec<u8>,
        /// Offset inside the element.
        offset: u32,
        /// Bytes before.
        old: Vec<u8>,
        /// Bytes after.
        new: Vec<u8>,
    },
    /// Whole page image replaced.
    PageImageFormat {
        /// Target page.
        page: PageId,
        /// Complete page bytes.
        image: Vec<u8>,
    },
    /// Foster split (including the no-record variant) touching the source
    /// page and its new foster child.
    FosterSplit {
        /// Page that was split.
        page: PageId,
        /// New foster child.
        new_page: PageId,
        /// First record index moved to the child.
        right_begins_from: u16,
        /// New fence-high of the source and fence-low of the child.
        mid: Vec<u8>,
        /// Chain-high of the source after the split.
        chain_high: Vec<u8>,
        /// Complete image of the new child.
        new_image: Vec<u8>,
    },
    /// A parent adopted its child's foster child.
    FosterAdopt {
        /// Parent receiving the separator.
        parent: PageId,
        /// Real child losing its foster link.
        child: PageId,
        /// Separator inserted into the parent.
        new_child_key: Vec<u8>,
        /// Foster child becoming a real child.
        new_child: PageId,
        /// Expected minimum LSN of the new child.
        new_child_emlsn: Lsn,
    },
    /// Root contents pushed down into a new child.
    GrowTree {
        /// Root page.
        root: PageId,
        /// New child page.
        new_child: PageId,
        /// Complete image of the new child.
        child_image: Vec<u8>,
    },
}

const KIND_INSERT_NONGHOST: u8 = 1;
const KIND_INSERT: u8 = 2;
const KIND_GHOST_RESERVE: u8 = 3;
const KIND_GHOST_MARK: u8 = 4;
const KIND_GHOST_RECLAIM: u8 = 5;
const KIND_UPDATE: u8 = 6;
const KIND_OVERWRITE: u8 = 7;
const KIND_PAGE_IMAGE_FORMAT: u8 = 8;
const KIND_FOSTER_SPLIT: u8 = 9;
const KIND_FOSTER_ADOPT: u8 = 10;
const KIND_GROW_TREE: u8 = 11;

impl LogRecord {
    /// Short name used in tracing output.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LogRecord::InsertNonGhost { .. } => "insert_nonghost",
            LogRecord::Insert { .. } => "insert",
            LogRecord::GhostReserve { .. } => "ghost_reserve",
            LogRecord::GhostMark { .. } => "ghost_mark",
            LogRecord::GhostReclaim { .. } => "ghost_reclaim",
            LogRecord::Update { .. } => "update",
            LogRecord::Overwrite { .. } => "overwrite",
            LogRecord::PageImageFormat { .. } => "page_img_format",
            LogRecord::FosterSplit { .. } => "foster_split",
            LogRecord::FosterAdopt { .. } => "foster_adopt",
            LogRecord::GrowTree { .. } => "grow_tree",
        }
    }

    /// Pages this record must be redone on, in application order.
    pub fn pages(&self) -> smallvec::SmallVec<[PageId; 2]> {
        match self {
            LogRecord::InsertNonGhost { page, .. }
            | LogRecord::Insert { page, .. }
            | LogRecord::GhostReserve { page, .. }
            | LogRecord::GhostMark { page, .. }
            | LogRecord::GhostReclaim { page, .. }
            | LogRecord::Update { page, .. }
            | LogRecord::Overwrite { page, .. }
            | LogRecord::PageImageFormat { page, .. } => smallvec::smallvec![*page],
            LogRecord::FosterSplit { page, new_page, .. } => smallvec::smallvec![*new_page, *page],
            LogRecord::FosterAdopt {
                parent, child, ..
            } => smallvec::smallvec![*parent, *child],
            LogRecord::GrowTree {
                root, new_child, ..
            } => smallvec::smallvec![*new_child, *root],
        }
    }

    /// Serialises the record.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            LogRecord::InsertNonGhost { page, key, element } => {
                out.push(KIND_INSERT_NONGHOST);
                put_pid(out, *page);
                put_bytes(out, key);
                put_bytes(out, element);
            }
            LogRecord::Insert {
                page,
                key,
                element,
                prior,
            } => {
                out.push(KIND_INSERT);
                put_pid(out, *page);
                put_bytes(out, key);
                put_bytes(out, element);
                put_bytes(out, prior);
            }
            LogRecord::GhostReserve {
                page,
                key,
                element_len,
            } => {
                out.push(KIND_GHOST_RESERVE);
                put_pid(out, *page);
                put_bytes(out, key);
                var::encode_u64(u64::from(*element_len), out);
            }
            LogRecord::GhostMark { page, keys } => {
                out.push(KIND_GHOST_MARK);
                put_pid(out, *page);
                put_keys(out, keys);
            }
            LogRecord::GhostReclaim { page, keys } => {
                out.push(KIND_GHOST_RECLAIM);
                put_pid(out, *page);
                put_keys(out, keys);
            }
            LogRecord::Update {
                page,
                key,
                old,
                new,
            } => {
                out.push(KIND_UPDATE);
                put_pid(out, *page);
                put_bytes(out, key);
                put_bytes(out, old);
                put_bytes(out, new);
            }
            LogRecord::Overwrite {
                page,
                key,
                offset,
                old,
                new,
            } => {
                out.push(KIND_OVERWRITE);
                put_pid(out, *page);
                put_bytes(out, key);
                var::encode_u64(u64::from(*offset), out);
                put_bytes(out, old);
                put_bytes(out, new);
            }
            LogRecord::PageImageFormat { page, image } => {
                out.push(KIND_PAGE_IMAGE_FORMAT);
                put_pid(out, *page);
                put_bytes(out, image);
            }
            LogRecord::FosterSplit {
                page,
                new_page,
                right_begins_from,
                mid,
                chain_high,
                new_image,
            } => {
                out.push(KIND_FOSTER_SPLIT);
                put_pid(out, *page);
                put_pid(out, *new_page);
                var::encode_u64(u64::from(*right_begins_from), out);
                put_bytes(out, mid);
                put_bytes(out, chain_high);
                put_bytes(out, new_image);
            }
            LogRecord::FosterAdopt {
                parent,
                child,
                new_child_key,
                new_child,
                new_child_emlsn,
            } => {
                out.push(KIND_FOSTER_ADOPT);
                put_pid(out, *parent);
                put_pid(out, *child);
                put_bytes(out, new_child_key);
                put_pid(out, *new_child);
                var::encode_u64(new_child_emlsn.0, out);
            }
            LogRecord::GrowTree {
                root,
                new_child,
                child_image,
            } => {
                out.push(KIND_GROW_TREE);
                put_pid(out, *root);
                put_pid(out, *new_child);
                put_bytes(out, child_image);
            }
        }
    }

    /// Parses a record produced by [`LogRecord::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut r = Reader::new(src);
        let record = match r.u8()? {
            KIND_INSERT_NONGHOST => LogRecord::InsertNonGhost {
                page: get_pid(&mut r)?,
                key: r.bytes()?.to_vec(),
                element: r.bytes()?.to_vec(),
            },
            KIND_INSERT => LogRecord::Insert {
                page: get_pid(&mut r)?,
                key: r.bytes()?.to_vec(),
                element: r.bytes()?.to_vec(),
                prior: r.bytes()?.to_vec(),
            },
            KIND_GHOST_RESERVE => LogRecord::GhostReserve {
                page: get_pid(&mut r)?,
                key: r.bytes()?.to_vec(),
                element_len: get_u32(&mut r)?,
            },
            KIND_GHOST_MARK => LogRecord::GhostMark {
                page: get_pid(&mut r)?,
                keys: get_keys(&mut r)?,
            },
            KIND_GHOST_RECLAIM => LogRecord::GhostReclaim {
                page: get_pid(&mut r)?,
                keys: get_keys(&mut r)?,
            },
            KIND_UPDATE => LogRecord::Update {
                page: get_pid(&mut r)?,
                key: r.bytes()?.to_vec(),
                old: r.bytes()?.to_vec(),
                new: r.bytes()?.to_vec(),
            },
            KIND_OVERWRITE => LogRecord::Overwrite {
                page: get_pid(&mut r)?,
                key: r.bytes()?.to_vec(),
                offset: get_u32(&mut r)?,
                old: r.bytes()?.to_vec(),
                new: r.bytes()?.to_vec(),
            },
            KIND_PAGE_IMAGE_FORMAT => LogRecord::PageImageFormat {
                page: get_pid(&mut r)?,
                image: r.bytes()?.to_vec(),
            },
            KIND_FOSTER_SPLIT => LogRecord::FosterSplit {
                page: get_pid(&mut r)?,
                new_page: get_pid(&mut r)?,
                right_begins_from: u16::try_from(r.var()?)
                    .map_err(|_| FosterError::Corruption("split slot out of range"))?,
                mid: r.bytes()?.to_vec(),
                chain_high: r.bytes()?.to_vec(),
                new_image: r.bytes()?.to_vec(),
            },
            KIND_FOSTER_ADOPT => LogRecord::FosterAdopt {
                parent: get_pid(&mut r)?,
                child: get_pid(&mut r)?,
                new_child_key: r.bytes()?.to_vec(),
                new_child: get_pid(&mut r)?,
                new_child_emlsn: Lsn(r.var()?),
            },
            KIND_GROW_TREE => LogRecord::GrowTree {
                root: get_pid(&mut r)?,
                new_child: get_pid(&mut r)?,
                child_image: r.bytes()?.to_vec(),
            },
            _ => return Err(FosterError::Corruption("unknown log record kind")),
        };
        if r.remaining() != 0 {
            return Err(FosterError::Corruption("trailing bytes after log record"));
        }
        Ok(record)
    }
}

fn put_pid(out: &mut Vec<u8>, pid: PageId) {
    out.extend_from_slice(&pid.vol.to_be_bytes());
    out.extend_from_slice(&pid.page.to_be_bytes());
}

fn get_pid(r: &mut Reader<'_>) -> Result<PageId> {
    Ok(PageId::new(r.u32()?, r.u32()?))
}

fn get_u32(r: &mut Reader<'_>) -> Result<u32> {
    u32::try_from(r.var()?).map_err(|_| FosterError::Corruption("u32 field out of range"))
}

fn put_keys(out: &mut Vec<u8>, keys: &[Vec<u8>]) {
    var::encode_u64(keys.len() as u64, out);
    for key in keys {
        put_bytes(out, key);
    }
}

fn get_keys(r: &mut Reader<'_>) -> Result<Vec<Vec<u8>>> {
    let count = r.var()?;
    // Each key costs at least one length byte.
    if count > r.remaining() as u64 {
        return Err(FosterError::Corruption("key count exceeds record size"));
    }
    (0..count).map(|_| r.bytes().map(<[u8]>::to_vec)).collect()
}
