#![forbid(unsafe_code)]
//! Write-ahead log of B-tree page changes.
//!
//! Every record is framed with its LSN, the owning transaction and two CRCs
//! so a torn tail is detected and dropped on reload.

mod record;

pub use record::LogRecord;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::page::{read_u32, read_u64};
use crate::types::{Lsn, Result, TxnId};

const FRAME_HEADER_LEN: usize = 32;

/// A decoded log record with its position and owner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    /// Position in the log.
    pub lsn: Lsn,
    /// Owning user transaction; `None` for system transactions.
    pub txn: Option<TxnId>,
    /// The change.
    pub record: LogRecord,
}

/// Counters for log activity.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct WalStats {
    /// Records appended.
    pub records_appended: u64,
    /// Framed bytes appended.
    pub bytes_appended: u64,
}

/// Log contract used by the B-tree.
pub trait LogSink: Send + Sync {
    /// Appends a record and returns its LSN.
    fn append(&self, txn: Option<TxnId>, record: &LogRecord) -> Result<Lsn>;
    /// All entries with `lsn >= from`, in LSN order.
    fn read_from(&self, from: Lsn) -> Result<Vec<LogEntry>>;
    /// LSN of the most recent record, or zero.
    fn last_lsn(&self) -> Lsn;
    /// Entries written on behalf of `txn`, in LSN order.
    fn entries_for(&self, txn: TxnId) -> Result<Vec<LogEntry>> {
        Ok(self
            .read_from(Lsn::ZERO)?
            .into_iter()
            .filter(|entry| entry.txn == Some(txn))
            .collect())
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    lsn: Lsn,
    txn: u64,
    payload_len: u32,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode_with_crc(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.txn.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[20..24].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = compute_crc32(&[&buf]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Option<Self> {
        let header = src.get(..FRAME_HEADER_LEN)?;
        let mut zeroed = [0u8; FRAME_HEADER_LEN];
        zeroed.copy_from_slice(header);
        zeroed[28..32].fill(0);
        if compute_crc32(&[&zeroed]) != read_u32(header, 28) || header[24..28] != [0; 4] {
            return None;
        }
        Some(Self {
            lsn: Lsn(read_u64(header, 0)),
            txn: read_u64(header, 8),
            payload_len: read_u32(header, 16),
            payload_crc32: read_u32(header, 20),
        })
    }
}

fn compute_crc32(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

struct LogState {
    buf: Vec<u8>,
    index: Vec<(Lsn, usize)>,
    next_lsn: u64,
    stats: WalStats,
}

/// In-memory log holding framed records in one contiguous buffer.
pub struct MemoryLog {
    state: Mutex<LogState>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    /// An empty log whose first record gets LSN 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                buf: Vec::new(),
                index: Vec::new(),
                next_lsn: 1,
                stats: WalStats::default(),
            }),
        }
    }

    /// Reloads a log from bytes produced by [`MemoryLog::bytes`]. Parsing
    /// stops at the first frame that fails validation; everything before it
    /// is kept.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut index = Vec::new();
        let mut off = 0usize;
        let mut last = 0u64;
        while let Some(header) = FrameHeader::decode(&bytes[off..]) {
            let start = off + FRAME_HEADER_LEN;
            let Some(end) = start.checked_add(header.payload_len as usize) else {
                break;
            };
            let Some(payload) = bytes.get(start..end) else {
                break;
            };
            if compute_crc32(&[payload]) != header.payload_crc32 || header.lsn.0 <= last {
                break;
            }
            index.push((header.lsn, off));
            last = header.lsn.0;
            off = end;
        }
        if off < bytes.len() {
            warn!(
                target: "fosterdb::wal",
                valid_up_to = off,
                len = bytes.len(),
                "dropping torn log tail"
            );
        }
        Self {
            state: Mutex::new(LogState {
                buf: bytes[..off].to_vec(),
                index,
                next_lsn: last + 1,
                stats: WalStats::default(),
            }),
        }
    }

    /// The raw framed log.
    pub fn bytes(&self) -> Vec<u8> {
        self.state.lock().buf.clone()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// True when no record has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats
    }

    fn decode_at(buf: &[u8], off: usize) -> Result<LogEntry> {
        let header = FrameHeader::decode(&buf[off..]).ok_or(
            crate::types::FosterError::Corruption("log frame header invalid"),
        )?;
        let start = off + FRAME_HEADER_LEN;
        let payload = buf
            .get(start..start + header.payload_len as usize)
            .ok_or(crate::types::FosterError::Corruption("log frame truncated"))?;
        Ok(LogEntry {
            lsn: header.lsn,
            txn: (header.txn != 0).then_some(TxnId(header.txn)),
            record: LogRecord::decode(payload)?,
        })
    }
}

impl LogSink for MemoryLog {
    fn append(&self, txn: Option<TxnId>, record: &LogRecord) -> Result<Lsn> {
        let mut payload = Vec::new();
        record.encode(&mut payload);
        let mut state = self.state.lock();
        let lsn = Lsn(state.next_lsn);
        state.next_lsn += 1;
        let header = FrameHeader {
            lsn,
            txn: txn.map_or(0, |t| t.0),
            payload_len: payload.len() as u32,
            payload_crc32: compute_crc32(&[&payload]),
        };
        let off = state.buf.len();
        state.buf.extend_from_slice(&header.encode_with_crc());
        state.buf.extend_from_slice(&payload);
        state.index.push((lsn, off));
        state.stats.records_appended += 1;
        state.stats.bytes_appended += (FRAME_HEADER_LEN + payload.len()) as u64;
        debug!(
            target: "fosterdb::wal",
            lsn = lsn.0,
            kind = record.kind_name(),
            txn = txn.map_or(0, |t| t.0),
            "appended log record"
        );
        Ok(lsn)
    }

    fn read_from(&self, from: Lsn) -> Result<Vec<LogEntry>> {
        let state = self.state.lock();
        let first = state.index.partition_point(|(lsn, _)| *lsn < from);
        state.index[first..]
            .iter()
            .map(|&(_, off)| Self::decode_at(&state.buf, off))
            .collect()
    }

    fn last_lsn(&self) -> Lsn {
        let state = self.state.lock();
        state.index.last().map_or(Lsn::ZERO, |(lsn, _)| *lsn)
    }
}
