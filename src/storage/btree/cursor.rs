use std::collections::VecDeque;
use std::ops::Bound;

use super::key::{KeyBuf, KeyCodec, KeyDecode, KeyStr};
use super::page::BTreePage;
use super::search::search;
use super::tree::BTree;
use crate::primitives::pager::LatchMode;
use crate::types::{FosterError, Result};

/// Forward iterator over the live records of a key range.
///
/// The cursor copies one leaf at a time under a shared latch and resumes
/// from that leaf's high fence, so it never holds a latch between calls and
/// sees each key at most once even while the tree splits underneath it.
pub struct Cursor<'a> {
    tree: &'a BTree,
    lower: EncodedBound,
    upper: EncodedBound,
    buffered: VecDeque<(KeyBuf, Vec<u8>)>,
    resume: Option<KeyBuf>,
}

struct LeafBatch {
    records: Vec<(KeyBuf, Vec<u8>)>,
    next: Option<KeyBuf>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(tree: &'a BTree, lower: EncodedBound, upper: EncodedBound) -> Self {
        let resume = if EncodedBound::range_is_empty(&lower, &upper) {
            None
        } else {
            Some(match lower.key_bytes() {
                Some(key) => KeyBuf::from_slice(key),
                None => KeyBuf::from_slice(KeyStr::neg_infinity().as_bytes()),
            })
        };
        Self {
            tree,
            lower,
            upper,
            buffered: VecDeque::new(),
            resume,
        }
    }

    /// Advances the cursor and returns the next user key and element.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.fill()?;
        match self.buffered.pop_front() {
            Some((key, element)) => {
                let user = key
                    .get(1..)
                    .ok_or(FosterError::Corruption("leaf holds an infinite key"))?;
                Ok(Some((user.to_vec(), element)))
            }
            None => Ok(None),
        }
    }

    /// [`Cursor::next`] with the key decoded as `K`.
    pub fn next_typed<K: KeyDecode>(&mut self) -> Result<Option<(K, Vec<u8>)>> {
        match self.next()? {
            Some((key, element)) => Ok(Some((K::decode_key(&key)?, element))),
            None => Ok(None),
        }
    }

    /// Drains the rest of the range.
    pub fn collect_all(mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        while let Some(pair) = self.next()? {
            out.push(pair);
        }
        Ok(out)
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffered.is_empty() {
            let Some(from) = self.resume.take() else {
                return Ok(());
            };
            let batch = self
                .tree
                .retry_on_lock_conflict(|| self.read_leaf(&from))?;
            self.buffered.extend(batch.records);
            self.resume = batch.next;
        }
        Ok(())
    }

    fn read_leaf(&self, from: &[u8]) -> Result<LeafBatch> {
        let leaf = self.tree.traverse(from, LatchMode::Shared)?;
        let page = BTreePage::wrap(leaf.data());
        let mut records = Vec::new();
        for slot in search(&page, from).slot..page.nrecs() {
            let key = page.key(slot);
            if self.is_past_upper(&key) {
                return Ok(LeafBatch { records, next: None });
            }
            if !page.is_ghost(slot) && self.lower_allows(&key) {
                records.push((key, page.element(slot).to_vec()));
            }
        }
        let high = page.fence_high();
        let next = (high.as_slice() != KeyStr::pos_infinity().as_bytes()).then_some(high);
        Ok(LeafBatch { records, next })
    }

    fn lower_allows(&self, key: &[u8]) -> bool {
        match &self.lower {
            EncodedBound::Unbounded => true,
            EncodedBound::Included(bound) => key >= bound.as_slice(),
            EncodedBound::Excluded(bound) => key > bound.as_slice(),
        }
    }

    fn is_past_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            EncodedBound::Unbounded => false,
            EncodedBound::Included(bound) => key > bound.as_slice(),
            EncodedBound::Excluded(bound) => key >= bound.as_slice(),
        }
    }
}

/// A range bound over keystr bytes.
#[derive(Clone)]
pub(crate) enum EncodedBound {
    Unbounded,
    Included(Vec<u8>),
    Excluded(Vec<u8>),
}

impl EncodedBound {
    pub(crate) fn from_bound<K: KeyCodec + ?Sized>(bound: Bound<&K>) -> Self {
        match bound {
            Bound::Unbounded => EncodedBound::Unbounded,
            Bound::Included(key) => EncodedBound::Included(KeyStr::encode(key).as_bytes().to_vec()),
            Bound::Excluded(key) => EncodedBound::Excluded(KeyStr::encode(key).as_bytes().to_vec()),
        }
    }

    fn key_bytes(&self) -> Option<&[u8]> {
        match self {
            EncodedBound::Unbounded => None,
            EncodedBound::Included(bytes) | EncodedBound::Excluded(bytes) => Some(bytes.as_slice()),
        }
    }

    fn range_is_empty(lower: &EncodedBound, upper: &EncodedBound) -> bool {
        let (Some(lo), Some(hi)) = (lower.key_bytes(), upper.key_bytes()) else {
            return false;
        };
        match lo.cmp(hi) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => !matches!(
                (lower, upper),
                (EncodedBound::Included(_), EncodedBound::Included(_))
            ),
            std::cmp::Ordering::Less => false,
        }
    }
}

impl BTree {
    /// Cursor over the live records between `lower` and `upper`.
    pub fn range<K: KeyCodec + ?Sized>(&self, lower: Bound<&K>, upper: Bound<&K>) -> Cursor<'_> {
        Cursor::new(self, EncodedBound::from_bound(lower), EncodedBound::from_bound(upper))
    }

    /// Cursor over every live record.
    pub fn scan(&self) -> Cursor<'_> {
        Cursor::new(self, EncodedBound::Unbounded, EncodedBound::Unbounded)
    }
}
