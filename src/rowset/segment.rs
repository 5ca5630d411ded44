//! Columnar segment and its primary-key index
//!
//! Only the surface the transaction core consumes: segment id, row count, and
//! the sorted primary-key index walked by publish-time delete-bitmap builds.

use crate::{EngineError, Result};
use std::sync::Arc;

pub type SegmentRef = Arc<Segment>;

/// One immutable columnar file within a rowset.
///
/// Rows are stored sorted by their encoded primary key, so a key's position
/// in the index is its row id within the segment.
pub struct Segment {
    id: u32,
    pk_index: PrimaryKeyIndex,
}

impl Segment {
    /// `keys` must be strictly increasing encoded primary keys.
    pub fn new(id: u32, keys: Vec<Vec<u8>>) -> SegmentRef {
        debug_assert!(
            keys.windows(2).all(|w| w[0] < w[1]),
            "segment keys must be strictly increasing"
        );
        Arc::new(Self {
            id,
            pk_index: PrimaryKeyIndex { keys },
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn num_rows(&self) -> usize {
        self.pk_index.num_rows()
    }

    /// Make the index blocks resident. The in-memory index is built at
    /// construction, so this only reports readiness.
    pub fn load_index(&self) -> Result<()> {
        Ok(())
    }

    pub fn primary_key_index(&self) -> &PrimaryKeyIndex {
        &self.pk_index
    }

    /// Resolve a key to its row id within this segment.
    pub fn lookup_row_key(&self, key: &[u8]) -> Result<u32> {
        let pos = self.pk_index.lower_bound(key);
        if pos < self.pk_index.keys.len() && self.pk_index.keys[pos] == key {
            Ok(pos as u32)
        } else {
            Err(EngineError::NotFound(format!(
                "key not in segment {}",
                self.id
            )))
        }
    }
}

/// Sorted index over the encoded primary keys of one segment.
pub struct PrimaryKeyIndex {
    keys: Vec<Vec<u8>>,
}

impl PrimaryKeyIndex {
    pub fn num_rows(&self) -> usize {
        self.keys.len()
    }

    pub fn new_iterator(&self) -> PrimaryKeyIndexIterator<'_> {
        PrimaryKeyIndexIterator {
            index: self,
            pos: 0,
        }
    }

    fn lower_bound(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() < key)
    }
}

/// Forward iterator over a primary-key index.
pub struct PrimaryKeyIndexIterator<'a> {
    index: &'a PrimaryKeyIndex,
    pos: usize,
}

impl<'a> PrimaryKeyIndexIterator<'a> {
    /// Position at the first key >= `key`. Returns whether the match is exact.
    pub fn seek_at_or_after(&mut self, key: &[u8]) -> Result<bool> {
        let pos = self.index.lower_bound(key);
        if pos == self.index.keys.len() {
            return Err(EngineError::NotFound(
                "seek past the end of the primary-key index".to_string(),
            ));
        }
        self.pos = pos;
        Ok(self.index.keys[pos] == key)
    }

    /// Read up to `*num` keys into `block`, advancing the iterator.
    /// On return `*num` holds the count actually read.
    pub fn next_batch(&mut self, num: &mut usize, block: &mut Vec<Vec<u8>>) -> Result<()> {
        block.clear();
        let take = (*num).min(self.index.keys.len() - self.pos);
        block.extend_from_slice(&self.index.keys[self.pos..self.pos + take]);
        self.pos += take;
        *num = take;
        Ok(())
    }
}
