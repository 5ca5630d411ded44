//! Delete bitmap for merge-on-write unique-key tablets

use crate::types::RowsetId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Coordinate of one bitmap: the rowset and segment holding the superseded
/// row, and the version whose publish superseded it.
pub type BitmapKey = (RowsetId, u32, i64);

/// Per-(rowset, segment, version) sets of row ids superseded by later writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteBitmap {
    bitmaps: BTreeMap<BitmapKey, BTreeSet<u32>>,
}

impl DeleteBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `row_id` dead at `key`.
    pub fn add(&mut self, key: BitmapKey, row_id: u32) {
        self.bitmaps.entry(key).or_default().insert(row_id);
    }

    pub fn contains(&self, key: &BitmapKey, row_id: u32) -> bool {
        self.bitmaps
            .get(key)
            .map(|rows| rows.contains(&row_id))
            .unwrap_or(false)
    }

    /// True when the row is marked dead at any version <= `max_version`.
    pub fn is_row_deleted(
        &self,
        rowset_id: RowsetId,
        segment_id: u32,
        max_version: i64,
        row_id: u32,
    ) -> bool {
        if max_version < 0 {
            return false;
        }
        self.bitmaps
            .range((rowset_id, segment_id, 0)..=(rowset_id, segment_id, max_version))
            .any(|(_, rows)| rows.contains(&row_id))
    }

    /// Number of distinct (rowset, segment, version) bitmaps.
    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Total count of marked rows across all bitmaps.
    pub fn cardinality(&self) -> usize {
        self.bitmaps.values().map(|rows| rows.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_contains() {
        let mut bitmap = DeleteBitmap::new();
        let key = (RowsetId(1), 0, 5);
        assert!(!bitmap.contains(&key, 3));
        bitmap.add(key, 3);
        assert!(bitmap.contains(&key, 3));
        assert!(!bitmap.contains(&key, 4));
        assert_eq!(bitmap.cardinality(), 1);
    }

    #[test]
    fn test_is_row_deleted_respects_version_ceiling() {
        let mut bitmap = DeleteBitmap::new();
        bitmap.add((RowsetId(1), 0, 7), 3);

        assert!(bitmap.is_row_deleted(RowsetId(1), 0, 7, 3));
        assert!(bitmap.is_row_deleted(RowsetId(1), 0, 100, 3));
        // Marked only at version 7; invisible to older snapshots
        assert!(!bitmap.is_row_deleted(RowsetId(1), 0, 6, 3));
        // Other segments and rowsets are untouched
        assert!(!bitmap.is_row_deleted(RowsetId(1), 1, 100, 3));
        assert!(!bitmap.is_row_deleted(RowsetId(2), 0, 100, 3));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut bitmap = DeleteBitmap::new();
        bitmap.add((RowsetId(1), 0, 5), 1);
        bitmap.add((RowsetId(1), 0, 5), 2);
        bitmap.add((RowsetId(2), 3, 6), 9);

        let bytes = bincode::serialize(&bitmap).unwrap();
        let back: DeleteBitmap = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.cardinality(), 3);
        assert!(back.contains(&(RowsetId(2), 3, 6), 9));
    }
}
