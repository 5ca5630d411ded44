//! Publish-time delete-bitmap construction for merge-on-write tablets
//!
//! Every key of the freshly visible rowset is checked against earlier
//! segments of the same rowset and then against the tablet's published
//! history; hits mark the superseded row dead at the publish version.

use crate::rowset::{RowsetRef, SegmentRef};
use crate::tablet::TabletRef;
use crate::types::{RowsetId, Version};
use crate::Result;
use tracing::info;

const INDEX_BATCH_SIZE: usize = 1024;

/// Builds delete-bitmap entries for one publish of one rowset.
pub struct DeleteBitmapBuilder {
    tablet: TabletRef,
    version: Version,
}

impl DeleteBitmapBuilder {
    /// `version` must be the singleton publish version.
    pub fn new(tablet: TabletRef, version: Version) -> Self {
        debug_assert!(version.is_singleton());
        Self { tablet, version }
    }

    /// Walk every segment of `rowset` in publication order and mark
    /// superseded rows in the tablet's delete bitmap.
    ///
    /// Holds the tablet header write lock for the whole traversal. A failure
    /// part-way through leaves the edits already applied in memory; the
    /// caller surfaces the error and does not persist the tablet meta.
    pub fn build(&self, rowset: &RowsetRef) -> Result<()> {
        let segments = rowset.load_segments()?;
        let rowset_id = rowset.rowset_id();
        let _header_guard = self.tablet.get_header_lock().write();
        let mut pre_segments: Vec<SegmentRef> = Vec::new();
        for segment in &segments {
            segment.load_index()?;
            let pk_index = segment.primary_key_index();
            let total = pk_index.num_rows();
            let mut remaining = total;
            let mut marked = 0usize;
            let mut last_key: Vec<u8> = Vec::new();
            let mut block: Vec<Vec<u8>> = Vec::new();
            while remaining > 0 {
                let mut iter = pk_index.new_iterator();
                let num_to_read = INDEX_BATCH_SIZE.min(remaining);
                iter.seek_at_or_after(&last_key)?;
                let mut num_read = num_to_read;
                iter.next_batch(&mut num_read, &mut block)?;
                debug_assert_eq!(num_read, num_to_read);
                last_key = block[num_read - 1].clone();
                // Drop the batch's last key; the next batch re-seeks to it and
                // reads it again. The final batch of the segment keeps it.
                if num_read == INDEX_BATCH_SIZE && num_read != remaining {
                    num_read -= 1;
                }
                for key in block.iter().take(num_read) {
                    if self.mark_in_pre_segments(rowset_id, &pre_segments, key)? {
                        marked += 1;
                        continue;
                    }
                    match self.tablet.lookup_row_key(key, self.version.start - 1) {
                        Ok(loc) => {
                            marked += 1;
                            self.tablet.delete_bitmap().write().add(
                                (loc.rowset_id, loc.segment_id, self.version.start),
                                loc.row_id,
                            );
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                remaining -= num_read;
            }
            info!(
                tablet_id = self.tablet.tablet_id(),
                rowset_id = %rowset_id,
                segment_id = segment.id(),
                version = %self.version,
                marked,
                total,
                "constructed delete bitmap for segment"
            );
            pre_segments.push(segment.clone());
        }
        Ok(())
    }

    /// Check earlier segments of the same rowset, most recent first. A hit
    /// marks the superseded row and skips the global lookup.
    fn mark_in_pre_segments(
        &self,
        rowset_id: RowsetId,
        pre_segments: &[SegmentRef],
        key: &[u8],
    ) -> Result<bool> {
        for segment in pre_segments.iter().rev() {
            match segment.lookup_row_key(key) {
                Ok(row_id) => {
                    self.tablet
                        .delete_bitmap()
                        .write()
                        .add((rowset_id, segment.id(), self.version.start), row_id);
                    return Ok(true);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }
}
