//! Rowsets: immutable outputs of one load attempt on one tablet

pub mod segment;

pub use segment::{PrimaryKeyIndex, PrimaryKeyIndexIterator, Segment, SegmentRef};

use crate::meta::RowsetMeta;
use crate::types::{KeysType, RowsetId, RowsetType, TabletId, TabletUid, Version};
use crate::Result;
use parking_lot::RwLock;
use std::sync::Arc;

pub type RowsetRef = Arc<Rowset>;

/// A set of immutable segments produced by a single load attempt, plus its
/// durable metadata.
///
/// The transaction layer, the engine and the delete-bitmap build may all hold
/// a reference concurrently. The only mutation is `make_visible`, serialized
/// by the per-txn mutex at publish time.
pub struct Rowset {
    meta: RwLock<RowsetMeta>,
    segments: Vec<SegmentRef>,
}

impl Rowset {
    /// `segments` may be empty for metadata-only rowsets rebuilt in recovery.
    pub fn new(meta: RowsetMeta, segments: Vec<SegmentRef>) -> RowsetRef {
        debug_assert!(
            segments.is_empty() || segments.len() == meta.num_segments as usize,
            "segment count disagrees with metadata"
        );
        Arc::new(Self {
            meta: RwLock::new(meta),
            segments,
        })
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.meta.read().rowset_id
    }

    pub fn tablet_id(&self) -> TabletId {
        self.meta.read().tablet_id
    }

    pub fn tablet_uid(&self) -> TabletUid {
        self.meta.read().tablet_uid
    }

    pub fn version(&self) -> Version {
        self.meta.read().version
    }

    pub fn keys_type(&self) -> KeysType {
        self.meta.read().keys_type
    }

    pub fn rowset_type(&self) -> RowsetType {
        self.meta.read().rowset_type
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Snapshot of the current metadata.
    pub fn meta(&self) -> RowsetMeta {
        self.meta.read().clone()
    }

    pub fn serialized_meta(&self) -> Result<Vec<u8>> {
        self.meta.read().serialize()
    }

    /// Record the publish version. Mutates the in-memory metadata only; the
    /// caller is responsible for persisting the new bytes.
    pub fn make_visible(&self, version: Version) {
        self.meta.write().version = version;
    }

    /// Segments in publication order.
    pub fn load_segments(&self) -> Result<Vec<SegmentRef>> {
        Ok(self.segments.clone())
    }
}
