//! Tablets and the node-local tablet registry

pub mod delete_bitmap;

pub use delete_bitmap::{BitmapKey, DeleteBitmap};

use crate::meta::store::MetaStore;
use crate::rowset::RowsetRef;
use crate::types::{KeysType, RowLocation, RowsetType, SchemaHash, TabletId, TabletInfo, TabletUid};
use crate::{EngineError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type TabletRef = Arc<Tablet>;

const TABLET_META_PREFIX: &str = "tbm_";

fn tablet_meta_key(tablet_uid: TabletUid) -> Vec<u8> {
    format!("{TABLET_META_PREFIX}{tablet_uid}").into_bytes()
}

/// Persisted per-tablet metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletMeta {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub tablet_uid: TabletUid,
    pub keys_type: KeysType,
    pub preferred_rowset_type: RowsetType,
    pub enable_unique_key_merge_on_write: bool,
    pub delete_bitmap: DeleteBitmap,
}

impl TabletMeta {
    pub fn load(store: &MetaStore, tablet_uid: TabletUid) -> Result<Self> {
        Ok(bincode::deserialize(&store.get(&tablet_meta_key(tablet_uid))?)?)
    }
}

/// A horizontal partition of a table on this storage node.
///
/// The header lock serializes metadata writers (delete-bitmap builds against
/// each other and against meta persistence); the inner locks keep point
/// lookups cheap while a writer holds the header.
pub struct Tablet {
    tablet_id: TabletId,
    schema_hash: SchemaHash,
    tablet_uid: TabletUid,
    keys_type: KeysType,
    preferred_rowset_type: RowsetType,
    enable_unique_key_merge_on_write: bool,
    header_lock: RwLock<()>,
    delete_bitmap: RwLock<DeleteBitmap>,
    visible_rowsets: RwLock<Vec<RowsetRef>>,
    meta_store: Option<Arc<MetaStore>>,
}

impl Tablet {
    /// Tablets constructed without a storage root skip meta persistence.
    pub fn new(meta: TabletMeta, meta_store: Option<Arc<MetaStore>>) -> TabletRef {
        Arc::new(Self {
            tablet_id: meta.tablet_id,
            schema_hash: meta.schema_hash,
            tablet_uid: meta.tablet_uid,
            keys_type: meta.keys_type,
            preferred_rowset_type: meta.preferred_rowset_type,
            enable_unique_key_merge_on_write: meta.enable_unique_key_merge_on_write,
            header_lock: RwLock::new(()),
            delete_bitmap: RwLock::new(meta.delete_bitmap),
            visible_rowsets: RwLock::new(Vec::new()),
            meta_store,
        })
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn schema_hash(&self) -> SchemaHash {
        self.schema_hash
    }

    pub fn tablet_uid(&self) -> TabletUid {
        self.tablet_uid
    }

    pub fn tablet_info(&self) -> TabletInfo {
        TabletInfo::new(self.tablet_id, self.schema_hash, self.tablet_uid)
    }

    pub fn keys_type(&self) -> KeysType {
        self.keys_type
    }

    pub fn preferred_rowset_type(&self) -> RowsetType {
        self.preferred_rowset_type
    }

    pub fn enable_unique_key_merge_on_write(&self) -> bool {
        self.enable_unique_key_merge_on_write
    }

    pub fn get_header_lock(&self) -> &RwLock<()> {
        &self.header_lock
    }

    pub fn delete_bitmap(&self) -> &RwLock<DeleteBitmap> {
        &self.delete_bitmap
    }

    /// Register a published rowset so point lookups can see it.
    /// Rowsets are kept ordered by version.
    pub fn add_visible_rowset(&self, rowset: RowsetRef) {
        let mut rowsets = self.visible_rowsets.write();
        rowsets.push(rowset);
        rowsets.sort_by_key(|r| r.version().start);
    }

    pub fn visible_rowsets(&self) -> Vec<RowsetRef> {
        self.visible_rowsets.read().clone()
    }

    /// Resolve an encoded primary key over every visible rowset whose version
    /// lies at or below `snapshot_version`. Newest rowset wins; within one
    /// rowset later segments win. Rows already dead in the delete bitmap are
    /// invisible.
    pub fn lookup_row_key(&self, key: &[u8], snapshot_version: i64) -> Result<RowLocation> {
        let rowsets = self.visible_rowsets.read();
        let bitmap = self.delete_bitmap.read();
        for rowset in rowsets.iter().rev() {
            if rowset.version().end > snapshot_version {
                continue;
            }
            let rowset_id = rowset.rowset_id();
            for segment in rowset.load_segments()?.iter().rev() {
                match segment.lookup_row_key(key) {
                    Ok(row_id) => {
                        if bitmap.is_row_deleted(rowset_id, segment.id(), snapshot_version, row_id)
                        {
                            continue;
                        }
                        return Ok(RowLocation {
                            rowset_id,
                            segment_id: segment.id(),
                            row_id,
                        });
                    }
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(EngineError::NotFound(format!(
            "key not found in tablet {}",
            self.tablet_id
        )))
    }

    /// Persist the tablet metadata, including the delete bitmap.
    pub fn save_meta(&self) -> Result<()> {
        let Some(store) = &self.meta_store else {
            return Ok(());
        };
        let meta = TabletMeta {
            tablet_id: self.tablet_id,
            schema_hash: self.schema_hash,
            tablet_uid: self.tablet_uid,
            keys_type: self.keys_type,
            preferred_rowset_type: self.preferred_rowset_type,
            enable_unique_key_merge_on_write: self.enable_unique_key_merge_on_write,
            delete_bitmap: self.delete_bitmap.read().clone(),
        };
        store.put(&tablet_meta_key(self.tablet_uid), &bincode::serialize(&meta)?)
    }
}

/// Node-local registry of tablets, keyed by tablet id.
pub struct TabletManager {
    tablets: DashMap<TabletId, TabletRef>,
}

impl TabletManager {
    pub fn new() -> Self {
        Self {
            tablets: DashMap::new(),
        }
    }

    pub fn add_tablet(&self, tablet: TabletRef) {
        self.tablets.insert(tablet.tablet_id(), tablet);
    }

    pub fn get_tablet(&self, tablet_id: TabletId) -> Option<TabletRef> {
        self.tablets.get(&tablet_id).map(|t| t.clone())
    }

    pub fn drop_tablet(&self, tablet_id: TabletId) -> Option<TabletRef> {
        self.tablets.remove(&tablet_id).map(|(_, t)| t)
    }

    pub fn tablet_count(&self) -> usize {
        self.tablets.len()
    }
}

impl Default for TabletManager {
    fn default() -> Self {
        Self::new()
    }
}
