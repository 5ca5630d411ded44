//! Rowset metadata persistence for one storage root
//!
//! Keys are laid out as `rst_<tablet_uid>_<rowset_id>`. The layout is visible
//! to admin tooling and recovery and must stay bit-exact across versions.

use crate::meta::rowset_meta::RowsetMeta;
use crate::meta::store::MetaStore;
use crate::types::{RowsetId, TabletUid};
use crate::{EngineError, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

pub const ROWSET_META_PREFIX: &str = "rst_";

fn rowset_meta_key(tablet_uid: TabletUid, rowset_id: RowsetId) -> Vec<u8> {
    format!("{ROWSET_META_PREFIX}{tablet_uid}_{rowset_id}").into_bytes()
}

fn parse_rowset_meta_key(key: &[u8]) -> Option<(TabletUid, RowsetId)> {
    let key = std::str::from_utf8(key).ok()?;
    let rest = key.strip_prefix(ROWSET_META_PREFIX)?;
    let (uid, rowset) = rest.split_once('_')?;
    Some((uid.parse().ok()?, rowset.parse().ok()?))
}

/// Persist serialized rowset metadata.
pub fn save(
    store: &MetaStore,
    tablet_uid: TabletUid,
    rowset_id: RowsetId,
    meta_bytes: &[u8],
) -> Result<()> {
    store.put(&rowset_meta_key(tablet_uid, rowset_id), meta_bytes)
}

/// Fetch the serialized metadata for one rowset.
pub fn get(store: &MetaStore, tablet_uid: TabletUid, rowset_id: RowsetId) -> Result<Vec<u8>> {
    store.get(&rowset_meta_key(tablet_uid, rowset_id))
}

/// Fetch and decode the metadata for one rowset.
pub fn get_rowset_meta(
    store: &MetaStore,
    tablet_uid: TabletUid,
    rowset_id: RowsetId,
) -> Result<RowsetMeta> {
    RowsetMeta::deserialize(&get(store, tablet_uid, rowset_id)?)
}

pub fn exists(store: &MetaStore, tablet_uid: TabletUid, rowset_id: RowsetId) -> bool {
    store.contains(&rowset_meta_key(tablet_uid, rowset_id))
}

/// Remove one entry. A missing entry is a success.
pub fn remove(store: &MetaStore, tablet_uid: TabletUid, rowset_id: RowsetId) -> Result<()> {
    store.remove(&rowset_meta_key(tablet_uid, rowset_id))
}

/// Visit every rowset meta entry exactly once. The visitor returns false to
/// stop. Keys that do not decode are skipped with a warning.
pub fn scan<F>(store: &MetaStore, mut visit: F) -> Result<()>
where
    F: FnMut(TabletUid, RowsetId, &[u8]) -> bool,
{
    store.scan_prefix(ROWSET_META_PREFIX.as_bytes(), |key, value| {
        match parse_rowset_meta_key(key) {
            Some((tablet_uid, rowset_id)) => visit(tablet_uid, rowset_id, value),
            None => {
                warn!(key = %String::from_utf8_lossy(key), "skipping malformed rowset meta key");
                true
            }
        }
    })
}

/// Decode one entry and render it as JSON for admin tooling.
pub fn get_json(store: &MetaStore, tablet_uid: TabletUid, rowset_id: RowsetId) -> Result<String> {
    get_rowset_meta(store, tablet_uid, rowset_id)?.to_json()
}

/// Parse an offline JSON dump and install the entry it describes.
pub fn load_json_meta(store: &MetaStore, path: impl AsRef<Path>) -> Result<()> {
    let text = fs::read_to_string(path.as_ref()).map_err(EngineError::Io)?;
    let meta = RowsetMeta::from_json(&text)?;
    save(store, meta.tablet_uid, meta.rowset_id, &meta.serialize()?)
}
