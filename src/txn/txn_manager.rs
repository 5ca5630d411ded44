//! Load transaction manager
//!
//! Tracks in-flight loads per (partition, txn, tablet), persists committed
//! rowset metadata to the per-root store, and makes rowsets visible at
//! publish time, building merge-on-write delete bitmaps where the tablet
//! requires them.

use crate::config::EngineConfig;
use crate::delta_writer::DeltaWriterRef;
use crate::engine::UnusedRowsets;
use crate::meta::rowset_meta_store;
use crate::meta::store::MetaStore;
use crate::rowset::RowsetRef;
use crate::tablet::TabletManager;
use crate::txn::delete_bitmap_builder::DeleteBitmapBuilder;
use crate::txn::txn_index::{unix_seconds, TabletTxnInfo, TxnIndex, TxnMaps};
use crate::types::{
    KeysType, LoadId, NodeId, PartitionId, RowsetType, TabletId, TabletInfo, TransactionId,
    TxnKey, Version,
};
use crate::{EngineError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coordinates load transactions between the cluster coordinator and the
/// local storage engine.
///
/// The in-memory index is volatile; a restart rebuilds it by replaying the
/// rowset meta store with `is_recovery` commits.
pub struct TxnManager {
    config: EngineConfig,
    index: TxnIndex,
    tablets: Arc<TabletManager>,
    unused_rowsets: Arc<UnusedRowsets>,
}

impl TxnManager {
    pub fn new(
        config: EngineConfig,
        tablets: Arc<TabletManager>,
        unused_rowsets: Arc<UnusedRowsets>,
    ) -> Self {
        let index = TxnIndex::new(config.txn_map_shard_size, config.txn_shard_size);
        Self {
            config,
            index,
            tablets,
            unused_rowsets,
        }
    }

    /// Register a new load attempt.
    ///
    /// Prepare must stay permissive: ingest tasks are retried, and a retry
    /// after a successful commit with the same load id is simply tolerated.
    pub fn prepare_txn(
        &self,
        partition_id: PartitionId,
        txn_id: TransactionId,
        tablet_info: TabletInfo,
        load_id: LoadId,
    ) -> Result<()> {
        let key: TxnKey = (partition_id, txn_id);
        let mut maps = self.index.map_write(txn_id);
        if let Some(load_info) = maps.tablet_map.get(&key).and_then(|m| m.get(&tablet_info)) {
            if load_info.load_id == load_id && load_info.is_committed() {
                warn!(
                    partition_id,
                    txn_id,
                    tablet = %tablet_info,
                    "transaction already committed when preparing"
                );
                return Ok(());
            }
        }

        // Reject the request when this shard already tracks too many
        // transactions, so the coordinator backs off and retries.
        let running = maps.partition_map.len();
        if running > self.config.max_running_transactions_per_txn_map {
            warn!(
                running,
                limit = self.config.max_running_transactions_per_txn_map,
                "too many running transactions"
            );
            return Err(EngineError::TooManyTransactions {
                running,
                limit: self.config.max_running_transactions_per_txn_map,
            });
        }

        maps.tablet_map
            .entry(key)
            .or_default()
            .insert(tablet_info, TabletTxnInfo::new(load_id, None));
        maps.insert_txn_partition(txn_id, partition_id);
        debug!(partition_id, txn_id, tablet = %tablet_info, "prepared transaction");
        Ok(())
    }

    /// Record a committed rowset for a load and persist its metadata.
    ///
    /// Recovery replay passes `is_recovery` to suppress the store write while
    /// still taking the same bookkeeping path.
    pub fn commit_txn(
        &self,
        meta: &MetaStore,
        partition_id: PartitionId,
        txn_id: TransactionId,
        tablet_info: TabletInfo,
        load_id: LoadId,
        rowset: Option<RowsetRef>,
        is_recovery: bool,
    ) -> Result<()> {
        assert!(
            partition_id >= 1 && txn_id >= 1 && tablet_info.tablet_id >= 1,
            "invalid commit request: partition_id={partition_id} txn_id={txn_id} tablet_id={}",
            tablet_info.tablet_id
        );
        let Some(rowset) = rowset else {
            warn!(partition_id, txn_id, tablet = %tablet_info, "commit without a rowset");
            return Err(EngineError::RowsetInvalid(format!(
                "no rowset to commit: partition_id={partition_id}, txn_id={txn_id}"
            )));
        };

        let key: TxnKey = (partition_id, txn_id);
        let _txn_guard = self.index.txn_lock(txn_id);
        {
            let maps = self.index.map_read(txn_id);
            if let Some(load_info) = maps.tablet_map.get(&key).and_then(|m| m.get(&tablet_info)) {
                if load_info.load_id == load_id {
                    if let Some(existing) = &load_info.rowset {
                        if existing.rowset_id() == rowset.rowset_id() {
                            info!(
                                partition_id,
                                txn_id,
                                tablet = %tablet_info,
                                rowset_id = %existing.rowset_id(),
                                "duplicate commit of the same rowset"
                            );
                            return Ok(());
                        }
                        warn!(
                            partition_id,
                            txn_id,
                            tablet = %tablet_info,
                            existing = %existing.rowset_id(),
                            new = %rowset.rowset_id(),
                            "commit found an existing rowset with a different id"
                        );
                        return Err(EngineError::AlreadyExists {
                            existing: existing.rowset_id(),
                            new: rowset.rowset_id(),
                        });
                    }
                }
            }
        }

        // The store write may touch disk; it stays outside the shard lock and
        // inside the per-txn mutex so it cannot race this txn's publish.
        if !is_recovery {
            let bytes = rowset.serialized_meta()?;
            if let Err(e) =
                rowset_meta_store::save(meta, tablet_info.tablet_uid, rowset.rowset_id(), &bytes)
            {
                warn!(
                    partition_id,
                    txn_id,
                    rowset_id = %rowset.rowset_id(),
                    error = %e,
                    "saving committed rowset meta failed"
                );
                return Err(EngineError::SaveFailed(format!(
                    "save committed rowset {}: {e}",
                    rowset.rowset_id()
                )));
            }
        }

        {
            let mut maps = self.index.map_write(txn_id);
            let tablet_map = maps.tablet_map.entry(key).or_default();
            let mut load_info = TabletTxnInfo::new(load_id, Some(rowset.clone()));
            if let Some(existing) = tablet_map.get(&tablet_info) {
                load_info.creation_time = existing.creation_time;
            }
            tablet_map.insert(tablet_info, load_info);
            maps.insert_txn_partition(txn_id, partition_id);
            debug!(
                partition_id,
                txn_id,
                tablet = %tablet_info,
                rowset_id = %rowset.rowset_id(),
                "committed transaction"
            );
        }
        Ok(())
    }

    /// Make a committed rowset visible at `version` and drop the entry.
    pub fn publish_txn(
        &self,
        meta: &MetaStore,
        partition_id: PartitionId,
        txn_id: TransactionId,
        tablet_info: TabletInfo,
        version: Version,
    ) -> Result<()> {
        let key: TxnKey = (partition_id, txn_id);
        let _txn_guard = self.index.txn_lock(txn_id);
        let rowset: Option<RowsetRef> = {
            let maps = self.index.map_read(txn_id);
            maps.tablet_map
                .get(&key)
                .and_then(|m| m.get(&tablet_info))
                .and_then(|info| info.rowset.clone())
        };
        let Some(rowset) = rowset else {
            return Err(EngineError::TransactionNotExist {
                partition_id,
                txn_id,
            });
        };

        // The in-memory version advances before the durable write. A failed
        // save leaves the rowset visible in memory but not on disk; the
        // coordinator retries the publish.
        rowset.make_visible(version);
        let bytes = rowset.serialized_meta()?;
        if let Err(e) =
            rowset_meta_store::save(meta, tablet_info.tablet_uid, rowset.rowset_id(), &bytes)
        {
            warn!(
                partition_id,
                txn_id,
                rowset_id = %rowset.rowset_id(),
                error = %e,
                "saving published rowset meta failed"
            );
            return Err(EngineError::SaveFailed(format!(
                "save published rowset {}: {e}",
                rowset.rowset_id()
            )));
        }

        {
            let mut maps = self.index.map_write(txn_id);
            if let Some(tablet_map) = maps.tablet_map.get_mut(&key) {
                tablet_map.remove(&tablet_info);
                info!(
                    partition_id,
                    txn_id,
                    tablet = %tablet_info,
                    rowset_id = %rowset.rowset_id(),
                    version = %version,
                    "published transaction"
                );
                if tablet_map.is_empty() {
                    maps.tablet_map.remove(&key);
                    maps.clear_txn_partition(txn_id, partition_id);
                }
            }
        }

        let Some(tablet) = self.tablets.get_tablet(tablet_info.tablet_id) else {
            return Ok(());
        };
        if !tablet.enable_unique_key_merge_on_write()
            || tablet.preferred_rowset_type() != RowsetType::Columnar
            || rowset.keys_type() != KeysType::Unique
        {
            return Ok(());
        }
        assert!(
            version.is_singleton(),
            "publish version must be a singleton: {version}"
        );
        DeleteBitmapBuilder::new(tablet.clone(), version).build(&rowset)?;
        tablet.save_meta()?;
        Ok(())
    }

    /// Drop an uncommitted load.
    ///
    /// A committed entry cannot be rolled back here: another thread may have
    /// committed the rowset while this caller hit a write error, so the
    /// coordinator has to go through `delete_txn` instead.
    pub fn rollback_txn(
        &self,
        partition_id: PartitionId,
        txn_id: TransactionId,
        tablet_info: TabletInfo,
    ) -> Result<()> {
        let key: TxnKey = (partition_id, txn_id);
        let mut maps = self.index.map_write(txn_id);
        if let Some(tablet_map) = maps.tablet_map.get_mut(&key) {
            if let Some(load_info) = tablet_map.get(&tablet_info) {
                if load_info.is_committed() {
                    return Err(EngineError::AlreadyCommitted);
                }
            }
            tablet_map.remove(&tablet_info);
            info!(partition_id, txn_id, tablet = %tablet_info, "rolled back transaction");
            if tablet_map.is_empty() {
                maps.tablet_map.remove(&key);
                maps.clear_txn_partition(txn_id, partition_id);
            }
        }
        Ok(())
    }

    /// Remove a transaction on coordinator request, deleting the committed
    /// rowset meta from the store unless it was already published.
    pub fn delete_txn(
        &self,
        meta: &MetaStore,
        partition_id: PartitionId,
        txn_id: TransactionId,
        tablet_info: TabletInfo,
    ) -> Result<()> {
        let key: TxnKey = (partition_id, txn_id);
        let mut maps = self.index.map_write(txn_id);
        let Some(tablet_map) = maps.tablet_map.get_mut(&key) else {
            return Err(EngineError::TransactionNotExist {
                partition_id,
                txn_id,
            });
        };
        if let Some(load_info) = tablet_map.get(&tablet_info) {
            if let Some(rowset) = &load_info.rowset {
                if rowset.version().is_visible() {
                    warn!(
                        partition_id,
                        txn_id,
                        tablet = %tablet_info,
                        rowset_id = %rowset.rowset_id(),
                        version = %rowset.version(),
                        "refusing to delete a published rowset"
                    );
                    return Err(EngineError::AlreadyCommitted);
                }
                rowset_meta_store::remove(meta, tablet_info.tablet_uid, rowset.rowset_id())?;
                self.unused_rowsets.add(rowset.clone());
                debug!(
                    partition_id,
                    txn_id,
                    tablet = %tablet_info,
                    rowset_id = %rowset.rowset_id(),
                    "deleted transaction"
                );
            }
        }
        tablet_map.remove(&tablet_info);
        if tablet_map.is_empty() {
            maps.tablet_map.remove(&key);
            maps.clear_txn_partition(txn_id, partition_id);
        }
        Ok(())
    }

    /// All transactions touching one tablet, plus the last partition id
    /// observed for it.
    pub fn get_tablet_related_txns(
        &self,
        tablet_info: TabletInfo,
    ) -> (PartitionId, BTreeSet<TransactionId>) {
        let mut partition_id = 0;
        let mut txn_ids = BTreeSet::new();
        for shard in 0..self.index.map_shard_count() {
            let maps = self.index.shard_read(shard);
            for (key, tablet_map) in &maps.tablet_map {
                if tablet_map.contains_key(&tablet_info) {
                    partition_id = key.0;
                    txn_ids.insert(key.1);
                }
            }
        }
        (partition_id, txn_ids)
    }

    /// Snapshot of every tablet under one transaction. Uncommitted entries
    /// surface with an empty rowset so a publish over them can fail loudly.
    pub fn get_txn_related_tablets(
        &self,
        txn_id: TransactionId,
        partition_id: PartitionId,
    ) -> BTreeMap<TabletInfo, Option<RowsetRef>> {
        let key: TxnKey = (partition_id, txn_id);
        let maps = self.index.map_read(txn_id);
        let Some(tablet_map) = maps.tablet_map.get(&key) else {
            debug!(partition_id, txn_id, "no tablets for transaction");
            return BTreeMap::new();
        };
        tablet_map
            .iter()
            .map(|(info, load_info)| (*info, load_info.rowset.clone()))
            .collect()
    }

    pub fn get_all_related_tablets(&self) -> BTreeSet<TabletInfo> {
        let mut tablet_infos = BTreeSet::new();
        for shard in 0..self.index.map_shard_count() {
            let maps = self.index.shard_read(shard);
            for tablet_map in maps.tablet_map.values() {
                tablet_infos.extend(tablet_map.keys().copied());
            }
        }
        tablet_infos
    }

    pub fn get_partition_ids(&self, txn_id: TransactionId) -> Vec<PartitionId> {
        let maps = self.index.map_read(txn_id);
        let mut partition_ids: Vec<PartitionId> = maps
            .partition_map
            .get(&txn_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        partition_ids.sort_unstable();
        partition_ids
    }

    pub fn has_txn(
        &self,
        partition_id: PartitionId,
        txn_id: TransactionId,
        tablet_info: TabletInfo,
    ) -> bool {
        let key: TxnKey = (partition_id, txn_id);
        let maps = self.index.map_read(txn_id);
        maps.tablet_map
            .get(&key)
            .map(|m| m.contains_key(&tablet_info))
            .unwrap_or(false)
    }

    /// Collect every entry older than the configured expiry, grouped by
    /// tablet, so the reaper can drop abandoned loads.
    pub fn build_expire_txn_map(
        &self,
        expire_txn_map: &mut BTreeMap<TabletInfo, Vec<TransactionId>>,
    ) {
        let now = unix_seconds();
        for shard in 0..self.index.map_shard_count() {
            let maps = self.index.shard_read(shard);
            for (key, tablet_map) in &maps.tablet_map {
                for (tablet_info, load_info) in tablet_map {
                    let age = now - load_info.creation_time;
                    if age >= self.config.pending_data_expire_time_sec {
                        expire_txn_map.entry(*tablet_info).or_default().push(key.1);
                        debug!(
                            tablet = %tablet_info,
                            txn_id = key.1,
                            age,
                            "found expired transaction"
                        );
                    }
                }
            }
        }
    }

    /// Drop every transaction touching one tablet, deleting committed rowset
    /// metas from the store. Used on tablet drop.
    ///
    /// Best-effort by design: the per-txn mutex is deliberately skipped, so a
    /// concurrent publish of the same txn may observe partial state. Store
    /// failures are logged and the cleanup continues.
    pub fn force_rollback_tablet_related_txns(&self, meta: &MetaStore, tablet_info: TabletInfo) {
        for shard in 0..self.index.map_shard_count() {
            let mut maps = self.index.shard_write(shard);
            let TxnMaps {
                tablet_map,
                partition_map,
            } = &mut *maps;
            tablet_map.retain(|key, entries| {
                if let Some(load_info) = entries.get(&tablet_info) {
                    if let Some(rowset) = &load_info.rowset {
                        if let Err(e) =
                            rowset_meta_store::remove(meta, tablet_info.tablet_uid, rowset.rowset_id())
                        {
                            warn!(
                                tablet = %tablet_info,
                                rowset_id = %rowset.rowset_id(),
                                error = %e,
                                "removing rowset meta during forced rollback failed"
                            );
                        }
                    }
                    info!(
                        partition_id = key.0,
                        txn_id = key.1,
                        tablet = %tablet_info,
                        "force rolled back tablet transaction"
                    );
                    entries.remove(&tablet_info);
                }
                if entries.is_empty() {
                    TxnMaps::clear_partition_entry(partition_map, key.1, key.0);
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Register the delta writer that should receive slave pull results.
    pub fn add_txn_tablet_delta_writer(
        &self,
        txn_id: TransactionId,
        tablet_id: TabletId,
        writer: DeltaWriterRef,
    ) {
        let mut shard = self.index.delta_writer_write(txn_id);
        shard.entry(txn_id).or_default().insert(tablet_id, writer);
    }

    /// Route one slave replica's pull acknowledgement to its writer.
    /// Missing entries are logged and dropped.
    pub fn finish_slave_tablet_pull_rowset(
        &self,
        txn_id: TransactionId,
        tablet_id: TabletId,
        node_id: NodeId,
        succeeded: bool,
    ) {
        let shard = self.index.delta_writer_write(txn_id);
        let Some(tablet_writers) = shard.get(&txn_id) else {
            warn!(txn_id, tablet_id, "delta writer map does not exist");
            return;
        };
        let Some(writer) = tablet_writers.get(&tablet_id) else {
            warn!(txn_id, tablet_id, "delta writer does not exist");
            return;
        };
        writer.finish_slave_tablet_pull_rowset(node_id, succeeded);
    }

    pub fn clear_txn_tablet_delta_writer(&self, txn_id: TransactionId) {
        let mut shard = self.index.delta_writer_write(txn_id);
        shard.remove(&txn_id);
        debug!(txn_id, "removed delta writer map");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta_writer::DeltaWriter;
    use crate::meta::RowsetMeta;
    use crate::rowset::{Rowset, Segment};
    use crate::tablet::{DeleteBitmap, Tablet, TabletMeta};
    use crate::types::{RowsetId, TabletUid};
    use tempfile::TempDir;

    const PARTITION: PartitionId = 10;
    const TXN: TransactionId = 100;

    fn uid1() -> TabletUid {
        TabletUid::new(1, 1)
    }

    fn tablet1() -> TabletInfo {
        TabletInfo::new(7, 42, uid1())
    }

    fn tablet2() -> TabletInfo {
        TabletInfo::new(8, 42, TabletUid::new(2, 2))
    }

    fn load1() -> LoadId {
        LoadId::new(1, 1)
    }

    fn setup() -> (TempDir, Arc<MetaStore>, Arc<TabletManager>, Arc<UnusedRowsets>, TxnManager) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MetaStore::open(dir.path()).unwrap());
        let tablets = Arc::new(TabletManager::new());
        let unused = Arc::new(UnusedRowsets::new());
        let manager = TxnManager::new(EngineConfig::for_testing(), tablets.clone(), unused.clone());
        (dir, store, tablets, unused, manager)
    }

    fn make_rowset(tablet_info: TabletInfo, rowset_id: u128, version: Version) -> RowsetRef {
        Rowset::new(
            RowsetMeta {
                rowset_id: RowsetId(rowset_id),
                rowset_type: crate::types::RowsetType::Columnar,
                keys_type: KeysType::Unique,
                tablet_id: tablet_info.tablet_id,
                schema_hash: tablet_info.schema_hash,
                tablet_uid: tablet_info.tablet_uid,
                partition_id: PARTITION,
                txn_id: TXN,
                load_id: load1(),
                version,
                num_segments: 0,
                num_rows: 0,
                total_disk_size: 0,
                creation_time: unix_seconds(),
            },
            Vec::new(),
        )
    }

    fn make_rowset_with_keys(
        tablet_info: TabletInfo,
        rowset_id: u128,
        version: Version,
        keys: Vec<Vec<u8>>,
    ) -> RowsetRef {
        Rowset::new(
            RowsetMeta {
                rowset_id: RowsetId(rowset_id),
                rowset_type: crate::types::RowsetType::Columnar,
                keys_type: KeysType::Unique,
                tablet_id: tablet_info.tablet_id,
                schema_hash: tablet_info.schema_hash,
                tablet_uid: tablet_info.tablet_uid,
                partition_id: PARTITION,
                txn_id: TXN,
                load_id: load1(),
                version,
                num_segments: 1,
                num_rows: keys.len() as u64,
                total_disk_size: 0,
                creation_time: unix_seconds(),
            },
            vec![Segment::new(0, keys)],
        )
    }

    #[test]
    fn test_happy_path_prepare_commit_publish() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let rowset = make_rowset(tablet1(), 1, Version::new(0, 0));

        manager.prepare_txn(PARTITION, TXN, tablet1(), load1()).unwrap();
        manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(rowset), false)
            .unwrap();
        manager
            .publish_txn(&store, PARTITION, TXN, tablet1(), Version::singleton(5))
            .unwrap();

        assert!(!manager.has_txn(PARTITION, TXN, tablet1()));
        assert!(manager.get_partition_ids(TXN).is_empty());
        let persisted =
            rowset_meta_store::get_rowset_meta(&store, uid1(), RowsetId(1)).unwrap();
        assert_eq!(persisted.version, Version::singleton(5));
    }

    #[test]
    fn test_duplicate_prepare_is_idempotent() {
        let (_dir, _store, _tablets, _unused, manager) = setup();
        manager.prepare_txn(PARTITION, TXN, tablet1(), load1()).unwrap();
        manager.prepare_txn(PARTITION, TXN, tablet1(), load1()).unwrap();
        assert!(manager.has_txn(PARTITION, TXN, tablet1()));
        assert_eq!(manager.get_partition_ids(TXN), vec![PARTITION]);
    }

    #[test]
    fn test_duplicate_commit_same_rowset_writes_once() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let rowset = make_rowset(tablet1(), 1, Version::new(0, 0));

        manager.prepare_txn(PARTITION, TXN, tablet1(), load1()).unwrap();
        manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(rowset.clone()), false)
            .unwrap();
        assert_eq!(store.stats().puts, 1);

        manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(rowset), false)
            .unwrap();
        assert_eq!(store.stats().puts, 1);
    }

    #[test]
    fn test_conflicting_commit_is_rejected() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let r1 = make_rowset(tablet1(), 1, Version::new(0, 0));
        let r2 = make_rowset(tablet1(), 2, Version::new(0, 0));

        manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(r1), false)
            .unwrap();
        let err = manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(r2), false)
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists { .. }));

        // The original commit is untouched
        let tablets = manager.get_txn_related_tablets(TXN, PARTITION);
        let kept = tablets.get(&tablet1()).unwrap().as_ref().unwrap();
        assert_eq!(kept.rowset_id(), RowsetId(1));
    }

    #[test]
    fn test_commit_without_rowset_is_invalid() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let err = manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), None, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::RowsetInvalid(_)));
    }

    #[test]
    #[should_panic(expected = "invalid commit request")]
    fn test_commit_with_bad_ids_panics() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let rowset = make_rowset(tablet1(), 1, Version::new(0, 0));
        let _ = manager.commit_txn(&store, 0, TXN, tablet1(), load1(), Some(rowset), false);
    }

    #[test]
    fn test_rollback_before_commit() {
        let (_dir, _store, _tablets, _unused, manager) = setup();
        manager.prepare_txn(PARTITION, TXN, tablet1(), load1()).unwrap();
        manager.rollback_txn(PARTITION, TXN, tablet1()).unwrap();

        assert!(!manager.has_txn(PARTITION, TXN, tablet1()));
        assert!(manager.get_partition_ids(TXN).is_empty());
        // A second rollback of the same txn is still ok
        manager.rollback_txn(PARTITION, TXN, tablet1()).unwrap();
    }

    #[test]
    fn test_rollback_after_commit_is_rejected() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let rowset = make_rowset(tablet1(), 1, Version::new(0, 0));
        manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(rowset), false)
            .unwrap();

        let err = manager.rollback_txn(PARTITION, TXN, tablet1()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyCommitted));
        assert!(manager.has_txn(PARTITION, TXN, tablet1()));
    }

    #[test]
    fn test_delete_after_commit_before_publish() {
        let (_dir, store, _tablets, unused, manager) = setup();
        let rowset = make_rowset(tablet1(), 1, Version::new(0, 0));
        manager.prepare_txn(PARTITION, TXN, tablet1(), load1()).unwrap();
        manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(rowset), false)
            .unwrap();
        assert!(rowset_meta_store::exists(&store, uid1(), RowsetId(1)));

        manager.delete_txn(&store, PARTITION, TXN, tablet1()).unwrap();
        assert!(!rowset_meta_store::exists(&store, uid1(), RowsetId(1)));
        assert!(!manager.has_txn(PARTITION, TXN, tablet1()));
        let queued = unused.take_all();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].rowset_id(), RowsetId(1));
    }

    #[test]
    fn test_delete_published_rowset_is_rejected() {
        let (_dir, store, _tablets, unused, manager) = setup();
        // A rowset whose in-memory meta already carries a published version,
        // as left behind by a publish that failed after make-visible
        let rowset = make_rowset(tablet1(), 1, Version::singleton(5));
        manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(rowset), false)
            .unwrap();

        let err = manager.delete_txn(&store, PARTITION, TXN, tablet1()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyCommitted));
        assert!(rowset_meta_store::exists(&store, uid1(), RowsetId(1)));
        assert!(unused.take_all().is_empty());
        assert!(manager.has_txn(PARTITION, TXN, tablet1()));
    }

    #[test]
    fn test_delete_unknown_txn() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let err = manager.delete_txn(&store, PARTITION, TXN, tablet1()).unwrap_err();
        assert!(matches!(err, EngineError::TransactionNotExist { .. }));
    }

    #[test]
    fn test_publish_unknown_txn() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let err = manager
            .publish_txn(&store, PARTITION, TXN, tablet1(), Version::singleton(5))
            .unwrap_err();
        assert!(matches!(err, EngineError::TransactionNotExist { .. }));
    }

    #[test]
    fn test_publish_uncommitted_txn() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        manager.prepare_txn(PARTITION, TXN, tablet1(), load1()).unwrap();
        let err = manager
            .publish_txn(&store, PARTITION, TXN, tablet1(), Version::singleton(5))
            .unwrap_err();
        assert!(matches!(err, EngineError::TransactionNotExist { .. }));
        // The prepared entry survives for a later commit
        assert!(manager.has_txn(PARTITION, TXN, tablet1()));
    }

    #[test]
    fn test_multi_tablet_publish_keeps_siblings() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        for info in [tablet1(), tablet2()] {
            manager.prepare_txn(PARTITION, TXN, info, load1()).unwrap();
            let rowset = make_rowset(info, info.tablet_id as u128, Version::new(0, 0));
            manager
                .commit_txn(&store, PARTITION, TXN, info, load1(), Some(rowset), false)
                .unwrap();
        }

        manager
            .publish_txn(&store, PARTITION, TXN, tablet1(), Version::singleton(5))
            .unwrap();
        assert!(!manager.has_txn(PARTITION, TXN, tablet1()));
        assert!(manager.has_txn(PARTITION, TXN, tablet2()));
        assert_eq!(manager.get_partition_ids(TXN), vec![PARTITION]);

        manager
            .publish_txn(&store, PARTITION, TXN, tablet2(), Version::singleton(5))
            .unwrap();
        assert!(!manager.has_txn(PARTITION, TXN, tablet2()));
        assert!(manager.get_partition_ids(TXN).is_empty());
        assert!(manager.get_txn_related_tablets(TXN, PARTITION).is_empty());
    }

    #[test]
    fn test_too_many_transactions() {
        let (_dir, _store, tablets, unused, _manager) = setup();
        let config = EngineConfig {
            max_running_transactions_per_txn_map: 1,
            ..EngineConfig::for_testing()
        };
        let manager = TxnManager::new(config, tablets, unused);

        // All three txn ids land in the same map shard of four
        manager.prepare_txn(1, 100, tablet1(), load1()).unwrap();
        manager.prepare_txn(2, 104, tablet1(), load1()).unwrap();
        let err = manager.prepare_txn(3, 108, tablet1(), load1()).unwrap_err();
        assert!(matches!(err, EngineError::TooManyTransactions { .. }));
    }

    #[test]
    fn test_recovery_commit_skips_store_write() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        let rowset = make_rowset(tablet1(), 1, Version::new(0, 0));
        manager
            .commit_txn(&store, PARTITION, TXN, tablet1(), load1(), Some(rowset), true)
            .unwrap();
        assert_eq!(store.stats().puts, 0);
        assert!(manager.has_txn(PARTITION, TXN, tablet1()));
        assert_eq!(manager.get_partition_ids(TXN), vec![PARTITION]);
    }

    #[test]
    fn test_tablet_related_queries() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        manager.prepare_txn(PARTITION, 100, tablet1(), load1()).unwrap();
        manager.prepare_txn(PARTITION, 101, tablet1(), load1()).unwrap();
        let rowset = make_rowset(tablet2(), 9, Version::new(0, 0));
        manager
            .commit_txn(&store, PARTITION, 102, tablet2(), load1(), Some(rowset), false)
            .unwrap();

        let (partition_id, txn_ids) = manager.get_tablet_related_txns(tablet1());
        assert_eq!(partition_id, PARTITION);
        assert_eq!(txn_ids, BTreeSet::from([100, 101]));

        let all = manager.get_all_related_tablets();
        assert_eq!(all, BTreeSet::from([tablet1(), tablet2()]));

        let related = manager.get_txn_related_tablets(102, PARTITION);
        assert_eq!(related.len(), 1);
        assert!(related.get(&tablet2()).unwrap().is_some());
    }

    #[test]
    fn test_expire_txn_map() {
        let (_dir, _store, _tablets, _unused, manager) = setup();
        manager.prepare_txn(PARTITION, 100, tablet1(), load1()).unwrap();
        manager.prepare_txn(PARTITION, 101, tablet1(), load1()).unwrap();

        // Nothing is old enough yet
        let mut expired = BTreeMap::new();
        manager.build_expire_txn_map(&mut expired);
        assert!(expired.is_empty());

        // Backdate one entry past the expiry window
        {
            let mut maps = manager.index.map_write(100);
            let info = maps
                .tablet_map
                .get_mut(&(PARTITION, 100))
                .unwrap()
                .get_mut(&tablet1())
                .unwrap();
            info.creation_time -= manager.config.pending_data_expire_time_sec + 1;
        }

        let mut expired = BTreeMap::new();
        manager.build_expire_txn_map(&mut expired);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired.get(&tablet1()).unwrap(), &vec![100]);
    }

    #[test]
    fn test_force_rollback_tablet_related_txns() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        // Two txns on tablet1 (one committed), one on tablet2
        manager.prepare_txn(PARTITION, 100, tablet1(), load1()).unwrap();
        let r1 = make_rowset(tablet1(), 1, Version::new(0, 0));
        manager
            .commit_txn(&store, PARTITION, 101, tablet1(), load1(), Some(r1), false)
            .unwrap();
        let r2 = make_rowset(tablet2(), 2, Version::new(0, 0));
        manager
            .commit_txn(&store, PARTITION, 102, tablet2(), load1(), Some(r2), false)
            .unwrap();

        manager.force_rollback_tablet_related_txns(&store, tablet1());

        assert!(!manager.has_txn(PARTITION, 100, tablet1()));
        assert!(!manager.has_txn(PARTITION, 101, tablet1()));
        assert!(!rowset_meta_store::exists(&store, uid1(), RowsetId(1)));
        // The other tablet is untouched
        assert!(manager.has_txn(PARTITION, 102, tablet2()));
        assert!(rowset_meta_store::exists(&store, tablet2().tablet_uid, RowsetId(2)));
        let (_, txn_ids) = manager.get_tablet_related_txns(tablet1());
        assert!(txn_ids.is_empty());
    }

    #[test]
    fn test_delta_writer_routing() {
        let (_dir, _store, _tablets, _unused, manager) = setup();
        let writer = DeltaWriter::new(TXN, 7);
        manager.add_txn_tablet_delta_writer(TXN, 7, writer.clone());

        manager.finish_slave_tablet_pull_rowset(TXN, 7, 31, true);
        manager.finish_slave_tablet_pull_rowset(TXN, 7, 32, false);
        // Unknown txn and tablet ids are logged and dropped
        manager.finish_slave_tablet_pull_rowset(999, 7, 33, true);
        manager.finish_slave_tablet_pull_rowset(TXN, 999, 33, true);

        assert_eq!(writer.success_slave_node_ids(), vec![31]);
        assert_eq!(writer.failed_slave_node_ids(), vec![32]);

        manager.clear_txn_tablet_delta_writer(TXN);
        manager.finish_slave_tablet_pull_rowset(TXN, 7, 34, true);
        assert_eq!(writer.success_slave_node_ids(), vec![31]);
    }

    #[test]
    fn test_publish_builds_delete_bitmap_for_mow_tablet() {
        let (_dir, store, tablets, _unused, manager) = setup();
        let info = tablet1();
        let tablet = Tablet::new(
            TabletMeta {
                tablet_id: info.tablet_id,
                schema_hash: info.schema_hash,
                tablet_uid: info.tablet_uid,
                keys_type: KeysType::Unique,
                preferred_rowset_type: crate::types::RowsetType::Columnar,
                enable_unique_key_merge_on_write: true,
                delete_bitmap: DeleteBitmap::new(),
            },
            Some(store.clone()),
        );
        // Version 2 holds keys 0..10
        tablet.add_visible_rowset(make_rowset_with_keys(
            info,
            1,
            Version::singleton(2),
            (0..10u32).map(|i| i.to_be_bytes().to_vec()).collect(),
        ));
        tablets.add_tablet(tablet.clone());

        // The new load rewrites keys 5..15
        let fresh = make_rowset_with_keys(
            info,
            2,
            Version::new(0, 0),
            (5..15u32).map(|i| i.to_be_bytes().to_vec()).collect(),
        );
        manager
            .commit_txn(&store, PARTITION, TXN, info, load1(), Some(fresh), false)
            .unwrap();
        manager
            .publish_txn(&store, PARTITION, TXN, info, Version::singleton(5))
            .unwrap();

        assert_eq!(tablet.delete_bitmap().read().cardinality(), 5);
        for row in 5..10u32 {
            assert!(tablet
                .delete_bitmap()
                .read()
                .contains(&(RowsetId(1), 0, 5), row));
        }
        // The publish also persisted the tablet meta with the new bitmap
        let persisted = TabletMeta::load(&store, info.tablet_uid).unwrap();
        assert_eq!(persisted.delete_bitmap.cardinality(), 5);
    }

    #[test]
    fn test_publish_skips_bitmap_for_non_mow_tablet() {
        let (_dir, store, tablets, _unused, manager) = setup();
        let info = tablet1();
        let tablet = Tablet::new(
            TabletMeta {
                tablet_id: info.tablet_id,
                schema_hash: info.schema_hash,
                tablet_uid: info.tablet_uid,
                keys_type: KeysType::Unique,
                preferred_rowset_type: crate::types::RowsetType::Columnar,
                enable_unique_key_merge_on_write: false,
                delete_bitmap: DeleteBitmap::new(),
            },
            Some(store.clone()),
        );
        tablet.add_visible_rowset(make_rowset_with_keys(
            info,
            1,
            Version::singleton(2),
            vec![vec![1], vec![2]],
        ));
        tablets.add_tablet(tablet.clone());

        let fresh = make_rowset_with_keys(info, 2, Version::new(0, 0), vec![vec![1]]);
        manager
            .commit_txn(&store, PARTITION, TXN, info, load1(), Some(fresh), false)
            .unwrap();
        manager
            .publish_txn(&store, PARTITION, TXN, info, Version::singleton(5))
            .unwrap();
        assert!(tablet.delete_bitmap().read().is_empty());
    }

    #[test]
    fn test_concurrent_loads_on_distinct_txns() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MetaStore::open(dir.path()).unwrap());
        let tablets = Arc::new(TabletManager::new());
        let unused = Arc::new(UnusedRowsets::new());
        let manager = Arc::new(TxnManager::new(
            EngineConfig::for_testing(),
            tablets,
            unused,
        ));

        let mut handles = Vec::new();
        for i in 0..8i64 {
            let manager = manager.clone();
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let txn_id = 200 + i;
                let info = TabletInfo::new(50 + i, 42, TabletUid::new(i as u64, i as u64));
                let load_id = LoadId::new(i, i);
                manager.prepare_txn(PARTITION, txn_id, info, load_id).unwrap();
                let rowset = make_rowset(info, 1000 + i as u128, Version::new(0, 0));
                manager
                    .commit_txn(&store, PARTITION, txn_id, info, load_id, Some(rowset), false)
                    .unwrap();
                manager
                    .publish_txn(&store, PARTITION, txn_id, info, Version::singleton(2))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(manager.get_all_related_tablets().is_empty());
        // One commit write and one publish write per load
        assert_eq!(store.stats().puts, 16);
    }

    #[test]
    fn test_partition_map_tracks_tablet_map() {
        let (_dir, store, _tablets, _unused, manager) = setup();
        // Two partitions under one txn id
        manager.prepare_txn(10, TXN, tablet1(), load1()).unwrap();
        manager.prepare_txn(11, TXN, tablet2(), load1()).unwrap();
        assert_eq!(manager.get_partition_ids(TXN), vec![10, 11]);

        manager.rollback_txn(10, TXN, tablet1()).unwrap();
        assert_eq!(manager.get_partition_ids(TXN), vec![11]);

        let rowset = make_rowset(tablet2(), 5, Version::new(0, 0));
        manager
            .commit_txn(&store, 11, TXN, tablet2(), load1(), Some(rowset), false)
            .unwrap();
        manager
            .publish_txn(&store, 11, TXN, tablet2(), Version::singleton(3))
            .unwrap();
        assert!(manager.get_partition_ids(TXN).is_empty());
    }
}
