//! Sharded in-memory index of in-flight load transactions
//!
//! Two independent shard families: rw-locked map shards holding the
//! tablet/partition bookkeeping, and plain mutexes serializing commit against
//! publish for one transaction. Unrelated transactions never contend.

use crate::delta_writer::DeltaWriterRef;
use crate::rowset::RowsetRef;
use crate::types::{LoadId, PartitionId, TabletId, TabletInfo, TransactionId, TxnKey};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-(txn, tablet) bookkeeping.
///
/// `rowset` is empty after prepare and set by commit; the entry is removed on
/// publish, rollback or delete.
#[derive(Clone)]
pub struct TabletTxnInfo {
    pub load_id: LoadId,
    pub rowset: Option<RowsetRef>,
    pub creation_time: i64,
}

impl TabletTxnInfo {
    pub fn new(load_id: LoadId, rowset: Option<RowsetRef>) -> Self {
        Self {
            load_id,
            rowset,
            creation_time: unix_seconds(),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.rowset.is_some()
    }
}

pub(crate) type TabletTxnMap = HashMap<TabletInfo, TabletTxnInfo>;

/// One map shard: the tablet map and its partition bookkeeping, maintained
/// together under the shard's write guard.
#[derive(Default)]
pub(crate) struct TxnMaps {
    pub tablet_map: HashMap<TxnKey, TabletTxnMap>,
    pub partition_map: HashMap<TransactionId, HashSet<PartitionId>>,
}

impl TxnMaps {
    pub fn insert_txn_partition(&mut self, txn_id: TransactionId, partition_id: PartitionId) {
        Self::insert_partition_entry(&mut self.partition_map, txn_id, partition_id);
    }

    pub fn clear_txn_partition(&mut self, txn_id: TransactionId, partition_id: PartitionId) {
        Self::clear_partition_entry(&mut self.partition_map, txn_id, partition_id);
    }

    pub fn insert_partition_entry(
        partition_map: &mut HashMap<TransactionId, HashSet<PartitionId>>,
        txn_id: TransactionId,
        partition_id: PartitionId,
    ) {
        partition_map.entry(txn_id).or_default().insert(partition_id);
    }

    /// Erases the pair, dropping the txn entry when its set empties.
    pub fn clear_partition_entry(
        partition_map: &mut HashMap<TransactionId, HashSet<PartitionId>>,
        txn_id: TransactionId,
        partition_id: PartitionId,
    ) {
        if let Some(partitions) = partition_map.get_mut(&txn_id) {
            partitions.remove(&partition_id);
            if partitions.is_empty() {
                partition_map.remove(&txn_id);
            }
        }
    }
}

pub(crate) type DeltaWriterMap = HashMap<TransactionId, HashMap<TabletId, DeltaWriterRef>>;

/// The sharded index. Lock order, never violated: per-txn mutex first, then
/// a shard rw-lock.
pub struct TxnIndex {
    map_shards: Vec<RwLock<TxnMaps>>,
    delta_writer_shards: Vec<RwLock<DeltaWriterMap>>,
    txn_locks: Vec<Mutex<()>>,
}

impl TxnIndex {
    /// Both shard counts must be non-zero powers of two.
    pub fn new(map_shard_count: usize, txn_shard_count: usize) -> Self {
        assert!(
            map_shard_count.is_power_of_two(),
            "map shard count must be a power of two: {map_shard_count}"
        );
        assert!(
            txn_shard_count.is_power_of_two(),
            "txn shard count must be a power of two: {txn_shard_count}"
        );
        Self {
            map_shards: (0..map_shard_count).map(|_| RwLock::default()).collect(),
            delta_writer_shards: (0..map_shard_count).map(|_| RwLock::default()).collect(),
            txn_locks: (0..txn_shard_count).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn map_shard_count(&self) -> usize {
        self.map_shards.len()
    }

    fn map_shard(&self, txn_id: TransactionId) -> usize {
        txn_id as usize & (self.map_shards.len() - 1)
    }

    pub(crate) fn map_read(&self, txn_id: TransactionId) -> RwLockReadGuard<'_, TxnMaps> {
        self.map_shards[self.map_shard(txn_id)].read()
    }

    pub(crate) fn map_write(&self, txn_id: TransactionId) -> RwLockWriteGuard<'_, TxnMaps> {
        self.map_shards[self.map_shard(txn_id)].write()
    }

    pub(crate) fn shard_read(&self, shard: usize) -> RwLockReadGuard<'_, TxnMaps> {
        self.map_shards[shard].read()
    }

    pub(crate) fn shard_write(&self, shard: usize) -> RwLockWriteGuard<'_, TxnMaps> {
        self.map_shards[shard].write()
    }

    /// Serializes commit and publish for one transaction.
    pub(crate) fn txn_lock(&self, txn_id: TransactionId) -> MutexGuard<'_, ()> {
        self.txn_locks[txn_id as usize & (self.txn_locks.len() - 1)].lock()
    }

    pub(crate) fn delta_writer_write(
        &self,
        txn_id: TransactionId,
    ) -> RwLockWriteGuard<'_, DeltaWriterMap> {
        self.delta_writer_shards[self.map_shard(txn_id)].write()
    }
}
