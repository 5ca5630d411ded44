//! Storage engine composition
//!
//! The long-lived pieces wired together at storage-node start: the per-root
//! metadata store, the tablet registry, the transaction manager, and the
//! queue of rowsets awaiting file cleanup. Tests build a fresh engine per
//! case; nothing here is a process global.

use crate::config::EngineConfig;
use crate::meta::rowset_meta_store;
use crate::meta::store::MetaStore;
use crate::meta::RowsetMeta;
use crate::rowset::{Rowset, RowsetRef};
use crate::tablet::TabletManager;
use crate::txn::TxnManager;
use crate::types::TabletInfo;
use crate::Result;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Rowsets whose files await eventual cleanup by the garbage sweeper.
pub struct UnusedRowsets {
    rowsets: Mutex<Vec<RowsetRef>>,
}

impl UnusedRowsets {
    pub fn new() -> Self {
        Self {
            rowsets: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, rowset: RowsetRef) {
        self.rowsets.lock().push(rowset);
    }

    /// Drain the queue; the sweeper owns the returned rowsets.
    pub fn take_all(&self) -> Vec<RowsetRef> {
        std::mem::take(&mut *self.rowsets.lock())
    }

    pub fn len(&self) -> usize {
        self.rowsets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rowsets.lock().is_empty()
    }
}

impl Default for UnusedRowsets {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one recovery pass over the rowset meta store.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Entries read from the store.
    pub scanned: usize,
    /// Unpublished entries replayed into the transaction index.
    pub replayed: usize,
    /// Published entries re-attached to their tablet.
    pub reattached: usize,
    /// Entries that could not be placed (undecodable, or tablet unknown).
    pub skipped: usize,
    /// Non-fatal problems encountered along the way.
    pub errors: Vec<String>,
}

/// The storage-node engine core.
pub struct StorageEngine {
    meta: Arc<MetaStore>,
    tablets: Arc<TabletManager>,
    txn_manager: TxnManager,
    unused_rowsets: Arc<UnusedRowsets>,
    config: EngineConfig,
}

impl StorageEngine {
    pub fn open(root: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let meta = Arc::new(MetaStore::open(root)?);
        let tablets = Arc::new(TabletManager::new());
        let unused_rowsets = Arc::new(UnusedRowsets::new());
        let txn_manager = TxnManager::new(config.clone(), tablets.clone(), unused_rowsets.clone());
        Ok(Self {
            meta,
            tablets,
            txn_manager,
            unused_rowsets,
            config,
        })
    }

    pub fn meta_store(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn tablet_manager(&self) -> &Arc<TabletManager> {
        &self.tablets
    }

    pub fn txn_manager(&self) -> &TxnManager {
        &self.txn_manager
    }

    pub fn unused_rowsets(&self) -> &Arc<UnusedRowsets> {
        &self.unused_rowsets
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue a rowset for eventual file cleanup.
    pub fn add_unused_rowset(&self, rowset: RowsetRef) {
        self.unused_rowsets.add(rowset);
    }

    /// Rebuild the volatile transaction index from the rowset meta store.
    ///
    /// Unpublished entries are replayed as recovery commits, which take the
    /// normal commit path but skip the store write. Published entries belong
    /// to their tablet's visible history and are re-attached when the tablet
    /// is registered.
    pub fn recover_pending_txns(&self) -> Result<RecoveryReport> {
        // Collected first: the scan holds the store's read guard, and the
        // replay below must be free to touch the store.
        let mut entries: Vec<Vec<u8>> = Vec::new();
        rowset_meta_store::scan(&self.meta, |_, _, bytes| {
            entries.push(bytes.to_vec());
            true
        })?;

        let mut report = RecoveryReport::default();
        for bytes in entries {
            report.scanned += 1;
            let meta = match RowsetMeta::deserialize(&bytes) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(error = %e, "undecodable rowset meta during recovery");
                    report.errors.push(e.to_string());
                    report.skipped += 1;
                    continue;
                }
            };
            let tablet_info = TabletInfo::new(meta.tablet_id, meta.schema_hash, meta.tablet_uid);
            if !meta.version.is_visible() {
                let partition_id = meta.partition_id;
                let txn_id = meta.txn_id;
                let load_id = meta.load_id;
                let rowset = Rowset::new(meta, Vec::new());
                match self.txn_manager.commit_txn(
                    &self.meta,
                    partition_id,
                    txn_id,
                    tablet_info,
                    load_id,
                    Some(rowset),
                    true,
                ) {
                    Ok(()) => report.replayed += 1,
                    Err(e) => {
                        warn!(
                            partition_id,
                            txn_id,
                            tablet = %tablet_info,
                            error = %e,
                            "replaying committed rowset failed"
                        );
                        report.errors.push(e.to_string());
                        report.skipped += 1;
                    }
                }
            } else if let Some(tablet) = self.tablets.get_tablet(meta.tablet_id) {
                tablet.add_visible_rowset(Rowset::new(meta, Vec::new()));
                report.reattached += 1;
            } else {
                warn!(
                    tablet = %tablet_info,
                    rowset_id = %meta.rowset_id,
                    "published rowset for an unregistered tablet"
                );
                report.skipped += 1;
            }
        }
        info!(
            scanned = report.scanned,
            replayed = report.replayed,
            reattached = report.reattached,
            skipped = report.skipped,
            "recovered pending transactions"
        );
        Ok(report)
    }
}
