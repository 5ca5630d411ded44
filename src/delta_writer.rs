//! Delta writer handle for slave-replica acknowledgement routing
//!
//! The master replica's writer stays registered with the transaction layer
//! until every slave replica has reported pulling the committed rowset.

use crate::types::{NodeId, TabletId, TransactionId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub type DeltaWriterRef = Arc<DeltaWriter>;

/// Tracks which slave replicas have pulled this writer's rowset.
pub struct DeltaWriter {
    txn_id: TransactionId,
    tablet_id: TabletId,
    success_slave_nodes: Mutex<HashSet<NodeId>>,
    failed_slave_nodes: Mutex<HashSet<NodeId>>,
}

impl DeltaWriter {
    pub fn new(txn_id: TransactionId, tablet_id: TabletId) -> DeltaWriterRef {
        Arc::new(Self {
            txn_id,
            tablet_id,
            success_slave_nodes: Mutex::new(HashSet::new()),
            failed_slave_nodes: Mutex::new(HashSet::new()),
        })
    }

    pub fn txn_id(&self) -> TransactionId {
        self.txn_id
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// Record one slave replica's pull result.
    pub fn finish_slave_tablet_pull_rowset(&self, node_id: NodeId, succeeded: bool) {
        if succeeded {
            self.success_slave_nodes.lock().insert(node_id);
        } else {
            self.failed_slave_nodes.lock().insert(node_id);
        }
    }

    pub fn success_slave_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.success_slave_nodes.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn failed_slave_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.failed_slave_nodes.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}
