//! Durable rowset metadata

use crate::types::{
    KeysType, LoadId, PartitionId, RowsetId, RowsetType, SchemaHash, TabletId, TabletUid,
    TransactionId, Version,
};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Metadata persisted for every committed rowset.
///
/// Carries the owning load's partition/txn/load ids so a restart can rebuild
/// the in-memory transaction index from the store alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub rowset_id: RowsetId,
    pub rowset_type: RowsetType,
    pub keys_type: KeysType,
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub tablet_uid: TabletUid,
    pub partition_id: PartitionId,
    pub txn_id: TransactionId,
    pub load_id: LoadId,
    pub version: Version,
    pub num_segments: u32,
    pub num_rows: u64,
    pub total_disk_size: u64,
    pub creation_time: i64,
}

impl RowsetMeta {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::EngineError::Serialization(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| crate::EngineError::Parse(e.to_string()))
    }

    /// True once publish has assigned a visible version.
    pub fn is_visible(&self) -> bool {
        self.version.is_visible()
    }
}
