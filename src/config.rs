//! Engine configuration
//!
//! Process-wide knobs read once at storage-node start.

use serde::{Deserialize, Serialize};

/// Configuration for the storage engine core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cap on in-flight transactions tracked by one txn-map shard.
    /// New prepares beyond the cap are rejected so the coordinator retries.
    pub max_running_transactions_per_txn_map: usize,

    /// Seconds before an unpublished load is considered expired and becomes
    /// a candidate for reaping.
    pub pending_data_expire_time_sec: i64,

    /// Writer threads owned by the RPC layer. The expiry map must outlive
    /// them, so the knob lives here with the rest of the engine config.
    pub number_tablet_writer_threads: usize,

    /// Shard count for the txn tablet/partition maps. Must be a power of two.
    pub txn_map_shard_size: usize,

    /// Shard count for the per-txn mutexes. Must be a power of two.
    pub txn_shard_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_running_transactions_per_txn_map: 100,
            pending_data_expire_time_sec: 1800,
            number_tablet_writer_threads: 16,
            txn_map_shard_size: 128,
            txn_shard_size: 1024,
        }
    }
}

impl EngineConfig {
    /// Small shard counts so tests can exercise cross-shard scans cheaply.
    pub fn for_testing() -> Self {
        Self {
            max_running_transactions_per_txn_map: 100,
            pending_data_expire_time_sec: 3600,
            number_tablet_writer_threads: 1,
            txn_map_shard_size: 4,
            txn_shard_size: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_shardable() {
        let config = EngineConfig::default();
        assert!(config.txn_map_shard_size.is_power_of_two());
        assert!(config.txn_shard_size.is_power_of_two());
        assert!(config.max_running_transactions_per_txn_map > 0);
        assert!(config.pending_data_expire_time_sec > 0);
    }

    #[test]
    fn test_testing_preset() {
        let config = EngineConfig::for_testing();
        assert!(config.txn_map_shard_size.is_power_of_two());
        assert!(config.txn_shard_size.is_power_of_two());
        assert!(config.txn_map_shard_size <= 8);
    }
}
