//! Loadstone Storage Engine Core
//!
//! The storage-node side of multi-tablet load transactions for a distributed
//! analytical column store.
//!
//! ## Architecture
//! - Metadata layer: per-root append-only key/value store holding rowset and
//!   tablet metadata
//! - Transaction layer: sharded in-memory index with a prepare / commit /
//!   publish / rollback / delete state machine
//! - Publish path: merge-on-write tablets get per-segment delete bitmaps
//!   built from the primary-key indexes of the freshly visible rowset

pub mod config;
pub mod delta_writer;
pub mod engine;
pub mod meta;
pub mod rowset;
pub mod tablet;
pub mod txn;
pub mod types;

mod error;

pub use config::EngineConfig;
pub use engine::{RecoveryReport, StorageEngine, UnusedRowsets};
pub use error::{EngineError, Result};
pub use meta::{MetaStore, RowsetMeta};
pub use rowset::{Rowset, RowsetRef, Segment, SegmentRef};
pub use tablet::{DeleteBitmap, Tablet, TabletManager, TabletMeta, TabletRef};
pub use txn::{DeleteBitmapBuilder, TxnManager};
pub use types::{
    KeysType, LoadId, PartitionId, RowLocation, RowsetId, RowsetType, SchemaHash, TabletId,
    TabletInfo, TabletUid, TransactionId, TxnKey, Version,
};
