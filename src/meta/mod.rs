//! Durable metadata: the per-root store and rowset meta persistence

pub mod rowset_meta;
pub mod rowset_meta_store;
pub mod store;

pub use rowset_meta::RowsetMeta;
pub use store::{MetaStore, MetaStoreStats};
