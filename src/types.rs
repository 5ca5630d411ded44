//! Shared identifier types for the storage engine core

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{EngineError, Result};

/// Coordinator-assigned id of a logical partition.
pub type PartitionId = i64;

/// Coordinator-assigned id of one load transaction.
pub type TransactionId = i64;

/// Id of a tablet on this storage node.
pub type TabletId = i64;

/// Hash of the tablet schema the load was written against.
pub type SchemaHash = u32;

/// Id of a storage node in the cluster.
pub type NodeId = i64;

/// Identifies a load transaction within one partition.
pub type TxnKey = (PartitionId, TransactionId);

/// 128-bit id of one physical tablet instance.
///
/// Survives tablet rename, changes when the tablet is dropped and recreated,
/// which makes it the disambiguator inside [`TabletInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletUid {
    pub hi: u64,
    pub lo: u64,
}

impl TabletUid {
    pub fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    pub fn generate() -> Self {
        Self {
            hi: rand::random::<u64>(),
            lo: rand::random::<u64>(),
        }
    }
}

impl fmt::Display for TabletUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.hi, self.lo)
    }
}

impl FromStr for TabletUid {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .split_once('-')
            .ok_or_else(|| EngineError::Parse(format!("malformed tablet uid: {s}")))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|e| EngineError::Parse(format!("malformed tablet uid {s}: {e}")))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|e| EngineError::Parse(format!("malformed tablet uid {s}: {e}")))?;
        Ok(Self { hi, lo })
    }
}

/// Unique token for one attempt by the coordinator to load data for a
/// transaction on one tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadId {
    pub hi: i64,
    pub lo: i64,
}

impl LoadId {
    pub fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    pub fn generate() -> Self {
        Self {
            hi: rand::random::<i64>(),
            lo: rand::random::<i64>(),
        }
    }
}

impl fmt::Display for LoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.hi, self.lo)
    }
}

/// Opaque rowset identifier with a total order.
///
/// The canonical form is 32 lowercase hex digits; it appears inside metadata
/// store keys and must stay stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowsetId(pub u128);

impl RowsetId {
    pub fn generate() -> Self {
        Self(rand::random::<u128>())
    }
}

impl fmt::Display for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for RowsetId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(EngineError::Parse(format!("malformed rowset id: {s}")));
        }
        u128::from_str_radix(s, 16)
            .map(RowsetId)
            .map_err(|e| EngineError::Parse(format!("malformed rowset id {s}: {e}")))
    }
}

// Serialized in canonical string form so metadata dumps stay human-readable.
impl Serialize for RowsetId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RowsetId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Version interval of a rowset in the tablet's published history.
///
/// A freshly committed rowset carries `(0, 0)` until publish assigns its
/// visible version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub start: i64,
    pub end: i64,
}

impl Version {
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub const fn singleton(v: i64) -> Self {
        Self { start: v, end: v }
    }

    pub fn is_singleton(&self) -> bool {
        self.start == self.end
    }

    /// True once publish has assigned a visible version.
    pub fn is_visible(&self) -> bool {
        self.start > 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// Identity of one tablet as seen by the transaction layer.
///
/// Equality uses all three fields; the uid tells two incarnations of the same
/// tablet id apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletInfo {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub tablet_uid: TabletUid,
}

impl TabletInfo {
    pub fn new(tablet_id: TabletId, schema_hash: SchemaHash, tablet_uid: TabletUid) -> Self {
        Self {
            tablet_id,
            schema_hash,
            tablet_uid,
        }
    }
}

impl fmt::Display for TabletInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tablet_id={}, schema_hash={}, tablet_uid={}",
            self.tablet_id, self.schema_hash, self.tablet_uid
        )
    }
}

/// Keys model of a tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeysType {
    Duplicate,
    Aggregate,
    Unique,
}

/// Physical layout family of a rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowsetType {
    Legacy,
    Columnar,
}

/// Physical location of one row inside a published rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLocation {
    pub rowset_id: RowsetId,
    pub segment_id: u32,
    pub row_id: u32,
}
