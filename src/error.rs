//! Error types for the storage engine core

use crate::types::RowsetId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("too many running transactions: {running}, limit: {limit}")]
    TooManyTransactions { running: usize, limit: usize },

    #[error("invalid rowset: {0}")]
    RowsetInvalid(String),

    #[error("transaction already committed with a different rowset: existing {existing}, new {new}")]
    AlreadyExists { existing: RowsetId, new: RowsetId },

    #[error("transaction already committed")]
    AlreadyCommitted,

    #[error("transaction not exist: partition_id={partition_id}, txn_id={txn_id}")]
    TransactionNotExist { partition_id: i64, txn_id: i64 },

    #[error("save rowset meta failed: {0}")]
    SaveFailed(String),
}

impl EngineError {
    /// Lookup misses are a normal outcome on key resolution paths.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
