//! Storage error taxonomy

use std::io;
use thiserror::Error;

/// A partition or one of its blocks could not be decoded.
///
/// Scoped: `block` is `Some(index)` when only that block is affected, so the
/// caller can skip it and keep the rest of the partition.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("decode error in {path} (block {block:?}): {detail}")]
pub struct StorageDecodeError {
    pub path: String,
    pub block: Option<usize>,
    pub detail: String,
}

impl StorageDecodeError {
    pub fn partition(path: &str, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            block: None,
            detail: detail.into(),
        }
    }

    pub fn block(path: &str, block: usize, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            block: Some(block),
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error(transparent)]
    Decode(#[from] StorageDecodeError),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Row {row} does not match schema: {detail}")]
    RowMismatch { row: usize, detail: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid partition key component: {0:?}")]
    InvalidKey(String),

    #[error("Invalid range: start {start} >= end {end}")]
    InvalidRange { start: i64, end: i64 },
}

impl StorageError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_scoping() {
        let err = StorageDecodeError::block("trade/BTC/2024-01-01/part-000000.cfp", 3, "crc mismatch");
        assert_eq!(err.block, Some(3));
        assert!(err.to_string().contains("block Some(3)"));

        let whole = StorageDecodeError::partition("x.cfp", "bad magic");
        assert_eq!(whole.block, None);
    }

    #[test]
    fn test_transient_classification() {
        let io = StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk busy"));
        assert!(io.is_transient());
        assert!(!StorageError::Schema("no ts".into()).is_transient());
        assert!(!StorageError::AlreadyExists("p".into()).is_transient());
    }
}
