//! Columnar partition storage
//!
//! Immutable, self-describing partition files made of compressed row blocks.
//! Each block's timestamp range is recorded in the footer so that range and
//! point-in-time reads fetch only the blocks they need.
//!
//! # Modules
//! - `schema`: column types, `Value`, `Row`
//! - `block`: columnar block codec (bincode + zstd + CRC32C)
//! - `writer`: `PartitionWriter`, file layout and footer
//! - `reader`: `PartitionReader`, block selection, read policies
//! - `backend`: filesystem, in-memory and read-counting backends
//! - `store`: day-partitioned directory of immutable parts

pub mod backend;
pub mod block;
pub mod error;
pub mod reader;
pub mod schema;
pub mod store;
pub mod writer;

pub use backend::{CountingBackend, FsBackend, MemoryBackend, StorageBackend};
pub use block::BlockMeta;
pub use error::{StorageDecodeError, StorageError};
pub use reader::{point_intervals, select_blocks, PartitionReader, ReadPolicy, ScanResult, SkippedBlock};
pub use schema::{Column, ColumnType, Row, Schema, Value};
pub use store::{day_of, PartitionKey, PartitionStore};
pub use writer::{EncodedPartition, Footer, PartitionSummary, PartitionWriter, WriterConfig};
