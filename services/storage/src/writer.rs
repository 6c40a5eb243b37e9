//! Partition writer
//!
//! Buffers rows for one partition, sorts them by timestamp and lays them out
//! as a sequence of row blocks followed by a self-describing footer.
//!
//! # File layout
//! ```text
//! [MAGIC: 8 bytes]
//! [block 0] [block 1] ... [block n]
//! [footer: bincode(Footer)]
//! [footer_len: u32 LE]
//! [footer_crc: u32 LE]   // CRC32C over footer bytes
//! [MAGIC: 8 bytes]
//! ```

use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::backend::StorageBackend;
use crate::block::{encode_block, BlockMeta};
use crate::error::StorageError;
use crate::schema::{Row, Schema};

pub const MAGIC: &[u8; 8] = b"CFPART01";
pub const FORMAT_VERSION: u16 = 1;

/// Trailer after the footer: footer_len + footer_crc + MAGIC.
pub const TRAILER_LEN: u64 = 4 + 4 + 8;

/// Embedded partition metadata. Enough to select blocks without reading them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footer {
    pub version: u16,
    pub schema: Schema,
    pub blocks: Vec<BlockMeta>,
    pub row_count: u64,
}

impl Footer {
    pub fn min_ts(&self) -> Option<i64> {
        self.blocks.iter().map(|b| b.min_ts).min()
    }

    pub fn max_ts(&self) -> Option<i64> {
        self.blocks.iter().map(|b| b.max_ts).max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Estimated row bytes per block before a new block is cut.
    pub target_block_bytes: usize,
    /// Hard cap on rows per block.
    pub max_block_rows: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            target_block_bytes: 1024 * 1024,
            max_block_rows: 65_536,
        }
    }
}

/// Result of a completed partition write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub path: String,
    pub row_count: u64,
    pub block_count: usize,
    pub byte_size: u64,
    pub min_ts: Option<i64>,
    pub max_ts: Option<i64>,
    /// SHA-256 of the whole file, hex encoded.
    pub sha256: String,
}

pub struct PartitionWriter {
    schema: Schema,
    config: WriterConfig,
    rows: Vec<Row>,
    buffered_bytes: usize,
}

impl PartitionWriter {
    pub fn new(schema: Schema, config: WriterConfig) -> Self {
        Self {
            schema,
            config,
            rows: Vec::new(),
            buffered_bytes: 0,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Validate and buffer one row.
    pub fn push(&mut self, row: Row) -> Result<(), StorageError> {
        self.schema.validate_row(self.rows.len(), &row)?;
        self.buffered_bytes += row.estimated_size();
        self.rows.push(row);
        Ok(())
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = Row>) -> Result<(), StorageError> {
        for row in rows {
            self.push(row)?;
        }
        Ok(())
    }

    /// Encode the buffered rows into partition bytes.
    pub fn finish(mut self) -> Result<(Vec<u8>, Footer), StorageError> {
        // Stable: rows sharing a timestamp keep their arrival order.
        self.rows.sort_by_key(|r| r.ts);

        let mut out = Vec::with_capacity(self.buffered_bytes / 2 + 64);
        out.extend_from_slice(MAGIC);

        let mut blocks = Vec::new();
        for chunk in cut_blocks(&self.rows, &self.config) {
            let block = encode_block(&self.schema, chunk)?;
            blocks.push(BlockMeta {
                min_ts: block.min_ts,
                max_ts: block.max_ts,
                row_count: block.row_count,
                byte_offset: out.len() as u64,
                byte_length: block.bytes.len() as u64,
                checksum: block.checksum,
            });
            out.extend_from_slice(&block.bytes);
        }

        let footer = Footer {
            version: FORMAT_VERSION,
            schema: self.schema,
            blocks,
            row_count: self.rows.len() as u64,
        };
        let footer_bytes =
            bincode::serialize(&footer).map_err(|e| StorageError::Encode(e.to_string()))?;
        out.extend_from_slice(&footer_bytes);
        out.extend_from_slice(&(footer_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&crc32c(&footer_bytes).to_le_bytes());
        out.extend_from_slice(MAGIC);

        Ok((out, footer))
    }

    /// Encode the buffered rows and digest the result.
    pub fn encode(self) -> Result<EncodedPartition, StorageError> {
        let (bytes, footer) = self.finish()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256 = format!("{:x}", hasher.finalize());
        Ok(EncodedPartition { bytes, footer, sha256 })
    }

    /// Encode and store the partition at `path`, replacing any object there.
    pub fn write_to<B: StorageBackend + ?Sized>(
        self,
        backend: &B,
        path: &str,
    ) -> Result<PartitionSummary, StorageError> {
        let encoded = self.encode()?;
        backend.put(path, &encoded.bytes)?;
        Ok(encoded.committed(path))
    }
}

/// Partition bytes ready to be stored, with their footer and digest.
pub struct EncodedPartition {
    pub bytes: Vec<u8>,
    pub footer: Footer,
    pub sha256: String,
}

impl EncodedPartition {
    /// Summary of these bytes once stored at `path`.
    pub fn committed(&self, path: &str) -> PartitionSummary {
        let summary = PartitionSummary {
            path: path.to_string(),
            row_count: self.footer.row_count,
            block_count: self.footer.blocks.len(),
            byte_size: self.bytes.len() as u64,
            min_ts: self.footer.min_ts(),
            max_ts: self.footer.max_ts(),
            sha256: self.sha256.clone(),
        };
        debug!(
            path = %summary.path,
            rows = summary.row_count,
            blocks = summary.block_count,
            bytes = summary.byte_size,
            sha256 = %summary.sha256,
            "Partition written"
        );
        summary
    }
}

/// Split sorted rows into block-sized chunks.
fn cut_blocks<'a>(rows: &'a [Row], config: &WriterConfig) -> Vec<&'a [Row]> {
    let max_rows = config.max_block_rows.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (i, row) in rows.iter().enumerate() {
        let size = row.estimated_size();
        let rows_in_block = i - start;
        if rows_in_block > 0
            && (rows_in_block >= max_rows || bytes + size > config.target_block_bytes)
        {
            chunks.push(&rows[start..i]);
            start = i;
            bytes = 0;
        }
        bytes += size;
    }
    if start < rows.len() {
        chunks.push(&rows[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::schema::{Column, ColumnType, Value};

    fn schema() -> Schema {
        Schema::new(vec![Column::required("seq", ColumnType::Int64)]).unwrap()
    }

    fn row(ts: i64, seq: i64) -> Row {
        Row::new(ts, vec![Value::Int64(seq)])
    }

    #[test]
    fn test_rows_sorted_stably_by_ts() {
        let mut writer = PartitionWriter::new(schema(), WriterConfig::default());
        writer
            .extend(vec![row(30, 0), row(10, 1), row(30, 2), row(20, 3)])
            .unwrap();
        let (_, footer) = writer.finish().unwrap();
        assert_eq!(footer.blocks.len(), 1);
        assert_eq!(footer.blocks[0].min_ts, 10);
        assert_eq!(footer.blocks[0].max_ts, 30);
        assert_eq!(footer.row_count, 4);
    }

    #[test]
    fn test_blocks_cut_by_row_cap() {
        let config = WriterConfig {
            target_block_bytes: usize::MAX,
            max_block_rows: 10,
        };
        let mut writer = PartitionWriter::new(schema(), config);
        writer.extend((0..25).map(|i| row(i, i))).unwrap();
        let (_, footer) = writer.finish().unwrap();

        let counts: Vec<u32> = footer.blocks.iter().map(|b| b.row_count).collect();
        assert_eq!(counts, vec![10, 10, 5]);
        assert_eq!(footer.blocks[1].min_ts, 10);
        assert_eq!(footer.blocks[1].max_ts, 19);
    }

    #[test]
    fn test_blocks_cut_by_target_bytes() {
        // Each row is 16 estimated bytes.
        let config = WriterConfig {
            target_block_bytes: 64,
            max_block_rows: usize::MAX,
        };
        let mut writer = PartitionWriter::new(schema(), config);
        writer.extend((0..10).map(|i| row(i, i))).unwrap();
        let (_, footer) = writer.finish().unwrap();
        let counts: Vec<u32> = footer.blocks.iter().map(|b| b.row_count).collect();
        assert_eq!(counts, vec![4, 4, 2]);
    }

    #[test]
    fn test_block_offsets_are_contiguous() {
        let config = WriterConfig {
            target_block_bytes: usize::MAX,
            max_block_rows: 3,
        };
        let mut writer = PartitionWriter::new(schema(), config);
        writer.extend((0..9).map(|i| row(i, i))).unwrap();
        let (bytes, footer) = writer.finish().unwrap();

        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(&bytes[bytes.len() - 8..], MAGIC);
        assert_eq!(footer.blocks[0].byte_offset, MAGIC.len() as u64);
        for pair in footer.blocks.windows(2) {
            assert_eq!(pair[0].byte_offset + pair[0].byte_length, pair[1].byte_offset);
        }
    }

    #[test]
    fn test_invalid_row_rejected() {
        let mut writer = PartitionWriter::new(schema(), WriterConfig::default());
        let err = writer.push(Row::new(1, vec![Value::Null])).unwrap_err();
        assert!(matches!(err, StorageError::RowMismatch { .. }));
        assert!(writer.is_empty());
    }

    #[test]
    fn test_summary_digest() {
        let backend = MemoryBackend::new();
        let mut writer = PartitionWriter::new(schema(), WriterConfig::default());
        writer.extend((0..5).map(|i| row(i * 10, i))).unwrap();
        let summary = writer.write_to(&backend, "x/part.cfp").unwrap();

        assert_eq!(summary.sha256.len(), 64);
        assert_eq!(summary.row_count, 5);
        assert_eq!(summary.min_ts, Some(0));
        assert_eq!(summary.max_ts, Some(40));
        assert_eq!(backend.size("x/part.cfp").unwrap(), summary.byte_size);
    }
}
