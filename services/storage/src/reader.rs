//! Partition reader with sparse block selection
//!
//! Features:
//! - Opens a partition from its tail: trailer + footer only, no block bytes
//! - Full scan for whole-day reprocessing
//! - Range scan `[start, end)` and point scan (timestamps ± buffer)
//! - Block selection is a pure function of footer statistics; unselected
//!   blocks are never fetched from the backend
//! - Per-block corruption handling: fail the read or skip and report the
//!   missing timestamp range

use crc32c::crc32c;
use tracing::{debug, warn};

use crate::backend::StorageBackend;
use crate::block::{decode_block, BlockMeta};
use crate::error::{StorageDecodeError, StorageError};
use crate::schema::{Row, Schema};
use crate::writer::{Footer, FORMAT_VERSION, MAGIC, TRAILER_LEN};

/// What to do when a selected block fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// Abort the read with the block's `StorageDecodeError`.
    #[default]
    FailFast,
    /// Skip the block and report its range in `ScanResult::skipped`.
    SkipCorrupt,
}

/// A block left out of a scan because it could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedBlock {
    pub block: usize,
    /// Inclusive timestamp range the block covered.
    pub min_ts: i64,
    pub max_ts: i64,
    pub error: StorageDecodeError,
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub rows: Vec<Row>,
    pub blocks_read: usize,
    pub skipped: Vec<SkippedBlock>,
}

impl ScanResult {
    /// True when no selected block was skipped.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Indices of blocks whose `[min_ts, max_ts]` overlaps any half-open interval.
pub fn select_blocks(blocks: &[BlockMeta], intervals: &[(i64, i64)]) -> Vec<usize> {
    blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| intervals.iter().any(|&(start, end)| b.overlaps(start, end)))
        .map(|(i, _)| i)
        .collect()
}

/// Turn timestamps ± `buffer` into sorted, non-overlapping half-open intervals.
pub fn point_intervals(points: &[i64], buffer: i64) -> Vec<(i64, i64)> {
    let buffer = buffer.max(0);
    let mut intervals: Vec<(i64, i64)> = points
        .iter()
        .map(|&p| (p.saturating_sub(buffer), p.saturating_add(buffer).saturating_add(1)))
        .collect();
    intervals.sort_unstable();

    let mut merged: Vec<(i64, i64)> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn in_intervals(ts: i64, intervals: &[(i64, i64)]) -> bool {
    // Intervals are sorted and disjoint: find the last one starting at or before ts.
    let idx = intervals.partition_point(|&(start, _)| start <= ts);
    idx > 0 && ts < intervals[idx - 1].1
}

pub struct PartitionReader<'a, B: StorageBackend + ?Sized> {
    backend: &'a B,
    path: String,
    footer: Footer,
}

impl<'a, B: StorageBackend + ?Sized> PartitionReader<'a, B> {
    /// Read and verify the trailer and footer of the partition at `path`.
    pub fn open(backend: &'a B, path: &str) -> Result<Self, StorageError> {
        let size = backend.size(path)?;
        let min_size = MAGIC.len() as u64 + TRAILER_LEN;
        if size < min_size {
            return Err(StorageDecodeError::partition(
                path,
                format!("file too small: {size} bytes"),
            )
            .into());
        }

        let trailer = backend.read_range(path, size - TRAILER_LEN, TRAILER_LEN)?;
        if trailer.len() as u64 != TRAILER_LEN || &trailer[8..16] != MAGIC {
            return Err(StorageDecodeError::partition(path, "bad trailing magic").into());
        }
        let footer_len = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as u64;
        let footer_crc = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);

        let footer_end = size - TRAILER_LEN;
        if footer_len > footer_end - MAGIC.len() as u64 {
            return Err(StorageDecodeError::partition(
                path,
                format!("implausible footer length: {footer_len}"),
            )
            .into());
        }

        let footer_bytes = backend.read_range(path, footer_end - footer_len, footer_len)?;
        if crc32c(&footer_bytes) != footer_crc {
            return Err(StorageDecodeError::partition(path, "footer CRC32C mismatch").into());
        }
        let footer: Footer = bincode::deserialize(&footer_bytes)
            .map_err(|e| StorageDecodeError::partition(path, format!("malformed footer: {e}")))?;
        if footer.version != FORMAT_VERSION {
            return Err(StorageDecodeError::partition(
                path,
                format!("unsupported format version {}", footer.version),
            )
            .into());
        }

        Ok(Self {
            backend,
            path: path.to_string(),
            footer,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn schema(&self) -> &Schema {
        &self.footer.schema
    }

    pub fn row_count(&self) -> u64 {
        self.footer.row_count
    }

    /// Decode every block.
    pub fn full_scan(&self, policy: ReadPolicy) -> Result<ScanResult, StorageError> {
        let all: Vec<usize> = (0..self.footer.blocks.len()).collect();
        self.read_blocks(&all, policy, |_| true)
    }

    /// Rows with `start <= ts < end`, reading only overlapping blocks.
    pub fn scan_range(
        &self,
        start: i64,
        end: i64,
        policy: ReadPolicy,
    ) -> Result<ScanResult, StorageError> {
        if start >= end {
            return Err(StorageError::InvalidRange { start, end });
        }
        let selected = select_blocks(&self.footer.blocks, &[(start, end)]);
        self.read_blocks(&selected, policy, |ts| ts >= start && ts < end)
    }

    /// Rows within `buffer` nanos of any requested timestamp.
    pub fn scan_points(
        &self,
        points: &[i64],
        buffer: i64,
        policy: ReadPolicy,
    ) -> Result<ScanResult, StorageError> {
        let intervals = point_intervals(points, buffer);
        let selected = select_blocks(&self.footer.blocks, &intervals);
        self.read_blocks(&selected, policy, |ts| in_intervals(ts, &intervals))
    }

    fn read_blocks(
        &self,
        indices: &[usize],
        policy: ReadPolicy,
        keep: impl Fn(i64) -> bool,
    ) -> Result<ScanResult, StorageError> {
        let mut result = ScanResult::default();

        for &index in indices {
            let meta = &self.footer.blocks[index];
            let bytes = self
                .backend
                .read_range(&self.path, meta.byte_offset, meta.byte_length)?;
            result.blocks_read += 1;

            match decode_block(&self.footer.schema, meta, &bytes) {
                Ok(rows) => result.rows.extend(rows.into_iter().filter(|r| keep(r.ts))),
                Err(detail) => {
                    let error = StorageDecodeError::block(&self.path, index, detail);
                    match policy {
                        ReadPolicy::FailFast => return Err(error.into()),
                        ReadPolicy::SkipCorrupt => {
                            warn!(
                                path = %self.path,
                                block = index,
                                min_ts = meta.min_ts,
                                max_ts = meta.max_ts,
                                error = %error.detail,
                                "Skipping corrupt block"
                            );
                            result.skipped.push(SkippedBlock {
                                block: index,
                                min_ts: meta.min_ts,
                                max_ts: meta.max_ts,
                                error,
                            });
                        }
                    }
                }
            }
        }

        debug!(
            path = %self.path,
            blocks_total = self.footer.blocks.len(),
            blocks_read = result.blocks_read,
            rows = result.rows.len(),
            "Partition scan complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::schema::{Column, ColumnType, Value};
    use crate::writer::{PartitionWriter, WriterConfig};

    fn meta(min_ts: i64, max_ts: i64) -> BlockMeta {
        BlockMeta {
            min_ts,
            max_ts,
            row_count: 1,
            byte_offset: 0,
            byte_length: 0,
            checksum: 0,
        }
    }

    fn write_partition(backend: &MemoryBackend, path: &str, n: i64, rows_per_block: usize) {
        let schema = Schema::new(vec![Column::required("seq", ColumnType::Int64)]).unwrap();
        let config = WriterConfig {
            target_block_bytes: usize::MAX,
            max_block_rows: rows_per_block,
        };
        let mut writer = PartitionWriter::new(schema, config);
        writer
            .extend((0..n).map(|i| Row::new(i * 10, vec![Value::Int64(i)])))
            .unwrap();
        writer.write_to(backend, path).unwrap();
    }

    #[test]
    fn test_select_blocks_by_stats() {
        let blocks = vec![meta(0, 9), meta(10, 19), meta(20, 29)];
        assert_eq!(select_blocks(&blocks, &[(5, 15)]), vec![0, 1]);
        assert_eq!(select_blocks(&blocks, &[(19, 20)]), vec![1]);
        assert_eq!(select_blocks(&blocks, &[(30, 40)]), Vec::<usize>::new());
        assert_eq!(select_blocks(&blocks, &[(0, 1), (25, 26)]), vec![0, 2]);
    }

    #[test]
    fn test_point_intervals_merge() {
        let merged = point_intervals(&[100, 10, 12, 50], 2);
        assert_eq!(merged, vec![(8, 15), (48, 53), (98, 103)]);
        assert!(in_intervals(8, &merged));
        assert!(in_intervals(14, &merged));
        assert!(!in_intervals(15, &merged));
        assert!(!in_intervals(60, &merged));
    }

    #[test]
    fn test_range_scan_filters_rows() {
        let backend = MemoryBackend::new();
        write_partition(&backend, "p.cfp", 100, 10);
        let reader = PartitionReader::open(&backend, "p.cfp").unwrap();

        let result = reader.scan_range(95, 215, ReadPolicy::FailFast).unwrap();
        let ts: Vec<i64> = result.rows.iter().map(|r| r.ts).collect();
        assert_eq!(ts, (10..=21).map(|i| i * 10).collect::<Vec<_>>());
        assert_eq!(result.blocks_read, 2);
        assert!(result.is_complete());
    }

    #[test]
    fn test_point_scan() {
        let backend = MemoryBackend::new();
        write_partition(&backend, "p.cfp", 100, 10);
        let reader = PartitionReader::open(&backend, "p.cfp").unwrap();

        let result = reader.scan_points(&[500, 905], 5, ReadPolicy::FailFast).unwrap();
        let ts: Vec<i64> = result.rows.iter().map(|r| r.ts).collect();
        assert_eq!(ts, vec![500, 900, 910]);
        assert_eq!(result.blocks_read, 2);
    }

    #[test]
    fn test_invalid_range() {
        let backend = MemoryBackend::new();
        write_partition(&backend, "p.cfp", 10, 10);
        let reader = PartitionReader::open(&backend, "p.cfp").unwrap();
        assert!(matches!(
            reader.scan_range(10, 10, ReadPolicy::FailFast),
            Err(StorageError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let backend = MemoryBackend::new();
        write_partition(&backend, "p.cfp", 10, 10);
        let size = backend.size("p.cfp").unwrap() as usize;
        backend.corrupt_byte("p.cfp", size - 1);

        match PartitionReader::open(&backend, "p.cfp") {
            Err(StorageError::Decode(e)) => assert_eq!(e.block, None),
            other => panic!("expected decode error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_corrupt_block_policies() {
        let backend = MemoryBackend::new();
        write_partition(&backend, "p.cfp", 30, 10);
        let offset = {
            let reader = PartitionReader::open(&backend, "p.cfp").unwrap();
            let b = reader.footer().blocks[1];
            (b.byte_offset + b.byte_length / 2) as usize
        };
        backend.corrupt_byte("p.cfp", offset);
        let reader = PartitionReader::open(&backend, "p.cfp").unwrap();

        match reader.full_scan(ReadPolicy::FailFast) {
            Err(StorageError::Decode(e)) => assert_eq!(e.block, Some(1)),
            other => panic!("expected block decode error, got {:?}", other.map(|r| r.rows.len())),
        }

        let result = reader.full_scan(ReadPolicy::SkipCorrupt).unwrap();
        assert_eq!(result.rows.len(), 20);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!((result.skipped[0].min_ts, result.skipped[0].max_ts), (100, 190));
    }

    #[test]
    fn test_empty_partition() {
        let backend = MemoryBackend::new();
        let schema = Schema::new(vec![Column::required("seq", ColumnType::Int64)]).unwrap();
        PartitionWriter::new(schema, WriterConfig::default())
            .write_to(&backend, "empty.cfp")
            .unwrap();
        let reader = PartitionReader::open(&backend, "empty.cfp").unwrap();
        assert_eq!(reader.row_count(), 0);
        assert!(reader.full_scan(ReadPolicy::FailFast).unwrap().rows.is_empty());
    }
}
