//! Row-block codec
//!
//! A block stores its rows column by column: one timestamp vector plus one
//! typed vector per schema column. The column set is bincode-encoded, then
//! zstd-compressed. Integrity is a CRC32C over the compressed bytes, kept in
//! the partition footer next to the block's timestamp statistics.
//!
//! # Block statistics (footer entry)
//! ```text
//! min_ts, max_ts   inclusive timestamp range of rows in the block
//! row_count        rows in the block
//! byte_offset      offset of the compressed block in the file
//! byte_length      compressed length
//! checksum         CRC32C over the compressed bytes
//! ```

use crc32c::crc32c;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::schema::{ColumnType, Row, Schema, Value};

/// zstd level used for block compression.
const COMPRESSION_LEVEL: i32 = 3;

/// Footer statistics for one row block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub min_ts: i64,
    pub max_ts: i64,
    pub row_count: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
    pub checksum: u32,
}

impl BlockMeta {
    /// Whether the inclusive `[min_ts, max_ts]` range intersects half-open `[start, end)`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.min_ts < end && self.max_ts >= start
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ColumnData {
    Int64(Vec<Option<i64>>),
    UInt64(Vec<Option<u64>>),
    Float64(Vec<Option<f64>>),
    Decimal(Vec<Option<[u8; 16]>>),
    Bool(Vec<Option<bool>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    fn with_capacity(ty: ColumnType, capacity: usize) -> Self {
        match ty {
            ColumnType::Int64 => ColumnData::Int64(Vec::with_capacity(capacity)),
            ColumnType::UInt64 => ColumnData::UInt64(Vec::with_capacity(capacity)),
            ColumnType::Float64 => ColumnData::Float64(Vec::with_capacity(capacity)),
            ColumnType::Decimal => ColumnData::Decimal(Vec::with_capacity(capacity)),
            ColumnType::Bool => ColumnData::Bool(Vec::with_capacity(capacity)),
            ColumnType::Text => ColumnData::Text(Vec::with_capacity(capacity)),
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Int64(_) => ColumnType::Int64,
            ColumnData::UInt64(_) => ColumnType::UInt64,
            ColumnData::Float64(_) => ColumnType::Float64,
            ColumnData::Decimal(_) => ColumnType::Decimal,
            ColumnData::Bool(_) => ColumnType::Bool,
            ColumnData::Text(_) => ColumnType::Text,
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Decimal(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    /// Append a value already validated against the schema.
    fn push(&mut self, value: &Value) {
        match (self, value) {
            (ColumnData::Int64(v), Value::Int64(x)) => v.push(Some(*x)),
            (ColumnData::UInt64(v), Value::UInt64(x)) => v.push(Some(*x)),
            (ColumnData::Float64(v), Value::Float64(x)) => v.push(Some(*x)),
            (ColumnData::Decimal(v), Value::Decimal(x)) => v.push(Some(x.serialize())),
            (ColumnData::Bool(v), Value::Bool(x)) => v.push(Some(*x)),
            (ColumnData::Text(v), Value::Text(x)) => v.push(Some(x.clone())),
            (ColumnData::Int64(v), _) => v.push(None),
            (ColumnData::UInt64(v), _) => v.push(None),
            (ColumnData::Float64(v), _) => v.push(None),
            (ColumnData::Decimal(v), _) => v.push(None),
            (ColumnData::Bool(v), _) => v.push(None),
            (ColumnData::Text(v), _) => v.push(None),
        }
    }

    fn value_at(&self, i: usize) -> Value {
        match self {
            ColumnData::Int64(v) => v[i].map_or(Value::Null, Value::Int64),
            ColumnData::UInt64(v) => v[i].map_or(Value::Null, Value::UInt64),
            ColumnData::Float64(v) => v[i].map_or(Value::Null, Value::Float64),
            ColumnData::Decimal(v) => v[i].map_or(Value::Null, |b| Value::Decimal(Decimal::deserialize(b))),
            ColumnData::Bool(v) => v[i].map_or(Value::Null, Value::Bool),
            ColumnData::Text(v) => v[i].clone().map_or(Value::Null, Value::Text),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EncodedBlock {
    timestamps: Vec<i64>,
    columns: Vec<ColumnData>,
}

/// An encoded block ready to be appended to a partition file.
#[derive(Debug)]
pub struct BlockBytes {
    pub bytes: Vec<u8>,
    pub min_ts: i64,
    pub max_ts: i64,
    pub row_count: u32,
    pub checksum: u32,
}

/// Encode rows (already validated and sorted by `ts`) into one compressed block.
pub fn encode_block(schema: &Schema, rows: &[Row]) -> Result<BlockBytes, StorageError> {
    let (min_ts, max_ts) = match (rows.first(), rows.last()) {
        (Some(first), Some(last)) => (first.ts, last.ts),
        _ => return Err(StorageError::Encode("cannot encode an empty block".into())),
    };

    let mut columns: Vec<ColumnData> = schema
        .columns
        .iter()
        .map(|c| ColumnData::with_capacity(c.ty, rows.len()))
        .collect();
    let mut timestamps = Vec::with_capacity(rows.len());

    for row in rows {
        timestamps.push(row.ts);
        for (column, value) in columns.iter_mut().zip(&row.values) {
            column.push(value);
        }
    }

    let raw = bincode::serialize(&EncodedBlock { timestamps, columns })
        .map_err(|e| StorageError::Encode(e.to_string()))?;
    let bytes = zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL)?;
    let checksum = crc32c(&bytes);

    Ok(BlockBytes {
        bytes,
        min_ts,
        max_ts,
        row_count: rows.len() as u32,
        checksum,
    })
}

/// Decode a block, verifying its checksum and shape against the schema.
///
/// Errors are plain strings; the reader scopes them to a block index.
pub fn decode_block(schema: &Schema, meta: &BlockMeta, bytes: &[u8]) -> Result<Vec<Row>, String> {
    if bytes.len() as u64 != meta.byte_length {
        return Err(format!(
            "short read: expected {} bytes, got {}",
            meta.byte_length,
            bytes.len()
        ));
    }

    let actual = crc32c(bytes);
    if actual != meta.checksum {
        return Err(format!(
            "CRC32C mismatch: stored={:#010x}, computed={:#010x}",
            meta.checksum, actual
        ));
    }

    let raw = zstd::decode_all(bytes).map_err(|e| format!("decompression failed: {e}"))?;
    let block: EncodedBlock =
        bincode::deserialize(&raw).map_err(|e| format!("malformed block: {e}"))?;

    let rows = block.timestamps.len();
    if rows != meta.row_count as usize {
        return Err(format!(
            "row count mismatch: footer says {}, block has {}",
            meta.row_count, rows
        ));
    }
    if block.columns.len() != schema.len() {
        return Err(format!(
            "column count mismatch: schema has {}, block has {}",
            schema.len(),
            block.columns.len()
        ));
    }
    for (column, data) in schema.columns.iter().zip(&block.columns) {
        if data.column_type() != column.ty || data.len() != rows {
            return Err(format!("column `{}` has wrong type or length", column.name));
        }
    }

    Ok(block
        .timestamps
        .iter()
        .enumerate()
        .map(|(i, ts)| Row::new(*ts, block.columns.iter().map(|c| c.value_at(i)).collect()))
        .collect())
}
