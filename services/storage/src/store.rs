//! Day-partitioned store
//!
//! Maps `(PartitionKey, calendar day)` to a directory of immutable parts:
//!
//! ```text
//! <dataset>/<group>/<YYYY-MM-DD>/part-000000.cfp
//!                               /part-000001.cfp
//! ```
//!
//! Every write produces a new part; a day's partition is the union of its
//! parts. Parts are never rewritten in place: a part name is claimed with an
//! exclusive create, so concurrent writers to one day each get their own.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::error::StorageError;
use crate::reader::{PartitionReader, ReadPolicy, ScanResult};
use crate::schema::{Row, Schema};
use crate::writer::{PartitionSummary, PartitionWriter, WriterConfig};

const PART_PREFIX: &str = "part-";
const PART_SUFFIX: &str = ".cfp";

/// Identifies a stream of partitions, e.g. `("trade", "BTC-PERP")` or
/// `("candles_1m", "majors")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub dataset: String,
    pub group: String,
}

impl PartitionKey {
    pub fn new(dataset: impl Into<String>, group: impl Into<String>) -> Result<Self, StorageError> {
        let dataset = dataset.into();
        let group = group.into();
        for part in [&dataset, &group] {
            if part.is_empty()
                || part == "."
                || part == ".."
                || part.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace())
            {
                return Err(StorageError::InvalidKey(part.clone()));
            }
        }
        Ok(Self { dataset, group })
    }

    fn prefix(&self) -> String {
        format!("{}/{}/", self.dataset, self.group)
    }

    fn day_dir(&self, day: NaiveDate) -> String {
        format!("{}{}/", self.prefix(), day.format("%Y-%m-%d"))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.group)
    }
}

/// UTC calendar day containing a Unix-nanosecond timestamp.
pub fn day_of(ts: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_nanos(ts).date_naive()
}

fn part_number(path: &str) -> Option<u32> {
    let name = path.rsplit('/').next()?;
    name.strip_prefix(PART_PREFIX)?
        .strip_suffix(PART_SUFFIX)?
        .parse()
        .ok()
}

pub struct PartitionStore<B> {
    backend: B,
    config: WriterConfig,
}

impl<B: StorageBackend> PartitionStore<B> {
    pub fn new(backend: B, config: WriterConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> WriterConfig {
        self.config
    }

    /// Paths of all parts for one day, in write order.
    pub fn list_parts(&self, key: &PartitionKey, day: NaiveDate) -> Result<Vec<String>, StorageError> {
        let mut parts: Vec<(u32, String)> = self
            .backend
            .list(&key.day_dir(day))?
            .into_iter()
            .filter_map(|p| part_number(&p).map(|n| (n, p)))
            .collect();
        parts.sort();
        Ok(parts.into_iter().map(|(_, p)| p).collect())
    }

    /// Days that have at least one part, ascending.
    pub fn days(&self, key: &PartitionKey) -> Result<Vec<NaiveDate>, StorageError> {
        let prefix = key.prefix();
        let mut days: Vec<NaiveDate> = self
            .backend
            .list(&prefix)?
            .iter()
            .filter(|p| part_number(p).is_some())
            .filter_map(|p| p.strip_prefix(&prefix)?.split('/').next())
            .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .collect();
        days.sort();
        days.dedup();
        Ok(days)
    }

    /// Write all rows as one new part of `day`.
    pub fn write(
        &self,
        key: &PartitionKey,
        day: NaiveDate,
        schema: &Schema,
        rows: Vec<Row>,
    ) -> Result<PartitionSummary, StorageError> {
        let mut writer = PartitionWriter::new(schema.clone(), self.config);
        writer.extend(rows)?;
        let encoded = writer.encode()?;

        let mut next = self
            .list_parts(key, day)?
            .last()
            .and_then(|p| part_number(p))
            .map_or(0, |n| n + 1);
        let summary = loop {
            let path = format!("{}{}{:06}{}", key.day_dir(day), PART_PREFIX, next, PART_SUFFIX);
            match self.backend.put_new(&path, &encoded.bytes) {
                Ok(()) => break encoded.committed(&path),
                Err(StorageError::AlreadyExists(_)) => {
                    debug!(key = %key, path = %path, "Part name taken, trying the next");
                    next += 1;
                }
                Err(err) => return Err(err),
            }
        };
        info!(
            key = %key,
            day = %day,
            path = %summary.path,
            rows = summary.row_count,
            sha256 = %summary.sha256,
            "Partition part committed"
        );
        Ok(summary)
    }

    /// Split rows by UTC day and write one part per day touched.
    pub fn write_rows(
        &self,
        key: &PartitionKey,
        schema: &Schema,
        rows: Vec<Row>,
    ) -> Result<Vec<PartitionSummary>, StorageError> {
        let mut by_day: std::collections::BTreeMap<NaiveDate, Vec<Row>> = Default::default();
        for row in rows {
            by_day.entry(day_of(row.ts)).or_default().push(row);
        }
        by_day
            .into_iter()
            .map(|(day, rows)| self.write(key, day, schema, rows))
            .collect()
    }

    pub fn open(&self, path: &str) -> Result<PartitionReader<'_, B>, StorageError> {
        PartitionReader::open(&self.backend, path)
    }

    /// Full scan of every part of one day, merged by timestamp.
    pub fn scan_day(
        &self,
        key: &PartitionKey,
        day: NaiveDate,
        policy: ReadPolicy,
    ) -> Result<ScanResult, StorageError> {
        let mut merged = ScanResult::default();
        for path in self.list_parts(key, day)? {
            let part = self.open(&path)?.full_scan(policy)?;
            merge_into(&mut merged, part);
        }
        merged.rows.sort_by_key(|r| r.ts);
        Ok(merged)
    }

    /// Rows with `start <= ts < end` across every day and part the range touches.
    pub fn scan_range(
        &self,
        key: &PartitionKey,
        start: i64,
        end: i64,
        policy: ReadPolicy,
    ) -> Result<ScanResult, StorageError> {
        if start >= end {
            return Err(StorageError::InvalidRange { start, end });
        }
        let first = day_of(start);
        let last = day_of(end - 1);

        let mut merged = ScanResult::default();
        for day in self.days(key)?.into_iter().filter(|d| *d >= first && *d <= last) {
            for path in self.list_parts(key, day)? {
                let part = self.open(&path)?.scan_range(start, end, policy)?;
                merge_into(&mut merged, part);
            }
        }
        merged.rows.sort_by_key(|r| r.ts);
        Ok(merged)
    }
}

fn merge_into(into: &mut ScanResult, part: ScanResult) {
    into.rows.extend(part.rows);
    into.blocks_read += part.blocks_read;
    into.skipped.extend(part.skipped);
}
