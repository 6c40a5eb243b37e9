//! Partition schema, values and rows
//!
//! Every partition carries its schema in the footer, so a reader never needs
//! external metadata. The timestamp column is implicit and always first: a
//! `Row` is `(ts, values)` where `values` follows `Schema::columns`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Int64,
    UInt64,
    Float64,
    Decimal,
    Bool,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn required(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }

    pub fn nullable(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }
}

/// Column layout of a partition. The `ts` column (i64 Unix nanos) is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub const TIMESTAMP_COLUMN: &'static str = "ts";

    pub fn new(columns: Vec<Column>) -> Result<Self, StorageError> {
        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if column.name == Self::TIMESTAMP_COLUMN {
                return Err(StorageError::Schema(
                    "`ts` is reserved for the implicit timestamp column".into(),
                ));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(StorageError::Schema(format!(
                    "duplicate column name: {}",
                    column.name
                )));
            }
        }
        Ok(Self { columns })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Check a row against the schema.
    pub fn validate_row(&self, index: usize, row: &Row) -> Result<(), StorageError> {
        if row.values.len() != self.columns.len() {
            return Err(StorageError::RowMismatch {
                row: index,
                detail: format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    row.values.len()
                ),
            });
        }
        for (column, value) in self.columns.iter().zip(&row.values) {
            let ok = match value {
                Value::Null => column.nullable,
                other => other.column_type() == Some(column.ty),
            };
            if !ok {
                return Err(StorageError::RowMismatch {
                    row: index,
                    detail: format!("column `{}` ({:?}) got {:?}", column.name, column.ty, value),
                });
            }
        }
        Ok(())
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Decimal(Decimal),
    Bool(bool),
    Text(String),
}

impl Value {
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Int64(_) => Some(ColumnType::Int64),
            Value::UInt64(_) => Some(ColumnType::UInt64),
            Value::Float64(_) => Some(ColumnType::Float64),
            Value::Decimal(_) => Some(ColumnType::Decimal),
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Text(_) => Some(ColumnType::Text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    fn estimated_size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Bool(_) => 1,
            Value::Int64(_) | Value::UInt64(_) | Value::Float64(_) => 8,
            Value::Decimal(_) => 16,
            Value::Text(s) => 8 + s.len(),
        }
    }
}

impl From<Option<Decimal>> for Value {
    fn from(value: Option<Decimal>) -> Self {
        value.map_or(Value::Null, Value::Decimal)
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Value::Null, Value::Float64)
    }
}

impl From<Option<i64>> for Value {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Value::Null, Value::Int64)
    }
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        value.map_or(Value::Null, Value::Text)
    }
}

/// One record: timestamp plus values in schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub ts: i64,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(ts: i64, values: Vec<Value>) -> Self {
        Self { ts, values }
    }

    /// Approximate in-memory/encoded size, used for block cutting and flush thresholds.
    pub fn estimated_size(&self) -> usize {
        8 + self.values.iter().map(Value::estimated_size).sum::<usize>()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}
