//! Core data model shared by the ingestion crates: raw snapshots, normalized
//! table shapes, typed cell values and the per-run outcome report.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rpt-core";

/// Immutable captured copy of one entity type's full record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub id: i64,
    pub entity_type: String,
    pub captured_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl RawSnapshot {
    /// Records of the payload, or `None` when the payload is not an array.
    pub fn records(&self) -> Option<&[JsonValue]> {
        self.payload.as_array().map(Vec::as_slice)
    }
}

/// Returned by a snapshot store once a snapshot is durably persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReceipt {
    pub id: i64,
    pub entity_type: String,
    pub captured_at: DateTime<Utc>,
    pub record_count: usize,
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Numeric,
    Integer,
    Date,
    Timestamp,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Numeric => "DOUBLE PRECISION",
            Self::Integer => "BIGINT",
            Self::Date => "DATE",
            Self::Timestamp => "TIMESTAMP",
            Self::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Numeric => "numeric",
            Self::Integer => "integer",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// A typed cell of a normalized row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Text(String),
    Numeric(f64),
    Integer(i64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Boolean(bool),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Text(v) => f.write_str(v),
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S")),
            Self::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// One normalized row, cells aligned with [`TableSpec::columns`].
pub type Row = Vec<SqlValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

/// Shape of a normalized table as the stores see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub key: Vec<String>,
}

impl TableSpec {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn key_indices(&self) -> Vec<usize> {
        self.key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    /// Key cells of `row`, one rendered value per key column. Compare these,
    /// not [`TableSpec::key_of`], when testing key equality.
    pub fn key_cells(&self, row: &[SqlValue]) -> Vec<String> {
        self.key_indices()
            .into_iter()
            .map(|i| row.get(i).map(ToString::to_string).unwrap_or_default())
            .collect()
    }

    /// Display form of the key, for logs and error messages.
    pub fn key_of(&self, row: &[SqlValue]) -> String {
        self.key_cells(row).join("|")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    ReplaceAll,
    InsertIfAbsent,
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReplaceAll => "replace_all",
            Self::InsertIfAbsent => "insert_if_absent",
        })
    }
}

/// Result of loading one normalized table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub entity_type: String,
    pub table: String,
    pub strategy: LoadStrategy,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchStatus {
    Captured {
        records: usize,
        snapshot_id: i64,
        content_hash: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub entity_type: String,
    #[serde(flatten)]
    pub status: FetchStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformAbort {
    pub entity_type: String,
    pub error: String,
}

/// Per-entity-type outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Source the fetch stage read from; `None` for transform-only runs.
    pub source: Option<String>,
    pub catalog: Vec<String>,
    pub fetches: Vec<FetchOutcome>,
    pub loads: Vec<LoadSummary>,
    pub skipped: Vec<String>,
    pub aborted: Option<TransformAbort>,
}

impl RunReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            source: None,
            catalog: Vec::new(),
            fetches: Vec::new(),
            loads: Vec::new(),
            skipped: Vec::new(),
            aborted: None,
        }
    }

    /// True when the transform stage ran to completion. Fetch failures do not
    /// count against success; they are reported per entity type.
    pub fn succeeded(&self) -> bool {
        self.aborted.is_none()
    }

    pub fn failed_fetches(&self) -> Vec<&str> {
        self.fetches
            .iter()
            .filter(|f| matches!(f.status, FetchStatus::Failed { .. }))
            .map(|f| f.entity_type.as_str())
            .collect()
    }

    pub fn records_fetched(&self, entity_type: &str) -> Option<usize> {
        self.fetches.iter().find_map(|f| match &f.status {
            FetchStatus::Captured { records, .. } if f.entity_type == entity_type => Some(*records),
            _ => None,
        })
    }

    pub fn rows_loaded(&self, entity_type: &str) -> Option<u64> {
        self.loads
            .iter()
            .find(|l| l.entity_type == entity_type)
            .map(|l| l.rows_loaded)
    }

    pub fn headline(&self) -> String {
        match &self.aborted {
            None => format!(
                "completed: {} entity types fetched, {} failed to fetch, {} tables loaded",
                self.fetches.len() - self.failed_fetches().len(),
                self.failed_fetches().len(),
                self.loads.len()
            ),
            Some(abort) => format!(
                "aborted during transform of {}: {}",
                abort.entity_type, abort.error
            ),
        }
    }
}
