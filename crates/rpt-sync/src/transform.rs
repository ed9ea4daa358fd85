//! Snapshot payload → normalized table loads.

use std::sync::Arc;

use rpt_core::{ColumnType, LoadStrategy, LoadSummary, Row, SqlValue};
use rpt_storage::{StoreError, TableStore};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

use crate::coerce::coerce;
use crate::registry::{EntityRegistry, EntitySpec};

pub type Record = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{entity_type}: payload is not an array of records ({reason})")]
    Shape { entity_type: String, reason: String },
    #[error("{entity_type}: record {index} is missing required field `{field}`")]
    MissingField {
        entity_type: String,
        index: usize,
        field: String,
    },
    #[error("{entity_type}: record {index} field `{field}` value {found} is not a valid {expected}")]
    Coercion {
        entity_type: String,
        index: usize,
        field: String,
        expected: ColumnType,
        found: String,
    },
    #[error("{entity_type}: {source}")]
    Store {
        entity_type: String,
        source: StoreError,
    },
}

impl TransformError {
    pub fn entity_type(&self) -> &str {
        match self {
            Self::Shape { entity_type, .. }
            | Self::MissingField { entity_type, .. }
            | Self::Coercion { entity_type, .. }
            | Self::Store { entity_type, .. } => entity_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Loaded(Vec<LoadSummary>),
    /// No mapping registered for the entity type.
    Skipped,
}

impl EntitySpec {
    /// Maps records through the field map. Fails on the first record that
    /// cannot be coerced, before anything is written.
    pub fn build_rows(&self, records: &[&Record]) -> Result<Vec<Row>, TransformError> {
        let mut rows = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let mut row = Vec::with_capacity(self.table.columns.len());
            for field in &self.fields {
                let value = coerce(record.get(&field.source), field.column_type).map_err(
                    |found| TransformError::Coercion {
                        entity_type: self.entity_type.clone(),
                        index,
                        field: field.source.clone(),
                        expected: field.column_type,
                        found,
                    },
                )?;
                let blank = value.is_null() || value.as_text().is_some_and(|s| s.trim().is_empty());
                if field.required && blank {
                    return Err(TransformError::MissingField {
                        entity_type: self.entity_type.clone(),
                        index,
                        field: field.source.clone(),
                    });
                }
                row.push(value);
            }
            row.resize(self.table.columns.len(), SqlValue::Text(String::new()));
            rows.push(row);
        }
        Ok(rows)
    }
}

fn payload_records<'a>(
    entity_type: &str,
    payload: &'a JsonValue,
) -> Result<Vec<&'a Record>, TransformError> {
    let items = payload.as_array().ok_or_else(|| TransformError::Shape {
        entity_type: entity_type.to_string(),
        reason: "payload is not an array".into(),
    })?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_object().ok_or_else(|| TransformError::Shape {
                entity_type: entity_type.to_string(),
                reason: format!("element {i} is not an object"),
            })
        })
        .collect()
}

pub struct Transformer {
    registry: Arc<EntityRegistry>,
    tables: Arc<dyn TableStore>,
}

impl Transformer {
    pub fn new(registry: Arc<EntityRegistry>, tables: Arc<dyn TableStore>) -> Self {
        Self { registry, tables }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Creates every registered table if missing.
    pub async fn prepare(&self) -> Result<(), TransformError> {
        for spec in self.registry.entities() {
            self.tables
                .ensure_table(&spec.table)
                .await
                .map_err(|source| TransformError::Store {
                    entity_type: spec.entity_type.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Loads `payload` into the entity type's table, then into every entity
    /// derived from it.
    pub async fn transform(
        &self,
        entity_type: &str,
        payload: &JsonValue,
    ) -> Result<TransformOutcome, TransformError> {
        let Some(spec) = self.registry.lookup(entity_type) else {
            info!(entity_type, "no mapping registered, skipping");
            return Ok(TransformOutcome::Skipped);
        };

        let records = payload_records(entity_type, payload)?;
        let mut summaries = vec![self.load(spec, &records).await?];

        for (derived, derivation) in self.registry.derived_from(entity_type) {
            let subset = records
                .iter()
                .copied()
                .filter(|r| derivation.matches(r))
                .collect::<Vec<_>>();
            summaries.push(self.load(derived, &subset).await?);
        }

        Ok(TransformOutcome::Loaded(summaries))
    }

    async fn load(
        &self,
        spec: &EntitySpec,
        records: &[&Record],
    ) -> Result<LoadSummary, TransformError> {
        let rows = spec.build_rows(records)?;
        let store_err = |source: StoreError| TransformError::Store {
            entity_type: spec.entity_type.clone(),
            source,
        };

        let (rows_loaded, rows_skipped) = match spec.strategy {
            LoadStrategy::ReplaceAll => {
                let loaded = self
                    .tables
                    .replace_all(&spec.table, rows)
                    .await
                    .map_err(store_err)?;
                (loaded, 0)
            }
            LoadStrategy::InsertIfAbsent => {
                let report = self
                    .tables
                    .insert_if_absent(&spec.table, rows)
                    .await
                    .map_err(store_err)?;
                for key in &report.skipped_keys {
                    warn!(entity_type = %spec.entity_type, %key, "already present, left unchanged");
                }
                (report.inserted, report.skipped_keys.len() as u64)
            }
        };

        info!(
            entity_type = %spec.entity_type,
            table = %spec.table.name,
            rows_loaded,
            rows_skipped,
            "entity loaded"
        );
        Ok(LoadSummary {
            entity_type: spec.entity_type.clone(),
            table: spec.table.name.clone(),
            strategy: spec.strategy,
            rows_loaded,
            rows_skipped,
        })
    }
}
