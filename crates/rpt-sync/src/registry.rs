//! Declarative entity registry: entity type → field map + load strategy.

use std::collections::HashSet;
use std::path::Path;

use rpt_core::{ColumnSpec, ColumnType, LoadStrategy, TableSpec};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

const BUILTIN_REGISTRY: &str = include_str!("../entities.yaml");
const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing entity registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported registry version {0}")]
    Version(u32),
    #[error("entity {entity}: {reason}")]
    Invalid { entity: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    version: u32,
    entities: Vec<EntityDecl>,
}

#[derive(Debug, Deserialize)]
struct EntityDecl {
    entity_type: String,
    table: String,
    strategy: LoadStrategy,
    #[serde(default)]
    key: Vec<String>,
    fields: Vec<FieldDecl>,
    #[serde(default)]
    unmanaged_columns: Vec<String>,
    #[serde(default)]
    derived_from: Option<Derivation>,
}

#[derive(Debug, Deserialize)]
struct FieldDecl {
    source: String,
    column: String,
    #[serde(rename = "type")]
    column_type: ColumnType,
    #[serde(default)]
    required: bool,
}

/// Selects the parent records a derived entity is built from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Derivation {
    pub entity_type: String,
    pub field: String,
    pub equals: String,
}

impl Derivation {
    pub fn matches(&self, record: &Map<String, JsonValue>) -> bool {
        record
            .get(&self.field)
            .and_then(JsonValue::as_str)
            .is_some_and(|v| v == self.equals)
    }
}

/// One source key mapped onto a table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMap {
    pub source: String,
    pub column: String,
    pub column_type: ColumnType,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySpec {
    pub entity_type: String,
    pub strategy: LoadStrategy,
    pub table: TableSpec,
    /// Aligned with the leading columns of `table`; remaining columns are unmanaged.
    pub fields: Vec<FieldMap>,
    pub derived_from: Option<Derivation>,
}

#[derive(Debug, Clone)]
pub struct EntityRegistry {
    entities: Vec<EntitySpec>,
}

impl EntityRegistry {
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_yaml_str(BUILTIN_REGISTRY)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_yaml::from_str(text)?;
        if file.version != REGISTRY_VERSION {
            return Err(RegistryError::Version(file.version));
        }

        let mut entities = Vec::with_capacity(file.entities.len());
        let mut entity_names = HashSet::new();
        let mut table_names = HashSet::new();
        for decl in file.entities {
            let spec = build_entity(decl)?;
            if !entity_names.insert(spec.entity_type.clone()) {
                return Err(invalid(&spec.entity_type, "declared more than once"));
            }
            if !table_names.insert(spec.table.name.clone()) {
                return Err(invalid(
                    &spec.entity_type,
                    format!("table {} already used by another entity", spec.table.name),
                ));
            }
            entities.push(spec);
        }

        for spec in &entities {
            let Some(derivation) = &spec.derived_from else {
                continue;
            };
            let parent_ok = entities.iter().any(|p| {
                p.entity_type == derivation.entity_type && p.derived_from.is_none()
            });
            if !parent_ok {
                return Err(invalid(
                    &spec.entity_type,
                    format!(
                        "derived_from {} is not a registered source entity",
                        derivation.entity_type
                    ),
                ));
            }
        }

        Ok(Self { entities })
    }

    pub fn entities(&self) -> &[EntitySpec] {
        &self.entities
    }

    /// Source entity registered under `entity_type`; derived entities are never
    /// dispatched by name.
    pub fn lookup(&self, entity_type: &str) -> Option<&EntitySpec> {
        self.entities
            .iter()
            .find(|e| e.entity_type == entity_type && e.derived_from.is_none())
    }

    /// Derived entities built from `entity_type`, in declaration order.
    pub fn derived_from<'a>(
        &'a self,
        entity_type: &'a str,
    ) -> impl Iterator<Item = (&'a EntitySpec, &'a Derivation)> + 'a {
        self.entities.iter().filter_map(move |e| {
            e.derived_from
                .as_ref()
                .filter(|d| d.entity_type == entity_type)
                .map(|d| (e, d))
        })
    }
}

fn invalid(entity: &str, reason: impl Into<String>) -> RegistryError {
    RegistryError::Invalid {
        entity: entity.to_string(),
        reason: reason.into(),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn build_entity(decl: EntityDecl) -> Result<EntitySpec, RegistryError> {
    let name = decl.entity_type.trim().to_string();
    if name.is_empty() {
        return Err(invalid("<unnamed>", "entity_type must not be empty"));
    }
    if !is_identifier(&decl.table) {
        return Err(invalid(&name, format!("table name {:?} is not a plain identifier", decl.table)));
    }
    if decl.fields.is_empty() {
        return Err(invalid(&name, "at least one field is required"));
    }

    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(decl.fields.len() + decl.unmanaged_columns.len());
    let mut fields = Vec::with_capacity(decl.fields.len());
    for field in decl.fields {
        if field.source.trim().is_empty() {
            return Err(invalid(&name, format!("column {} has an empty source key", field.column)));
        }
        if !is_identifier(&field.column) || !seen.insert(field.column.clone()) {
            return Err(invalid(&name, format!("column {:?} is invalid or repeated", field.column)));
        }
        columns.push(ColumnSpec {
            name: field.column.clone(),
            column_type: field.column_type,
        });
        fields.push(FieldMap {
            source: field.source,
            column: field.column,
            column_type: field.column_type,
            required: field.required,
        });
    }
    for column in decl.unmanaged_columns {
        if !is_identifier(&column) || !seen.insert(column.clone()) {
            return Err(invalid(&name, format!("column {column:?} is invalid or repeated")));
        }
        columns.push(ColumnSpec {
            name: column,
            column_type: ColumnType::Text,
        });
    }

    for key in &decl.key {
        match fields.iter().find(|f| &f.column == key) {
            Some(f) if f.required => {}
            Some(_) => return Err(invalid(&name, format!("key column {key} must be required"))),
            None => return Err(invalid(&name, format!("key column {key} is not a mapped field"))),
        }
    }
    if decl.strategy == LoadStrategy::InsertIfAbsent && decl.key.is_empty() {
        return Err(invalid(&name, "insert_if_absent needs a key"));
    }
    if let Some(d) = &decl.derived_from {
        if d.field.trim().is_empty() {
            return Err(invalid(&name, "derived_from.field must not be empty"));
        }
    }

    Ok(EntitySpec {
        entity_type: name,
        strategy: decl.strategy,
        table: TableSpec {
            name: decl.table,
            columns,
            key: decl.key,
        },
        fields,
        derived_from: decl.derived_from,
    })
}
