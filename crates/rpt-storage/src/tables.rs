//! Normalized table writes: atomic replace-all and insert-if-absent.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use rpt_core::{ColumnType, Row, SqlValue, TableSpec};
use sqlx::postgres::{PgArguments, PgPool, Postgres};
use sqlx::query::Query;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{quote_ident, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: u64,
    pub skipped_keys: Vec<String>,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StoreError>;

    /// Deletes every row of `table` and inserts `rows` as one atomic unit.
    async fn replace_all(&self, table: &TableSpec, rows: Vec<Row>) -> Result<u64, StoreError>;

    /// Inserts rows whose key is not present yet; existing rows are left untouched.
    async fn insert_if_absent(
        &self,
        table: &TableSpec,
        rows: Vec<Row>,
    ) -> Result<InsertReport, StoreError>;
}

fn check_shape(table: &TableSpec, rows: &[Row]) -> Result<(), StoreError> {
    let key_indices = table.key_indices();
    for (index, row) in rows.iter().enumerate() {
        if row.len() != table.columns.len() {
            return Err(StoreError::RowShape {
                table: table.name.clone(),
                index,
                expected: table.columns.len(),
                got: row.len(),
            });
        }
        for &k in &key_indices {
            if row[k].is_null() {
                return Err(StoreError::NullKey {
                    table: table.name.clone(),
                    column: table.columns[k].name.clone(),
                    index,
                });
            }
        }
    }
    Ok(())
}

fn check_unique_keys(table: &TableSpec, rows: &[Row]) -> Result<(), StoreError> {
    if table.key.is_empty() {
        return Ok(());
    }
    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows {
        if !seen.insert(table.key_cells(row)) {
            return Err(StoreError::DuplicateKey {
                table: table.name.clone(),
                key: table.key_of(row),
            });
        }
    }
    Ok(())
}

fn create_table_sql(table: &TableSpec) -> String {
    let mut parts = table
        .columns
        .iter()
        .map(|c| {
            let not_null = if table.key.contains(&c.name) { " NOT NULL" } else { "" };
            format!("{} {}{}", quote_ident(&c.name), c.column_type.sql_type(), not_null)
        })
        .collect::<Vec<_>>();
    if !table.key.is_empty() {
        parts.push(format!(
            "PRIMARY KEY ({})",
            table.key.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ")
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&table.name),
        parts.join(", ")
    )
}

fn insert_sql(table: &TableSpec) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=table.columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders})",
        quote_ident(&table.name)
    )
}

fn key_exists_sql(table: &TableSpec) -> String {
    let predicate = table
        .key
        .iter()
        .enumerate()
        .map(|(i, k)| format!("{} = ${}", quote_ident(k), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT 1 FROM {} WHERE {predicate} LIMIT 1",
        quote_ident(&table.name)
    )
}

fn bind_cell<'q>(
    query: Query<'q, Postgres, PgArguments>,
    column_type: ColumnType,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Numeric(v) => query.bind(*v),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
        SqlValue::Boolean(v) => query.bind(*v),
        SqlValue::Null => match column_type {
            ColumnType::Text => query.bind(None::<String>),
            ColumnType::Numeric => query.bind(None::<f64>),
            ColumnType::Integer => query.bind(None::<i64>),
            ColumnType::Date => query.bind(None::<chrono::NaiveDate>),
            ColumnType::Timestamp => query.bind(None::<chrono::NaiveDateTime>),
            ColumnType::Boolean => query.bind(None::<bool>),
        },
    }
}

fn bind_row<'q>(sql: &'q str, table: &TableSpec, row: &Row) -> Query<'q, Postgres, PgArguments> {
    table
        .columns
        .iter()
        .zip(row)
        .fold(sqlx::query(sql), |q, (column, value)| {
            bind_cell(q, column.column_type, value)
        })
}

#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql(table))
            .execute(&self.pool)
            .await?;
        debug!(table = %table.name, "table ready");
        Ok(())
    }

    async fn replace_all(&self, table: &TableSpec, rows: Vec<Row>) -> Result<u64, StoreError> {
        check_shape(table, &rows)?;
        check_unique_keys(table, &rows)?;

        // Dropping `tx` on any early return rolls the unit back.
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&format!("DELETE FROM {}", quote_ident(&table.name)))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let sql = insert_sql(table);
        for row in &rows {
            bind_row(&sql, table, row).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(table = %table.name, deleted, inserted = rows.len(), "table replaced");
        Ok(rows.len() as u64)
    }

    async fn insert_if_absent(
        &self,
        table: &TableSpec,
        rows: Vec<Row>,
    ) -> Result<InsertReport, StoreError> {
        check_shape(table, &rows)?;

        let key_indices = table.key_indices();
        let exists_sql = key_exists_sql(table);
        let sql = insert_sql(table);
        let mut report = InsertReport::default();

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            let probe = key_indices.iter().fold(sqlx::query(&exists_sql), |q, &i| {
                bind_cell(q, table.columns[i].column_type, &row[i])
            });
            if probe.fetch_optional(&mut *tx).await?.is_some() {
                let key = table.key_of(row);
                info!(table = %table.name, %key, "row already present, skipping");
                report.skipped_keys.push(key);
                continue;
            }
            bind_row(&sql, table, row).execute(&mut *tx).await?;
            report.inserted += 1;
        }
        tx.commit().await?;
        Ok(report)
    }
}

/// Process-local table store. Every write builds the next table state before
/// swapping it in, so a failed write leaves the previous rows in place.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables.lock().await.insert(table.to_string(), rows);
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .entry(table.name.clone())
            .or_default();
        Ok(())
    }

    async fn replace_all(&self, table: &TableSpec, rows: Vec<Row>) -> Result<u64, StoreError> {
        check_shape(table, &rows)?;
        check_unique_keys(table, &rows)?;
        let count = rows.len() as u64;
        self.tables.lock().await.insert(table.name.clone(), rows);
        Ok(count)
    }

    async fn insert_if_absent(
        &self,
        table: &TableSpec,
        rows: Vec<Row>,
    ) -> Result<InsertReport, StoreError> {
        check_shape(table, &rows)?;
        let mut tables = self.tables.lock().await;
        let mut next = tables.get(&table.name).cloned().unwrap_or_default();
        let mut present: HashSet<Vec<String>> = next.iter().map(|r| table.key_cells(r)).collect();

        let mut report = InsertReport::default();
        for row in rows {
            if !present.insert(table.key_cells(&row)) {
                report.skipped_keys.push(table.key_of(&row));
                continue;
            }
            next.push(row);
            report.inserted += 1;
        }
        tables.insert(table.name.clone(), next);
        Ok(report)
    }
}
