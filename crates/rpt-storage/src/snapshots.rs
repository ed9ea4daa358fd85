//! Append-only raw snapshot storage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rpt_core::{RawSnapshot, SnapshotReceipt};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::info;

use crate::{sha256_hex, StoreError};

/// Durable, append-only store of fetch results keyed by entity type.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Creates the backing schema if it does not exist yet.
    async fn prepare(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Appends a snapshot; returns once it is durably persisted.
    async fn save(
        &self,
        entity_type: &str,
        records: &[JsonValue],
    ) -> Result<SnapshotReceipt, StoreError>;

    /// The most recent snapshot of every entity type, ordered by entity type.
    /// Equal `captured_at` values are resolved by the highest id.
    async fn latest(&self) -> Result<Vec<RawSnapshot>, StoreError>;
}

fn encode_payload(records: &[JsonValue]) -> Result<(JsonValue, String), StoreError> {
    let payload = JsonValue::Array(records.to_vec());
    let bytes = serde_json::to_vec(&payload)?;
    Ok((payload, sha256_hex(&bytes)))
}

#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn prepare(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_snapshots (
                id BIGSERIAL PRIMARY KEY,
                entity_type TEXT NOT NULL,
                captured_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                payload JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_raw_snapshots_entity_type ON raw_snapshots (entity_type)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_raw_snapshots_captured_at ON raw_snapshots (captured_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save(
        &self,
        entity_type: &str,
        records: &[JsonValue],
    ) -> Result<SnapshotReceipt, StoreError> {
        let (payload, content_hash) = encode_payload(records)?;
        let row = sqlx::query(
            r#"
            INSERT INTO raw_snapshots (entity_type, payload)
            VALUES ($1, $2)
            RETURNING id, captured_at
            "#,
        )
        .bind(entity_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        let receipt = SnapshotReceipt {
            id: row.try_get("id")?,
            entity_type: entity_type.to_string(),
            captured_at: row.try_get("captured_at")?,
            record_count: records.len(),
            content_hash,
        };
        info!(
            entity_type,
            snapshot_id = receipt.id,
            records = receipt.record_count,
            "snapshot saved"
        );
        Ok(receipt)
    }

    async fn latest(&self) -> Result<Vec<RawSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (entity_type) id, entity_type, captured_at, payload
              FROM raw_snapshots
             ORDER BY entity_type, captured_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawSnapshot {
                id: row.try_get("id")?,
                entity_type: row.try_get("entity_type")?,
                captured_at: row.try_get("captured_at")?,
                payload: row.try_get("payload")?,
            });
        }
        Ok(out)
    }
}

/// Process-local snapshot store; history lives as long as the value.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<Vec<RawSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a snapshot with an explicit capture time.
    pub async fn insert_at(
        &self,
        entity_type: &str,
        records: &[JsonValue],
        captured_at: DateTime<Utc>,
    ) -> Result<SnapshotReceipt, StoreError> {
        let (payload, content_hash) = encode_payload(records)?;
        let mut snapshots = self.snapshots.lock().await;
        let id = snapshots.len() as i64 + 1;
        snapshots.push(RawSnapshot {
            id,
            entity_type: entity_type.to_string(),
            captured_at,
            payload,
        });
        Ok(SnapshotReceipt {
            id,
            entity_type: entity_type.to_string(),
            captured_at,
            record_count: records.len(),
            content_hash,
        })
    }

    pub async fn history(&self, entity_type: &str) -> Vec<RawSnapshot> {
        self.snapshots
            .lock()
            .await
            .iter()
            .filter(|s| s.entity_type == entity_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(
        &self,
        entity_type: &str,
        records: &[JsonValue],
    ) -> Result<SnapshotReceipt, StoreError> {
        self.insert_at(entity_type, records, Utc::now()).await
    }

    async fn latest(&self) -> Result<Vec<RawSnapshot>, StoreError> {
        let snapshots = self.snapshots.lock().await;
        let mut newest: BTreeMap<&str, &RawSnapshot> = BTreeMap::new();
        for snapshot in snapshots.iter() {
            let entry = newest.entry(snapshot.entity_type.as_str()).or_insert(snapshot);
            if (snapshot.captured_at, snapshot.id) > (entry.captured_at, entry.id) {
                *entry = snapshot;
            }
        }
        Ok(newest.into_values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn latest_picks_greatest_capture_time_per_entity_type() {
        let store = MemorySnapshotStore::new();
        store.insert_at("Issues", &[json!({"Clave": "A-2"})], at(10)).await.unwrap();
        store.insert_at("Issues", &[json!({"Clave": "A-1"})], at(8)).await.unwrap();
        store.insert_at("Sprints", &[json!({"Sprint Id": 1})], at(9)).await.unwrap();
        store.insert_at("Sprints", &[json!({"Sprint Id": 2})], at(11)).await.unwrap();

        let latest = store.latest().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].entity_type, "Issues");
        assert_eq!(latest[0].captured_at, at(10));
        assert_eq!(latest[0].payload, json!([{"Clave": "A-2"}]));
        assert_eq!(latest[1].entity_type, "Sprints");
        assert_eq!(latest[1].captured_at, at(11));
    }

    #[tokio::test]
    async fn equal_capture_times_resolve_to_highest_id() {
        let store = MemorySnapshotStore::new();
        store.insert_at("Worklogs", &[json!({"n": 1})], at(7)).await.unwrap();
        let second = store.insert_at("Worklogs", &[json!({"n": 2})], at(7)).await.unwrap();

        let latest = store.latest().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, second.id);
        assert_eq!(store.history("Worklogs").await.len(), 2);
    }

    #[tokio::test]
    async fn receipt_hash_tracks_payload_content() {
        let store = MemorySnapshotStore::new();
        let a = store.save("Etiquetas", &[json!({"Etiquetas": "x"})]).await.unwrap();
        let b = store.save("Etiquetas", &[json!({"Etiquetas": "x"})]).await.unwrap();
        let c = store.save("Etiquetas", &[json!({"Etiquetas": "y"})]).await.unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
        assert_ne!(a.id, b.id);
        assert_eq!(a.record_count, 1);
    }
}
