//! Two-stage ingestion: catalog → fetch + snapshot → transform latest snapshots.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rpt_adapters::{FetchContext, FetchError, RecordSource};
use rpt_core::{FetchOutcome, FetchStatus, RawSnapshot, RunReport, TransformAbort};
use rpt_storage::{SnapshotStore, StoreError};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::transform::{TransformError, TransformOutcome, Transformer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovering,
    Fetching,
    Transforming,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovering => "discovering",
            Self::Fetching => "fetching",
            Self::Transforming => "transforming",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    FetchOnly,
    TransformOnly,
}

/// Fatal failures; everything else is reported through [`RunReport`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no record source configured")]
    MissingSource,
    #[error("discovering entity types: {0}")]
    Discovery(#[source] FetchError),
    #[error("snapshot store: {0}")]
    Snapshots(#[source] StoreError),
    #[error("preparing tables: {0}")]
    Tables(#[source] TransformError),
}

pub struct IngestPipeline {
    source: Option<Arc<dyn RecordSource>>,
    snapshots: Arc<dyn SnapshotStore>,
    transformer: Transformer,
}

impl IngestPipeline {
    pub fn new(snapshots: Arc<dyn SnapshotStore>, transformer: Transformer) -> Self {
        Self {
            source: None,
            snapshots,
            transformer,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Creates the snapshot table and every registered normalized table.
    pub async fn prepare(&self) -> Result<(), PipelineError> {
        self.snapshots
            .prepare()
            .await
            .map_err(PipelineError::Snapshots)?;
        self.transformer
            .prepare()
            .await
            .map_err(PipelineError::Tables)
    }

    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        self.execute(RunMode::Full).await
    }

    pub async fn run_fetch_stage(&self) -> Result<RunReport, PipelineError> {
        self.execute(RunMode::FetchOnly).await
    }

    pub async fn run_transform_stage(&self) -> Result<RunReport, PipelineError> {
        self.execute(RunMode::TransformOnly).await
    }

    pub async fn execute(&self, mode: RunMode) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, ?mode);
        async move {
            let mut report = RunReport::new(run_id, Utc::now());
            let ctx = FetchContext { run_id };

            if mode != RunMode::TransformOnly {
                let source = self.source.as_ref().ok_or(PipelineError::MissingSource)?;
                report.source = Some(source.source_id().to_string());
                info!(stage = %Stage::Discovering, source = source.source_id(), "stage started");
                report.catalog = source
                    .list_entity_types(&ctx)
                    .await
                    .map_err(PipelineError::Discovery)?;

                info!(stage = %Stage::Fetching, entity_types = report.catalog.len(), "stage started");
                report.fetches = self.fetch_all(&**source, &ctx, &report.catalog).await;
            }

            if mode != RunMode::FetchOnly {
                info!(stage = %Stage::Transforming, "stage started");
                self.transform_latest(&mut report).await?;
            }

            report.finished_at = Utc::now();
            if report.succeeded() {
                info!(summary = %report.headline(), "run finished");
            } else {
                error!(summary = %report.headline(), "run finished");
            }
            Ok::<_, PipelineError>(report)
        }
        .instrument(span)
        .await
    }

    async fn fetch_all(
        &self,
        source: &dyn RecordSource,
        ctx: &FetchContext,
        catalog: &[String],
    ) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::with_capacity(catalog.len());
        for entity_type in catalog {
            let status = match source.fetch_records(ctx, entity_type).await {
                Ok(records) => match self.snapshots.save(entity_type, &records).await {
                    Ok(receipt) => FetchStatus::Captured {
                        records: receipt.record_count,
                        snapshot_id: receipt.id,
                        content_hash: receipt.content_hash,
                    },
                    Err(err) => {
                        error!(%entity_type, error = %err, "saving snapshot failed");
                        FetchStatus::Failed {
                            error: format!("saving snapshot: {err}"),
                        }
                    }
                },
                Err(err) => {
                    warn!(%entity_type, error = %err, "fetch failed; previous snapshot stays latest");
                    FetchStatus::Failed {
                        error: err.to_string(),
                    }
                }
            };
            outcomes.push(FetchOutcome {
                entity_type: entity_type.clone(),
                status,
            });
        }
        outcomes
    }

    async fn transform_latest(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        let latest = self
            .snapshots
            .latest()
            .await
            .map_err(PipelineError::Snapshots)?;

        for snapshot in order_snapshots(&report.catalog, latest) {
            let outcome = self
                .transformer
                .transform(&snapshot.entity_type, &snapshot.payload)
                .await;
            match outcome {
                Ok(TransformOutcome::Loaded(summaries)) => report.loads.extend(summaries),
                Ok(TransformOutcome::Skipped) => report.skipped.push(snapshot.entity_type),
                Err(err) => {
                    error!(
                        entity_type = %err.entity_type(),
                        snapshot_id = snapshot.id,
                        error = %err,
                        "transform failed; remaining entity types not loaded"
                    );
                    report.aborted = Some(TransformAbort {
                        entity_type: err.entity_type().to_string(),
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Catalog order first, then snapshot types the catalog no longer lists, by name.
pub fn order_snapshots(catalog: &[String], mut latest: Vec<RawSnapshot>) -> Vec<RawSnapshot> {
    let mut ordered = Vec::with_capacity(latest.len());
    for name in catalog {
        if let Some(pos) = latest.iter().position(|s| &s.entity_type == name) {
            ordered.push(latest.remove(pos));
        }
    }
    latest.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
    ordered.extend(latest);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rpt_storage::{MemorySnapshotStore, MemoryTableStore};
    use serde_json::{json, Value as JsonValue};
    use std::collections::HashMap;

    use crate::registry::EntityRegistry;

    struct StubSource {
        catalog: Vec<String>,
        data: HashMap<String, Result<Vec<JsonValue>, u16>>,
    }

    #[async_trait]
    impl RecordSource for StubSource {
        fn source_id(&self) -> &str {
            "stub"
        }

        async fn list_entity_types(&self, _ctx: &FetchContext) -> Result<Vec<String>, FetchError> {
            Ok(self.catalog.clone())
        }

        async fn fetch_records(
            &self,
            _ctx: &FetchContext,
            entity_type: &str,
        ) -> Result<Vec<JsonValue>, FetchError> {
            match self.data.get(entity_type) {
                Some(Ok(records)) => Ok(records.clone()),
                Some(Err(status)) => Err(FetchError::HttpStatus {
                    status: *status,
                    url: format!("stub://{entity_type}"),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    /// Delegates to memory, but refuses to save the listed entity types.
    struct FailingSaves {
        inner: MemorySnapshotStore,
        refuse: Vec<&'static str>,
    }

    #[async_trait]
    impl SnapshotStore for FailingSaves {
        async fn save(
            &self,
            entity_type: &str,
            records: &[JsonValue],
        ) -> Result<rpt_core::SnapshotReceipt, StoreError> {
            if self.refuse.iter().any(|r| *r == entity_type) {
                let err = serde_json::from_str::<JsonValue>("{").unwrap_err();
                return Err(StoreError::Serialize(err));
            }
            self.inner.save(entity_type, records).await
        }

        async fn latest(&self) -> Result<Vec<RawSnapshot>, StoreError> {
            self.inner.latest().await
        }
    }

    fn pipeline(
        source: StubSource,
    ) -> (IngestPipeline, Arc<MemorySnapshotStore>, Arc<MemoryTableStore>) {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let tables = Arc::new(MemoryTableStore::new());
        let registry = Arc::new(EntityRegistry::builtin().unwrap());
        let pipeline = IngestPipeline::new(snapshots.clone(), Transformer::new(registry, tables.clone()))
            .with_source(Arc::new(source));
        (pipeline, snapshots, tables)
    }

    fn snapshot(id: i64, entity_type: &str) -> RawSnapshot {
        RawSnapshot {
            id,
            entity_type: entity_type.into(),
            captured_at: Utc::now(),
            payload: json!([]),
        }
    }

    #[test]
    fn snapshots_follow_catalog_order_then_name() {
        let latest = vec![
            snapshot(1, "Components"),
            snapshot(2, "Issues"),
            snapshot(3, "Legacy"),
            snapshot(4, "Sprints"),
        ];
        let catalog = vec!["Sprints".to_string(), "Issues".to_string(), "Gone".to_string()];
        let ordered = order_snapshots(&catalog, latest)
            .into_iter()
            .map(|s| s.entity_type)
            .collect::<Vec<_>>();
        assert_eq!(ordered, vec!["Sprints", "Issues", "Components", "Legacy"]);
    }

    #[tokio::test]
    async fn fetch_failure_skips_type_but_keeps_previous_snapshot() {
        let mut data = HashMap::new();
        data.insert("Sprints".to_string(), Err(500));
        data.insert(
            "Worklogs".to_string(),
            Ok(vec![json!({ "Worklog ID": "W-1", "Time Spent": "1" })]),
        );
        let (pipeline, snapshots, tables) = pipeline(StubSource {
            catalog: vec!["Sprints".into(), "Worklogs".into()],
            data,
        });
        snapshots
            .save("Sprints", &[json!({ "Sprint Id": "S-old" })])
            .await
            .unwrap();

        let report = pipeline.run().await.unwrap();

        assert!(report.succeeded());
        assert_eq!(report.failed_fetches(), vec!["Sprints"]);
        assert_eq!(report.records_fetched("Worklogs"), Some(1));
        assert_eq!(snapshots.history("Sprints").await.len(), 1);
        assert_eq!(report.rows_loaded("Sprints"), Some(1));
        assert_eq!(tables.rows("sprints").await.len(), 1);
        assert_eq!(tables.rows("worklogs").await.len(), 1);
    }

    #[tokio::test]
    async fn transform_failure_aborts_remaining_types() {
        let mut data = HashMap::new();
        data.insert(
            "Worklogs".to_string(),
            Ok(vec![json!({ "Worklog ID": "W-1", "Time Spent": "lots" })]),
        );
        data.insert("Sprints".to_string(), Ok(vec![json!({ "Sprint Id": "S-1" })]));
        data.insert("Unmodelled".to_string(), Ok(vec![json!({ "a": 1 })]));
        let (pipeline, _snapshots, tables) = pipeline(StubSource {
            catalog: vec!["Unmodelled".into(), "Worklogs".into(), "Sprints".into()],
            data,
        });

        let report = pipeline.run().await.unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.fetches.len(), 3);
        assert!(report.failed_fetches().is_empty());
        assert_eq!(report.skipped, vec!["Unmodelled".to_string()]);
        let abort = report.aborted.as_ref().unwrap();
        assert_eq!(abort.entity_type, "Worklogs");
        assert!(report.headline().contains("aborted during transform of Worklogs"));
        assert!(report.loads.is_empty());
        assert!(tables.rows("sprints").await.is_empty());
    }

    #[tokio::test]
    async fn stages_can_run_separately() {
        let mut data = HashMap::new();
        data.insert("Sprints".to_string(), Ok(vec![json!({ "Sprint Id": "S-1" })]));
        let (pipeline, snapshots, tables) = pipeline(StubSource {
            catalog: vec!["Sprints".into()],
            data,
        });

        let fetched = pipeline.run_fetch_stage().await.unwrap();
        assert_eq!(fetched.source.as_deref(), Some("stub"));
        assert_eq!(fetched.records_fetched("Sprints"), Some(1));
        assert!(fetched.loads.is_empty());
        assert_eq!(snapshots.history("Sprints").await.len(), 1);
        assert!(tables.rows("sprints").await.is_empty());

        let transformed = pipeline.run_transform_stage().await.unwrap();
        assert!(transformed.fetches.is_empty());
        assert!(transformed.source.is_none());
        assert_eq!(transformed.rows_loaded("Sprints"), Some(1));
        assert_eq!(tables.rows("sprints").await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_save_failure_is_recorded_and_next_type_proceeds() {
        let mut data = HashMap::new();
        data.insert("Sprints".to_string(), Ok(vec![json!({ "Sprint Id": "S-1" })]));
        data.insert(
            "Worklogs".to_string(),
            Ok(vec![json!({ "Worklog ID": "W-1", "Time Spent": "2" })]),
        );
        let snapshots = Arc::new(FailingSaves {
            inner: MemorySnapshotStore::new(),
            refuse: vec!["Sprints"],
        });
        let tables = Arc::new(MemoryTableStore::new());
        let registry = Arc::new(EntityRegistry::builtin().unwrap());
        let pipeline = IngestPipeline::new(snapshots.clone(), Transformer::new(registry, tables.clone()))
            .with_source(Arc::new(StubSource {
                catalog: vec!["Sprints".into(), "Worklogs".into()],
                data,
            }));

        let report = pipeline.run().await.unwrap();

        assert!(report.succeeded());
        assert_eq!(report.failed_fetches(), vec!["Sprints"]);
        match &report.fetches[0].status {
            FetchStatus::Failed { error } => assert!(error.starts_with("saving snapshot")),
            other => panic!("expected a failed save, got {other:?}"),
        }
        assert_eq!(report.records_fetched("Worklogs"), Some(1));
        assert!(snapshots.inner.history("Sprints").await.is_empty());
        assert_eq!(snapshots.inner.history("Worklogs").await.len(), 1);
        assert_eq!(report.rows_loaded("Sprints"), None);
        assert_eq!(tables.rows("worklogs").await.len(), 1);
    }

    #[tokio::test]
    async fn fetching_without_a_source_is_fatal() {
        let registry = Arc::new(EntityRegistry::builtin().unwrap());
        let pipeline = IngestPipeline::new(
            Arc::new(MemorySnapshotStore::new()),
            Transformer::new(registry, Arc::new(MemoryTableStore::new())),
        );
        assert!(matches!(pipeline.run().await, Err(PipelineError::MissingSource)));
        assert!(pipeline.run_transform_stage().await.is_ok());
    }
}
