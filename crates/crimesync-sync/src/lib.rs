//! Sync pipeline orchestration: batches of areas flow through
//! fetch -> transform -> dedup -> upload, one batch at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crimesync_core::{AreaRecord, BackoffPolicy, ReportingPeriod};
use crimesync_fetch::CrimeFetcher;
use crimesync_store::{
    connect_pool, CrimeStore, MemoryCrimeStore, PgCrimeStore, TableName, UploadOutcome, Uploader,
};
use crimesync_transform::{transform_batch, ExistingIdSet};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

mod config;

pub use config::{load_areas_csv, SyncConfig, DEFAULT_AREAS_CSV, DEFAULT_BATCH_SIZE};

pub const CRATE_NAME: &str = "crimesync-sync";

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub areas: usize,
    pub areas_with_data: usize,
    pub fetched_records: usize,
    pub normalized_rows: usize,
    pub rejected_rows: usize,
    pub skipped_existing: usize,
    pub upload: UploadOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub period: ReportingPeriod,
    pub areas: usize,
    pub batches: usize,
    pub fetched_records: usize,
    pub normalized_rows: usize,
    pub rejected_rows: usize,
    pub skipped_existing: usize,
    pub uploaded_rows: usize,
    pub inserted_rows: u64,
    pub abandoned_batches: usize,
}

impl SyncRunSummary {
    fn absorb(&mut self, batch: &BatchSummary) {
        self.batches += 1;
        self.fetched_records += batch.fetched_records;
        self.normalized_rows += batch.normalized_rows;
        self.rejected_rows += batch.rejected_rows;
        self.skipped_existing += batch.skipped_existing;
        match &batch.upload {
            UploadOutcome::Empty => {}
            UploadOutcome::Inserted {
                submitted,
                inserted,
            } => {
                self.uploaded_rows += submitted;
                self.inserted_rows += inserted;
            }
            UploadOutcome::Abandoned { .. } => self.abandoned_batches += 1,
        }
    }
}

pub struct SyncPipeline {
    fetcher: CrimeFetcher,
    store: Arc<dyn CrimeStore>,
    uploader: Uploader,
    batch_size: usize,
}

impl SyncPipeline {
    pub fn new(
        fetcher: CrimeFetcher,
        store: Arc<dyn CrimeStore>,
        upload_backoff: BackoffPolicy,
        batch_size: usize,
    ) -> Self {
        let uploader = Uploader::new(store.clone(), upload_backoff);
        Self {
            fetcher,
            store,
            uploader,
            batch_size: batch_size.max(1),
        }
    }

    /// Process every area once. Per-area and per-batch failures are absorbed;
    /// only loading the existing id set can fail the run.
    pub async fn run(&self, areas: &[AreaRecord]) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        async {
            let existing = ExistingIdSet::new(
                self.store
                    .existing_ids()
                    .await
                    .context("loading existing crime ids")?,
            );
            let total = areas.len().div_ceil(self.batch_size);
            info!(
                areas = areas.len(),
                batches = total,
                existing = existing.len(),
                period = %self.fetcher.period(),
                "starting sync"
            );

            let mut summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: started_at,
                period: self.fetcher.period(),
                areas: areas.len(),
                batches: 0,
                fetched_records: 0,
                normalized_rows: 0,
                rejected_rows: 0,
                skipped_existing: 0,
                uploaded_rows: 0,
                inserted_rows: 0,
                abandoned_batches: 0,
            };

            for (index, batch) in areas.chunks(self.batch_size).enumerate() {
                let number = index + 1;
                let result = self
                    .run_batch(batch, &existing)
                    .instrument(info_span!("sync_batch", batch = number))
                    .await;
                info!(
                    areas = result.areas,
                    with_data = result.areas_with_data,
                    new_rows = result.normalized_rows - result.skipped_existing,
                    upload = ?result.upload,
                    "batch {number}/{total}"
                );
                summary.absorb(&result);
            }

            summary.finished_at = Utc::now();
            info!(
                inserted = summary.inserted_rows,
                abandoned = summary.abandoned_batches,
                "sync complete"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(info_span!("sync_run", %run_id))
        .await
    }

    async fn run_batch(&self, areas: &[AreaRecord], existing: &ExistingIdSet) -> BatchSummary {
        let results = join_all(areas.iter().map(|area| self.fetcher.fetch(area))).await;
        let fetched_records = results.iter().map(Vec::len).sum();

        let transformed = transform_batch(areas, results);
        let normalized_rows = transformed.rows.len();
        let rows = existing.filter(transformed.rows);
        let skipped_existing = normalized_rows - rows.len();

        let upload = self.uploader.upload(&rows).await;

        BatchSummary {
            areas: areas.len(),
            areas_with_data: transformed.areas_with_data,
            fetched_records,
            normalized_rows,
            rejected_rows: transformed.rejected,
            skipped_existing,
            upload,
        }
    }
}

async fn open_store(config: &SyncConfig) -> Result<PgCrimeStore> {
    let pool = connect_pool(config.database_url.as_deref(), config.db_max_connections)
        .await
        .context("connecting to postgres")?;
    Ok(PgCrimeStore::new(pool, config.table.clone()))
}

/// Load areas, connect, and run one full sync. `dry_run` swaps Postgres for an
/// empty in-memory table.
pub async fn run_sync(config: &SyncConfig, dry_run: bool) -> Result<SyncRunSummary> {
    let areas = load_areas_csv(&config.areas_csv)?;
    let fetcher = CrimeFetcher::new(&config.http, config.period)?;

    let store: Arc<dyn CrimeStore> = if dry_run {
        info!("dry run: rows are kept in memory only");
        Arc::new(MemoryCrimeStore::new())
    } else {
        Arc::new(open_store(config).await?)
    };

    SyncPipeline::new(fetcher, store, config.upload_backoff, config.batch_size)
        .run(&areas)
        .await
}

/// Create the target table if it does not exist yet.
pub async fn migrate(config: &SyncConfig) -> Result<TableName> {
    let store = open_store(config).await?;
    store
        .ensure_schema()
        .await
        .with_context(|| format!("creating table {}", store.table()))?;
    Ok(store.table().clone())
}
