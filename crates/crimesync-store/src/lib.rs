//! Persistence of normalized crime rows: schema provisioning, existing-id
//! lookup and idempotent bulk upload with contention retry.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crimesync_core::{BackoffPolicy, NormalizedRow, RetryError, NORMALIZED_COLUMNS};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{error, info};

pub const CRATE_NAME: &str = "crimesync-store";

pub const DEFAULT_TABLE: &str = "street_crimes";

/// Postgres caps a statement at 65535 bind parameters; 12 columns per row.
pub const MAX_ROWS_PER_STATEMENT: usize = 5000;

const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid table name {0:?}: expected [schema.]identifier")]
pub struct InvalidTableName(pub String);

/// A validated, optionally schema-qualified table identifier. Safe to splice
/// into SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for TableName {
    type Err = InvalidTableName;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = input.split('.').collect();
        if parts.len() > 2 || !parts.iter().all(|part| is_identifier(part)) {
            return Err(InvalidTableName(input.to_string()));
        }
        Ok(Self(input.to_ascii_lowercase()))
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self(DEFAULT_TABLE.to_string())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn create_table_sql(table: &TableName) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            category VARCHAR(255) NOT NULL,
            location_type VARCHAR(255),
            location_latitude VARCHAR(255) NOT NULL,
            location_longitude VARCHAR(255) NOT NULL,
            context VARCHAR(255),
            outcome_status VARCHAR(255),
            persistent_id VARCHAR(255),
            id BIGINT PRIMARY KEY,
            location_subtype VARCHAR(255),
            month SMALLINT NOT NULL,
            year SMALLINT NOT NULL,
            borough VARCHAR(255) NOT NULL
        )
        "#
    )
}

fn insert_prefix(table: &TableName) -> String {
    format!("INSERT INTO {table} ({}) ", NORMALIZED_COLUMNS.join(", "))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write contention ({code}): {message}")]
    Contention { code: String, message: String },
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if let Some(code) = db_err.code() {
                if code == DEADLOCK_DETECTED || code == SERIALIZATION_FAILURE {
                    return Self::Contention {
                        code: code.into_owned(),
                        message: db_err.message().to_string(),
                    };
                }
            }
        }
        Self::Database(err)
    }
}

/// The two operations the pipeline needs from the persisted table.
#[async_trait]
pub trait CrimeStore: Send + Sync {
    async fn existing_ids(&self) -> Result<HashSet<i64>, StoreError>;

    /// Insert rows, silently skipping ids that already exist. Returns the
    /// number of rows actually written.
    async fn insert_rows(&self, rows: &[NormalizedRow]) -> Result<u64, StoreError>;
}

pub async fn connect_pool(
    database_url: Option<&str>,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    // Without a URL, libpq-style PGHOST/PGDATABASE/PGUSER/PGPASSWORD apply.
    let options = match database_url {
        Some(url) => PgConnectOptions::from_str(url)?,
        None => PgConnectOptions::new(),
    };
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
}

#[derive(Debug, Clone)]
pub struct PgCrimeStore {
    pool: PgPool,
    table: TableName,
}

impl PgCrimeStore {
    pub fn new(pool: PgPool, table: TableName) -> Self {
        Self { pool, table }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql(&self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CrimeStore for PgCrimeStore {
    async fn existing_ids(&self) -> Result<HashSet<i64>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(&format!("SELECT id FROM {}", self.table))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn insert_rows(&self, rows: &[NormalizedRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let prefix = insert_prefix(&self.table);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
            builder.push_values(chunk, |mut values, row| {
                values
                    .push_bind(row.category.clone())
                    .push_bind(row.location_type.clone())
                    .push_bind(row.location_latitude.clone())
                    .push_bind(row.location_longitude.clone())
                    .push_bind(row.context.clone())
                    .push_bind(row.outcome_status.clone())
                    .push_bind(row.persistent_id.clone())
                    .push_bind(row.id)
                    .push_bind(row.location_subtype.clone())
                    .push_bind(row.month)
                    .push_bind(row.year)
                    .push_bind(row.borough.clone());
            });
            builder.push(" ON CONFLICT (id) DO NOTHING");

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

/// In-process table keyed by id with the same conflict-skip semantics.
/// Failures queued with [`MemoryCrimeStore::fail_next`] are returned by the
/// following inserts, one per call.
#[derive(Debug, Default)]
pub struct MemoryCrimeStore {
    rows: Mutex<BTreeMap<i64, NormalizedRow>>,
    pending_failures: Mutex<VecDeque<StoreError>>,
    insert_sizes: Mutex<Vec<usize>>,
}

impl MemoryCrimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = NormalizedRow>) -> Self {
        let store = Self::new();
        if let Ok(mut table) = store.rows.lock() {
            table.extend(rows.into_iter().map(|row| (row.id, row)));
        }
        store
    }

    pub fn fail_next(&self, err: StoreError) {
        if let Ok(mut failures) = self.pending_failures.lock() {
            failures.push_back(err);
        }
    }

    pub fn rows(&self) -> Vec<NormalizedRow> {
        self.rows
            .lock()
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Row count of every insert call, failed ones included.
    pub fn insert_sizes(&self) -> Vec<usize> {
        self.insert_sizes
            .lock()
            .map(|sizes| sizes.clone())
            .unwrap_or_default()
    }

    fn poisoned() -> StoreError {
        StoreError::Other("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl CrimeStore for MemoryCrimeStore {
    async fn existing_ids(&self) -> Result<HashSet<i64>, StoreError> {
        let table = self.rows.lock().map_err(|_| Self::poisoned())?;
        Ok(table.keys().copied().collect())
    }

    async fn insert_rows(&self, rows: &[NormalizedRow]) -> Result<u64, StoreError> {
        self.insert_sizes
            .lock()
            .map_err(|_| Self::poisoned())?
            .push(rows.len());

        if let Some(err) = self
            .pending_failures
            .lock()
            .map_err(|_| Self::poisoned())?
            .pop_front()
        {
            return Err(err);
        }

        let mut table = self.rows.lock().map_err(|_| Self::poisoned())?;
        let mut inserted = 0u64;
        for row in rows {
            if !table.contains_key(&row.id) {
                table.insert(row.id, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Empty,
    Inserted { submitted: usize, inserted: u64 },
    Abandoned { submitted: usize, reason: String },
}

/// Bulk upload of one batch. Contention is retried under the backoff policy;
/// any other failure abandons the batch.
pub struct Uploader {
    store: Arc<dyn CrimeStore>,
    backoff: BackoffPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn CrimeStore>, backoff: BackoffPolicy) -> Self {
        Self { store, backoff }
    }

    pub async fn upload(&self, rows: &[NormalizedRow]) -> UploadOutcome {
        if rows.is_empty() {
            return UploadOutcome::Empty;
        }

        let submitted = rows.len();
        let result = self
            .backoff
            .run(
                "crime_upload",
                |_attempt| self.store.insert_rows(rows),
                StoreError::is_contention,
            )
            .await;

        match result {
            Ok(inserted) => {
                info!(submitted, inserted, "uploaded batch");
                UploadOutcome::Inserted {
                    submitted,
                    inserted,
                }
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(attempts, error = %last, "contention persisted; abandoning batch upload");
                UploadOutcome::Abandoned {
                    submitted,
                    reason: last.to_string(),
                }
            }
            Err(RetryError::Fatal(err)) => {
                error!(error = %err, "insert failed; abandoning batch upload");
                UploadOutcome::Abandoned {
                    submitted,
                    reason: err.to_string(),
                }
            }
        }
    }
}
