use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crimesync_core::{AreaRecord, BackoffPolicy, ReportingPeriod, DEFAULT_PERIOD};
use crimesync_fetch::{HttpClientConfig, DEFAULT_API_BASE};
use crimesync_store::TableName;

pub const DEFAULT_AREAS_CSV: &str = "data/london_boroughs_borders.csv";
pub const DEFAULT_BATCH_SIZE: usize = 15;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` defers to libpq-style `PG*` environment variables.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub table: TableName,
    pub areas_csv: PathBuf,
    pub period: ReportingPeriod,
    pub batch_size: usize,
    pub http: HttpClientConfig,
    pub upload_backoff: BackoffPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 5,
            table: TableName::default(),
            areas_csv: PathBuf::from(DEFAULT_AREAS_CSV),
            period: DEFAULT_PERIOD,
            batch_size: DEFAULT_BATCH_SIZE,
            http: HttpClientConfig {
                user_agent: Some("crimesync/0.1".to_string()),
                ..Default::default()
            },
            upload_backoff: BackoffPolicy::new(3, Duration::from_secs(1)),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let table = match std::env::var("CRIMESYNC_TABLE") {
            Ok(raw) => raw.parse::<TableName>().context("CRIMESYNC_TABLE")?,
            Err(_) => defaults.table,
        };
        let period = match std::env::var("CRIMESYNC_PERIOD") {
            Ok(raw) => raw.parse::<ReportingPeriod>().context("CRIMESYNC_PERIOD")?,
            Err(_) => defaults.period,
        };

        let base_delay = env_parse::<u64>("CRIMESYNC_BACKOFF_BASE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.http.backoff.base_delay);
        let max_delay = env_parse::<u64>("CRIMESYNC_BACKOFF_MAX_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.http.backoff.max_delay);
        let fetch_attempts =
            env_parse("CRIMESYNC_FETCH_ATTEMPTS").unwrap_or(defaults.http.backoff.max_attempts);
        let upload_attempts =
            env_parse("CRIMESYNC_UPLOAD_ATTEMPTS").unwrap_or(defaults.upload_backoff.max_attempts);

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            db_max_connections: env_parse("CRIMESYNC_DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.db_max_connections),
            table,
            areas_csv: std::env::var("CRIMESYNC_AREAS_CSV")
                .map(PathBuf::from)
                .unwrap_or(defaults.areas_csv),
            period,
            batch_size: env_parse::<usize>("CRIMESYNC_BATCH_SIZE")
                .unwrap_or(defaults.batch_size)
                .max(1),
            http: HttpClientConfig {
                api_base: std::env::var("CRIMESYNC_API_BASE")
                    .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
                timeout: env_parse::<u64>("CRIMESYNC_HTTP_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.http.timeout),
                user_agent: std::env::var("CRIMESYNC_USER_AGENT")
                    .ok()
                    .or(defaults.http.user_agent),
                max_requests_per_second: env_parse("CRIMESYNC_MAX_RPS")
                    .unwrap_or(defaults.http.max_requests_per_second),
                max_concurrent_fetches: env_parse("CRIMESYNC_MAX_CONCURRENT_FETCHES"),
                backoff: BackoffPolicy::new(fetch_attempts, base_delay).with_max_delay(max_delay),
            },
            upload_backoff: BackoffPolicy::new(upload_attempts, base_delay)
                .with_max_delay(max_delay),
        })
    }
}

/// Read area records from a header CSV (`borough`/`name`, `latitude`, `longitude`).
/// Extra columns are ignored.
pub fn load_areas_csv(path: impl AsRef<Path>) -> Result<Vec<AreaRecord>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut areas = Vec::new();
    for (index, record) in reader.deserialize::<AreaRecord>().enumerate() {
        // Line numbers count the header.
        let line = index + 2;
        let area = record.with_context(|| format!("parsing {} line {line}", path.display()))?;
        if !area.latitude.is_finite() || !area.longitude.is_finite() {
            bail!(
                "{} line {line}: non-finite coordinates for {}",
                path.display(),
                area.name
            );
        }
        areas.push(area);
    }
    Ok(areas)
}
