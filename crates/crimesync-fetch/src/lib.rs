//! Rate-limited, retrying fetch of street-level crimes for one area at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use crimesync_core::{AreaRecord, BackoffPolicy, ReportingPeriod, RetryError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "crimesync-fetch";

pub const DEFAULT_API_BASE: &str = "https://data.police.uk/api";

/// Longest slice of an error body carried into logs.
const BODY_PREVIEW_LEN: usize = 500;

/// Fixed-spacing gate: consecutive permits are released at least
/// `1 / max_requests_per_second` apart.
///
/// Each waiter reserves the next free slot under the lock and sleeps outside it,
/// so concurrent callers receive strictly increasing slots in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_release: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests_per_second: f64) -> Self {
        let interval = if max_requests_per_second.is_finite() && max_requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / max_requests_per_second)
        } else {
            Duration::ZERO
        };
        Self::with_interval(interval)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_release: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }

        let slot = {
            let mut last = self.last_release.lock().await;
            let now = Instant::now();
            let slot = match *last {
                Some(previous) => (previous + self.interval).max(now),
                None => now,
            };
            *last = Some(slot);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

/// Query parameters for one `crimes-street/all-crime` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrimeQuery {
    pub period: ReportingPeriod,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("payload error: {0}")]
    Payload(String),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        // Bodies are read as bytes, so decode errors here come from decompression.
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Self::Payload(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// The one HTTP call the fetcher needs.
#[async_trait]
pub trait CrimeTransport: Send + Sync {
    async fn get_crimes(&self, query: &CrimeQuery) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_requests_per_second: f64,
    pub max_concurrent_fetches: Option<usize>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_requests_per_second: 15.0,
            max_concurrent_fetches: None,
            backoff: BackoffPolicy::new(5, Duration::from_secs(1)),
        }
    }
}

pub fn crimes_endpoint(api_base: &str) -> String {
    format!("{}/crimes-street/all-crime", api_base.trim_end_matches('/'))
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: crimes_endpoint(&config.api_base),
        })
    }
}

#[async_trait]
impl CrimeTransport for ReqwestTransport {
    async fn get_crimes(&self, query: &CrimeQuery) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("date", query.period.to_string()),
                ("lat", query.latitude.to_string()),
                ("lng", query.longitude.to_string()),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("payload corrupted: {0}")]
    Payload(String),
    #[error("200 body is not a JSON array: {0}")]
    MalformedBody(String),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout(_) | Self::Payload(_))
    }
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => Self::Timeout(msg),
            TransportError::Payload(msg) => Self::Payload(msg),
            TransportError::Other(msg) => Self::Transport(msg),
        }
    }
}

fn body_preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(BODY_PREVIEW_LEN) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

pub struct CrimeFetcher {
    transport: Arc<dyn CrimeTransport>,
    limiter: Arc<RateLimiter>,
    concurrency: Option<Arc<Semaphore>>,
    backoff: BackoffPolicy,
    period: ReportingPeriod,
}

impl CrimeFetcher {
    pub fn new(config: &HttpClientConfig, period: ReportingPeriod) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        let limiter = Arc::new(RateLimiter::new(config.max_requests_per_second));
        let fetcher = Self::with_transport(Arc::new(transport), limiter, config.backoff, period);
        Ok(match config.max_concurrent_fetches {
            Some(limit) => fetcher.with_concurrency_limit(limit),
            None => fetcher,
        })
    }

    pub fn with_transport(
        transport: Arc<dyn CrimeTransport>,
        limiter: Arc<RateLimiter>,
        backoff: BackoffPolicy,
        period: ReportingPeriod,
    ) -> Self {
        Self {
            transport,
            limiter,
            concurrency: None,
            backoff,
            period,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    pub fn period(&self) -> ReportingPeriod {
        self.period
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetch an area's crimes, degrading every failure to an empty list.
    /// Elements come back as served; the transformer decodes them one by one.
    pub async fn fetch(&self, area: &AreaRecord) -> Vec<Value> {
        let span = info_span!("crime_fetch", area = %area.name);
        async {
            match self.try_fetch(area).await {
                Ok(records) => {
                    debug!(records = records.len(), "fetched crimes");
                    records
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    warn!(attempts, error = %last, "giving up on area");
                    Vec::new()
                }
                Err(RetryError::Fatal(err)) => {
                    error!(error = %err, "fetch failed; skipping area");
                    Vec::new()
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Same retry loop as [`CrimeFetcher::fetch`], but surfaces the final error.
    pub async fn try_fetch(
        &self,
        area: &AreaRecord,
    ) -> Result<Vec<Value>, RetryError<FetchError>> {
        let _permit = match &self.concurrency {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        let query = CrimeQuery {
            period: self.period,
            latitude: area.latitude,
            longitude: area.longitude,
        };

        self.backoff
            .run(
                "crime_fetch",
                |_attempt| self.attempt(&query),
                FetchError::is_retryable,
            )
            .await
    }

    async fn attempt(&self, query: &CrimeQuery) -> Result<Vec<Value>, FetchError> {
        self.limiter.wait().await;
        let response = self.transport.get_crimes(query).await?;
        match response.status {
            200 => serde_json::from_slice(&response.body).map_err(|err| {
                FetchError::MalformedBody(format!("{err}: {}", body_preview(&response.body)))
            }),
            429 => Err(FetchError::RateLimited),
            status => Err(FetchError::HttpStatus {
                status,
                body: body_preview(&response.body),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use futures::future::join_all;

    use super::*;

    type Scripted = Result<TransportResponse, TransportError>;

    #[derive(Default)]
    struct ScriptedTransport {
        replies: StdMutex<VecDeque<Scripted>>,
        calls: StdMutex<Vec<(Instant, CrimeQuery)>>,
        latency: Duration,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Scripted>) -> Arc<Self> {
            Self::slow(replies, Duration::ZERO)
        }

        fn slow(replies: Vec<Scripted>, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies.into()),
                latency,
                ..Default::default()
            })
        }

        fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
        }
    }

    #[async_trait]
    impl CrimeTransport for ScriptedTransport {
        async fn get_crimes(&self, query: &CrimeQuery) -> Result<TransportResponse, TransportError> {
            self.calls.lock().unwrap().push((Instant::now(), *query));
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into())))
        }
    }

    fn reply(status: u16, body: &str) -> Scripted {
        Ok(TransportResponse {
            status,
            body: body.as_bytes().to_vec(),
        })
    }

    fn fetcher(transport: Arc<ScriptedTransport>) -> CrimeFetcher {
        CrimeFetcher::with_transport(
            transport,
            Arc::new(RateLimiter::new(1000.0)),
            BackoffPolicy::new(5, Duration::from_secs(1)),
            "2024-06".parse().unwrap(),
        )
    }

    fn camden() -> AreaRecord {
        AreaRecord::new("Camden", 51.529, -0.1255)
    }

    const TWO_CRIMES: &str = r#"[
        {"category":"burglary","location":{"latitude":"51.52","longitude":"-0.12","street":{"id":1,"name":"On or near X"}},
         "location_type":"Force","location_subtype":"","context":"","outcome_status":null,
         "persistent_id":"abc","id":101,"month":"2024-06"},
        {"category":"drugs","location":{"latitude":"51.53","longitude":"-0.13"},
         "location_type":"Force","location_subtype":"","context":"","outcome_status":{"category":"Local resolution","date":"2024-06"},
         "persistent_id":"def","id":102,"month":"2024-06"}
    ]"#;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_sequential_calls() {
        let limiter = RateLimiter::new(4.0);
        let mut completions = Vec::new();
        for _ in 0..5 {
            limiter.wait().await;
            completions.push(Instant::now());
        }
        for pair in completions.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_serializes_concurrent_waiters() {
        let limiter = RateLimiter::new(10.0);
        let mut completions = join_all((0..6).map(|_| async {
            limiter.wait().await;
            Instant::now()
        }))
        .await;
        completions.sort();
        for pair in completions.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_does_not_delay_after_idle_gap() {
        let limiter = RateLimiter::new(1.0);
        limiter.wait().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(Instant::now() - before, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn ok_response_returns_parsed_records() {
        let transport = ScriptedTransport::new(vec![reply(200, TWO_CRIMES)]);
        let records = fetcher(transport.clone()).fetch(&camden()).await;

        let expected: Vec<Value> = serde_json::from_str(TWO_CRIMES).unwrap();
        assert_eq!(records, expected);

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.latitude, 51.529);
        assert_eq!(calls[0].1.period.to_string(), "2024-06");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limiting_gives_up_after_five_attempts() {
        let transport = ScriptedTransport::new((0..10).map(|_| reply(429, "")).collect());
        let result = fetcher(transport.clone()).try_fetch(&camden()).await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                attempts: 5,
                last: FetchError::RateLimited
            })
        ));

        let times = transport.call_times();
        assert_eq!(times.len(), 5);
        for (k, pair) in times.windows(2).enumerate() {
            let expected = Duration::from_secs(1 << k);
            let gap = pair[1] - pair[0];
            assert!(gap >= expected, "gap {k} was {gap:?}");
            assert!(gap < expected + Duration::from_millis(50), "gap {k} was {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![reply(500, "Internal Error"), reply(200, "[]")]);
        let fetcher = fetcher(transport.clone());

        let err = fetcher.try_fetch(&camden()).await.unwrap_err();
        match err {
            RetryError::Fatal(FetchError::HttpStatus { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "Internal Error");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_degrades_server_error_to_empty() {
        let transport = ScriptedTransport::new(vec![reply(500, "Internal Error")]);
        let started = Instant::now();
        assert!(fetcher(transport).fetch(&camden()).await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_and_corrupt_payload_are_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout("deadline elapsed".into())),
            Err(TransportError::Payload("connection reset mid-body".into())),
            Err(TransportError::Payload("gzip stream truncated".into())),
            reply(200, TWO_CRIMES),
        ]);
        let records = fetcher(transport.clone()).fetch(&camden()).await;
        assert_eq!(records.len(), 2);
        assert_eq!(transport.call_times().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_json_ok_body_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            reply(200, "<html>maintenance</html>"),
            reply(200, TWO_CRIMES),
        ]);
        let fetcher = fetcher(transport.clone());
        let started = Instant::now();

        let err = fetcher.try_fetch(&camden()).await.unwrap_err();
        assert!(matches!(err, RetryError::Fatal(FetchError::MalformedBody(_))), "{err:?}");
        assert_eq!(transport.call_times().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn one_bad_record_does_not_discard_its_neighbours() {
        let body = r#"[
            {"category":"burglary","location":{"latitude":"51.52","longitude":"-0.12"},"id":1,"month":"2024-06"},
            {"category":null,"location":{"latitude":"51.52","longitude":"-0.12"},"id":2}
        ]"#;
        let transport = ScriptedTransport::new(vec![reply(200, body)]);
        let started = Instant::now();

        let records = fetcher(transport.clone()).fetch(&camden()).await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], 1);
        assert_eq!(records[1]["id"], 2);
        assert_eq!(transport.call_times().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn other_transport_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Other("dns failure".into())),
            reply(200, TWO_CRIMES),
        ]);
        assert!(fetcher(transport.clone()).fetch(&camden()).await.is_empty());
        assert_eq!(transport.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_is_honoured() {
        let replies = || vec![reply(200, "[]"), reply(200, "[]"), reply(200, "[]")];
        let areas = [camden(), camden(), camden()];

        let unbounded = ScriptedTransport::slow(replies(), Duration::from_millis(100));
        let fetcher_unbounded = fetcher(unbounded.clone());
        join_all(areas.iter().map(|area| fetcher_unbounded.fetch(area))).await;
        assert!(unbounded.peak_in_flight() > 1);

        let bounded = ScriptedTransport::slow(replies(), Duration::from_millis(100));
        let fetcher_bounded = fetcher(bounded.clone()).with_concurrency_limit(1);
        let started = Instant::now();
        let results = join_all(areas.iter().map(|area| fetcher_bounded.fetch(area))).await;

        assert!(results.iter().all(Vec::is_empty));
        assert_eq!(bounded.call_times().len(), 3);
        assert_eq!(bounded.peak_in_flight(), 1);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn endpoint_and_preview_helpers() {
        assert_eq!(
            crimes_endpoint("https://data.police.uk/api/"),
            "https://data.police.uk/api/crimes-street/all-crime"
        );
        let long = "x".repeat(BODY_PREVIEW_LEN + 20);
        let preview = body_preview(long.as_bytes());
        assert_eq!(preview.len(), BODY_PREVIEW_LEN + 3);
        assert!(preview.ends_with("..."));
    }
}
