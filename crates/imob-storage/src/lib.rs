//! Persistence backends for scrape jobs and listing records.
//!
//! Every backend implements [`PropertyStore`]: job rows are inserted once and
//! then patched field by field, listing rows are upserted keyed on `link`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use imob_core::{JobUpdate, ParsedProperty, ScrapeJob};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// `properties` columns in insert order; `link` is the conflict key.
pub const PROPERTY_COLUMNS: [&str; 18] = [
    "link",
    "job_id",
    "tipo",
    "valor",
    "area_privativa",
    "dormitorio",
    "banheiro",
    "vaga",
    "suite",
    "andar",
    "piscina",
    "varanda",
    "elevador",
    "rua",
    "bairro",
    "cidade",
    "uf",
    "endereco_completo",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("listing {link} references unknown job {job_id}")]
    OrphanListing { link: String, job_id: Uuid },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait PropertyStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn create_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;

    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<(), StoreError>;

    /// Every `link` currently persisted in `properties`.
    async fn existing_links(&self) -> Result<HashSet<String>, StoreError>;

    /// Insert-or-overwrite keyed on `link`.
    async fn upsert_properties(&self, batch: &[ParsedProperty]) -> Result<(), StoreError>;
}

/// Collapse repeated links inside one batch, keeping the last occurrence.
///
/// Postgres rejects an `ON CONFLICT DO UPDATE` that touches the same row twice
/// in a single statement.
pub fn last_write_per_link(batch: &[ParsedProperty]) -> Vec<&ParsedProperty> {
    let mut last_index: HashMap<&str, usize> = HashMap::new();
    for (idx, property) in batch.iter().enumerate() {
        last_index.insert(property.link.as_str(), idx);
    }
    batch
        .iter()
        .enumerate()
        .filter(|(idx, property)| last_index.get(property.link.as_str()) == Some(idx))
        .map(|(_, property)| property)
        .collect()
}

fn to_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn create_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scraping_jobs \
             (id, status, started_at, completed_at, links_found, new_links_to_process, properties_scraped, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_db_count(job.links_found))
        .bind(to_db_count(job.new_links_to_process))
        .bind(to_db_count(job.properties_scraped))
        .bind(job.error_message.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE scraping_jobs SET \
             status = COALESCE($2, status), \
             completed_at = COALESCE($3, completed_at), \
             links_found = COALESCE($4, links_found), \
             new_links_to_process = COALESCE($5, new_links_to_process), \
             properties_scraped = COALESCE($6, properties_scraped), \
             error_message = COALESCE($7, error_message) \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.completed_at)
        .bind(update.links_found.map(to_db_count))
        .bind(update.new_links_to_process.map(to_db_count))
        .bind(update.properties_scraped.map(to_db_count))
        .bind(update.error_message.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn existing_links(&self) -> Result<HashSet<String>, StoreError> {
        let links = sqlx::query_scalar::<_, String>("SELECT link FROM properties")
            .fetch_all(&self.pool)
            .await?;
        Ok(links.into_iter().collect())
    }

    async fn upsert_properties(&self, batch: &[ParsedProperty]) -> Result<(), StoreError> {
        let rows = last_write_per_link(batch);
        if rows.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO properties ({}) ",
            PROPERTY_COLUMNS.join(", ")
        ));
        qb.push_values(rows, |mut b, p| {
            b.push_bind(p.link.clone())
                .push_bind(p.job_id)
                .push_bind(p.property_type.clone())
                .push_bind(p.price)
                .push_bind(p.private_area)
                .push_bind(p.bedrooms)
                .push_bind(p.bathrooms)
                .push_bind(p.parking_spaces)
                .push_bind(p.suites)
                .push_bind(p.floor)
                .push_bind(p.pool)
                .push_bind(p.balcony)
                .push_bind(p.elevator)
                .push_bind(p.address.street.clone())
                .push_bind(p.address.neighborhood.clone())
                .push_bind(p.address.city.clone())
                .push_bind(p.address.state.clone())
                .push_bind(p.full_address.clone());
        });
        let assignments = PROPERTY_COLUMNS
            .iter()
            .skip(1)
            .map(|col| format!("{col} = EXCLUDED.{col}"))
            .collect::<Vec<_>>()
            .join(", ");
        qb.push(format!(
            " ON CONFLICT (link) DO UPDATE SET {assignments}, updated_at = NOW()"
        ));

        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Project URL, e.g. `https://<ref>.supabase.co`.
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Rows per request when listing existing links; PostgREST caps responses.
    pub page_size: usize,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            page_size: 1000,
        }
    }
}

/// PostgREST (Supabase) backend speaking the REST dialect over HTTPS.
#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    rest_root: String,
    backoff: BackoffPolicy,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct LinkRow {
    link: String,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| StoreError::Message(format!("invalid api key header: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| StoreError::Message(format!("invalid api key header: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            rest_root: rest_root(&config.base_url),
            backoff: config.backoff,
            page_size: config.page_size.max(1),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_root, table)
    }

    async fn send_with_retry<F>(&self, label: &str, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let span = info_span!("store_request", backend = "postgrest", label);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp);
                        }
                        let url = resp.url().to_string();
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(%status, attempt, "retryable store response");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        let body = resp.text().await.unwrap_or_default();
                        return Err(StoreError::HttpStatus {
                            status: status.as_u16(),
                            url,
                            body,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retryable store request error");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StoreError::Request(err));
                    }
                }
            }

            Err(match last_request_error {
                Some(err) => StoreError::Request(err),
                None => StoreError::Message(format!("{label}: retry loop exhausted")),
            })
        }
        .instrument(span)
        .await
    }
}

fn rest_root(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/rest/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/rest/v1")
    }
}

#[async_trait]
impl PropertyStore for RestStore {
    fn backend(&self) -> &'static str {
        "postgrest"
    }

    async fn create_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        let url = self.table_url("scraping_jobs");
        self.send_with_retry("create_job", || {
            self.client
                .post(&url)
                .header("Prefer", "return=minimal")
                .json(job)
        })
        .await?;
        Ok(())
    }

    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<(), StoreError> {
        let url = self.table_url("scraping_jobs");
        let filter = format!("eq.{job_id}");
        self.send_with_retry("update_job", || {
            self.client
                .patch(&url)
                .query(&[("id", filter.as_str())])
                .header("Prefer", "return=minimal")
                .json(update)
        })
        .await?;
        Ok(())
    }

    async fn existing_links(&self) -> Result<HashSet<String>, StoreError> {
        let url = self.table_url("properties");
        let limit = self.page_size.to_string();
        let mut links = HashSet::new();
        let mut offset = 0usize;

        loop {
            let offset_param = offset.to_string();
            let resp = self
                .send_with_retry("existing_links", || {
                    self.client.get(&url).query(&[
                        ("select", "link"),
                        ("order", "link"),
                        ("limit", limit.as_str()),
                        ("offset", offset_param.as_str()),
                    ])
                })
                .await?;
            let page: Vec<LinkRow> = resp.json().await?;
            let fetched = page.len();
            links.extend(page.into_iter().map(|row| row.link));
            debug!(offset, fetched, "fetched existing link page");

            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }

        Ok(links)
    }

    async fn upsert_properties(&self, batch: &[ParsedProperty]) -> Result<(), StoreError> {
        let rows = last_write_per_link(batch);
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.table_url("properties");
        self.send_with_retry("upsert_properties", || {
            self.client
                .post(&url)
                .query(&[("on_conflict", "link")])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&rows)
        })
        .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, ScrapeJob>,
    properties: BTreeMap<String, ParsedProperty>,
}

/// Process-local store used for dry runs and as a test double.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a listing without the owning-job check, as if left by an earlier run.
    pub async fn seed_property(&self, property: ParsedProperty) {
        let mut state = self.state.lock().await;
        state.properties.insert(property.link.clone(), property);
    }

    pub async fn job(&self, job_id: Uuid) -> Option<ScrapeJob> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    pub async fn jobs(&self) -> Vec<ScrapeJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn properties(&self) -> Vec<ParsedProperty> {
        self.state.lock().await.properties.values().cloned().collect()
    }

    pub async fn property(&self, link: &str) -> Option<ParsedProperty> {
        self.state.lock().await.properties.get(link).cloned()
    }
}

#[async_trait]
impl PropertyStore for InMemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Message(format!("job {} already exists", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.apply(update);
        Ok(())
    }

    async fn existing_links(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.state.lock().await.properties.keys().cloned().collect())
    }

    async fn upsert_properties(&self, batch: &[ParsedProperty]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(orphan) = batch.iter().find(|p| !state.jobs.contains_key(&p.job_id)) {
            return Err(StoreError::OrphanListing {
                link: orphan.link.clone(),
                job_id: orphan.job_id,
            });
        }
        for property in batch {
            state.properties.insert(property.link.clone(), property.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use imob_core::{Address, JobStatus, RawListing};

    fn listing(link: &str, job_id: Uuid, price: &str) -> ParsedProperty {
        let raw = RawListing {
            price: Some(price.to_string()),
            ..RawListing::default()
        };
        ParsedProperty::from_raw(&raw, Address::unknown(), "apartamento", link, job_id)
    }

    fn started_job() -> ScrapeJob {
        ScrapeJob::start(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap())
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_retries_server_errors_and_throttling() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::CONFLICT), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn rest_root_accepts_project_or_rest_url() {
        assert_eq!(rest_root("https://abc.supabase.co"), "https://abc.supabase.co/rest/v1");
        assert_eq!(rest_root("https://abc.supabase.co/"), "https://abc.supabase.co/rest/v1");
        assert_eq!(rest_root("https://abc.supabase.co/rest/v1/"), "https://abc.supabase.co/rest/v1");
    }

    #[test]
    fn batch_collapse_keeps_last_write() {
        let job_id = Uuid::new_v4();
        let batch = vec![
            listing("https://h/a", job_id, "100"),
            listing("https://h/b", job_id, "200"),
            listing("https://h/a", job_id, "300"),
        ];
        let rows = last_write_per_link(&batch);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].link, "https://h/b");
        assert_eq!(rows[1].link, "https://h/a");
        assert_eq!(rows[1].price, 300.0);
    }

    #[tokio::test]
    async fn upserting_same_link_twice_keeps_one_row_with_latest_values() {
        let store = InMemoryStore::new();
        let job = started_job();
        store.create_job(&job).await.unwrap();

        store
            .upsert_properties(&[listing("https://h/imovel/a", job.id, "100.000")])
            .await
            .unwrap();
        store
            .upsert_properties(&[listing("https://h/imovel/a", job.id, "120.000")])
            .await
            .unwrap();

        let rows = store.properties().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, 120000.0);
        assert_eq!(
            store.existing_links().await.unwrap(),
            HashSet::from(["https://h/imovel/a".to_string()])
        );
    }

    #[tokio::test]
    async fn listings_require_an_existing_job() {
        let store = InMemoryStore::new();
        let err = store
            .upsert_properties(&[listing("https://h/a", Uuid::new_v4(), "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OrphanListing { .. }));
        assert!(store.properties().await.is_empty());
    }

    #[tokio::test]
    async fn job_updates_are_field_level() {
        let store = InMemoryStore::new();
        let mut job = started_job();
        store.create_job(&job).await.unwrap();

        let update = job.record_discovery(40, 7).unwrap();
        store.update_job(job.id, &update).await.unwrap();
        let update = job.record_scraped(7).unwrap();
        store.update_job(job.id, &update).await.unwrap();

        let stored = store.job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.links_found, 40);
        assert_eq!(stored.new_links_to_process, 7);
        assert_eq!(stored.properties_scraped, 7);

        let missing = store.update_job(Uuid::new_v4(), &update).await.unwrap_err();
        assert!(matches!(missing, StoreError::JobNotFound(_)));
    }
}
