//! Scrape-and-persist orchestration: job tracking, link discovery, bounded
//! page extraction, batched upserts and the spreadsheet backup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use imob_adapters::{
    extract_property, BrowserConfig, ChromeCatalogCrawler, ChromePageFetcher, FetchError,
    LinkCrawler, PageFetcher, DEFAULT_USER_AGENT,
};
use imob_core::{canonical_link_set, new_links, JobStatus, ParsedProperty, ScrapeJob};
use imob_storage::{InMemoryStore, PgStore, PropertyStore, RestStore, RestStoreConfig};
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_CATALOG_URL: &str = "https://www.vivareal.com.br/venda/sp/santos/bairros/santa-maria/apartamento_residencial/?transacao=venda&onde=%2CS%C3%A3o+Paulo%2CSantos%2C%2CSanta+Maria%2C%2C%2Cneighborhood%2CBR%3ESao+Paulo%3ENULL%3ESantos%3EBarrios%3ESanta+Maria%2C-23.940526%2C-46.370098%2C%3B%2CS%C3%A3o+Paulo%2CSantos%2C%2CAreia+Branca%2C%2C%2Cneighborhood%2CBR%3ESao+Paulo%3ENULL%3ESantos%3EBarrios%3EAreia+Branca%2C-23.946714%2C-46.373514%2C&tipos=apartamento_residencial&areaMaxima=132&areaMinima=33";

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 90;

/// Spreadsheet header, in column order.
pub const EXPORT_COLUMNS: [&str; 17] = [
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
    "link",
];

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub catalog_url: String,
    pub database_url: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    /// Keep everything in process memory instead of a remote store.
    pub dry_run: bool,
    pub concurrency: usize,
    pub batch_size: usize,
    pub task_timeout: Duration,
    /// Directory for `resultados_<job_id>.xlsx`; `None` disables the export.
    pub export_dir: Option<PathBuf>,
    pub browser: BrowserConfig,
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let positive = |key: &str, default: usize| {
            var(key)
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        let browser = BrowserConfig {
            headless: env_flag(var("IMOB_HEADLESS"), true),
            chrome_executable: var("CHROME_PATH").map(PathBuf::from),
            user_agent: var("IMOB_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            ..BrowserConfig::default()
        };

        let export_dir = if env_flag(var("IMOB_EXPORT_XLSX"), true) {
            Some(var("IMOB_EXPORT_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")))
        } else {
            None
        };

        Self {
            catalog_url: var("IMOB_CATALOG_URL").unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
            database_url: var("DATABASE_URL"),
            supabase_url: var("SUPABASE_URL"),
            supabase_key: var("SUPABASE_KEY"),
            dry_run: false,
            concurrency: positive("IMOB_CONCURRENCY", DEFAULT_CONCURRENCY),
            batch_size: positive("IMOB_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            task_timeout: Duration::from_secs(
                positive("IMOB_TASK_TIMEOUT_SECS", DEFAULT_TASK_TIMEOUT_SECS as usize) as u64,
            ),
            export_dir,
            browser,
        }
    }

    pub fn store_target(&self) -> Result<StoreTarget> {
        if self.dry_run {
            return Ok(StoreTarget::Memory);
        }
        if let Some(database_url) = &self.database_url {
            return Ok(StoreTarget::Postgres {
                database_url: database_url.clone(),
            });
        }
        match (&self.supabase_url, &self.supabase_key) {
            (Some(base_url), Some(api_key)) => Ok(StoreTarget::Rest {
                base_url: base_url.clone(),
                api_key: api_key.clone(),
            }),
            (Some(_), None) => bail!("SUPABASE_URL is set but SUPABASE_KEY is missing"),
            (None, Some(_)) => bail!("SUPABASE_KEY is set but SUPABASE_URL is missing"),
            (None, None) => bail!("no store configured: set DATABASE_URL or SUPABASE_URL and SUPABASE_KEY"),
        }
    }
}

fn env_flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref() {
        Some("1" | "true" | "TRUE" | "True" | "yes") => true,
        Some("0" | "false" | "FALSE" | "False" | "no") => false,
        _ => default,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Postgres { database_url: String },
    Rest { base_url: String, api_key: String },
    Memory,
}

pub async fn build_store(config: &ScrapeConfig) -> Result<Arc<dyn PropertyStore>> {
    let store: Arc<dyn PropertyStore> = match config.store_target()? {
        StoreTarget::Postgres { database_url } => Arc::new(
            PgStore::connect(&database_url)
                .await
                .context("connecting to Postgres")?,
        ),
        StoreTarget::Rest { base_url, api_key } => Arc::new(
            RestStore::new(RestStoreConfig::new(base_url, api_key))
                .context("building REST store client")?,
        ),
        StoreTarget::Memory => Arc::new(InMemoryStore::new()),
    };
    info!(backend = store.backend(), "store ready");
    Ok(store)
}

/// Why one listing produced no record.
#[derive(Debug, Error)]
pub enum ExtractionFailure {
    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("extraction of {url} exceeded {after:?}")]
    TimedOut { url: String, after: Duration },
    #[error("parsing {url} aborted: {reason}")]
    Parse { url: String, reason: String },
    #[error("extraction task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    /// Successful records in completion order.
    pub records: Vec<ParsedProperty>,
    pub failures: Vec<ExtractionFailure>,
}

/// Runs fetch-then-parse for many listings, at most `concurrency` at a time.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionPool {
    concurrency: usize,
    task_timeout: Duration,
}

impl ExtractionPool {
    pub fn new(concurrency: usize, task_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            task_timeout,
        }
    }

    pub async fn run(
        &self,
        fetcher: Arc<dyn PageFetcher>,
        urls: Vec<String>,
        job_id: Uuid,
    ) -> ExtractionOutcome {
        let total = urls.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for url in urls {
            let fetcher = Arc::clone(&fetcher);
            let semaphore = Arc::clone(&semaphore);
            let task_timeout = self.task_timeout;
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(ExtractionFailure::Aborted(format!("worker pool closed before {url}")));
                };
                match tokio::time::timeout(task_timeout, extract_one(fetcher.as_ref(), &url, job_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExtractionFailure::TimedOut {
                        url,
                        after: task_timeout,
                    }),
                }
            });
        }

        let mut outcome = ExtractionOutcome::default();
        let mut done = 0usize;
        while let Some(joined) = tasks.join_next().await {
            done += 1;
            match joined {
                Ok(Ok(record)) => {
                    info!(done, total, link = %record.link, "listing extracted");
                    outcome.records.push(record);
                }
                Ok(Err(failure)) => {
                    warn!(done, total, "{failure}");
                    outcome.failures.push(failure);
                }
                Err(e) => {
                    error!(done, total, "extraction task failed: {e}");
                    outcome.failures.push(ExtractionFailure::Aborted(e.to_string()));
                }
            }
        }
        outcome
    }
}

async fn extract_one(
    fetcher: &dyn PageFetcher,
    url: &str,
    job_id: Uuid,
) -> Result<ParsedProperty, ExtractionFailure> {
    let page = fetcher
        .fetch(url)
        .await
        .map_err(|source| ExtractionFailure::Fetch {
            url: url.to_string(),
            source,
        })?;
    let link = url.to_string();
    tokio::task::spawn_blocking(move || extract_property(&page, &link, job_id))
        .await
        .map_err(|e| ExtractionFailure::Parse {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

/// Owns the job row for one run and mirrors every transition to the store.
pub struct JobTracker {
    store: Arc<dyn PropertyStore>,
    job: ScrapeJob,
}

impl JobTracker {
    pub async fn start(store: Arc<dyn PropertyStore>) -> Result<Self> {
        let job = ScrapeJob::start(Utc::now());
        store
            .create_job(&job)
            .await
            .with_context(|| format!("creating scrape job {}", job.id))?;
        info!(job_id = %job.id, backend = store.backend(), "scrape job started");
        Ok(Self { store, job })
    }

    pub fn job(&self) -> &ScrapeJob {
        &self.job
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub async fn record_discovery(&mut self, links_found: u64, new_links_to_process: u64) -> Result<()> {
        let update = self.job.record_discovery(links_found, new_links_to_process)?;
        self.store
            .update_job(self.job.id, &update)
            .await
            .context("recording discovery counters")
    }

    pub async fn record_progress(&mut self, properties_scraped: u64) -> Result<()> {
        let update = self.job.record_scraped(properties_scraped)?;
        self.store
            .update_job(self.job.id, &update)
            .await
            .context("recording scrape progress")
    }

    pub async fn complete(&mut self, properties_scraped: u64) -> Result<()> {
        let update = self.job.complete(properties_scraped, Utc::now())?;
        self.store
            .update_job(self.job.id, &update)
            .await
            .context("marking job completed")?;
        info!(job_id = %self.job.id, properties_scraped, "scrape job completed");
        Ok(())
    }

    pub async fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        let update = self.job.fail(message, Utc::now())?;
        self.store
            .update_job(self.job.id, &update)
            .await
            .context("marking job failed")?;
        warn!(job_id = %self.job.id, "scrape job failed");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub size: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub persisted: u64,
    pub failed: Vec<BatchFailure>,
}

/// Writes records in fixed-size upsert batches.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceBatcher {
    batch_size: usize,
}

impl Default for PersistenceBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl PersistenceBatcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Every batch is attempted; a failed batch is recorded and skipped.
    pub async fn flush(
        &self,
        store: &dyn PropertyStore,
        tracker: &mut JobTracker,
        records: &[ParsedProperty],
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let batches = records.len().div_ceil(self.batch_size);

        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            match store.upsert_properties(batch).await {
                Ok(()) => {
                    report.persisted += batch.len() as u64;
                    info!(
                        batch = batch_index + 1,
                        batches,
                        persisted = report.persisted,
                        "batch upserted"
                    );
                    if let Err(e) = tracker.record_progress(report.persisted).await {
                        warn!("progress update after batch {} failed: {e:#}", batch_index + 1);
                    }
                }
                Err(e) => {
                    error!(batch = batch_index + 1, batches, size = batch.len(), "batch upsert failed: {e}");
                    report.failed.push(BatchFailure {
                        batch_index,
                        size: batch.len(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

pub fn export_file_name(job_id: Uuid) -> String {
    format!("resultados_{job_id}.xlsx")
}

fn header_format() -> Format {
    Format::new()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(0x1F4E78))
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter)
}

/// Write records to an `.xlsx` sheet with the fixed column order.
pub fn export_xlsx(records: &[ParsedProperty], path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let header = header_format();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Imoveis").context("naming worksheet")?;

    for (col, name) in EXPORT_COLUMNS.iter().enumerate() {
        worksheet
            .write_string_with_format(0, col as u16, *name, &header)
            .with_context(|| format!("writing header {name}"))?;
    }

    for (i, record) in records.iter().enumerate() {
        let row = (i + 1) as u32;
        let text = |value: &Option<String>| value.as_deref().unwrap_or("0").to_string();
        worksheet
            .write_string(row, 0, &record.property_type)
            .and_then(|ws| ws.write_number(row, 1, record.price))
            .and_then(|ws| ws.write_number(row, 2, record.private_area))
            .and_then(|ws| ws.write_number(row, 3, record.bedrooms))
            .and_then(|ws| ws.write_number(row, 4, record.bathrooms))
            .and_then(|ws| ws.write_number(row, 5, record.parking_spaces))
            .and_then(|ws| ws.write_number(row, 6, record.suites))
            .and_then(|ws| ws.write_number(row, 7, record.floor))
            .and_then(|ws| ws.write_boolean(row, 8, record.pool))
            .and_then(|ws| ws.write_boolean(row, 9, record.balcony))
            .and_then(|ws| ws.write_boolean(row, 10, record.elevator))
            .and_then(|ws| ws.write_string(row, 11, text(&record.address.street)))
            .and_then(|ws| ws.write_string(row, 12, text(&record.address.neighborhood)))
            .and_then(|ws| ws.write_string(row, 13, text(&record.address.city)))
            .and_then(|ws| ws.write_string(row, 14, text(&record.address.state)))
            .and_then(|ws| ws.write_string(row, 15, text(&record.full_address)))
            .and_then(|ws| ws.write_string(row, 16, &record.link))
            .with_context(|| format!("writing row for {}", record.link))?;
    }

    worksheet.set_freeze_panes(1, 0).context("freezing header row")?;
    worksheet.autofit();

    workbook
        .save(path)
        .with_context(|| format!("saving {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub catalog_pages: usize,
    pub links_found: usize,
    pub canonical_links: usize,
    pub new_links: usize,
    pub extracted: usize,
    pub extraction_failures: usize,
    pub persisted: u64,
    pub failed_batches: usize,
    pub spreadsheet: Option<String>,
}

pub struct ScrapePipeline {
    config: ScrapeConfig,
    store: Arc<dyn PropertyStore>,
    crawler: Arc<dyn LinkCrawler>,
    fetcher: Arc<dyn PageFetcher>,
}

impl ScrapePipeline {
    pub fn new(config: ScrapeConfig, store: Arc<dyn PropertyStore>) -> Self {
        let crawler = Arc::new(ChromeCatalogCrawler::new(
            config.catalog_url.clone(),
            config.browser.clone(),
        ));
        let fetcher = Arc::new(ChromePageFetcher::new(config.browser.clone()));
        Self {
            config,
            store,
            crawler,
            fetcher,
        }
    }

    /// Swap the browser-backed crawler and fetcher.
    pub fn with_browser(mut self, crawler: Arc<dyn LinkCrawler>, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.crawler = crawler;
        self.fetcher = fetcher;
        self
    }

    pub async fn run_once(&self) -> Result<ScrapeRunSummary> {
        let mut tracker = JobTracker::start(Arc::clone(&self.store)).await?;
        let span = info_span!("scrape_run", job_id = %tracker.job_id());
        self.run_job(&mut tracker).instrument(span).await
    }

    async fn run_job(&self, tracker: &mut JobTracker) -> Result<ScrapeRunSummary> {
        let job_id = tracker.job_id();
        let started_at = tracker.job().started_at;

        let discovery = match self.discover().await {
            Ok(discovery) => discovery,
            Err(e) => {
                let message = format!("{e:#}");
                error!("link discovery failed: {message}");
                if let Err(mark) = tracker.fail(message.clone()).await {
                    error!("could not mark job {job_id} failed: {mark:#}");
                }
                return Err(e.context(format!("scrape job {job_id} failed during discovery")));
            }
        };

        let links_found = discovery.raw_links;
        let todo = discovery.new_links;
        info!(
            pages = discovery.pages,
            links_found,
            canonical = discovery.canonical_links,
            new = todo.len(),
            "discovery finished"
        );
        if let Err(e) = tracker.record_discovery(links_found as u64, todo.len() as u64).await {
            warn!("{e:#}");
        }

        let pool = ExtractionPool::new(self.config.concurrency, self.config.task_timeout);
        let new_links = todo.len();
        let outcome = if todo.is_empty() {
            info!("no new listings to process");
            ExtractionOutcome::default()
        } else {
            pool.run(Arc::clone(&self.fetcher), todo, job_id).await
        };
        info!(
            extracted = outcome.records.len(),
            failed = outcome.failures.len(),
            "extraction finished"
        );

        let batcher = PersistenceBatcher::new(self.config.batch_size);
        let batches = batcher
            .flush(self.store.as_ref(), tracker, &outcome.records)
            .await;

        let spreadsheet = self.export(job_id, &outcome.records);

        tracker.complete(batches.persisted).await?;
        let finished_at = tracker.job().completed_at.unwrap_or_else(Utc::now);

        info!(
            new_records = batches.persisted,
            failed_batches = batches.failed.len(),
            "scrape run finished"
        );

        Ok(ScrapeRunSummary {
            job_id,
            status: tracker.job().status,
            started_at,
            finished_at,
            catalog_pages: discovery.pages,
            links_found,
            canonical_links: discovery.canonical_links,
            new_links,
            extracted: outcome.records.len(),
            extraction_failures: outcome.failures.len(),
            persisted: batches.persisted,
            failed_batches: batches.failed.len(),
            spreadsheet,
        })
    }

    async fn discover(&self) -> Result<Discovery> {
        let report = self
            .crawler
            .discover()
            .await
            .context("crawling catalog")?;
        let found = canonical_link_set(report.raw_links.iter());
        let existing = self
            .store
            .existing_links()
            .await
            .context("loading persisted links")?;
        Ok(Discovery {
            pages: report.pages,
            raw_links: report.raw_links.len(),
            canonical_links: found.len(),
            new_links: new_links(&found, &existing),
        })
    }

    fn export(&self, job_id: Uuid, records: &[ParsedProperty]) -> Option<String> {
        let dir = self.config.export_dir.as_ref()?;
        if records.is_empty() {
            return None;
        }
        let path = dir.join(export_file_name(job_id));
        match export_xlsx(records, &path) {
            Ok(()) => {
                info!(path = %path.display(), rows = records.len(), "spreadsheet written");
                Some(path.display().to_string())
            }
            Err(e) => {
                warn!("spreadsheet export failed: {e:#}");
                None
            }
        }
    }
}

struct Discovery {
    pages: usize,
    raw_links: usize,
    canonical_links: usize,
    new_links: Vec<String>,
}

/// Crawl the catalog without touching any store.
pub async fn discover_canonical_links(crawler: &dyn LinkCrawler) -> Result<BTreeSet<String>> {
    let report = crawler.discover().await.context("crawling catalog")?;
    info!(
        pages = report.pages,
        raw = report.raw_links.len(),
        stop = ?report.stop,
        "catalog crawled"
    );
    Ok(canonical_link_set(report.raw_links.iter()))
}

pub async fn run_scrape_once(config: ScrapeConfig) -> Result<ScrapeRunSummary> {
    let store = build_store(&config).await?;
    ScrapePipeline::new(config, store).run_once().await
}

pub async fn run_crawl(config: &ScrapeConfig) -> Result<BTreeSet<String>> {
    let crawler = ChromeCatalogCrawler::new(config.catalog_url.clone(), config.browser.clone());
    discover_canonical_links(&crawler).await
}

pub async fn run_migrations(config: &ScrapeConfig) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("DATABASE_URL is required for migrations"))?;
    let store = PgStore::connect(database_url)
        .await
        .context("connecting to Postgres")?;
    store.migrate().await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}
