//! Catalog adapters: headless-browser page rendering, paginated link discovery
//! and rule-based field extraction for listing pages.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use imob_core::{Address, ParsedProperty, RawListing, TYPE_NOT_INFORMED};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const LISTING_ANCHOR_SELECTOR: &str = "a[href*='/imovel/']";
pub const NEXT_PAGE_SELECTOR: &str = "a[aria-label='próxima página']";

/// Structural locations of the listing address, highest priority first.
pub const ADDRESS_SELECTORS: [&str; 3] = [
    r#"p[data-testid="location-address"]"#,
    r#"div[data-testid="location-address"]"#,
    r#"span[itemprop="streetAddress"]"#,
];

/// Listing-type slugs after `/imovel/`, checked in order. Longer slugs that
/// share a prefix with a shorter one (`casa-de-condominio` vs `casa`) come first.
pub const PROPERTY_TYPE_PREFIXES: [&str; 16] = [
    "consultorio",
    "galpao-deposito-armazem",
    "imovel-comercial",
    "ponto-comercial",
    "sala-comercial",
    "predio-comercial",
    "edificio-residencial",
    "casa-de-condominio",
    "fazenda---sitio",
    "lote-terreno",
    "apartamento",
    "cobertura",
    "sobrado",
    "kitnet",
    "flat",
    "casa",
];

const LISTING_PATH_MARKER: &str = "/imovel/";
const SKIPPED_TEXT_PARENTS: [&str; 3] = ["script", "style", "noscript"];

const SCROLL_TO_BOTTOM_JS: &str = "window.scrollTo(0, document.body.scrollHeight); true";

static LISTING_HREFS_JS: Lazy<String> = Lazy::new(|| {
    format!(
        r#"Array.from(document.querySelectorAll("{}"))
    .map((a) => a.href)
    .filter((href) => typeof href === "string" && href.length > 0)"#,
        LISTING_ANCHOR_SELECTOR
    )
});

static NEXT_PAGE_JS: Lazy<String> = Lazy::new(|| {
    format!(
        r#"(() => {{
    const next = document.querySelector("{}");
    if (!next) {{ return "missing"; }}
    if (next.getAttribute("aria-disabled") === "true") {{ return "disabled"; }}
    next.click();
    return "clicked";
}})()"#,
        NEXT_PAGE_SELECTOR
    )
});

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {source}")]
    Navigation {
        url: String,
        #[source]
        source: CdpError,
    },
    #[error("browser protocol error: {0}")]
    Cdp(#[from] CdpError),
    #[error("unexpected script result: {0}")]
    Script(String),
}

/// Randomized pause between browser actions, drawn uniformly from `min..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelay {
    pub min: Duration,
    pub max: Duration,
}

impl SettleDelay {
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
        }
    }

    pub const fn between(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn sample(&self) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if hi <= lo {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }

    pub async fn wait(&self) {
        tokio::time::sleep(self.sample()).await;
    }
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub user_agent: String,
    pub window_size: (u32, u32),
    pub request_timeout: Duration,
    /// After the catalog entry page first loads.
    pub catalog_load: SettleDelay,
    /// After scrolling a catalog page to the bottom.
    pub catalog_scroll: SettleDelay,
    /// After activating the next-page control.
    pub page_turn: SettleDelay,
    /// After navigating to a listing detail page.
    pub detail_load: SettleDelay,
    /// After scrolling a listing detail page to the bottom.
    pub detail_scroll: SettleDelay,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_executable: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window_size: (1920, 1080),
            request_timeout: Duration::from_secs(30),
            catalog_load: SettleDelay::between(Duration::from_secs(3), Duration::from_secs(4)),
            catalog_scroll: SettleDelay::between(
                Duration::from_millis(1500),
                Duration::from_millis(2500),
            ),
            page_turn: SettleDelay::between(Duration::from_secs(3), Duration::from_secs(5)),
            detail_load: SettleDelay::fixed(Duration::from_secs(2)),
            detail_scroll: SettleDelay::fixed(Duration::from_secs(1)),
        }
    }
}

/// One exclusively owned browser process.
///
/// Call [`BrowserSession::close`] on the normal path. If the session is dropped
/// instead (error unwinding, a cancelled future after a timeout), the browser
/// child is killed by `chromiumoxide` and the handler task is aborted here.
pub struct BrowserSession {
    browser: Option<Browser>,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
}

impl BrowserSession {
    pub async fn launch(config: &BrowserConfig) -> Result<Self, FetchError> {
        let user_data_dir = std::env::temp_dir().join(format!("imob-chrome-{}", Uuid::new_v4()));

        let mut builder = CdpBrowserConfig::builder()
            .window_size(config.window_size.0, config.window_size.1)
            .request_timeout(config.request_timeout)
            .user_data_dir(user_data_dir.clone())
            .arg(format!("--user-agent={}", config.user_agent))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-notifications")
            .arg("--mute-audio");
        if let Some(path) = &config.chrome_executable {
            builder = builder.chrome_executable(path.clone());
        }
        if !config.headless {
            builder = builder.with_head();
        }
        let cdp_config = builder.build().map_err(FetchError::Launch)?;

        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|e| FetchError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    trace!("browser handler event error: {e}");
                }
            }
        });

        debug!(dir = %user_data_dir.display(), "browser session launched");
        Ok(Self {
            browser: Some(browser),
            handler,
            user_data_dir,
        })
    }

    /// Open a fresh tab and navigate it to `url`.
    pub async fn open(&self, url: &str) -> Result<Page, FetchError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| FetchError::Launch("session already closed".to_string()))?;
        let page = browser.new_page("about:blank").await?;
        page.goto(url).await.map_err(|source| FetchError::Navigation {
            url: url.to_string(),
            source,
        })?;
        Ok(page)
    }

    pub async fn close(mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("failed to close browser: {e}");
            }
            if let Err(e) = browser.wait().await {
                warn!("failed to wait for browser exit: {e}");
            }
        }
        self.handler.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            debug!(dir = %self.user_data_dir.display(), "profile cleanup skipped: {e}");
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
        release_profile(self.browser.take(), &self.user_data_dir);
    }
}

/// Drop the process owning `dir` before deleting it, so nothing recreates files.
fn release_profile<T>(owner: Option<T>, dir: &Path) {
    let Some(owner) = owner else {
        return;
    };
    drop(owner);
    let _ = std::fs::remove_dir_all(dir);
}

async fn scroll_to_bottom(page: &Page) -> Result<(), FetchError> {
    page.evaluate(SCROLL_TO_BOTTOM_JS).await?;
    Ok(())
}

/// Markup of one listing page after client-side rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RenderedPage, FetchError>;
}

/// Renders each listing in its own browser process.
#[derive(Debug, Clone)]
pub struct ChromePageFetcher {
    config: BrowserConfig,
}

impl ChromePageFetcher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    async fn render(&self, session: &BrowserSession, url: &str) -> Result<RenderedPage, FetchError> {
        let page = session.open(url).await?;
        self.config.detail_load.wait().await;
        scroll_to_bottom(&page).await?;
        self.config.detail_scroll.wait().await;
        let html = page.content().await?;
        Ok(RenderedPage {
            url: url.to_string(),
            html,
        })
    }
}

#[async_trait]
impl PageFetcher for ChromePageFetcher {
    async fn fetch(&self, url: &str) -> Result<RenderedPage, FetchError> {
        let span = info_span!("page_fetch", url);
        async {
            let session = BrowserSession::launch(&self.config).await?;
            let rendered = self.render(&session, url).await;
            session.close().await;
            rendered
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPage {
    Advanced,
    Disabled,
    Missing,
}

/// Page-level operations the catalog crawl loop needs from a browser tab.
#[async_trait]
pub trait CatalogDriver: Send {
    async fn load_lazy_content(&mut self) -> Result<(), FetchError>;
    async fn listing_hrefs(&mut self) -> Result<Vec<String>, FetchError>;
    async fn advance(&mut self) -> Result<NextPage, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlStop {
    NextDisabled,
    NextMissing,
    Interrupted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    /// Distinct raw hrefs in first-seen order.
    pub raw_links: Vec<String>,
    pub pages: usize,
    pub stop: CrawlStop,
}

/// Walk the catalog page by page until the next-page control is gone or
/// disabled. A page-level error ends the walk with whatever was collected.
pub async fn collect_catalog_links<D>(driver: &mut D) -> CrawlReport
where
    D: CatalogDriver + ?Sized,
{
    let mut raw_links: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut pages = 0usize;

    let stop = loop {
        pages += 1;

        if let Err(e) = driver.load_lazy_content().await {
            warn!(page = pages, "catalog scroll failed: {e}");
            break CrawlStop::Interrupted(e.to_string());
        }

        let hrefs = match driver.listing_hrefs().await {
            Ok(hrefs) => hrefs,
            Err(e) => {
                warn!(page = pages, "collecting listing anchors failed: {e}");
                break CrawlStop::Interrupted(e.to_string());
            }
        };
        let on_page = hrefs.len();
        let mut new_on_page = 0usize;
        for href in hrefs {
            if seen.insert(href.clone()) {
                raw_links.push(href);
                new_on_page += 1;
            }
        }
        info!(page = pages, on_page, new_on_page, total = raw_links.len(), "catalog page processed");

        match driver.advance().await {
            Ok(NextPage::Advanced) => continue,
            Ok(NextPage::Disabled) => break CrawlStop::NextDisabled,
            Ok(NextPage::Missing) => break CrawlStop::NextMissing,
            Err(e) => {
                warn!(page = pages, "pagination failed: {e}");
                break CrawlStop::Interrupted(e.to_string());
            }
        }
    };

    CrawlReport {
        raw_links,
        pages,
        stop,
    }
}

#[async_trait]
pub trait LinkCrawler: Send + Sync {
    /// Errors only when the catalog itself cannot be reached.
    async fn discover(&self) -> Result<CrawlReport, FetchError>;
}

struct ChromeCatalogPage<'a> {
    page: Page,
    config: &'a BrowserConfig,
}

#[async_trait]
impl CatalogDriver for ChromeCatalogPage<'_> {
    async fn load_lazy_content(&mut self) -> Result<(), FetchError> {
        scroll_to_bottom(&self.page).await?;
        self.config.catalog_scroll.wait().await;
        Ok(())
    }

    async fn listing_hrefs(&mut self) -> Result<Vec<String>, FetchError> {
        self.page
            .evaluate(LISTING_HREFS_JS.as_str())
            .await?
            .into_value::<Vec<String>>()
            .map_err(|e| FetchError::Script(e.to_string()))
    }

    async fn advance(&mut self) -> Result<NextPage, FetchError> {
        let outcome = self
            .page
            .evaluate(NEXT_PAGE_JS.as_str())
            .await?
            .into_value::<String>()
            .map_err(|e| FetchError::Script(e.to_string()))?;
        match outcome.as_str() {
            "clicked" => {
                self.config.page_turn.wait().await;
                Ok(NextPage::Advanced)
            }
            "disabled" => Ok(NextPage::Disabled),
            "missing" => Ok(NextPage::Missing),
            other => Err(FetchError::Script(format!("next-page probe returned {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChromeCatalogCrawler {
    catalog_url: String,
    config: BrowserConfig,
}

impl ChromeCatalogCrawler {
    pub fn new(catalog_url: impl Into<String>, config: BrowserConfig) -> Self {
        Self {
            catalog_url: catalog_url.into(),
            config,
        }
    }
}

#[async_trait]
impl LinkCrawler for ChromeCatalogCrawler {
    async fn discover(&self) -> Result<CrawlReport, FetchError> {
        let span = info_span!("catalog_crawl", url = %self.catalog_url);
        async {
            let session = BrowserSession::launch(&self.config).await?;
            let page = match session.open(&self.catalog_url).await {
                Ok(page) => page,
                Err(e) => {
                    session.close().await;
                    return Err(e);
                }
            };
            self.config.catalog_load.wait().await;

            let mut driver = ChromeCatalogPage {
                page,
                config: &self.config,
            };
            let report = collect_catalog_links(&mut driver).await;
            drop(driver);
            session.close().await;

            info!(
                pages = report.pages,
                links = report.raw_links.len(),
                stop = ?report.stop,
                "catalog crawl finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListingField {
    Price,
    Area,
    Bedrooms,
    Bathrooms,
    ParkingSpaces,
    Suites,
    Floor,
    Pool,
    Balcony,
    Elevator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    /// First capture group of the first match.
    Capture,
    /// The whole match, anywhere in the text.
    Presence,
}

/// One independent text pattern producing one raw listing field.
#[derive(Debug)]
pub struct ExtractionRule {
    pub field: ListingField,
    pub name: &'static str,
    regex: Regex,
    kind: MatchKind,
}

impl ExtractionRule {
    fn new(field: ListingField, name: &'static str, pattern: &str, kind: MatchKind) -> Self {
        Self {
            field,
            name,
            regex: Regex::new(pattern).expect("extraction patterns are static and valid"),
            kind,
        }
    }

    pub fn extract(&self, text: &str) -> Option<String> {
        match self.kind {
            MatchKind::Capture => self
                .regex
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty()),
            MatchKind::Presence => self.regex.find(text).map(|m| m.as_str().to_string()),
        }
    }
}

static RULES: Lazy<Vec<ExtractionRule>> = Lazy::new(|| {
    use ListingField::*;
    use MatchKind::*;
    vec![
        ExtractionRule::new(Price, "price", r"R\$\s*([\d.,]+)", Capture),
        ExtractionRule::new(Area, "area", r"(?i)([\d.,]+)\s*m²", Capture),
        ExtractionRule::new(Bedrooms, "bedrooms", r"(?i)(\d+)\s*quartos?", Capture),
        ExtractionRule::new(Bathrooms, "bathrooms", r"(?i)(\d+)\s*banheiros?", Capture),
        ExtractionRule::new(ParkingSpaces, "parking_spaces", r"(?i)(\d+)\s*vagas?", Capture),
        ExtractionRule::new(Suites, "suites", r"(?i)(\d+)\s*su[ií]tes?", Capture),
        ExtractionRule::new(Floor, "floor", r"(?i)(\d+)\s*[º°]?\s*andar", Capture),
        ExtractionRule::new(Pool, "pool", r"(?i)piscinas?", Presence),
        ExtractionRule::new(Balcony, "balcony", r"(?i)varandas?", Presence),
        ExtractionRule::new(Elevator, "elevator", r"(?i)elevador", Presence),
    ]
});

static ADDRESS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*?)\s*-\s*(.*?),\s*(.*?)\s*-\s*(.{2})$").expect("address pattern is valid")
});

static ADDRESS_SELECTOR_LIST: Lazy<Vec<Selector>> = Lazy::new(|| {
    ADDRESS_SELECTORS
        .iter()
        .map(|s| Selector::parse(s).expect("address selectors are valid"))
        .collect()
});

pub fn extraction_rules() -> &'static [ExtractionRule] {
    &RULES
}

pub fn rule_for(field: ListingField) -> &'static ExtractionRule {
    RULES
        .iter()
        .find(|rule| rule.field == field)
        .expect("every listing field has a rule")
}

/// Apply every text rule. The address is left absent; it comes from markup.
pub fn parse_listing_text(text: &str) -> RawListing {
    let mut raw = RawListing::default();
    for rule in extraction_rules() {
        let value = rule.extract(text);
        let slot = match rule.field {
            ListingField::Price => &mut raw.price,
            ListingField::Area => &mut raw.area,
            ListingField::Bedrooms => &mut raw.bedrooms,
            ListingField::Bathrooms => &mut raw.bathrooms,
            ListingField::ParkingSpaces => &mut raw.parking_spaces,
            ListingField::Suites => &mut raw.suites,
            ListingField::Floor => &mut raw.floor,
            ListingField::Pool => &mut raw.pool,
            ListingField::Balcony => &mut raw.balcony,
            ListingField::Elevator => &mut raw.elevator,
        };
        *slot = value;
    }
    raw
}

/// Visible text of a document: text nodes trimmed and joined by single spaces.
pub fn page_text(document: &Html) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| el.name()))
            .map(|name| SKIPPED_TEXT_PARENTS.contains(&name))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    parts.join(" ")
}

pub fn extract_address(document: &Html) -> Option<String> {
    ADDRESS_SELECTOR_LIST.iter().find_map(|selector| {
        document.select(selector).next().and_then(|el| {
            let text = el
                .text()
                .flat_map(str::split_whitespace)
                .collect::<Vec<_>>()
                .join(" ");
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        })
    })
}

/// Split `"street - neighborhood, city - UF"`; anything else becomes the street.
pub fn split_address(text: Option<&str>) -> Address {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Address::unknown();
    };
    match ADDRESS_PATTERN.captures(text) {
        Some(caps) => {
            let part = |idx: usize| {
                caps.get(idx)
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|s| !s.is_empty())
            };
            Address {
                street: part(1),
                neighborhood: part(2),
                city: part(3),
                state: part(4),
            }
        }
        None => Address::street_only(text),
    }
}

pub fn property_type_from_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return TYPE_NOT_INFORMED.to_string();
    };
    let Some(segment) = parsed.path().split(LISTING_PATH_MARKER).nth(1) else {
        return TYPE_NOT_INFORMED.to_string();
    };
    PROPERTY_TYPE_PREFIXES
        .iter()
        .find(|prefix| segment.starts_with(*prefix))
        .map(|prefix| match *prefix {
            "casa" => "casa isolada".to_string(),
            other => other.replace('-', " "),
        })
        .unwrap_or_else(|| TYPE_NOT_INFORMED.to_string())
}

/// Raw fields from rendered markup: text rules plus the structural address.
pub fn extract_listing(html: &str) -> RawListing {
    let document = Html::parse_document(html);
    let mut raw = parse_listing_text(&page_text(&document));
    raw.address = extract_address(&document);
    raw
}

pub fn extract_property(page: &RenderedPage, link: &str, job_id: Uuid) -> ParsedProperty {
    let raw = extract_listing(&page.html);
    let address = split_address(raw.address.as_deref());
    ParsedProperty::from_raw(&raw, address, property_type_from_url(link), link, job_id)
}
