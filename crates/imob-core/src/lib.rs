//! Core domain model for listing harvesting: canonical links, listing records and scrape jobs.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Textual value reported when a listing's property type cannot be derived.
pub const TYPE_NOT_INFORMED: &str = "nao informado";

/// Strip query string and fragment from a listing URL.
///
/// Scheme, host and path are kept byte-for-byte; no case folding and no
/// trailing-slash handling. Empty input yields empty output.
pub fn canonicalize_url(raw: &str) -> String {
    let end = raw.find(|c: char| c == '?' || c == '#').unwrap_or(raw.len());
    raw[..end].to_string()
}

pub fn canonical_link_set<'a, I>(raw_links: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    raw_links
        .into_iter()
        .map(|link| canonicalize_url(link))
        .filter(|link| !link.is_empty())
        .collect()
}

/// Links discovered this run that are not yet persisted (`found - existing`).
pub fn new_links(found: &BTreeSet<String>, existing: &HashSet<String>) -> Vec<String> {
    found
        .iter()
        .filter(|link| !existing.contains(*link))
        .cloned()
        .collect()
}

/// Integer coercion: every non-digit is dropped, so `"1.200"` becomes 1200.
pub fn coerce_int(value: Option<&str>) -> i32 {
    let Some(value) = value else {
        return 0;
    };
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Decimal coercion for pt-BR formatted numbers: `.` groups thousands and `,`
/// marks decimals, so `"1.500,50"` becomes 1500.5.
pub fn coerce_decimal(value: Option<&str>) -> f64 {
    let Some(value) = value else {
        return 0.0;
    };
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Field fragments as matched on a rendered listing page, before coercion.
///
/// `None` is the absence marker for every field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub price: Option<String>,
    pub area: Option<String>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub parking_spaces: Option<String>,
    pub suites: Option<String>,
    pub floor: Option<String>,
    pub pool: Option<String>,
    pub balcony: Option<String>,
    pub elevator: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(rename = "rua")]
    pub street: Option<String>,
    #[serde(rename = "bairro")]
    pub neighborhood: Option<String>,
    #[serde(rename = "cidade")]
    pub city: Option<String>,
    #[serde(rename = "uf")]
    pub state: Option<String>,
}

impl Address {
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Fallback shape when the address text does not decompose.
    pub fn street_only(text: impl Into<String>) -> Self {
        Self {
            street: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Typed, coerced listing record; the unit of persistence.
///
/// Serialized field names are the `properties` table columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedProperty {
    pub link: String,
    pub job_id: Uuid,
    #[serde(rename = "tipo")]
    pub property_type: String,
    #[serde(rename = "valor")]
    pub price: f64,
    #[serde(rename = "area_privativa")]
    pub private_area: f64,
    #[serde(rename = "dormitorio")]
    pub bedrooms: i32,
    #[serde(rename = "banheiro")]
    pub bathrooms: i32,
    #[serde(rename = "vaga")]
    pub parking_spaces: i32,
    #[serde(rename = "suite")]
    pub suites: i32,
    #[serde(rename = "andar")]
    pub floor: i32,
    #[serde(rename = "piscina")]
    pub pool: bool,
    #[serde(rename = "varanda")]
    pub balcony: bool,
    #[serde(rename = "elevador")]
    pub elevator: bool,
    #[serde(flatten)]
    pub address: Address,
    #[serde(rename = "endereco_completo")]
    pub full_address: Option<String>,
}

impl ParsedProperty {
    pub fn from_raw(
        raw: &RawListing,
        address: Address,
        property_type: impl Into<String>,
        link: impl Into<String>,
        job_id: Uuid,
    ) -> Self {
        Self {
            link: link.into(),
            job_id,
            property_type: property_type.into(),
            price: coerce_decimal(raw.price.as_deref()),
            private_area: coerce_decimal(raw.area.as_deref()),
            bedrooms: coerce_int(raw.bedrooms.as_deref()),
            bathrooms: coerce_int(raw.bathrooms.as_deref()),
            parking_spaces: coerce_int(raw.parking_spaces.as_deref()),
            suites: coerce_int(raw.suites.as_deref()),
            floor: coerce_int(raw.floor.as_deref()),
            pool: raw.pool.is_some(),
            balcony: raw.balcony.is_some(),
            elevator: raw.elevator.is_some(),
            address,
            full_address: raw.address.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = JobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(JobStateError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobStateError {
    #[error("job {id} is already {status}")]
    Terminal { id: Uuid, status: JobStatus },
    #[error("counter {counter} would regress from {from} to {to}")]
    CounterRegression {
        counter: &'static str,
        from: u64,
        to: u64,
    },
    #[error("unknown job status {0:?}")]
    UnknownStatus(String),
}

/// One end-to-end pipeline run as persisted in `scraping_jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub links_found: u64,
    pub new_links_to_process: u64,
    pub properties_scraped: u64,
    pub error_message: Option<String>,
}

/// Field-level change to a persisted job. `None` leaves the stored column as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links_found: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_links_to_process: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties_scraped: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ScrapeJob {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Running,
            started_at,
            completed_at: None,
            links_found: 0,
            new_links_to_process: 0,
            properties_scraped: 0,
            error_message: None,
        }
    }

    pub fn record_discovery(
        &mut self,
        links_found: u64,
        new_links_to_process: u64,
    ) -> Result<JobUpdate, JobStateError> {
        self.ensure_running()?;
        ensure_monotonic("links_found", self.links_found, links_found)?;
        ensure_monotonic(
            "new_links_to_process",
            self.new_links_to_process,
            new_links_to_process,
        )?;
        let update = JobUpdate {
            links_found: Some(links_found),
            new_links_to_process: Some(new_links_to_process),
            ..JobUpdate::default()
        };
        self.apply(&update);
        Ok(update)
    }

    pub fn record_scraped(&mut self, properties_scraped: u64) -> Result<JobUpdate, JobStateError> {
        self.ensure_running()?;
        ensure_monotonic("properties_scraped", self.properties_scraped, properties_scraped)?;
        let update = JobUpdate {
            properties_scraped: Some(properties_scraped),
            ..JobUpdate::default()
        };
        self.apply(&update);
        Ok(update)
    }

    pub fn complete(
        &mut self,
        properties_scraped: u64,
        completed_at: DateTime<Utc>,
    ) -> Result<JobUpdate, JobStateError> {
        self.ensure_running()?;
        ensure_monotonic("properties_scraped", self.properties_scraped, properties_scraped)?;
        let update = JobUpdate {
            status: Some(JobStatus::Completed),
            completed_at: Some(completed_at),
            properties_scraped: Some(properties_scraped),
            ..JobUpdate::default()
        };
        self.apply(&update);
        Ok(update)
    }

    pub fn fail(
        &mut self,
        error_message: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<JobUpdate, JobStateError> {
        self.ensure_running()?;
        let update = JobUpdate {
            status: Some(JobStatus::Failed),
            completed_at: Some(completed_at),
            error_message: Some(error_message.into()),
            ..JobUpdate::default()
        };
        self.apply(&update);
        Ok(update)
    }

    /// Overwrite the columns present in `update`, without transition checks.
    pub fn apply(&mut self, update: &JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(v) = update.links_found {
            self.links_found = v;
        }
        if let Some(v) = update.new_links_to_process {
            self.new_links_to_process = v;
        }
        if let Some(v) = update.properties_scraped {
            self.properties_scraped = v;
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
    }

    fn ensure_running(&self) -> Result<(), JobStateError> {
        if self.status.is_terminal() {
            return Err(JobStateError::Terminal {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }
}

fn ensure_monotonic(counter: &'static str, from: u64, to: u64) -> Result<(), JobStateError> {
    if to < from {
        return Err(JobStateError::CounterRegression { counter, from, to });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn canonicalize_strips_query_and_fragment() {
        assert_eq!(canonicalize_url("https://h/p?x=1#f"), "https://h/p");
        assert_eq!(canonicalize_url("https://h/p#f?x=1"), "https://h/p");
        assert_eq!(
            canonicalize_url("https://www.vivareal.com.br/imovel/apartamento-2-quartos-santos-id-1/"),
            "https://www.vivareal.com.br/imovel/apartamento-2-quartos-santos-id-1/"
        );
        assert_eq!(canonicalize_url(""), "");
    }

    #[test]
    fn canonicalize_is_idempotent_and_verbatim() {
        for raw in [
            "https://Host.Example/Path/?a=1",
            "http://h/p/#top",
            "https://h",
            "not a url at all",
            "https://h/p?",
        ] {
            let once = canonicalize_url(raw);
            assert_eq!(canonicalize_url(&once), once);
            assert!(raw.starts_with(&once));
        }
        assert_eq!(canonicalize_url("https://Host.Example/Path/?a=1"), "https://Host.Example/Path/");
    }

    #[test]
    fn dedup_is_asymmetric_set_difference() {
        let raw = vec![
            "https://h/a?src=1".to_string(),
            "https://h/a#gallery".to_string(),
            "https://h/b".to_string(),
            "https://h/c?x".to_string(),
        ];
        let found = canonical_link_set(&raw);
        assert_eq!(found.len(), 3);

        let existing: HashSet<String> = ["https://h/b".to_string(), "https://h/z".to_string()]
            .into_iter()
            .collect();
        assert_eq!(new_links(&found, &existing), vec!["https://h/a", "https://h/c"]);

        let all: HashSet<String> = found.iter().cloned().collect();
        assert!(new_links(&found, &all).is_empty());
        assert!(new_links(&BTreeSet::new(), &existing).is_empty());
    }

    #[test]
    fn decimal_coercion_handles_brazilian_separators() {
        assert_eq!(coerce_decimal(Some("1.500,50")), 1500.5);
        assert_eq!(coerce_decimal(Some("450.000")), 450000.0);
        assert_eq!(coerce_decimal(Some("72")), 72.0);
        assert_eq!(coerce_decimal(Some("sob consulta")), 0.0);
        assert_eq!(coerce_decimal(Some("1,2,3")), 0.0);
        assert_eq!(coerce_decimal(None), 0.0);
    }

    #[test]
    fn integer_coercion_defaults_to_zero() {
        assert_eq!(coerce_int(Some("3")), 3);
        assert_eq!(coerce_int(Some("1.200")), 1200);
        assert_eq!(coerce_int(Some("")), 0);
        assert_eq!(coerce_int(Some("abc")), 0);
        assert_eq!(coerce_int(Some("99999999999999")), 0);
        assert_eq!(coerce_int(None), 0);
    }

    #[test]
    fn parsed_property_coerces_raw_fragments() {
        let raw = RawListing {
            price: Some("689.000".into()),
            area: Some("85,5".into()),
            bedrooms: Some("3".into()),
            suites: Some("1".into()),
            pool: Some("piscina".into()),
            address: Some("Rua X, 10 - Centro, Santos - SP".into()),
            ..RawListing::default()
        };
        let job_id = Uuid::new_v4();
        let parsed = ParsedProperty::from_raw(
            &raw,
            Address::street_only("Rua X, 10"),
            "apartamento",
            "https://h/imovel/apartamento-1",
            job_id,
        );
        assert_eq!(parsed.price, 689000.0);
        assert_eq!(parsed.private_area, 85.5);
        assert_eq!(parsed.bedrooms, 3);
        assert_eq!(parsed.bathrooms, 0);
        assert_eq!(parsed.suites, 1);
        assert_eq!(parsed.floor, 0);
        assert!(parsed.pool);
        assert!(!parsed.balcony);
        assert_eq!(parsed.job_id, job_id);
        assert_eq!(parsed.full_address.as_deref(), Some("Rua X, 10 - Centro, Santos - SP"));
    }

    #[test]
    fn parsed_property_serializes_with_store_column_names() {
        let parsed = ParsedProperty::from_raw(
            &RawListing::default(),
            Address::unknown(),
            TYPE_NOT_INFORMED,
            "https://h/p",
            Uuid::nil(),
        );
        let value = serde_json::to_value(&parsed).unwrap();
        for column in [
            "link", "job_id", "tipo", "valor", "area_privativa", "dormitorio", "banheiro", "vaga",
            "suite", "andar", "piscina", "varanda", "elevador", "rua", "bairro", "cidade", "uf",
            "endereco_completo",
        ] {
            assert!(value.get(column).is_some(), "missing column {column}");
        }
        assert!(value["rua"].is_null());
    }

    #[test]
    fn job_lifecycle_completes_once() {
        let mut job = ScrapeJob::start(ts(8));
        assert_eq!(job.status, JobStatus::Running);

        let update = job.record_discovery(120, 14).unwrap();
        assert_eq!(update.links_found, Some(120));
        assert_eq!(update.status, None);

        job.record_scraped(10).unwrap();
        job.record_scraped(14).unwrap();
        let done = job.complete(14, ts(9)).unwrap();
        assert_eq!(done.status, Some(JobStatus::Completed));
        assert_eq!(job.completed_at, Some(ts(9)));

        let err = job.fail("late failure", ts(10)).unwrap_err();
        assert!(matches!(err, JobStateError::Terminal { status: JobStatus::Completed, .. }));
        assert!(job.record_scraped(20).is_err());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn job_counters_never_regress() {
        let mut job = ScrapeJob::start(ts(8));
        job.record_scraped(5).unwrap();
        assert_eq!(
            job.record_scraped(3),
            Err(JobStateError::CounterRegression {
                counter: "properties_scraped",
                from: 5,
                to: 3
            })
        );
        assert!(job.complete(4, ts(9)).is_err());
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn failed_job_records_message() {
        let mut job = ScrapeJob::start(ts(8));
        let update = job.fail("catalog unreachable", ts(8)).unwrap();
        assert_eq!(update.error_message.as_deref(), Some("catalog unreachable"));
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.complete(0, ts(9)).is_err());
    }

    #[test]
    fn job_update_serializes_only_changed_columns() {
        let update = JobUpdate {
            properties_scraped: Some(50),
            ..JobUpdate::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, serde_json::json!({ "properties_scraped": 50 }));
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
