//! Pipeline orchestration: crowd import, park sync and weather fetch.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parkpulse_adapters::{
    aggregate_daily, hours_by_day, hours_window, park_local_date, park_snapshot,
    parse_live_attractions, parse_schedule, parse_weather_samples, AdapterError, CalendarParser,
    CalendarSource, LiveDataSource, WeatherSource,
};
use parkpulse_core::{DateRange, StatusPolicy};
use parkpulse_storage::{
    ArchiveScope, BackoffPolicy, FetchError, FetchRequest, FetchedResponse, HttpClientConfig,
    HttpFetcher, Pacer, PacingPolicy, RawArchive, SourceFetcher, DEFAULT_BROWSER_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod store;

pub use store::{
    DryRunStore, MemoryStore, PgStore, RecordStore, StoreRecord, UpsertBatch, UpsertWriter,
    WriteError, WEATHER_RETENTION_DAYS,
};

pub const CRATE_NAME: &str = "parkpulse-sync";

pub const YEARS_BACK: i32 = 10;
pub const YEARS_AHEAD: i32 = 5;
pub const DEFAULT_SYNC_DAYS: u32 = 7;
pub const MAX_SYNC_DAYS: u32 = 30;

const BUILTIN_PARKS_YAML: &str = include_str!("../../../parks.yaml");

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ParkRegistry {
    pub parks: Vec<ParkConfig>,
    pub weather_location: WeatherLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ParkConfig {
    pub id: String,
    pub display_name: String,
    pub live_entity_id: String,
    pub calendar_slug: String,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WeatherLocation {
    pub id: String,
    pub display_name: String,
    pub lat: f64,
    pub lon: f64,
}

impl ParkRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing park registry")?;
        let mut seen = BTreeSet::new();
        for park in &registry.parks {
            anyhow::ensure!(seen.insert(park.id.as_str()), "duplicate park id {}", park.id);
        }
        Ok(registry)
    }

    /// The registry compiled into the binary from the repository `parks.yaml`.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_PARKS_YAML)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
            }
            None => Self::builtin(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub database_password: Option<String>,
    pub db_pool_max: u32,
    pub openweather_api_key: Option<String>,
    pub parks_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub park_delay_ms: u64,
    pub max_retries: usize,
    pub strict_status: bool,
    pub archive_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub crowd_import_cron: String,
    pub park_sync_cron: String,
    pub weather_cron: String,
    pub web_port: u16,
}

fn parse_var<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            database_password: non_empty("DATABASE_SERVICE_PASSWORD"),
            db_pool_max: parse_var(non_empty("DB_POOL_MAX")).unwrap_or(5),
            openweather_api_key: non_empty("OPENWEATHER_API_KEY"),
            parks_file: non_empty("PARKPULSE_PARKS_FILE").map(PathBuf::from),
            user_agent: non_empty("PARKPULSE_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_BROWSER_USER_AGENT.to_string()),
            http_timeout_secs: parse_var(non_empty("PARKPULSE_HTTP_TIMEOUT_SECS"))
                .unwrap_or(20),
            park_delay_ms: parse_var(non_empty("PARKPULSE_PARK_DELAY_MS")).unwrap_or(1000),
            max_retries: parse_var(non_empty("PARKPULSE_MAX_RETRIES")).unwrap_or(2),
            strict_status: non_empty("PARKPULSE_STRICT_STATUS").is_some_and(|v| flag(&v)),
            archive_dir: non_empty("PARKPULSE_ARCHIVE_DIR").map(PathBuf::from),
            scheduler_enabled: non_empty("PARKPULSE_SCHEDULER_ENABLED").is_some_and(|v| flag(&v)),
            crowd_import_cron: non_empty("CROWD_IMPORT_CRON")
                .unwrap_or_else(|| "0 0 5 * * *".to_string()),
            park_sync_cron: non_empty("PARK_SYNC_CRON")
                .unwrap_or_else(|| "0 */10 * * * *".to_string()),
            weather_cron: non_empty("WEATHER_CRON").unwrap_or_else(|| "0 0 */3 * * *".to_string()),
            web_port: parse_var(non_empty("PARKPULSE_WEB_PORT")).unwrap_or(8000),
        }
    }

    pub fn status_policy(&self) -> StatusPolicy {
        if self.strict_status {
            StatusPolicy::Strict
        } else {
            StatusPolicy::Permissive
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn log_config(&self) {
        info!(
            database = %self
                .database_url
                .as_deref()
                .map(mask_database_url)
                .unwrap_or_else(|| "unset (simulated writes)".to_string()),
            service_password = self.database_password.is_some(),
            db_pool_max = self.db_pool_max,
            weather_api_key = self.openweather_api_key.is_some(),
            parks_file = %self
                .parks_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "builtin".to_string()),
            http_timeout_secs = self.http_timeout_secs,
            park_delay_ms = self.park_delay_ms,
            max_retries = self.max_retries,
            strict_status = self.strict_status,
            archive_dir = ?self.archive_dir,
            scheduler_enabled = self.scheduler_enabled,
            web_port = self.web_port,
            "effective configuration"
        );
    }
}

/// Replace the password in a connection URL with `****`.
pub fn mask_database_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let Some(at) = url[scheme_end..].find('@').map(|i| i + scheme_end) else {
        return url.to_string();
    };
    match url[scheme_end..at].find(':').map(|i| i + scheme_end) {
        Some(colon) => format!("{}:****{}", &url[..colon], &url[at..]),
        None => url.to_string(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("OPENWEATHER_API_KEY is not configured")]
    MissingWeatherApiKey,
    #[error("year {year} is outside {min}..={max}")]
    YearOutOfRange { year: i32, min: i32, max: i32 },
    #[error("days {days} is outside 1..={max}")]
    DaysOutOfRange { days: u32, max: u32 },
}

impl ConfigError {
    /// Rejected caller input rather than a deployment problem.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::YearOutOfRange { .. } | Self::DaysOutOfRange { .. })
    }
}

pub fn validate_year(year: i32, current_year: i32) -> Result<(), ConfigError> {
    let (min, max) = (current_year - YEARS_BACK, current_year + YEARS_AHEAD);
    if (min..=max).contains(&year) {
        Ok(())
    } else {
        Err(ConfigError::YearOutOfRange { year, min, max })
    }
}

pub fn validate_days(days: u32) -> Result<(), ConfigError> {
    if (1..=MAX_SYNC_DAYS).contains(&days) {
        Ok(())
    } else {
        Err(ConfigError::DaysOutOfRange {
            days,
            max: MAX_SYNC_DAYS,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Parse,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Parse => "parse",
            Self::Write => "write",
        })
    }
}

/// A failure confined to one entity of a run.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parse failed: {0}")]
    Parse(#[from] AdapterError),
    #[error("write failed: {0}")]
    Write(#[from] WriteError),
}

impl EntityError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Fetch(_) => Stage::Fetch,
            Self::Parse(_) => Stage::Parse,
            Self::Write(_) => Stage::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Summarizing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Fetching,
    Parsing,
    Writing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline: &'static str,
    pub success: bool,
    pub records_written: usize,
    pub processed: Vec<String>,
    pub errors: Vec<String>,
    pub date_range: Option<DateRange>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn duration_label(&self) -> String {
        format!("{}ms", self.duration_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParkSyncSummary {
    #[serde(flatten)]
    pub run: RunSummary,
    pub attractions_count: usize,
}

/// Run state machine plus the accumulators behind [`RunSummary`].
#[derive(Debug)]
pub struct RunTracker {
    pipeline: &'static str,
    run_id: Uuid,
    state: RunState,
    started: Instant,
    started_at: DateTime<Utc>,
    current: Option<(String, EntityState)>,
    records_written: usize,
    processed: Vec<String>,
    errors: Vec<String>,
    date_range: Option<DateRange>,
}

impl RunTracker {
    pub fn new(pipeline: &'static str) -> Self {
        Self {
            pipeline,
            run_id: Uuid::new_v4(),
            state: RunState::Idle,
            started: Instant::now(),
            started_at: Utc::now(),
            current: None,
            records_written: 0,
            processed: Vec::new(),
            errors: Vec::new(),
            date_range: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn entity_state(&self) -> Option<EntityState> {
        self.current.as_ref().map(|(_, state)| *state)
    }

    pub fn start(&mut self) {
        self.state = RunState::Running;
        self.started = Instant::now();
        self.started_at = Utc::now();
        info!(pipeline = self.pipeline, run_id = %self.run_id, "run started");
    }

    pub fn enter(&mut self, entity: &str, state: EntityState) {
        debug!(entity, ?state, "entity stage");
        self.current = Some((entity.to_string(), state));
    }

    pub fn succeed(
        &mut self,
        entity: &str,
        records: usize,
        dates: impl IntoIterator<Item = NaiveDate>,
    ) {
        self.enter(entity, EntityState::Done);
        self.records_written += records;
        self.processed.push(entity.to_string());
        for date in dates {
            DateRange::extend(&mut self.date_range, date);
        }
        info!(entity, records, "entity done");
    }

    pub fn fail(&mut self, entity: &str, err: &EntityError) {
        self.enter(entity, EntityState::Failed);
        warn!(entity, stage = %err.stage(), error = %err, "entity failed");
        self.errors.push(format!("{entity}: {err}"));
    }

    pub fn finish(mut self) -> RunSummary {
        self.state = RunState::Summarizing;
        let summary = RunSummary {
            run_id: self.run_id,
            pipeline: self.pipeline,
            success: !self.processed.is_empty(),
            records_written: self.records_written,
            processed: std::mem::take(&mut self.processed),
            errors: std::mem::take(&mut self.errors),
            date_range: self.date_range,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        };
        self.state = RunState::Completed;
        info!(
            pipeline = self.pipeline,
            run_id = %self.run_id,
            state = ?self.state,
            success = summary.success,
            records = summary.records_written,
            processed = summary.processed.len(),
            errors = summary.errors.len(),
            duration_ms = summary.duration_ms,
            "run completed"
        );
        summary
    }
}

/// Fetch with bounded retries for transient failures only.
pub async fn fetch_with_retry(
    fetcher: &dyn SourceFetcher,
    backoff: &BackoffPolicy,
    request: &FetchRequest,
) -> Result<FetchedResponse, FetchError> {
    let mut attempt = 0usize;
    loop {
        match fetcher.fetch(request).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(
                    url = %request.url,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying fetch"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fetcher plus retry policy and optional raw archive, shared by the pipelines.
#[derive(Clone)]
pub struct SourceClient {
    fetcher: Arc<dyn SourceFetcher>,
    backoff: BackoffPolicy,
    archive: Option<RawArchive>,
}

impl SourceClient {
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            fetcher,
            backoff: BackoffPolicy::default(),
            archive: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_archive(mut self, archive: Option<RawArchive>) -> Self {
        self.archive = archive;
        self
    }

    /// Fetch with retries, archiving the body under `scope` when an archive is set.
    pub async fn get(
        &self,
        request: &FetchRequest,
        scope: ArchiveScope<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let response = fetch_with_retry(self.fetcher.as_ref(), &self.backoff, request).await?;
        if let Some(archive) = &self.archive {
            match archive.archive_response(scope, &request.source_id, &response).await {
                Ok(stored) => debug!(
                    path = %stored.body_path.display(),
                    deduplicated = stored.deduplicated,
                    "archived payload"
                ),
                Err(err) => warn!(source_id = %request.source_id, error = %err, "archiving payload failed"),
            }
        }
        Ok(response)
    }
}

pub struct CrowdImport {
    client: SourceClient,
    writer: UpsertWriter,
    registry: Arc<ParkRegistry>,
    source: CalendarSource,
    parser: CalendarParser,
}

impl CrowdImport {
    pub const PIPELINE: &'static str = "crowd_import";

    pub fn new(client: SourceClient, writer: UpsertWriter, registry: Arc<ParkRegistry>) -> Self {
        Self {
            client,
            writer,
            registry,
            source: CalendarSource::default(),
            parser: CalendarParser::default(),
        }
    }

    pub fn with_source(mut self, source: CalendarSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_parser(mut self, parser: CalendarParser) -> Self {
        self.parser = parser;
        self
    }

    pub async fn run(&self, year: i32) -> Result<RunSummary, ConfigError> {
        validate_year(year, Utc::now().year())?;
        let mut tracker = RunTracker::new(Self::PIPELINE);
        let span = info_span!(
            "run",
            run_id = %tracker.run_id(),
            pipeline = Self::PIPELINE,
            year,
            strategy = self.parser.strategy_version()
        );
        async {
            tracker.start();
            for park in &self.registry.parks {
                let outcome = self
                    .import_park(park, year, &mut tracker)
                    .instrument(info_span!("entity", entity = %park.id))
                    .await;
                match outcome {
                    Ok((records, dates)) => tracker.succeed(&park.display_name, records, dates),
                    Err(err) => tracker.fail(&park.display_name, &err),
                }
            }
        }
        .instrument(span)
        .await;
        Ok(tracker.finish())
    }

    async fn import_park(
        &self,
        park: &ParkConfig,
        year: i32,
        tracker: &mut RunTracker,
    ) -> Result<(usize, Vec<NaiveDate>), EntityError> {
        let label = park.display_name.as_str();
        let scope = ArchiveScope {
            pipeline: Self::PIPELINE,
            run_id: tracker.run_id(),
            entity: &park.id,
        };
        tracker.enter(label, EntityState::Fetching);
        let page = self
            .client
            .get(&self.source.request(&park.calendar_slug, year), scope)
            .await?;

        tracker.enter(label, EntityState::Parsing);
        let report = self.parser.parse(&page.text(), &park.id, year, Utc::now());
        if !report.skipped.is_empty() {
            info!(
                skipped = report.skipped.len(),
                strategy = report.strategy,
                "calendar fragments skipped"
            );
        }

        tracker.enter(label, EntityState::Writing);
        let written = self.writer.write(&report.predictions).await?;
        Ok((written, report.predictions.iter().map(|p| p.date).collect()))
    }
}

pub struct ParkSync {
    client: SourceClient,
    writer: UpsertWriter,
    registry: Arc<ParkRegistry>,
    source: LiveDataSource,
    pacer: Pacer,
    status_policy: StatusPolicy,
}

struct ParkOutcome {
    records: usize,
    attractions: usize,
    dates: Vec<NaiveDate>,
}

impl ParkSync {
    pub const PIPELINE: &'static str = "park_sync";

    pub fn new(client: SourceClient, writer: UpsertWriter, registry: Arc<ParkRegistry>) -> Self {
        Self {
            client,
            writer,
            registry,
            source: LiveDataSource::default(),
            pacer: Pacer::new(PacingPolicy::FixedDelay(Duration::from_secs(1))),
            status_policy: StatusPolicy::default(),
        }
    }

    pub fn with_source(mut self, source: LiveDataSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_pacing(mut self, policy: PacingPolicy) -> Self {
        self.pacer = Pacer::new(policy);
        self
    }

    pub fn with_status_policy(mut self, policy: StatusPolicy) -> Self {
        self.status_policy = policy;
        self
    }

    pub async fn run(&self, days: u32, now: DateTime<Utc>) -> Result<ParkSyncSummary, ConfigError> {
        validate_days(days)?;
        let mut tracker = RunTracker::new(Self::PIPELINE);
        let mut attractions_count = 0usize;
        let span = info_span!("run", run_id = %tracker.run_id(), pipeline = Self::PIPELINE, days);
        async {
            tracker.start();
            debug!(pacing = ?self.pacer.policy(), parks = self.registry.parks.len(), "pacing parks");
            for (index, park) in self.registry.parks.iter().enumerate() {
                self.pacer.pace(index).await;
                let outcome = self
                    .sync_park(park, days, now, &mut tracker)
                    .instrument(info_span!("entity", entity = %park.id))
                    .await;
                match outcome {
                    Ok(outcome) => {
                        attractions_count += outcome.attractions;
                        tracker.succeed(&park.display_name, outcome.records, outcome.dates);
                    }
                    Err(err) => tracker.fail(&park.display_name, &err),
                }
            }
        }
        .instrument(span)
        .await;
        Ok(ParkSyncSummary {
            run: tracker.finish(),
            attractions_count,
        })
    }

    async fn sync_park(
        &self,
        park: &ParkConfig,
        days: u32,
        now: DateTime<Utc>,
        tracker: &mut RunTracker,
    ) -> Result<ParkOutcome, EntityError> {
        let label = park.display_name.as_str();
        let scope = ArchiveScope {
            pipeline: Self::PIPELINE,
            run_id: tracker.run_id(),
            entity: &park.id,
        };
        tracker.enter(label, EntityState::Fetching);
        let live = self
            .client
            .get(&self.source.live_request(&park.live_entity_id), scope)
            .await?;
        let schedule = self
            .client
            .get(&self.source.schedule_request(&park.live_entity_id), scope)
            .await?;

        tracker.enter(label, EntityState::Parsing);
        let attractions = parse_live_attractions(&park.id, &live.text())?
            .map(|a| a.into_snapshot(&park.id, self.status_policy, now))
            .collect::<Vec<_>>();
        let entries = parse_schedule(&park.id, &schedule.text())?;
        let hours = hours_by_day(&entries);
        let today = park_local_date(&entries, now).unwrap_or_else(|| now.date_naive());
        let snapshot = park_snapshot(
            &park.id,
            &park.display_name,
            &park.timezone,
            hours.get(&today),
            now,
        );
        let park_hours = hours_window(&hours, today, days)
            .map(|h| h.to_record(&park.id, now))
            .collect::<Vec<_>>();
        debug!(status = ?snapshot.status, %today, attractions = attractions.len(), "park parsed");

        tracker.enter(label, EntityState::Writing);
        let mut records = self.writer.write(std::slice::from_ref(&snapshot)).await?;
        records += self.writer.write(&attractions).await?;
        records += self.writer.write(&park_hours).await?;

        Ok(ParkOutcome {
            records,
            attractions: attractions.len(),
            dates: park_hours.iter().map(|h| h.date).collect(),
        })
    }
}

pub struct WeatherFetch {
    client: SourceClient,
    writer: UpsertWriter,
    location: WeatherLocation,
    source: Option<WeatherSource>,
}

impl WeatherFetch {
    pub const PIPELINE: &'static str = "weather_fetch";

    /// `source` is `None` when no API key is configured; runs then fail to start.
    pub fn new(
        client: SourceClient,
        writer: UpsertWriter,
        location: WeatherLocation,
        source: Option<WeatherSource>,
    ) -> Self {
        Self {
            client,
            writer,
            location,
            source,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunSummary, ConfigError> {
        let source = self.source.as_ref().ok_or(ConfigError::MissingWeatherApiKey)?;
        let mut tracker = RunTracker::new(Self::PIPELINE);
        let span = info_span!("run", run_id = %tracker.run_id(), pipeline = Self::PIPELINE);
        async {
            tracker.start();
            let outcome = self
                .fetch_location(source, now, &mut tracker)
                .instrument(info_span!("entity", entity = %self.location.id))
                .await;
            match outcome {
                Ok((records, dates)) => {
                    tracker.succeed(&self.location.display_name, records, dates);
                    self.writer
                        .purge_stale_weather(&self.location.id, now.date_naive())
                        .await;
                }
                Err(err) => tracker.fail(&self.location.display_name, &err),
            }
        }
        .instrument(span)
        .await;
        Ok(tracker.finish())
    }

    async fn fetch_location(
        &self,
        source: &WeatherSource,
        now: DateTime<Utc>,
        tracker: &mut RunTracker,
    ) -> Result<(usize, Vec<NaiveDate>), EntityError> {
        let location = &self.location;
        let label = location.display_name.as_str();
        let scope = ArchiveScope {
            pipeline: Self::PIPELINE,
            run_id: tracker.run_id(),
            entity: &location.id,
        };
        tracker.enter(label, EntityState::Fetching);
        let body = self
            .client
            .get(&source.request(location.lat, location.lon), scope)
            .await?
            .text();

        tracker.enter(label, EntityState::Parsing);
        let samples = parse_weather_samples(&location.id, &body)?;
        let days = aggregate_daily(&location.id, samples, now);

        tracker.enter(label, EntityState::Writing);
        let written = self.writer.write(&days).await?;
        Ok((written, days.iter().map(|d| d.forecast_date).collect()))
    }
}

/// The three pipelines wired from one configuration.
#[derive(Clone)]
pub struct Pipelines {
    pub crowd_import: Arc<CrowdImport>,
    pub park_sync: Arc<ParkSync>,
    pub weather: Arc<WeatherFetch>,
}

impl Pipelines {
    pub fn assemble(
        config: &SyncConfig,
        registry: Arc<ParkRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let client = SourceClient::new(fetcher)
            .with_backoff(config.backoff())
            .with_archive(config.archive_dir.clone().map(RawArchive::new));
        let writer = UpsertWriter::new(store);
        let weather_source = config
            .openweather_api_key
            .as_ref()
            .map(|key| WeatherSource::new(WeatherSource::DEFAULT_BASE_URL, key.clone()));

        Self {
            crowd_import: Arc::new(CrowdImport::new(
                client.clone(),
                writer.clone(),
                Arc::clone(&registry),
            )),
            park_sync: Arc::new(
                ParkSync::new(client.clone(), writer.clone(), Arc::clone(&registry))
                    .with_pacing(PacingPolicy::FixedDelay(Duration::from_millis(
                        config.park_delay_ms,
                    )))
                    .with_status_policy(config.status_policy()),
            ),
            weather: Arc::new(WeatherFetch::new(
                client,
                writer,
                registry.weather_location.clone(),
                weather_source,
            )),
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = Arc::new(ParkRegistry::load(config.parks_file.as_deref())?);
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        })?;
        let store = open_store(config).await?;
        Ok(Self::assemble(config, registry, Arc::new(fetcher), store))
    }
}

pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn RecordStore>> {
    match &config.database_url {
        Some(url) => {
            let store =
                PgStore::connect(url, config.database_password.as_deref(), config.db_pool_max)
                    .await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL is not set; writes are simulated");
            Ok(Arc::new(DryRunStore))
        }
    }
}

/// Create every table the pipelines write to.
pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for migrate")?;
    let store = PgStore::connect(url, config.database_password.as_deref(), config.db_pool_max)
        .await?;
    store.ensure_schema().await
}

/// One cron job per pipeline, or `None` when the scheduler is disabled.
pub async fn build_scheduler(
    config: &SyncConfig,
    pipelines: &Pipelines,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let crowd = Arc::clone(&pipelines.crowd_import);
    let job = Job::new_async(config.crowd_import_cron.as_str(), move |_uuid, _l| {
        let crowd = Arc::clone(&crowd);
        Box::pin(async move {
            if let Err(err) = crowd.run(Utc::now().year()).await {
                error!(error = %err, "scheduled crowd import could not start");
            }
        })
    })
    .with_context(|| format!("creating crowd import job for cron {}", config.crowd_import_cron))?;
    sched.add(job).await.context("adding crowd import job")?;

    let parks = Arc::clone(&pipelines.park_sync);
    let job = Job::new_async(config.park_sync_cron.as_str(), move |_uuid, _l| {
        let parks = Arc::clone(&parks);
        Box::pin(async move {
            if let Err(err) = parks.run(DEFAULT_SYNC_DAYS, Utc::now()).await {
                error!(error = %err, "scheduled park sync could not start");
            }
        })
    })
    .with_context(|| format!("creating park sync job for cron {}", config.park_sync_cron))?;
    sched.add(job).await.context("adding park sync job")?;

    let weather = Arc::clone(&pipelines.weather);
    let job = Job::new_async(config.weather_cron.as_str(), move |_uuid, _l| {
        let weather = Arc::clone(&weather);
        Box::pin(async move {
            if let Err(err) = weather.run(Utc::now()).await {
                error!(error = %err, "scheduled weather fetch could not start");
            }
        })
    })
    .with_context(|| format!("creating weather job for cron {}", config.weather_cron))?;
    sched.add(job).await.context("adding weather job")?;

    info!(
        crowd_import = %config.crowd_import_cron,
        park_sync = %config.park_sync_cron,
        weather = %config.weather_cron,
        "scheduler jobs registered"
    );
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use parkpulse_core::{CrowdPrediction, WeatherCondition, WeatherForecastDay};
    use parkpulse_storage::StaticFetcher;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn config_defaults_and_overrides() {
        let empty = SyncConfig::from_lookup(|_| None);
        assert_eq!(empty.database_url, None);
        assert_eq!(empty.db_pool_max, 5);
        assert_eq!(empty.park_delay_ms, 1000);
        assert_eq!(empty.max_retries, 2);
        assert_eq!(empty.web_port, 8000);
        assert_eq!(empty.crowd_import_cron, "0 0 5 * * *");
        assert_eq!(empty.status_policy(), StatusPolicy::Permissive);
        assert!(!empty.scheduler_enabled);

        let vars = HashMap::from([
            ("DATABASE_URL", "postgres://svc:secret@db:5432/parks"),
            ("PARKPULSE_STRICT_STATUS", "true"),
            ("PARKPULSE_MAX_RETRIES", "4"),
            ("PARKPULSE_WEB_PORT", "not-a-port"),
            ("OPENWEATHER_API_KEY", "   "),
        ]);
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.status_policy(), StatusPolicy::Strict);
        assert_eq!(config.backoff().max_retries, 4);
        assert_eq!(config.web_port, 8000);
        assert_eq!(config.openweather_api_key, None);
    }

    #[test]
    fn database_password_is_masked() {
        assert_eq!(
            mask_database_url("postgres://svc:secret@db:5432/parks"),
            "postgres://svc:****@db:5432/parks"
        );
        assert_eq!(
            mask_database_url("postgres://db:5432/parks"),
            "postgres://db:5432/parks"
        );
        assert_eq!(
            mask_database_url("postgres://svc@db/parks"),
            "postgres://svc@db/parks"
        );
    }

    #[test]
    fn builtin_registry_lists_four_parks() {
        let registry = ParkRegistry::builtin().unwrap();
        assert_eq!(registry.parks.len(), 4);
        assert_eq!(registry.parks[0].id, "magic-kingdom");
        assert_eq!(registry.weather_location.id, "orlando");
        let dup = r#"
parks:
  - {id: a, display_name: A, live_entity_id: x, calendar_slug: a, timezone: UTC}
  - {id: a, display_name: B, live_entity_id: y, calendar_slug: b, timezone: UTC}
weather_location: {id: w, display_name: W, lat: 0.0, lon: 0.0}
"#;
        assert!(ParkRegistry::from_yaml_str(dup).is_err());
    }

    #[test]
    fn year_and_day_windows() {
        assert!(validate_year(2025, 2025).is_ok());
        assert!(validate_year(2015, 2025).is_ok());
        assert!(validate_year(2030, 2025).is_ok());
        assert_eq!(
            validate_year(2031, 2025),
            Err(ConfigError::YearOutOfRange {
                year: 2031,
                min: 2015,
                max: 2030
            })
        );
        assert!(validate_year(2014, 2025).is_err());
        assert!(validate_days(1).is_ok());
        assert!(validate_days(30).is_ok());
        assert!(validate_days(0).unwrap_err().is_invalid_input());
        assert!(validate_days(31).is_err());
        assert!(!ConfigError::MissingWeatherApiKey.is_invalid_input());
    }

    #[test]
    fn tracker_walks_state_machine() {
        let mut tracker = RunTracker::new("test");
        assert_eq!(tracker.state(), RunState::Idle);
        tracker.start();
        assert_eq!(tracker.state(), RunState::Running);
        tracker.enter("Park A", EntityState::Fetching);
        assert_eq!(tracker.entity_state(), Some(EntityState::Fetching));
        let d = |day| NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        tracker.succeed("Park A", 2, [d(3), d(1)]);
        let err = EntityError::Fetch(FetchError::NotFound {
            url: "https://x.test/b".into(),
        });
        tracker.fail("Park B", &err);
        assert_eq!(tracker.entity_state(), Some(EntityState::Failed));

        let summary = tracker.finish();
        assert!(summary.success);
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.processed, vec!["Park A"]);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("Park B: fetch failed:"));
        assert_eq!(summary.date_range, Some(DateRange { start: d(1), end: d(3) }));
        assert!(summary.duration_label().ends_with("ms"));
    }

    #[test]
    fn run_with_no_success_is_not_successful() {
        let mut tracker = RunTracker::new("test");
        tracker.start();
        let summary = tracker.finish();
        assert!(!summary.success);
        assert_eq!(summary.date_range, None);
    }

    #[tokio::test]
    async fn retries_transient_failures_only() {
        let fetcher = StaticFetcher::new()
            .with_network_failure("https://x.test/flaky", "reset")
            .with_html("https://x.test/flaky", "<p>ok</p>")
            .with_status("https://x.test/gone", 404)
            .with_status("https://x.test/busy", 429);
        let backoff = fast_backoff();

        let ok = fetch_with_retry(&fetcher, &backoff, &FetchRequest::new("t", "https://x.test/flaky"))
            .await
            .unwrap();
        assert_eq!(ok.text(), "<p>ok</p>");
        assert_eq!(fetcher.calls_to("https://x.test/flaky").await, 2);

        let gone = fetch_with_retry(&fetcher, &backoff, &FetchRequest::new("t", "https://x.test/gone")).await;
        assert!(matches!(gone, Err(FetchError::NotFound { .. })));
        assert_eq!(fetcher.calls_to("https://x.test/gone").await, 1);

        let busy = fetch_with_retry(&fetcher, &backoff, &FetchRequest::new("t", "https://x.test/busy")).await;
        assert!(matches!(busy, Err(FetchError::RateLimited { .. })));
        assert_eq!(fetcher.calls_to("https://x.test/busy").await, 3);
    }

    #[tokio::test]
    async fn source_client_archives_payloads_under_run_scope() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(StaticFetcher::new().with_json("https://x.test/a", "{}"));
        let client = SourceClient::new(fetcher)
            .with_backoff(BackoffPolicy::none())
            .with_archive(Some(RawArchive::new(dir.path())));
        let run_id = Uuid::new_v4();
        let scope = ArchiveScope {
            pipeline: ParkSync::PIPELINE,
            run_id,
            entity: "epcot",
        };
        client
            .get(&FetchRequest::new("live-data", "https://x.test/a"), scope)
            .await
            .unwrap();

        let mut stack = vec![dir.path().to_path_buf()];
        let mut files = Vec::new();
        while let Some(path) = stack.pop() {
            for entry in std::fs::read_dir(&path).unwrap() {
                let entry = entry.unwrap().path();
                if entry.is_dir() {
                    stack.push(entry);
                } else {
                    files.push(entry.strip_prefix(dir.path()).unwrap().to_path_buf());
                }
            }
        }
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[0].starts_with("park_sync"));
        assert!(files[0].components().any(|c| c.as_os_str() == run_id.to_string().as_str()));
        assert_eq!(files[0].parent().and_then(|p| p.file_name()).unwrap(), "epcot");
        assert!(files[0].to_string_lossy().ends_with(".json"));
        assert!(files[1].to_string_lossy().ends_with(".json.meta.json"));
    }

    #[tokio::test]
    async fn missing_database_url_runs_against_dry_run_store() {
        let config = SyncConfig::from_lookup(|_| None);
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.backend(), "dry-run");

        let mut registry = ParkRegistry::builtin().unwrap();
        registry.parks.retain(|p| p.id == "magic-kingdom");
        let page = std::fs::read_to_string(
            std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("../../fixtures/crowd-calendar/magic-kingdom-2025.html"),
        )
        .unwrap();
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with_html(&CalendarSource::default().request("magic-kingdom", 2025).url, page),
        );
        let pipelines = Pipelines::assemble(&config, Arc::new(registry), fetcher, store);

        let summary = pipelines.crowd_import.run(2025).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.records_written, 7);
        assert_eq!(summary.processed, vec!["Magic Kingdom"]);
    }

    fn prediction(park: &str, day: u32, wait: u32) -> CrowdPrediction {
        CrowdPrediction::from_wait_time(
            park,
            NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            wait,
            Utc::now(),
        )
    }

    #[test]
    fn batch_collapses_duplicate_keys_last_wins() {
        let batch = UpsertBatch::from_records(&[
            prediction("mk", 1, 10),
            prediction("mk", 2, 20),
            prediction("mk", 1, 40),
        ])
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rows[0].0, "mk|2025-01-01");
        assert_eq!(batch.rows[0].1["wait_time"], 40);
        assert_eq!(batch.rows[0].1["crowd_level"], 10);
    }

    #[test]
    fn upsert_sql_updates_every_non_key_column() {
        let batch = UpsertBatch::from_records(&[prediction("mk", 1, 10)]).unwrap();
        let sql = batch.upsert_sql();
        assert!(sql.starts_with("INSERT INTO park_crowd_predictions (park_id, date, wait_time"));
        assert!(sql.contains("jsonb_populate_recordset(NULL::park_crowd_predictions, $1::jsonb)"));
        assert!(sql.contains("ON CONFLICT (park_id, date) DO UPDATE SET wait_time = EXCLUDED.wait_time"));
        assert!(!sql.contains("park_id = EXCLUDED.park_id"));
    }

    #[tokio::test]
    async fn writer_is_idempotent_and_skips_empty_batches() {
        let store = Arc::new(MemoryStore::new());
        let writer = UpsertWriter::new(store.clone());
        let rows = vec![prediction("mk", 1, 10), prediction("mk", 2, 33)];
        assert_eq!(writer.write(&rows).await.unwrap(), 2);
        assert_eq!(writer.write(&rows).await.unwrap(), 2);
        assert_eq!(store.count("park_crowd_predictions").await, 2);
        assert_eq!(writer.write::<CrowdPrediction>(&[]).await.unwrap(), 0);
    }

    fn forecast(day: u32) -> WeatherForecastDay {
        WeatherForecastDay {
            location_id: "orlando".into(),
            forecast_date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            temp_high: 80,
            temp_low: 65,
            feels_like: 72,
            humidity: 70,
            precipitation_chance: 10,
            precipitation_amount: 0.0,
            condition: WeatherCondition::Clear,
            description: "clear sky".into(),
            wind_speed: 5,
            wind_direction: 90,
            uv_index: 0,
            visibility: 6.2,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn purge_removes_rows_older_than_retention() {
        let store = Arc::new(MemoryStore::new());
        let writer = UpsertWriter::new(store.clone());
        writer
            .write(&[forecast(1), forecast(7), forecast(8), forecast(10)])
            .await
            .unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        assert_eq!(writer.purge_stale_weather("orlando", today).await, 2);
        assert_eq!(writer.purge_stale_weather("other", today).await, 0);
        assert_eq!(store.count("weather_forecasts").await, 2);
    }

    struct BrokenStore;

    #[async_trait]
    impl RecordStore for BrokenStore {
        fn backend(&self) -> &'static str {
            "broken"
        }

        async fn upsert(&self, batch: &UpsertBatch) -> Result<u64, WriteError> {
            Err(WriteError::Rejected {
                table: batch.table,
                message: "offline".into(),
            })
        }

        async fn delete_before(
            &self,
            table: &'static str,
            _date_column: &'static str,
            _key_column: &'static str,
            _key: &str,
            _cutoff: NaiveDate,
        ) -> Result<u64, WriteError> {
            Err(WriteError::Rejected {
                table,
                message: "offline".into(),
            })
        }
    }

    #[tokio::test]
    async fn purge_failure_is_swallowed() {
        let writer = UpsertWriter::new(Arc::new(BrokenStore));
        let today = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        assert_eq!(writer.purge_stale_weather("orlando", today).await, 0);
        assert!(writer.write(&[forecast(1)]).await.is_err());
    }
}
