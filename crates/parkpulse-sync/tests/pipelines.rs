use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parkpulse_adapters::{CalendarSource, LiveDataSource, WeatherSource};
use parkpulse_core::{WeatherCondition, WeatherForecastDay};
use parkpulse_storage::{BackoffPolicy, PacingPolicy, StaticFetcher};
use parkpulse_sync::{
    ConfigError, CrowdImport, MemoryStore, ParkRegistry, ParkSync, Pipelines, SourceClient,
    SyncConfig, UpsertWriter, WeatherFetch,
};

fn fixture(rel: &str) -> String {
    let root: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    std::fs::read_to_string(root.join("fixtures").join(rel)).expect("fixture readable")
}

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

fn client(fetcher: &Arc<StaticFetcher>) -> SourceClient {
    SourceClient::new(fetcher.clone()).with_backoff(fast_backoff())
}

fn magic_kingdom_only() -> Arc<ParkRegistry> {
    let mut registry = ParkRegistry::builtin().unwrap();
    registry.parks.retain(|p| p.id == "magic-kingdom");
    Arc::new(registry)
}

fn calendar_url(slug: &str) -> String {
    CalendarSource::default().request(slug, 2025).url
}

fn crowd_import(
    fetcher: &Arc<StaticFetcher>,
    store: &Arc<MemoryStore>,
    registry: Arc<ParkRegistry>,
) -> CrowdImport {
    CrowdImport::new(client(fetcher), UpsertWriter::new(store.clone()), registry)
}

#[tokio::test]
async fn crowd_import_twice_leaves_one_row_per_date() {
    let html = fixture("crowd-calendar/magic-kingdom-2025.html");
    let fetcher = Arc::new(StaticFetcher::new().with_html(&calendar_url("magic-kingdom"), html));
    let store = Arc::new(MemoryStore::new());
    let import = crowd_import(&fetcher, &store, magic_kingdom_only());

    let first = import.run(2025).await.unwrap();
    let second = import.run(2025).await.unwrap();

    assert!(first.success && second.success);
    assert_eq!(first.records_written, 7);
    assert_eq!(second.records_written, 7);
    assert_eq!(store.count("park_crowd_predictions").await, 7);
    assert_eq!(first.processed, vec!["Magic Kingdom"]);
    assert!(first.errors.is_empty());
    let range = first.date_range.unwrap();
    assert!(range.start <= range.end);
    assert_eq!(range.start.format("%Y").to_string(), "2025");
}

#[tokio::test]
async fn one_park_failing_does_not_stop_the_others() {
    let html = fixture("crowd-calendar/magic-kingdom-2025.html");
    let fetcher = Arc::new(
        StaticFetcher::new()
            .with_html(&calendar_url("magic-kingdom"), html.clone())
            .with_status(&calendar_url("epcot"), 404)
            .with_html(&calendar_url("hollywood-studios"), html.clone())
            .with_html(&calendar_url("animal-kingdom"), html),
    );
    let store = Arc::new(MemoryStore::new());
    let import = crowd_import(&fetcher, &store, Arc::new(ParkRegistry::builtin().unwrap()));

    let summary = import.run(2025).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.processed.len(), 3);
    assert_eq!(summary.records_written, 21);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].starts_with("EPCOT"));
    assert!(summary.errors[0].contains("fetch failed"));
    assert_eq!(fetcher.calls_to(&calendar_url("epcot")).await, 1);
    assert_eq!(store.count("park_crowd_predictions").await, 21);
}

#[tokio::test]
async fn transient_failure_is_retried_then_succeeds() {
    let url = calendar_url("magic-kingdom");
    let fetcher = Arc::new(
        StaticFetcher::new()
            .with_network_failure(&url, "connection reset")
            .with_html(&url, fixture("crowd-calendar/magic-kingdom-2025.html")),
    );
    let store = Arc::new(MemoryStore::new());
    let import = crowd_import(&fetcher, &store, magic_kingdom_only());

    let summary = import.run(2025).await.unwrap();

    assert!(summary.success);
    assert_eq!(fetcher.calls_to(&url).await, 2);
    assert_eq!(store.count("park_crowd_predictions").await, 7);
}

#[tokio::test]
async fn year_outside_window_is_rejected_before_any_work() {
    let fetcher = Arc::new(StaticFetcher::new());
    let store = Arc::new(MemoryStore::new());
    let import = crowd_import(&fetcher, &store, magic_kingdom_only());

    let err = import.run(1990).await.unwrap_err();

    assert!(matches!(err, ConfigError::YearOutOfRange { year: 1990, .. }));
    assert!(err.is_invalid_input());
    assert_eq!(store.count("park_crowd_predictions").await, 0);
    assert_eq!(fetcher.calls_to(&calendar_url("magic-kingdom")).await, 0);
}

#[tokio::test]
async fn rejected_writes_fail_the_run() {
    let fetcher = Arc::new(StaticFetcher::new().with_html(
        &calendar_url("magic-kingdom"),
        fixture("crowd-calendar/magic-kingdom-2025.html"),
    ));
    let store = Arc::new(MemoryStore::rejecting("park_crowd_predictions"));
    let import = crowd_import(&fetcher, &store, magic_kingdom_only());

    let summary = import.run(2025).await.unwrap();

    assert!(!summary.success);
    assert_eq!(summary.records_written, 0);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains("write failed"));
}

const MK_ENTITY: &str = "75ea578a-adc8-4116-a54d-dccb60765ef9";

fn park_sync(fetcher: &Arc<StaticFetcher>, store: &Arc<MemoryStore>) -> ParkSync {
    ParkSync::new(
        client(fetcher),
        UpsertWriter::new(store.clone()),
        magic_kingdom_only(),
    )
    .with_pacing(PacingPolicy::None)
}

#[tokio::test]
async fn park_sync_writes_snapshot_attractions_and_hours() {
    let source = LiveDataSource::default();
    let fetcher = Arc::new(
        StaticFetcher::new()
            .with_json(
                &source.live_request(MK_ENTITY).url,
                fixture("live/magic-kingdom-live.json"),
            )
            .with_json(
                &source.schedule_request(MK_ENTITY).url,
                fixture("live/magic-kingdom-schedule.json"),
            ),
    );
    let store = Arc::new(MemoryStore::new());

    let summary = park_sync(&fetcher, &store)
        .run(7, at("2025-01-01T15:05:00Z"))
        .await
        .unwrap();

    assert!(summary.run.success);
    assert_eq!(summary.attractions_count, 5);
    assert_eq!(summary.run.records_written, 9);
    assert_eq!(store.count("live_parks").await, 1);
    assert_eq!(store.count("live_attractions").await, 5);
    assert_eq!(store.count("park_hours").await, 3);

    let parks = store.rows("live_parks").await;
    assert_eq!(parks[0]["park_id"], "magic-kingdom");
    assert_eq!(parks[0]["timezone"], "America/New_York");
    let range = summary.run.date_range.unwrap();
    assert_eq!(range.start, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    assert_eq!(range.end, NaiveDate::from_ymd_opt(2025, 1, 3).unwrap());
}

#[tokio::test]
async fn park_sync_rejects_days_outside_window() {
    let fetcher = Arc::new(StaticFetcher::new());
    let store = Arc::new(MemoryStore::new());
    let sync = park_sync(&fetcher, &store);

    assert!(matches!(
        sync.run(0, Utc::now()).await,
        Err(ConfigError::DaysOutOfRange { days: 0, .. })
    ));
    assert!(sync.run(31, Utc::now()).await.is_err());
}

#[tokio::test]
async fn html_in_place_of_live_json_is_a_parse_failure() {
    let source = LiveDataSource::default();
    let fetcher = Arc::new(
        StaticFetcher::new()
            .with_html(
                &source.live_request(MK_ENTITY).url,
                "<html><body>Service unavailable</body></html>",
            )
            .with_json(
                &source.schedule_request(MK_ENTITY).url,
                fixture("live/magic-kingdom-schedule.json"),
            ),
    );
    let store = Arc::new(MemoryStore::new());

    let summary = park_sync(&fetcher, &store)
        .run(7, at("2025-01-01T15:05:00Z"))
        .await
        .unwrap();

    assert!(!summary.run.success);
    assert_eq!(summary.attractions_count, 0);
    assert!(summary.run.errors[0].starts_with("Magic Kingdom: parse failed"));
    assert_eq!(store.count("live_parks").await, 0);
}

fn stale_forecast(date: NaiveDate) -> WeatherForecastDay {
    WeatherForecastDay {
        location_id: "orlando".into(),
        forecast_date: date,
        temp_high: 70,
        temp_low: 60,
        feels_like: 65,
        humidity: 60,
        precipitation_chance: 0,
        precipitation_amount: 0.0,
        condition: WeatherCondition::Clear,
        description: "clear sky".into(),
        wind_speed: 3,
        wind_direction: 0,
        uv_index: 0,
        visibility: 6.2,
        fetched_at: Utc::now(),
    }
}

#[tokio::test]
async fn weather_fetch_writes_days_and_purges_old_rows() {
    let registry = ParkRegistry::builtin().unwrap();
    let location = registry.weather_location.clone();
    let source = WeatherSource::new("https://weather.test/data/2.5", "test-key");
    let fetcher = Arc::new(StaticFetcher::new().with_json(
        &source.request(location.lat, location.lon).url,
        fixture("weather/orlando-forecast.json"),
    ));
    let store = Arc::new(MemoryStore::new());
    let writer = UpsertWriter::new(store.clone());
    writer
        .write(&[stale_forecast(NaiveDate::from_ymd_opt(2024, 12, 20).unwrap())])
        .await
        .unwrap();

    let weather = WeatherFetch::new(client(&fetcher), writer, location, Some(source));
    let summary = weather.run(at("2025-01-01T12:00:00Z")).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.records_written, 2);
    assert_eq!(summary.processed, vec!["Orlando"]);
    let rows = store.rows("weather_forecasts").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["forecast_date"], "2025-01-01");
    assert_eq!(rows[1]["forecast_date"], "2025-01-02");
}

#[tokio::test]
async fn weather_without_api_key_does_not_start() {
    let vars = HashMap::from([("PARKPULSE_PARK_DELAY_MS", "0")]);
    let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
    let fetcher = Arc::new(StaticFetcher::new());
    let store = Arc::new(MemoryStore::new());
    let pipelines = Pipelines::assemble(
        &config,
        Arc::new(ParkRegistry::builtin().unwrap()),
        fetcher,
        store.clone(),
    );

    let err = pipelines.weather.run(Utc::now()).await.unwrap_err();

    assert_eq!(err, ConfigError::MissingWeatherApiKey);
    assert_eq!(store.count("weather_forecasts").await, 0);
}

#[tokio::test]
async fn strict_status_config_stores_unknown_for_unrecognized_status() {
    let vars = HashMap::from([
        ("PARKPULSE_STRICT_STATUS", "true"),
        ("PARKPULSE_PARK_DELAY_MS", "0"),
        ("PARKPULSE_MAX_RETRIES", "0"),
    ]);
    let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
    let source = LiveDataSource::default();
    let fetcher = Arc::new(
        StaticFetcher::new()
            .with_json(
                &source.live_request(MK_ENTITY).url,
                fixture("live/magic-kingdom-live.json"),
            )
            .with_json(
                &source.schedule_request(MK_ENTITY).url,
                fixture("live/magic-kingdom-schedule.json"),
            ),
    );
    let store = Arc::new(MemoryStore::new());
    let pipelines = Pipelines::assemble(&config, magic_kingdom_only(), fetcher, store.clone());

    let summary = pipelines
        .park_sync
        .run(7, at("2025-01-01T15:05:00Z"))
        .await
        .unwrap();

    assert!(summary.run.success);
    let rows = store.rows("live_attractions").await;
    let big_thunder = rows
        .iter()
        .find(|r| r["name"] == "Big Thunder Mountain Railroad")
        .expect("attraction stored");
    assert_eq!(big_thunder["operating_status"], "UNKNOWN");
    let space_mountain = rows
        .iter()
        .find(|r| r["name"] == "Space Mountain")
        .expect("attraction stored");
    assert_eq!(space_mountain["operating_status"], "OPERATING");
}
