//! Axum trigger surface for the sync pipelines.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Datelike, Utc};
use parkpulse_core::DateRange;
use parkpulse_sync::{ConfigError, Pipelines, RunSummary, DEFAULT_SYNC_DAYS};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "parkpulse-web";

#[derive(Clone)]
pub struct AppState {
    pub pipelines: Pipelines,
}

impl AppState {
    pub fn new(pipelines: Pipelines) -> Self {
        Self { pipelines }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ImportRequest {
    year: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    days: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportResponse {
    success: bool,
    run_id: String,
    records_imported: usize,
    parks_processed: Vec<String>,
    errors: Vec<String>,
    date_range: Option<DateRange>,
    duration: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParkSyncResponse {
    success: bool,
    run_id: String,
    attractions_count: usize,
    records_written: usize,
    parks_processed: Vec<String>,
    errors: Vec<String>,
    date_range: Option<DateRange>,
    duration: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WeatherResponse {
    success: bool,
    run_id: String,
    days_written: usize,
    locations_processed: Vec<String>,
    errors: Vec<String>,
    date_range: Option<DateRange>,
    duration: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/import-thrill-data", post(import_handler))
        .route("/sync-parks", get(sync_parks_handler).post(sync_parks_handler))
        .route("/fetch-weather", post(fetch_weather_handler))
        .with_state(Arc::new(state))
}

/// Serve until ctrl-c.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn import_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ImportRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    let year = request.year.unwrap_or_else(|| Utc::now().year());
    info!(year, "crowd import triggered");
    match state.pipelines.crowd_import.run(year).await {
        Ok(summary) => Json(ImportResponse {
            success: summary.success,
            run_id: summary.run_id.to_string(),
            records_imported: summary.records_written,
            duration: summary.duration_label(),
            parks_processed: summary.processed,
            errors: summary.errors,
            date_range: summary.date_range,
        })
        .into_response(),
        Err(err) => run_error(err),
    }
}

async fn sync_parks_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: SyncRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    let days = request.days.unwrap_or(DEFAULT_SYNC_DAYS);
    info!(days, "park sync triggered");
    match state.pipelines.park_sync.run(days, Utc::now()).await {
        Ok(summary) => {
            let run = summary.run;
            Json(ParkSyncResponse {
                success: run.success,
                run_id: run.run_id.to_string(),
                attractions_count: summary.attractions_count,
                records_written: run.records_written,
                duration: run.duration_label(),
                parks_processed: run.processed,
                errors: run.errors,
                date_range: run.date_range,
            })
            .into_response()
        }
        Err(err) => run_error(err),
    }
}

async fn fetch_weather_handler(State(state): State<Arc<AppState>>) -> Response {
    info!("weather fetch triggered");
    match state.pipelines.weather.run(Utc::now()).await {
        Ok(summary) => weather_response(summary),
        Err(err) => run_error(err),
    }
}

fn weather_response(summary: RunSummary) -> Response {
    Json(WeatherResponse {
        success: summary.success,
        run_id: summary.run_id.to_string(),
        days_written: summary.records_written,
        duration: summary.duration_label(),
        locations_processed: summary.processed,
        errors: summary.errors,
        date_range: summary.date_range,
    })
    .into_response()
}

/// An empty body selects the defaults.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| bad_request(format!("invalid JSON body: {err}")))
}

fn run_error(err: ConfigError) -> Response {
    if err.is_invalid_input() {
        bad_request(err.to_string())
    } else {
        server_error(anyhow::Error::new(err))
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "run could not start");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "success": false,
            "error": err.to_string(),
            "stack": format!("{err:?}"),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use parkpulse_storage::StaticFetcher;
    use parkpulse_sync::{MemoryStore, ParkRegistry, SyncConfig};
    use serde_json::Value;
    use tower::ServiceExt;

    const CALENDAR_URL: &str =
        "https://www.thrill-data.com/trip-planning/crowd-calendar/magic-kingdom/calendar/2025";

    fn calendar_html() -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/crowd-calendar/magic-kingdom-2025.html");
        std::fs::read_to_string(path).unwrap()
    }

    fn test_app(fetcher: StaticFetcher) -> (Router, Arc<MemoryStore>) {
        let vars = HashMap::from([
            ("PARKPULSE_PARK_DELAY_MS", "0"),
            ("PARKPULSE_MAX_RETRIES", "0"),
        ]);
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        let mut registry = ParkRegistry::builtin().unwrap();
        registry.parks.retain(|p| p.id == "magic-kingdom");
        let store = Arc::new(MemoryStore::new());
        let pipelines =
            Pipelines::assemble(&config, Arc::new(registry), Arc::new(fetcher), store.clone());
        (app(AppState::new(pipelines)), store)
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = test_app(StaticFetcher::new());
        let resp = app.oneshot(request("GET", "/health", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn import_returns_camel_case_summary() {
        let (app, store) =
            test_app(StaticFetcher::new().with_html(CALENDAR_URL, calendar_html()));
        let resp = app
            .oneshot(request("POST", "/import-thrill-data", r#"{"year": 2025}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["recordsImported"], 7);
        assert_eq!(body["parksProcessed"][0], "Magic Kingdom");
        assert!(body["errors"].as_array().unwrap().is_empty());
        assert!(body["dateRange"]["start"].is_string());
        assert!(body["duration"].as_str().unwrap().ends_with("ms"));
        assert_eq!(store.count("park_crowd_predictions").await, 7);
    }

    #[tokio::test]
    async fn import_rejects_year_beyond_window() {
        let (app, store) =
            test_app(StaticFetcher::new().with_html(CALENDAR_URL, calendar_html()));
        let year = Utc::now().year() + 6;
        let resp = app
            .oneshot(request(
                "POST",
                "/import-thrill-data",
                &format!(r#"{{"year": {year}}}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["success"], false);
        assert_eq!(store.count("park_crowd_predictions").await, 0);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let (app, _) = test_app(StaticFetcher::new());
        let resp = app
            .oneshot(request("POST", "/import-thrill-data", "{year:"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn strict_endpoints_reject_get() {
        let (app, _) = test_app(StaticFetcher::new());
        let resp = app
            .clone()
            .oneshot(request("GET", "/import-thrill-data", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        let resp = app
            .oneshot(request("GET", "/fetch-weather", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn sync_parks_accepts_get_and_reports_failures() {
        let (app, _) = test_app(StaticFetcher::new());
        let resp = app
            .oneshot(request("GET", "/sync-parks", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["attractionsCount"], 0);
        assert!(body["errors"][0]
            .as_str()
            .unwrap()
            .starts_with("Magic Kingdom: fetch failed"));
        assert!(body["dateRange"].is_null());
    }

    #[tokio::test]
    async fn sync_parks_rejects_days_out_of_range() {
        let (app, _) = test_app(StaticFetcher::new());
        let resp = app
            .oneshot(request("POST", "/sync-parks", r#"{"days": 31}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn weather_without_key_is_server_error_with_stack() {
        let (app, _) = test_app(StaticFetcher::new());
        let resp = app
            .oneshot(request("POST", "/fetch-weather", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("OPENWEATHER_API_KEY"));
        assert!(!body["stack"].as_str().unwrap().is_empty());
    }
}
