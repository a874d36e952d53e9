//! 3-hourly forecast feed parsing and reduction to daily summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use parkpulse_core::{WeatherCondition, WeatherForecastDay};
use parkpulse_storage::FetchRequest;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{round_to, AdapterError};

const METRES_PER_MILE: f64 = 1609.344;
const MM_PER_INCH: f64 = 25.4;

#[derive(Debug, Clone)]
pub struct WeatherSource {
    pub base_url: String,
    pub api_key: String,
}

impl WeatherSource {
    pub const SOURCE_ID: &'static str = "weather-forecast";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openweathermap.org/data/2.5";

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn request(&self, lat: f64, lon: f64) -> FetchRequest {
        FetchRequest::new(
            Self::SOURCE_ID,
            format!(
                "{}/forecast?lat={lat}&lon={lon}&appid={}&units=imperial",
                self.base_url.trim_end_matches('/'),
                self.api_key
            ),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ForecastFeed {
    list: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawSample {
    dt: i64,
    main: RawMain,
    #[serde(default)]
    weather: Vec<RawCondition>,
    #[serde(default)]
    wind: Option<RawWind>,
    #[serde(default)]
    visibility: Option<f64>,
    #[serde(default)]
    pop: Option<f64>,
    #[serde(default)]
    rain: Option<RawAccumulation>,
    #[serde(default)]
    snow: Option<RawAccumulation>,
    #[serde(default)]
    uvi: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawMain {
    temp: f64,
    #[serde(default)]
    feels_like: Option<f64>,
    #[serde(default)]
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct RawCondition {
    main: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawWind {
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    deg: f64,
}

#[derive(Debug, Deserialize)]
struct RawAccumulation {
    #[serde(rename = "3h", default)]
    three_hour: f64,
}

/// One 3-hour forecast point, imperial units except where noted.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherSample {
    pub timestamp: DateTime<Utc>,
    pub temp: f64,
    pub feels_like: f64,
    pub humidity: f64,
    pub condition: String,
    pub description: String,
    pub wind_speed: f64,
    pub wind_deg: f64,
    pub visibility_m: Option<f64>,
    /// Probability of precipitation, 0-1.
    pub pop: f64,
    pub precipitation_mm: f64,
    pub uvi: Option<f64>,
}

impl TryFrom<RawSample> for WeatherSample {
    type Error = String;

    fn try_from(raw: RawSample) -> Result<Self, Self::Error> {
        let timestamp = DateTime::from_timestamp(raw.dt, 0)
            .ok_or_else(|| format!("timestamp {} out of range", raw.dt))?;
        let (condition, description) = raw
            .weather
            .into_iter()
            .next()
            .map(|c| (c.main, c.description))
            .unwrap_or_default();
        let wind = raw.wind.unwrap_or(RawWind {
            speed: 0.0,
            deg: 0.0,
        });
        let accumulated = |a: Option<RawAccumulation>| a.map(|a| a.three_hour).unwrap_or(0.0);
        Ok(Self {
            timestamp,
            temp: raw.main.temp,
            feels_like: raw.main.feels_like.unwrap_or(raw.main.temp),
            humidity: raw.main.humidity,
            condition,
            description,
            wind_speed: wind.speed,
            wind_deg: wind.deg,
            visibility_m: raw.visibility,
            pop: raw.pop.unwrap_or(0.0).clamp(0.0, 1.0),
            precipitation_mm: accumulated(raw.rain) + accumulated(raw.snow),
            uvi: raw.uvi,
        })
    }
}

pub fn parse_weather_samples<'a>(
    location_id: &'a str,
    body: &str,
) -> Result<impl Iterator<Item = WeatherSample> + 'a, AdapterError> {
    let feed: ForecastFeed = serde_json::from_str(body)
        .map_err(|e| AdapterError::parse(location_id, format!("forecast: {e}")))?;

    Ok(feed.list.into_iter().filter_map(move |value| {
        let sample = serde_json::from_value::<RawSample>(value)
            .map_err(|e| e.to_string())
            .and_then(WeatherSample::try_from);
        match sample {
            Ok(sample) => Some(sample),
            Err(err) => {
                warn!(location_id, error = %err, "skipping malformed forecast sample");
                None
            }
        }
    }))
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

fn dominant_condition(samples: &[WeatherSample]) -> (&str, &str) {
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for sample in samples {
        match tally
            .iter_mut()
            .find(|(c, _)| c.eq_ignore_ascii_case(&sample.condition))
        {
            Some((_, count)) => *count += 1,
            None => tally.push((sample.condition.as_str(), 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (condition, count) in tally {
        if best.map_or(true, |(_, n)| count > n) {
            best = Some((condition, count));
        }
    }
    let condition = best.map(|(c, _)| c).unwrap_or_default();
    let description = samples
        .iter()
        .find(|s| s.condition.eq_ignore_ascii_case(condition))
        .map(|s| s.description.as_str())
        .unwrap_or_default();
    (condition, description)
}

fn reduce_day(
    location_id: &str,
    date: NaiveDate,
    samples: &[WeatherSample],
    fetched_at: DateTime<Utc>,
) -> WeatherForecastDay {
    let whole = |v: Option<f64>| v.map(|v| v.round() as i32).unwrap_or(0);
    let temps = || samples.iter().map(|s| s.temp);
    let high = temps().fold(f64::NEG_INFINITY, f64::max);
    let low = temps().fold(f64::INFINITY, f64::min);
    let max_pop = samples.iter().map(|s| s.pop).fold(0.0, f64::max);
    let visibility_m = mean(samples.iter().filter_map(|s| s.visibility_m)).unwrap_or(0.0);
    let precipitation_mm = mean(samples.iter().map(|s| s.precipitation_mm)).unwrap_or(0.0);
    let (condition, description) = dominant_condition(samples);

    WeatherForecastDay {
        location_id: location_id.to_string(),
        forecast_date: date,
        temp_high: high.round() as i32,
        temp_low: low.round() as i32,
        feels_like: whole(mean(samples.iter().map(|s| s.feels_like))),
        humidity: whole(mean(samples.iter().map(|s| s.humidity))),
        precipitation_chance: (max_pop * 100.0).round() as i32,
        precipitation_amount: round_to(precipitation_mm / MM_PER_INCH, 2),
        condition: WeatherCondition::from_raw(condition),
        description: description.to_string(),
        wind_speed: whole(mean(samples.iter().map(|s| s.wind_speed))),
        wind_direction: whole(mean(samples.iter().map(|s| s.wind_deg))),
        uv_index: whole(mean(samples.iter().filter_map(|s| s.uvi))),
        visibility: round_to(visibility_m / METRES_PER_MILE, 1),
        fetched_at,
    }
}

/// Reduce samples to one summary per UTC calendar date, sorted by date. Dates
/// without samples never appear.
pub fn aggregate_daily(
    location_id: &str,
    samples: impl IntoIterator<Item = WeatherSample>,
    fetched_at: DateTime<Utc>,
) -> Vec<WeatherForecastDay> {
    let mut by_date: BTreeMap<NaiveDate, Vec<WeatherSample>> = BTreeMap::new();
    for sample in samples {
        by_date
            .entry(sample.timestamp.date_naive())
            .or_default()
            .push(sample);
    }
    by_date
        .iter()
        .map(|(date, day)| reduce_day(location_id, *date, day, fetched_at))
        .collect()
}
