//! Core domain model and value-mapping tables for ParkPulse.
//!
//! Every record serializes with field names equal to its store column names,
//! so the same serde shape feeds the upsert writer and JSON responses.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "parkpulse-core";

/// Source tag written on every crowd prediction imported from the calendar scrape.
pub const CROWD_SOURCE_TAG: &str = "thrill-data";

/// Predicted wait minutes -> crowd level. Five inclusive-upper-bound buckets.
pub fn crowd_level(wait_minutes: u32) -> u8 {
    match wait_minutes {
        0..=19 => 2,
        20..=25 => 4,
        26..=31 => 6,
        32..=37 => 8,
        _ => 10,
    }
}

pub fn crowd_description(level: u8) -> &'static str {
    match level {
        0..=2 => "Very Low",
        3..=4 => "Low",
        5..=6 => "Moderate",
        7..=8 => "High",
        _ => "Very High",
    }
}

pub fn crowd_recommendation(level: u8) -> &'static str {
    match level {
        0..=2 => "Great day to visit! Expect minimal waits across the park.",
        3..=4 => "Good day to visit. Most attractions should have manageable waits.",
        5..=6 => "Moderate crowds expected. Arrive early and use Lightning Lane for headliners.",
        7..=8 => "Busy day ahead. Plan for rope drop and prioritize must-do attractions.",
        _ => "Peak crowds expected. Consider another date or arrive well before opening.",
    }
}

/// One park's predicted crowd level for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrowdPrediction {
    pub park_id: String,
    pub date: NaiveDate,
    pub wait_time: u32,
    pub crowd_level: u8,
    pub description: String,
    pub recommendation: String,
    pub source: String,
    pub synced_at: DateTime<Utc>,
}

impl CrowdPrediction {
    /// Derive level, description and recommendation from the raw predicted wait.
    pub fn from_wait_time(
        park_id: impl Into<String>,
        date: NaiveDate,
        wait_time: u32,
        synced_at: DateTime<Utc>,
    ) -> Self {
        let level = crowd_level(wait_time);
        Self {
            park_id: park_id.into(),
            date,
            wait_time,
            crowd_level: level,
            description: crowd_description(level).to_string(),
            recommendation: crowd_recommendation(level).to_string(),
            source: CROWD_SOURCE_TAG.to_string(),
            synced_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkStatus {
    Operating,
    Limited,
    Closed,
    Unknown,
}

/// Attraction status, mirroring the upstream live-data vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttractionStatus {
    Operating,
    Delayed,
    Down,
    TemporaryClosure,
    Unknown,
}

impl AttractionStatus {
    pub fn from_upstream(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OPERATING" => Self::Operating,
            "DELAYED" => Self::Delayed,
            "DOWN" => Self::Down,
            "CLOSED" | "REFURBISHMENT" | "TEMPORARY_CLOSURE" => Self::TemporaryClosure,
            _ => Self::Unknown,
        }
    }
}

/// Canonical operating status stored next to the upstream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingStatus {
    Operating,
    Closed,
    Refurbishment,
    Unknown,
}

/// How unrecognized upstream status strings are mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPolicy {
    /// Unrecognized strings map to `Operating` (legacy behaviour).
    #[default]
    Permissive,
    /// Unrecognized strings map to `Unknown`.
    Strict,
}

pub fn map_operating_status(raw: &str, policy: StatusPolicy) -> OperatingStatus {
    let lower = raw.trim().to_ascii_lowercase();
    match lower.as_str() {
        "operating" | "open" => OperatingStatus::Operating,
        "closed" => OperatingStatus::Closed,
        "refurbishment" => OperatingStatus::Refurbishment,
        _ => match policy {
            StatusPolicy::Permissive => OperatingStatus::Operating,
            StatusPolicy::Strict => OperatingStatus::Unknown,
        },
    }
}

/// Current operational state of one park. Cached per park, overwritten each sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveParkSnapshot {
    pub park_id: String,
    pub name: String,
    pub status: ParkStatus,
    pub timezone: String,
    pub opening_time: Option<DateTime<FixedOffset>>,
    pub closing_time: Option<DateTime<FixedOffset>>,
    pub early_entry_start: Option<DateTime<FixedOffset>>,
    pub early_entry_end: Option<DateTime<FixedOffset>>,
    pub extended_evening_start: Option<DateTime<FixedOffset>>,
    pub extended_evening_end: Option<DateTime<FixedOffset>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveAttractionSnapshot {
    pub park_id: String,
    pub attraction_id: String,
    pub name: String,
    pub status: AttractionStatus,
    pub operating_status: OperatingStatus,
    /// `None` means the feed had no standby data; `Some(0)` is a walk-on.
    pub wait_time: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Published hours for one park-day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkHoursDay {
    pub park_id: String,
    pub date: NaiveDate,
    pub opening_time: Option<DateTime<FixedOffset>>,
    pub closing_time: Option<DateTime<FixedOffset>>,
    pub early_entry_start: Option<DateTime<FixedOffset>>,
    pub early_entry_end: Option<DateTime<FixedOffset>>,
    pub extended_evening_start: Option<DateTime<FixedOffset>>,
    pub extended_evening_end: Option<DateTime<FixedOffset>>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    Clear,
    Cloudy,
    Rain,
    Thunderstorm,
    Snow,
}

impl WeatherCondition {
    /// Map a raw feed condition (`"Clouds"`, `"Mist"`, ...) onto the app vocabulary.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "clear" => Self::Clear,
            "clouds" | "mist" | "fog" | "haze" | "smoke" | "dust" => Self::Cloudy,
            "rain" | "drizzle" => Self::Rain,
            "thunderstorm" => Self::Thunderstorm,
            "snow" => Self::Snow,
            _ => Self::Clear,
        }
    }
}

/// One location's reduced daily forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherForecastDay {
    pub location_id: String,
    pub forecast_date: NaiveDate,
    pub temp_high: i32,
    pub temp_low: i32,
    pub feels_like: i32,
    pub humidity: i32,
    pub precipitation_chance: i32,
    pub precipitation_amount: f64,
    pub condition: WeatherCondition,
    pub description: String,
    pub wind_speed: i32,
    pub wind_direction: i32,
    pub uv_index: i32,
    pub visibility: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Inclusive span of calendar dates covered by written records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn include(&mut self, date: NaiveDate) {
        self.start = self.start.min(date);
        self.end = self.end.max(date);
    }

    /// Widen `range` to cover `date`, starting a new range when empty.
    pub fn extend(range: &mut Option<Self>, date: NaiveDate) {
        match range {
            Some(r) => r.include(date),
            None => *range = Some(Self::single(date)),
        }
    }
}
