//! Live wait-time and park schedule feeds.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use parkpulse_core::{
    map_operating_status, AttractionStatus, LiveAttractionSnapshot, LiveParkSnapshot,
    ParkHoursDay, ParkStatus, StatusPolicy,
};
use parkpulse_storage::FetchRequest;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::AdapterError;

#[derive(Debug, Clone)]
pub struct LiveDataSource {
    pub base_url: String,
}

impl Default for LiveDataSource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_URL)
    }
}

impl LiveDataSource {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.themeparks.wiki/v1";
    pub const LIVE_SOURCE_ID: &'static str = "live-data";
    pub const SCHEDULE_SOURCE_ID: &'static str = "park-schedule";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn live_request(&self, entity_id: &str) -> FetchRequest {
        FetchRequest::new(
            Self::LIVE_SOURCE_ID,
            format!("{}/entity/{}/live", self.base_url.trim_end_matches('/'), entity_id),
        )
    }

    pub fn schedule_request(&self, entity_id: &str) -> FetchRequest {
        FetchRequest::new(
            Self::SCHEDULE_SOURCE_ID,
            format!(
                "{}/entity/{}/schedule",
                self.base_url.trim_end_matches('/'),
                entity_id
            ),
        )
    }
}

#[derive(Debug, Deserialize)]
struct LiveFeed {
    #[serde(rename = "liveData")]
    live_data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLiveEntry {
    id: String,
    name: String,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    queue: Option<RawQueue>,
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    #[serde(rename = "STANDBY", default)]
    standby: Option<RawStandby>,
}

#[derive(Debug, Deserialize)]
struct RawStandby {
    #[serde(rename = "waitTime", default)]
    wait_time: Option<f64>,
}

/// One attraction from the live feed, before status mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveAttraction {
    pub id: String,
    pub name: String,
    pub raw_status: String,
    /// Standby minutes; `None` when the feed carries no standby wait.
    pub wait_time: Option<u32>,
}

impl LiveAttraction {
    pub fn into_snapshot(
        self,
        park_id: &str,
        policy: StatusPolicy,
        updated_at: DateTime<Utc>,
    ) -> LiveAttractionSnapshot {
        LiveAttractionSnapshot {
            park_id: park_id.to_string(),
            attraction_id: self.id,
            name: self.name,
            status: AttractionStatus::from_upstream(&self.raw_status),
            operating_status: map_operating_status(&self.raw_status, policy),
            wait_time: self.wait_time,
            updated_at,
        }
    }
}

/// Attractions in a live feed body. Non-attraction entities are dropped and a
/// malformed entry is skipped; a body without a `liveData` array is an error.
pub fn parse_live_attractions<'a>(
    park_id: &'a str,
    body: &str,
) -> Result<impl Iterator<Item = LiveAttraction> + 'a, AdapterError> {
    let feed: LiveFeed = serde_json::from_str(body)
        .map_err(|e| AdapterError::parse(park_id, format!("live data: {e}")))?;

    Ok(feed.live_data.into_iter().filter_map(move |value| {
        let entry = match serde_json::from_value::<RawLiveEntry>(value) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(park_id, error = %err, "skipping malformed live entry");
                return None;
            }
        };
        if !entry
            .entity_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("ATTRACTION"))
        {
            return None;
        }
        let wait_time = entry
            .queue
            .and_then(|q| q.standby)
            .and_then(|s| s.wait_time)
            .filter(|w| w.is_finite() && *w >= 0.0)
            .map(|w| w.round() as u32);
        Some(LiveAttraction {
            id: entry.id,
            name: entry.name,
            raw_status: entry.status.unwrap_or_default(),
            wait_time,
        })
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl TimeWindow {
    /// Half-open: `[start, end)`.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    fn union(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Operating,
    EarlyEntry,
    ExtendedEvening,
    /// Extra hours with no telling description; placed by time of day.
    ExtraHours,
    Other,
}

impl ScheduleKind {
    fn classify(raw_type: &str, description: Option<&str>) -> Self {
        let description = description.unwrap_or_default().to_ascii_lowercase();
        match raw_type.trim().to_ascii_uppercase().as_str() {
            "OPERATING" => Self::Operating,
            kind @ ("EXTRA_HOURS" | "TICKETED_EVENT") => {
                if description.contains("early") {
                    Self::EarlyEntry
                } else if description.contains("evening") || description.contains("extended") {
                    Self::ExtendedEvening
                } else if kind == "EXTRA_HOURS" {
                    Self::ExtraHours
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub date: NaiveDate,
    pub kind: ScheduleKind,
    pub window: TimeWindow,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduleFeed {
    schedule: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScheduleEntry {
    date: NaiveDate,
    #[serde(rename = "type")]
    kind: String,
    opening_time: DateTime<FixedOffset>,
    closing_time: DateTime<FixedOffset>,
    #[serde(default)]
    description: Option<String>,
}

pub fn parse_schedule(park_id: &str, body: &str) -> Result<Vec<ScheduleEntry>, AdapterError> {
    let feed: ScheduleFeed = serde_json::from_str(body)
        .map_err(|e| AdapterError::parse(park_id, format!("schedule: {e}")))?;

    let entries = feed
        .schedule
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<RawScheduleEntry>(value) {
            Ok(raw) => Some(raw),
            Err(err) => {
                debug!(park_id, error = %err, "skipping schedule entry without a time window");
                None
            }
        })
        .filter(|raw| raw.opening_time < raw.closing_time)
        .map(|raw| ScheduleEntry {
            date: raw.date,
            kind: ScheduleKind::classify(&raw.kind, raw.description.as_deref()),
            window: TimeWindow {
                start: raw.opening_time,
                end: raw.closing_time,
            },
            description: raw.description,
        })
        .collect();
    Ok(entries)
}

/// Regular and extra windows for one park-day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayHours {
    pub date: NaiveDate,
    pub regular: Option<TimeWindow>,
    pub early_entry: Option<TimeWindow>,
    pub extended_evening: Option<TimeWindow>,
}

impl DayHours {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            regular: None,
            early_entry: None,
            extended_evening: None,
        }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> ParkStatus {
        let inside = |w: &Option<TimeWindow>| w.is_some_and(|w| w.contains(now));
        if inside(&self.regular) {
            ParkStatus::Operating
        } else if inside(&self.early_entry) || inside(&self.extended_evening) {
            ParkStatus::Limited
        } else {
            ParkStatus::Closed
        }
    }

    pub fn to_record(&self, park_id: &str, synced_at: DateTime<Utc>) -> ParkHoursDay {
        ParkHoursDay {
            park_id: park_id.to_string(),
            date: self.date,
            opening_time: self.regular.map(|w| w.start),
            closing_time: self.regular.map(|w| w.end),
            early_entry_start: self.early_entry.map(|w| w.start),
            early_entry_end: self.early_entry.map(|w| w.end),
            extended_evening_start: self.extended_evening.map(|w| w.start),
            extended_evening_end: self.extended_evening.map(|w| w.end),
            synced_at,
        }
    }
}

fn merge(slot: &mut Option<TimeWindow>, window: TimeWindow) {
    *slot = Some(match *slot {
        Some(existing) => existing.union(window),
        None => window,
    });
}

/// Fold schedule entries into per-day hours. Unlabeled extra hours become early
/// entry when they start before regular opening and extended evening otherwise;
/// on a day without regular hours they are dropped.
pub fn hours_by_day(entries: &[ScheduleEntry]) -> BTreeMap<NaiveDate, DayHours> {
    let mut days: BTreeMap<NaiveDate, DayHours> = BTreeMap::new();

    for entry in entries.iter().filter(|e| e.kind == ScheduleKind::Operating) {
        let day = days
            .entry(entry.date)
            .or_insert_with(|| DayHours::new(entry.date));
        merge(&mut day.regular, entry.window);
    }

    for entry in entries {
        match entry.kind {
            ScheduleKind::EarlyEntry => {
                let day = days
                    .entry(entry.date)
                    .or_insert_with(|| DayHours::new(entry.date));
                merge(&mut day.early_entry, entry.window);
            }
            ScheduleKind::ExtendedEvening => {
                let day = days
                    .entry(entry.date)
                    .or_insert_with(|| DayHours::new(entry.date));
                merge(&mut day.extended_evening, entry.window);
            }
            ScheduleKind::ExtraHours => {
                let Some(day) = days.get_mut(&entry.date) else {
                    continue;
                };
                let Some(regular) = day.regular else {
                    continue;
                };
                if entry.window.start < regular.start {
                    merge(&mut day.early_entry, entry.window);
                } else {
                    merge(&mut day.extended_evening, entry.window);
                }
            }
            ScheduleKind::Operating | ScheduleKind::Other => {}
        }
    }

    days
}

/// The park-local calendar date of `now`, using the UTC offsets the schedule
/// itself publishes. `None` for an empty schedule.
pub fn park_local_date(entries: &[ScheduleEntry], now: DateTime<Utc>) -> Option<NaiveDate> {
    entries
        .iter()
        .find(|e| now.with_timezone(e.window.start.offset()).date_naive() == e.date)
        .or_else(|| entries.first())
        .map(|e| now.with_timezone(e.window.start.offset()).date_naive())
}

pub fn derive_park_status(day: Option<&DayHours>, now: DateTime<Utc>) -> ParkStatus {
    match day {
        Some(day) => day.status_at(now),
        None => ParkStatus::Unknown,
    }
}

/// Current snapshot for a park given its hours for the park-local day.
pub fn park_snapshot(
    park_id: &str,
    name: &str,
    timezone: &str,
    today: Option<&DayHours>,
    now: DateTime<Utc>,
) -> LiveParkSnapshot {
    let window = |pick: fn(&DayHours) -> Option<TimeWindow>| today.and_then(pick);
    let regular = window(|d| d.regular);
    let early = window(|d| d.early_entry);
    let evening = window(|d| d.extended_evening);
    LiveParkSnapshot {
        park_id: park_id.to_string(),
        name: name.to_string(),
        status: derive_park_status(today, now),
        timezone: timezone.to_string(),
        opening_time: regular.map(|w| w.start),
        closing_time: regular.map(|w| w.end),
        early_entry_start: early.map(|w| w.start),
        early_entry_end: early.map(|w| w.end),
        extended_evening_start: evening.map(|w| w.start),
        extended_evening_end: evening.map(|w| w.end),
        updated_at: now,
    }
}

/// Hours for `days` consecutive dates starting at `first`, skipping dates the
/// schedule does not cover.
pub fn hours_window<'a>(
    days: &'a BTreeMap<NaiveDate, DayHours>,
    first: NaiveDate,
    count: u32,
) -> impl Iterator<Item = &'a DayHours> + 'a {
    let last = first + Duration::days(i64::from(count.max(1)) - 1);
    days.range(first..=last).map(|(_, hours)| hours)
}
