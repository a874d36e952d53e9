//! Source adapters: request builders, parsers and normalizers for each upstream feed.

use thiserror::Error;

pub mod calendar;
pub mod live;
pub mod weather;

pub use calendar::{
    month_from_abbrev, CalendarCell, CalendarParse, CalendarParser, CalendarSource,
    CalendarStrategy, DomSelectorStrategy, SkipReason, SkippedFragment, TitleAttributeStrategy,
};
pub use live::{
    derive_park_status, hours_by_day, hours_window, park_local_date, park_snapshot,
    parse_live_attractions, parse_schedule, DayHours, LiveAttraction, LiveDataSource,
    ScheduleEntry, ScheduleKind, TimeWindow,
};
pub use weather::{aggregate_daily, parse_weather_samples, WeatherSample, WeatherSource};

pub const CRATE_NAME: &str = "parkpulse-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("could not parse {entity}: {message}")]
    Parse { entity: String, message: String },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn parse(entity: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            entity: entity.to_string(),
            message: message.into(),
        }
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn snippet_of(text: &str) -> String {
    const MAX: usize = 120;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippets_are_trimmed_and_bounded() {
        assert_eq!(snippet_of("  short  "), "short");
        let long = "x".repeat(300);
        let s = snippet_of(&long);
        assert!(s.ends_with("..."));
        assert_eq!(s.len(), 123);
    }

    #[test]
    fn rounding_helper() {
        assert_eq!(round_to(4.97097, 1), 5.0);
        assert_eq!(round_to(0.026247, 2), 0.03);
        assert_eq!(text_or_none("   "), None);
    }
}
