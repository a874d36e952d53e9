//! Crowd-calendar page scraping.
//!
//! The calendar markup belongs to a third party and changes without notice, so
//! the extraction pattern lives behind [`CalendarStrategy`]. Each strategy is
//! versioned; a markup change means a new strategy, not a new parser.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use parkpulse_core::CrowdPrediction;
use parkpulse_storage::FetchRequest;
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::warn;

use crate::{snippet_of, text_or_none, AdapterError};

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

pub fn month_from_abbrev(abbrev: &str) -> Option<u32> {
    let lower = abbrev.trim().to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|idx| idx as u32 + 1)
}

/// One validated day cell, before the year is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarCell {
    pub wait_minutes: u32,
    pub month: u32,
    pub day: u32,
    pub displayed: String,
}

impl CalendarCell {
    pub fn date(&self, year: i32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("malformed {field}: {value:?}")]
    Malformed { field: &'static str, value: String },
    #[error("unrecognized month abbreviation {0:?}")]
    UnknownMonth(String),
    #[error("no such date: month {month} day {day}")]
    InvalidDate { month: u32, day: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFragment {
    pub snippet: String,
    pub reason: SkipReason,
}

pub type CellResult = Result<CalendarCell, SkippedFragment>;

pub trait CalendarStrategy: Send + Sync {
    fn version(&self) -> &'static str;

    /// Every candidate day fragment in document order, validated or skipped.
    fn cells<'a>(&'a self, document: &'a str) -> Box<dyn Iterator<Item = CellResult> + 'a>;
}

/// Plain unsigned decimal; rejects signs and anything `u32::from_str` would otherwise accept.
fn ascii_number(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn validate_cell(
    wait: Option<&str>,
    month: Option<&str>,
    day: Option<&str>,
    displayed: Option<&str>,
    raw: &str,
) -> CellResult {
    let skip = |reason| SkippedFragment {
        snippet: snippet_of(raw),
        reason,
    };

    let wait = wait
        .and_then(text_or_none)
        .ok_or_else(|| skip(SkipReason::MissingField("wait minutes")))?;
    let month = month
        .and_then(text_or_none)
        .ok_or_else(|| skip(SkipReason::MissingField("month")))?;
    let day = day
        .and_then(text_or_none)
        .ok_or_else(|| skip(SkipReason::MissingField("day")))?;
    let displayed = displayed
        .and_then(text_or_none)
        .ok_or_else(|| skip(SkipReason::MissingField("displayed value")))?;

    let wait_minutes = ascii_number(&wait).ok_or_else(|| {
        skip(SkipReason::Malformed {
            field: "wait minutes",
            value: wait.clone(),
        })
    })?;
    let month_no =
        month_from_abbrev(&month).ok_or_else(|| skip(SkipReason::UnknownMonth(month.clone())))?;
    let day_no = ascii_number(&day)
        .filter(|d| (1..=31).contains(d))
        .ok_or_else(|| {
            skip(SkipReason::Malformed {
                field: "day",
                value: day.clone(),
            })
        })?;
    if ascii_number(&displayed).is_none() {
        return Err(skip(SkipReason::Malformed {
            field: "displayed value",
            value: displayed,
        }));
    }

    Ok(CalendarCell {
        wait_minutes,
        month: month_no,
        day: day_no,
        displayed,
    })
}

fn title_attribute_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)title\s*=\s*['"]\s*predicted wait time of\s*(?P<wait>[^\s'"<>]*)\s*minutes on\s*(?P<month>[^\s'"<>\d]*)\s*(?P<day>[^\s'"<>]*)\s*['"][^>]*>(?P<value>[^<]*)"#,
        )
        .expect("title attribute pattern is valid")
    })
}

fn title_text_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*predicted wait time of\s*(?P<wait>\S*?)\s*minutes on\s*(?P<month>[^\s\d]*)\s*(?P<day>\S*)\s*$",
        )
        .expect("title text pattern is valid")
    })
}

/// Regex over raw markup: `title='Predicted wait time of N minutes on Mon DD'>value<`.
///
/// Works on fragments as well as full pages and never builds a DOM.
#[derive(Debug, Clone, Copy, Default)]
pub struct TitleAttributeStrategy;

impl CalendarStrategy for TitleAttributeStrategy {
    fn version(&self) -> &'static str {
        "title-attr-v1"
    }

    fn cells<'a>(&'a self, document: &'a str) -> Box<dyn Iterator<Item = CellResult> + 'a> {
        Box::new(
            title_attribute_pattern()
                .captures_iter(document)
                .map(|caps| {
                    let field = |name| caps.name(name).map(|m| m.as_str());
                    let raw = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                    validate_cell(field("wait"), field("month"), field("day"), field("value"), raw)
                }),
        )
    }
}

/// DOM walk over every element carrying a `title`, using the element text as the
/// displayed value. Tolerates attribute reordering and nested markup.
#[derive(Debug, Clone)]
pub struct DomSelectorStrategy {
    selector: Selector,
}

impl DomSelectorStrategy {
    pub fn new() -> Result<Self, AdapterError> {
        let selector =
            Selector::parse("[title]").map_err(|e| AdapterError::Message(e.to_string()))?;
        Ok(Self { selector })
    }
}

impl CalendarStrategy for DomSelectorStrategy {
    fn version(&self) -> &'static str {
        "dom-title-v1"
    }

    fn cells<'a>(&'a self, document: &'a str) -> Box<dyn Iterator<Item = CellResult> + 'a> {
        let html = Html::parse_document(document);
        let cells = html
            .select(&self.selector)
            .filter_map(|el| {
                let title = el.value().attr("title")?;
                let caps = title_text_pattern().captures(title)?;
                let field = |name| caps.name(name).map(|m| m.as_str());
                let displayed = el.text().collect::<String>();
                Some(validate_cell(
                    field("wait"),
                    field("month"),
                    field("day"),
                    Some(displayed.as_str()),
                    &el.html(),
                ))
            })
            .collect::<Vec<_>>();
        Box::new(cells.into_iter())
    }
}

#[derive(Debug, Clone)]
pub struct CalendarParse {
    pub strategy: &'static str,
    pub predictions: Vec<CrowdPrediction>,
    pub skipped: Vec<SkippedFragment>,
}

pub struct CalendarParser {
    strategy: Box<dyn CalendarStrategy>,
}

impl Default for CalendarParser {
    fn default() -> Self {
        Self::new(Box::new(TitleAttributeStrategy))
    }
}

impl CalendarParser {
    pub fn new(strategy: Box<dyn CalendarStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy_version(&self) -> &'static str {
        self.strategy.version()
    }

    /// Dated cells for `year`; impossible dates (e.g. Feb 30) become skips.
    pub fn entries<'a>(
        &'a self,
        html: &'a str,
        year: i32,
    ) -> impl Iterator<Item = Result<(NaiveDate, CalendarCell), SkippedFragment>> + 'a {
        self.strategy.cells(html).map(move |cell| {
            let cell = cell?;
            match cell.date(year) {
                Some(date) => Ok((date, cell)),
                None => Err(SkippedFragment {
                    snippet: format!("{} {}", cell.month, cell.day),
                    reason: SkipReason::InvalidDate {
                        month: cell.month,
                        day: cell.day,
                    },
                }),
            }
        })
    }

    /// Lazily yields predictions, logging and dropping malformed fragments.
    pub fn predictions<'a>(
        &'a self,
        html: &'a str,
        park_id: &'a str,
        year: i32,
        synced_at: DateTime<Utc>,
    ) -> impl Iterator<Item = CrowdPrediction> + 'a {
        self.entries(html, year).filter_map(move |entry| match entry {
            Ok((date, cell)) => Some(CrowdPrediction::from_wait_time(
                park_id,
                date,
                cell.wait_minutes,
                synced_at,
            )),
            Err(skipped) => {
                warn!(park_id, reason = %skipped.reason, snippet = %skipped.snippet, "skipping calendar fragment");
                None
            }
        })
    }

    pub fn parse(
        &self,
        html: &str,
        park_id: &str,
        year: i32,
        synced_at: DateTime<Utc>,
    ) -> CalendarParse {
        let mut predictions = Vec::new();
        let mut skipped = Vec::new();
        for entry in self.entries(html, year) {
            match entry {
                Ok((date, cell)) => predictions.push(CrowdPrediction::from_wait_time(
                    park_id,
                    date,
                    cell.wait_minutes,
                    synced_at,
                )),
                Err(skip) => {
                    warn!(park_id, reason = %skip.reason, snippet = %skip.snippet, "skipping calendar fragment");
                    skipped.push(skip);
                }
            }
        }
        CalendarParse {
            strategy: self.strategy.version(),
            predictions,
            skipped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalendarSource {
    pub base_url: String,
}

impl Default for CalendarSource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_URL)
    }
}

impl CalendarSource {
    pub const SOURCE_ID: &'static str = "crowd-calendar";
    pub const DEFAULT_BASE_URL: &'static str =
        "https://www.thrill-data.com/trip-planning/crowd-calendar";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn request(&self, calendar_slug: &str, year: i32) -> FetchRequest {
        FetchRequest::new(
            Self::SOURCE_ID,
            format!(
                "{}/{}/calendar/{}",
                self.base_url.trim_end_matches('/'),
                calendar_slug,
                year
            ),
        )
    }
}
