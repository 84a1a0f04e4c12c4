use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Label used for records with an empty district or state.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Row as read from the source table, before date parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based line number in the source file (header is line 1).
    pub line: u64,
    pub date: String,
    pub district: String,
    pub state: String,
    pub enrolments: RawCount,
}

/// Enrolment count as read. Empty cells never reach here; they count as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawCount {
    Valid(u64),
    /// Text of a cell that is not a non-negative integer.
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrolmentRecord {
    pub date: NaiveDate,
    pub district: String,
    pub state: String,
    pub enrolments: u64,
}

impl EnrolmentRecord {
    pub fn new(date: NaiveDate, district: &str, state: &str, enrolments: u64) -> Self {
        Self {
            date,
            district: normalize_label(district),
            state: normalize_label(state),
            enrolments,
        }
    }
}

pub fn normalize_label(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        UNKNOWN_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Start of the period containing `date`. Weeks start on Monday.
    pub fn period_start(self, date: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Day => date,
            Granularity::Week => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            Granularity::Month => date - Duration::days(date.day0() as i64),
        }
    }

    /// Start of the period following the one starting at `period_start`.
    pub fn next(self, period_start: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Day => period_start + Duration::days(1),
            Granularity::Week => period_start + Duration::days(7),
            Granularity::Month => period_start
                .checked_add_months(Months::new(1))
                .unwrap_or(period_start + Duration::days(31)),
        }
    }

    /// Start of the period `steps` periods after `period_start`.
    pub fn advance(self, period_start: NaiveDate, steps: usize) -> NaiveDate {
        match self {
            Granularity::Day => period_start + Duration::days(steps as i64),
            Granularity::Week => period_start + Duration::days(7 * steps as i64),
            Granularity::Month => (0..steps).fold(period_start, |date, _| self.next(date)),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        };
        f.write_str(label)
    }
}

impl FromStr for Granularity {
    type Err = AnalysisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            other => Err(AnalysisError::invalid(
                "granularity",
                format!("'{other}' is not one of day, week, month"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    None,
    District,
    State,
}

impl GroupBy {
    pub const OVERALL_KEY: &'static str = "all";

    pub fn key(self, record: &EnrolmentRecord) -> &str {
        match self {
            GroupBy::None => Self::OVERALL_KEY,
            GroupBy::District => &record.district,
            GroupBy::State => &record.state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub period_start: NaiveDate,
    pub enrolments: u64,
    /// False for periods zero-filled by the aggregator.
    pub observed: bool,
}

/// Contiguous, ascending per-period totals for one grouping key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedSeries {
    pub key: String,
    pub granularity: Granularity,
    pub points: Vec<SeriesPoint>,
}

impl AggregatedSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.enrolments as f64).collect()
    }

    pub fn total(&self) -> u64 {
        self.points.iter().map(|p| p.enrolments).sum()
    }

    /// Periods among the last `window` that had at least one row.
    pub fn observed_in_last(&self, window: usize) -> usize {
        let start = self.points.len().saturating_sub(window);
        self.points[start..].iter().filter(|p| p.observed).count()
    }

    pub fn last_period(&self) -> Option<NaiveDate> {
        self.points.last().map(|p| p.period_start)
    }

    /// Builds a series from consecutive values starting at `start`.
    pub fn from_values(
        key: &str,
        granularity: Granularity,
        start: NaiveDate,
        values: &[u64],
    ) -> Self {
        let first = granularity.period_start(start);
        let points = values
            .iter()
            .enumerate()
            .map(|(i, &enrolments)| SeriesPoint {
                period_start: granularity.advance(first, i),
                enrolments,
                observed: true,
            })
            .collect();
        Self {
            key: key.to_string(),
            granularity,
            points,
        }
    }
}
