//! Temporal aggregation: raw rows to contiguous per-period series.
//!
//! Gap filling happens here and only here. Every series handed to the
//! engines covers each period between its first and last period exactly
//! once, with zero for periods that had no rows.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

use crate::error::{AnalysisError, Result};
use crate::models::{
    AggregatedSeries, EnrolmentRecord, Granularity, GroupBy, RawCount, RawRecord, RejectedRow,
    SeriesPoint,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParsePolicy {
    /// Fail on the first row with an unparseable date or count.
    Strict,
    /// Exclude such rows and report them.
    #[default]
    SkipMalformed,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedRecords {
    pub records: Vec<EnrolmentRecord>,
    pub rejected: Vec<RejectedRow>,
}

/// Which periods each group's series covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    /// From the group's first to its last observed period.
    Observed,
    /// From the group's first observed period through the period containing this date.
    Through(NaiveDate),
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.date_naive());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|timestamp| timestamp.date())
}

pub fn parse_records(raw: &[RawRecord], policy: ParsePolicy) -> Result<ParsedRecords> {
    let mut parsed = ParsedRecords::default();

    for row in raw {
        match validate(row) {
            Ok(record) => parsed.records.push(record),
            Err(rejected) if policy == ParsePolicy::Strict => {
                return Err(AnalysisError::MalformedInput {
                    line: Some(rejected.line),
                    reason: format!("{} '{}'", rejected.reason, rejected.value),
                });
            }
            Err(rejected) => parsed.rejected.push(rejected),
        }
    }

    if !parsed.rejected.is_empty() {
        warn!(
            rejected = parsed.rejected.len(),
            accepted = parsed.records.len(),
            "excluded malformed rows"
        );
    }

    Ok(parsed)
}

fn validate(row: &RawRecord) -> std::result::Result<EnrolmentRecord, RejectedRow> {
    let reject = |value: &str, reason: &str| RejectedRow {
        line: row.line,
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let date = parse_date(&row.date).ok_or_else(|| reject(&row.date, "unparseable date"))?;
    let enrolments = match &row.enrolments {
        RawCount::Valid(count) => *count,
        RawCount::Invalid(text) => return Err(reject(text, "invalid enrolment count")),
    };
    Ok(EnrolmentRecord::new(date, &row.district, &row.state, enrolments))
}

/// Aggregates records into one contiguous series per group key.
pub fn aggregate(
    records: &[EnrolmentRecord],
    granularity: Granularity,
    group_by: GroupBy,
    span: Span,
) -> BTreeMap<String, AggregatedSeries> {
    let mut totals: BTreeMap<String, BTreeMap<NaiveDate, u64>> = BTreeMap::new();

    for record in records {
        let period = granularity.period_start(record.date);
        *totals
            .entry(group_by.key(record).to_string())
            .or_default()
            .entry(period)
            .or_insert(0) += record.enrolments;
    }

    totals
        .into_iter()
        .filter_map(|(key, periods)| {
            let first = *periods.keys().next()?;
            let observed_last = *periods.keys().next_back()?;
            let last = match span {
                Span::Observed => observed_last,
                Span::Through(end) => granularity.period_start(end).max(observed_last),
            };

            let mut points = Vec::new();
            let mut current = first;
            while current <= last {
                let total = periods.get(&current).copied();
                points.push(SeriesPoint {
                    period_start: current,
                    enrolments: total.unwrap_or(0),
                    observed: total.is_some(),
                });
                current = granularity.next(current);
            }

            debug!(
                group = %key,
                periods = points.len(),
                observed = periods.len(),
                "aggregated series"
            );
            Some((
                key.clone(),
                AggregatedSeries {
                    key,
                    granularity,
                    points,
                },
            ))
        })
        .collect()
}

/// Aggregates all records into a single series keyed [`GroupBy::OVERALL_KEY`].
pub fn aggregate_overall(
    records: &[EnrolmentRecord],
    granularity: Granularity,
) -> Option<AggregatedSeries> {
    aggregate(records, granularity, GroupBy::None, Span::Observed)
        .remove(GroupBy::OVERALL_KEY)
}
