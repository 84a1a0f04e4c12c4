use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::aggregate::{aggregate, Span};
use crate::error::{AnalysisError, Result};
use crate::models::{AggregatedSeries, EnrolmentRecord, Granularity, GroupBy};
use crate::stats::{self, EPSILON};

pub const DEFAULT_WINDOW_DAYS: usize = 30;
pub const DEFAULT_THRESHOLD_PERCENTILE: f64 = 75.0;
pub const DEFAULT_CAPACITY_PER_CENTRE: f64 = 100.0;
pub const DEFAULT_SURGE_THRESHOLD: f64 = 2.0;

/// Pressure score = VOLUME_WEIGHT * volume + TREND_WEIGHT * trend, where
/// volume is the percentile rank of the rolling mean scaled to [0, 1] and
/// trend is the trend percentage min-max scaled to [0, 1] across districts.
pub const VOLUME_WEIGHT: f64 = 0.6;
pub const TREND_WEIGHT: f64 = 0.4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistrictMetricsRow {
    pub district: String,
    pub window_periods: usize,
    pub latest_enrolments: u64,
    pub rolling_mean: f64,
    pub rolling_std: f64,
    pub percentile_rank: f64,
    /// `None` when the first window averaged zero.
    pub trend_pct: Option<f64>,
    pub pressure_score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedGroup {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistrictMetrics {
    pub window_days: usize,
    pub rows: Vec<DistrictMetricsRow>,
    pub skipped: Vec<SkippedGroup>,
}

/// Utilization of one district in one period. With no known centre count the
/// district is assumed to run a single centre, so the figure is an estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityRow {
    pub district: String,
    pub period: NaiveDate,
    pub enrolments: u64,
    pub centres: u32,
    pub centre_count_estimated: bool,
    pub capacity: f64,
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurgeEvent {
    pub district: String,
    pub period: NaiveDate,
    pub observed_value: u64,
    pub baseline_value: f64,
    pub ratio: f64,
}

pub struct DistrictPressureAnalyzer {
    series: BTreeMap<String, AggregatedSeries>,
    window_days: usize,
    centre_counts: HashMap<String, u32>,
}

impl DistrictPressureAnalyzer {
    pub fn new(records: &[EnrolmentRecord]) -> Self {
        Self::with_granularity(records, Granularity::Day)
    }

    /// Every district's series runs through the latest date in the dataset,
    /// so districts that stopped reporting carry zeros in their trailing window.
    /// Those zeros never count as observations. Windows are counted in
    /// periods of `granularity`.
    pub fn with_granularity(records: &[EnrolmentRecord], granularity: Granularity) -> Self {
        let series = match records.iter().map(|r| r.date).max() {
            Some(end) => aggregate(records, granularity, GroupBy::District, Span::Through(end)),
            None => BTreeMap::new(),
        };
        Self::from_series(series)
    }

    pub fn from_series(series: BTreeMap<String, AggregatedSeries>) -> Self {
        Self {
            series,
            window_days: DEFAULT_WINDOW_DAYS,
            centre_counts: HashMap::new(),
        }
    }

    pub fn with_window(mut self, window_days: usize) -> Self {
        self.window_days = window_days;
        self
    }

    pub fn with_centre_counts(mut self, centre_counts: HashMap<String, u32>) -> Self {
        self.centre_counts = centre_counts;
        self
    }

    pub fn districts(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn calculate_district_metrics(&self, window_days: usize) -> Result<DistrictMetrics> {
        if window_days == 0 {
            return Err(AnalysisError::invalid("window_days", "must be at least 1"));
        }

        struct Partial {
            district: String,
            window_periods: usize,
            latest_enrolments: u64,
            rolling_mean: f64,
            rolling_std: f64,
            trend_pct: Option<f64>,
        }

        let mut partials = Vec::new();
        let mut skipped = Vec::new();

        for (district, series) in &self.series {
            let values = series.values();
            let window = window_days.min(values.len());
            let trailing = &values[values.len() - window..];

            // zero-filled periods count toward the stats but not as observations
            let observations = series.observed_in_last(window);
            let summary = match observations {
                0 | 1 => None,
                _ => stats::mean(trailing).zip(stats::std_dev(trailing)),
            };
            let Some((rolling_mean, rolling_std)) = summary else {
                warn!(district = %district, observations, "skipping district");
                skipped.push(SkippedGroup {
                    key: district.clone(),
                    reason: format!("{observations} observation(s) in window, need at least 2"),
                });
                continue;
            };

            let rolling = stats::rolling_means(&values, window);
            let trend_pct = match (rolling.first(), rolling.last()) {
                (Some(&first), Some(&last)) => stats::percent_change(first, last),
                _ => None,
            };

            partials.push(Partial {
                district: district.clone(),
                window_periods: window,
                latest_enrolments: series.points.last().map(|p| p.enrolments).unwrap_or(0),
                rolling_mean,
                rolling_std,
                trend_pct,
            });
        }

        let means: Vec<f64> = partials.iter().map(|p| p.rolling_mean).collect();
        let trends: Vec<f64> = partials.iter().filter_map(|p| p.trend_pct).collect();
        let trend_min = trends.iter().copied().fold(f64::INFINITY, f64::min);
        let trend_max = trends.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let rows = partials
            .into_iter()
            .map(|partial| {
                let percentile_rank = stats::percentile_rank(&means, partial.rolling_mean);
                let trend_scaled = match partial.trend_pct {
                    None => 0.0,
                    Some(_) if trend_max - trend_min < EPSILON => 0.5,
                    Some(trend) => (trend - trend_min) / (trend_max - trend_min),
                };
                let pressure_score =
                    VOLUME_WEIGHT * percentile_rank / 100.0 + TREND_WEIGHT * trend_scaled;

                DistrictMetricsRow {
                    district: partial.district,
                    window_periods: partial.window_periods,
                    latest_enrolments: partial.latest_enrolments,
                    rolling_mean: partial.rolling_mean,
                    rolling_std: partial.rolling_std,
                    percentile_rank,
                    trend_pct: partial.trend_pct,
                    pressure_score,
                }
            })
            .collect::<Vec<_>>();

        debug!(
            districts = rows.len(),
            skipped = skipped.len(),
            window_days,
            "computed district metrics"
        );

        Ok(DistrictMetrics {
            window_days,
            rows,
            skipped,
        })
    }

    /// Districts scoring at or above the `threshold_percentile` of all pressure
    /// scores, highest first.
    pub fn identify_high_pressure_districts(
        &self,
        threshold_percentile: f64,
    ) -> Result<Vec<DistrictMetricsRow>> {
        if !(0.0..=100.0).contains(&threshold_percentile) {
            return Err(AnalysisError::invalid(
                "threshold_percentile",
                "must be between 0 and 100",
            ));
        }

        let metrics = self.calculate_district_metrics(self.window_days)?;
        let scores: Vec<f64> = metrics.rows.iter().map(|r| r.pressure_score).collect();
        let Some(cutoff) = stats::percentile(&scores, threshold_percentile) else {
            return Ok(Vec::new());
        };

        let mut selected: Vec<DistrictMetricsRow> = metrics
            .rows
            .into_iter()
            .filter(|row| row.pressure_score >= cutoff)
            .collect();
        selected.sort_by(|a, b| {
            b.pressure_score
                .partial_cmp(&a.pressure_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.district.cmp(&b.district))
        });
        Ok(selected)
    }

    pub fn calculate_capacity_utilization(
        &self,
        capacity_per_centre: f64,
    ) -> Result<Vec<CapacityRow>> {
        if !capacity_per_centre.is_finite() || capacity_per_centre <= 0.0 {
            return Err(AnalysisError::invalid(
                "capacity_per_centre",
                "must be a positive number",
            ));
        }

        let mut rows = Vec::new();
        for (district, series) in &self.series {
            let known = self.centre_counts.get(district).copied().filter(|&c| c > 0);
            let centres = known.unwrap_or(1);
            let capacity = capacity_per_centre * centres as f64;

            rows.extend(series.points.iter().map(|point| CapacityRow {
                district: district.clone(),
                period: point.period_start,
                enrolments: point.enrolments,
                centres,
                centre_count_estimated: known.is_none(),
                capacity,
                utilization: point.enrolments as f64 / capacity,
            }));
        }
        Ok(rows)
    }

    /// Periods whose value is at least `surge_threshold` times the mean of the
    /// preceding window. The first window of each district only forms a baseline.
    pub fn detect_surges(&self, surge_threshold: f64) -> Result<Vec<SurgeEvent>> {
        if !surge_threshold.is_finite() || surge_threshold <= 0.0 {
            return Err(AnalysisError::invalid(
                "surge_threshold",
                "must be a positive number",
            ));
        }
        if self.window_days == 0 {
            return Err(AnalysisError::invalid("window_days", "must be at least 1"));
        }

        let window = self.window_days;
        let mut events = Vec::new();

        for (district, series) in &self.series {
            let values = series.values();
            let baselines = stats::rolling_means(&values, window);

            // baselines[k] covers values[k..k + window], the window before index k + window.
            for (i, point) in series.points.iter().enumerate().skip(window) {
                let baseline = baselines[i - window];
                if baseline < EPSILON {
                    continue;
                }
                let ratio = point.enrolments as f64 / baseline;
                if ratio >= surge_threshold {
                    events.push(SurgeEvent {
                        district: district.clone(),
                        period: point.period_start,
                        observed_value: point.enrolments,
                        baseline_value: baseline,
                        ratio,
                    });
                }
            }
        }

        debug!(events = events.len(), surge_threshold, window, "surge scan complete");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn analyzer(districts: &[(&str, &[u64])]) -> DistrictPressureAnalyzer {
        let series = districts
            .iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    AggregatedSeries::from_values(name, Granularity::Day, start(), values),
                )
            })
            .collect();
        DistrictPressureAnalyzer::from_series(series)
    }

    #[test]
    fn single_spike_yields_one_surge() {
        let analyzer = analyzer(&[("Pune", &[100, 100, 100, 300, 100, 100])]).with_window(3);
        let surges = analyzer.detect_surges(2.0).unwrap();

        assert_eq!(surges.len(), 1);
        let surge = &surges[0];
        assert_eq!(surge.district, "Pune");
        assert_eq!(surge.period, start() + chrono::Duration::days(3));
        assert_eq!(surge.observed_value, 300);
        assert!((surge.baseline_value - 100.0).abs() < 1e-9);
        assert!((surge.ratio - 3.0).abs() < 1e-9);
    }

    #[test]
    fn surges_skip_the_baseline_window() {
        let analyzer =
            analyzer(&[("Nagpur", &[10, 500, 10, 10, 10, 10, 90, 10])]).with_window(4);
        let surges = analyzer.detect_surges(2.0).unwrap();

        let earliest_eligible = start() + chrono::Duration::days(4);
        assert!(surges.iter().all(|s| s.period >= earliest_eligible));
        let mut periods: Vec<NaiveDate> = surges.iter().map(|s| s.period).collect();
        periods.dedup();
        assert_eq!(periods.len(), surges.len());
    }

    #[test]
    fn zero_baseline_is_not_a_surge() {
        let analyzer = analyzer(&[("Leh", &[0, 0, 0, 40])]).with_window(3);
        assert!(analyzer.detect_surges(2.0).unwrap().is_empty());
        assert!(analyzer.detect_surges(0.0).is_err());
    }

    #[test]
    fn metrics_exclude_districts_without_two_observations() {
        let analyzer = analyzer(&[("Kochi", &[5, 7, 9]), ("Kargil", &[4])]);
        let metrics = analyzer.calculate_district_metrics(30).unwrap();

        assert_eq!(metrics.rows.len(), 1);
        assert_eq!(metrics.rows[0].district, "Kochi");
        assert_eq!(metrics.skipped.len(), 1);
        assert_eq!(metrics.skipped[0].key, "Kargil");
    }

    #[test]
    fn districts_that_stopped_reporting_are_skipped() {
        let first = start();
        let mut records: Vec<EnrolmentRecord> = (0..60)
            .map(|day| {
                EnrolmentRecord::new(first + chrono::Duration::days(day), "Pune", "MH", 100)
            })
            .collect();
        records.push(EnrolmentRecord::new(first, "Leh", "Ladakh", 3));

        let metrics = DistrictPressureAnalyzer::new(&records)
            .calculate_district_metrics(30)
            .unwrap();

        let names: Vec<&str> = metrics.rows.iter().map(|r| r.district.as_str()).collect();
        assert_eq!(names, vec!["Pune"]);
        assert!((metrics.rows[0].percentile_rank - 100.0).abs() < 1e-9);
        assert_eq!(metrics.skipped.len(), 1);
        assert_eq!(metrics.skipped[0].key, "Leh");
        assert!(metrics.skipped[0].reason.starts_with("0 observation"));
    }

    #[test]
    fn sparse_district_keeps_filled_zeros_in_its_stats() {
        let first = start();
        let records = vec![
            EnrolmentRecord::new(first, "Kochi", "KL", 10),
            EnrolmentRecord::new(first + chrono::Duration::days(3), "Kochi", "KL", 30),
        ];
        let metrics = DistrictPressureAnalyzer::new(&records)
            .calculate_district_metrics(4)
            .unwrap();

        let row = &metrics.rows[0];
        assert_eq!(row.window_periods, 4);
        assert!((row.rolling_mean - 10.0).abs() < 1e-9);
    }

    #[test]
    fn metrics_report_rolling_stats_and_trend() {
        let analyzer = analyzer(&[("Kochi", &[10, 10, 20, 20, 30, 30])]);
        let metrics = analyzer.calculate_district_metrics(2).unwrap();
        let row = &metrics.rows[0];

        assert_eq!(row.window_periods, 2);
        assert_eq!(row.latest_enrolments, 30);
        assert!((row.rolling_mean - 30.0).abs() < 1e-9);
        assert!(row.rolling_std.abs() < 1e-9);
        // first window averages 10, last averages 30
        assert!((row.trend_pct.unwrap() - 200.0).abs() < 1e-9);
        assert!((row.percentile_rank - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_first_window_leaves_trend_undefined() {
        let analyzer = analyzer(&[("Leh", &[0, 0, 0, 5, 5, 5])]);
        let metrics = analyzer.calculate_district_metrics(3).unwrap();
        assert_eq!(metrics.rows[0].trend_pct, None);
        assert!(analyzer.calculate_district_metrics(0).is_err());
    }

    #[test]
    fn percentile_ranks_order_districts_by_volume() {
        let analyzer = analyzer(&[
            ("A", &[10, 10, 10, 10]),
            ("B", &[20, 20, 20, 20]),
            ("C", &[30, 30, 30, 30]),
        ]);
        let metrics = analyzer.calculate_district_metrics(4).unwrap();
        let ranks: Vec<f64> = metrics.rows.iter().map(|r| r.percentile_rank).collect();
        assert!((ranks[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!((ranks[1] - 200.0 / 3.0).abs() < 1e-9);
        assert!((ranks[2] - 100.0).abs() < 1e-9);
    }

    fn mixed_districts() -> DistrictPressureAnalyzer {
        analyzer(&[
            ("Agra", &[10, 12, 14, 16, 18, 20]),
            ("Bhopal", &[50, 50, 50, 50, 50, 50]),
            ("Chennai", &[90, 80, 70, 60, 50, 40]),
            ("Delhi", &[100, 120, 140, 160, 180, 200]),
            ("Erode", &[5, 5, 6, 6, 7, 7]),
            ("Faridabad", &[30, 10, 30, 10, 30, 10]),
        ])
        .with_window(3)
    }

    #[test]
    fn stricter_percentile_selects_a_subset() {
        let analyzer = mixed_districts();
        let top_quarter = analyzer.identify_high_pressure_districts(75.0).unwrap();
        let top_tenth = analyzer.identify_high_pressure_districts(90.0).unwrap();

        assert!(!top_tenth.is_empty());
        assert!(top_tenth.len() <= top_quarter.len());
        for row in &top_tenth {
            assert!(top_quarter.iter().any(|r| r.district == row.district));
        }
        assert_eq!(top_tenth[0].district, "Delhi");
        for pair in top_quarter.windows(2) {
            assert!(pair[0].pressure_score >= pair[1].pressure_score);
        }
        assert!(analyzer.identify_high_pressure_districts(101.0).is_err());
    }

    #[test]
    fn equal_scores_are_ordered_by_name() {
        let analyzer = analyzer(&[("Zira", &[5, 5, 5]), ("Alwar", &[5, 5, 5])]).with_window(3);
        let selected = analyzer.identify_high_pressure_districts(0.0).unwrap();
        let names: Vec<&str> = selected.iter().map(|r| r.district.as_str()).collect();
        assert_eq!(names, vec!["Alwar", "Zira"]);
    }

    #[test]
    fn capacity_uses_known_centres_or_flags_estimate() {
        let analyzer = analyzer(&[("Kochi", &[150, 300]), ("Kollam", &[50, 0])])
            .with_centre_counts(HashMap::from([("Kochi".to_string(), 3)]));
        let rows = analyzer.calculate_capacity_utilization(100.0).unwrap();

        assert_eq!(rows.len(), 4);
        let kochi: Vec<&CapacityRow> = rows.iter().filter(|r| r.district == "Kochi").collect();
        assert!(!kochi[0].centre_count_estimated);
        assert!((kochi[0].utilization - 0.5).abs() < 1e-9);
        assert!((kochi[1].utilization - 1.0).abs() < 1e-9);

        let kollam: Vec<&CapacityRow> = rows.iter().filter(|r| r.district == "Kollam").collect();
        assert!(kollam[0].centre_count_estimated);
        assert_eq!(kollam[0].centres, 1);
        assert!((kollam[0].utilization - 0.5).abs() < 1e-9);

        assert!(analyzer.calculate_capacity_utilization(0.0).is_err());
    }

    #[test]
    fn districts_from_records_share_an_end_date() {
        let d = |day| NaiveDate::from_ymd_opt(2024, 5, day).unwrap();
        let records = vec![
            EnrolmentRecord::new(d(1), "Early", "S", 10),
            EnrolmentRecord::new(d(2), "Early", "S", 10),
            EnrolmentRecord::new(d(1), "Late", "S", 1),
            EnrolmentRecord::new(d(5), "Late", "S", 1),
        ];
        let analyzer = DistrictPressureAnalyzer::new(&records);
        let metrics = analyzer.calculate_district_metrics(3).unwrap();

        let early = metrics.rows.iter().find(|r| r.district == "Early").unwrap();
        assert_eq!(early.latest_enrolments, 0);
        assert!(early.rolling_mean.abs() < 1e-9);
    }

    #[test]
    fn repeated_metrics_are_identical() {
        let analyzer = mixed_districts();
        assert_eq!(
            analyzer.calculate_district_metrics(3).unwrap(),
            analyzer.calculate_district_metrics(3).unwrap()
        );
    }
}
