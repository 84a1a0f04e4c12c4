//! Seasonal pattern detection over the overall enrolment series.
//!
//! Decomposition is classical and additive: a centered moving-average
//! trend, per-phase mean of the detrended values as the seasonal
//! component, and whatever is left as the residual.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::debug;

use crate::aggregate::aggregate_overall;
use crate::error::{AnalysisError, Result};
use crate::models::{AggregatedSeries, EnrolmentRecord, Granularity, GroupBy};
use crate::stats::{self, fit_line, EPSILON};

pub const DEFAULT_PERIOD: usize = 12;
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 2.0;

/// Below this many full cycles a single outlier dominates its phase mean,
/// so anomaly scoring measures deviation from the series mean instead.
pub const MIN_CYCLES_FOR_SEASONAL_RESIDUALS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketAverage {
    /// Month (1-12) or quarter (1-4).
    pub bucket: u32,
    pub average: f64,
    pub observations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decomposition {
    pub period: usize,
    pub periods: Vec<NaiveDate>,
    pub observed: Vec<f64>,
    pub trend: Vec<f64>,
    pub seasonal: Vec<f64>,
    pub residual: Vec<f64>,
    pub residual_std: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    Spike,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualBasis {
    Decomposition,
    SeriesMean,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalousPeriod {
    pub period: NaiveDate,
    pub value: u64,
    pub z_score: f64,
    pub kind: AnomalyKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeasonalSummary {
    pub peak_months: Vec<BucketAverage>,
    pub peak_quarters: Vec<BucketAverage>,
    pub seasonality_strength: f64,
    pub anomaly_basis: ResidualBasis,
    pub anomalous_periods: Vec<AnomalousPeriod>,
    pub total_enrolments: u64,
    pub average_period_enrolments: Option<f64>,
}

pub struct SeasonalTrendDetector {
    observations: Vec<(NaiveDate, f64)>,
    series: AggregatedSeries,
    period: usize,
}

impl SeasonalTrendDetector {
    /// Detector over the monthly overall series of `records`.
    pub fn new(records: &[EnrolmentRecord]) -> Self {
        Self::with_granularity(records, Granularity::Month)
    }

    pub fn with_granularity(records: &[EnrolmentRecord], granularity: Granularity) -> Self {
        let series = aggregate_overall(records, granularity).unwrap_or(AggregatedSeries {
            key: GroupBy::OVERALL_KEY.to_string(),
            granularity,
            points: Vec::new(),
        });
        // peak buckets average individual rows, not per-date totals
        let observations = records
            .iter()
            .map(|r| (r.date, r.enrolments as f64))
            .collect();
        Self {
            observations,
            series,
            period: DEFAULT_PERIOD,
        }
    }

    /// Detector over an already aggregated series; its observed points double
    /// as the observations for peak-bucket averages.
    pub fn from_series(series: AggregatedSeries) -> Self {
        let observations = series
            .points
            .iter()
            .filter(|p| p.observed)
            .map(|p| (p.period_start, p.enrolments as f64))
            .collect();
        Self {
            observations,
            series,
            period: DEFAULT_PERIOD,
        }
    }

    pub fn with_period(mut self, period: usize) -> Self {
        self.period = period;
        self
    }

    pub fn series(&self) -> &AggregatedSeries {
        &self.series
    }

    pub fn identify_peak_months(&self) -> Vec<BucketAverage> {
        self.bucket_averages(|date| date.month())
    }

    pub fn identify_peak_quarters(&self) -> Vec<BucketAverage> {
        self.bucket_averages(|date| (date.month() - 1) / 3 + 1)
    }

    fn bucket_averages(&self, bucket_of: impl Fn(NaiveDate) -> u32) -> Vec<BucketAverage> {
        let mut buckets: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
        for (date, value) in &self.observations {
            let entry = buckets.entry(bucket_of(*date)).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }

        let mut averages: Vec<BucketAverage> = buckets
            .into_iter()
            .map(|(bucket, (sum, observations))| BucketAverage {
                bucket,
                average: sum / observations as f64,
                observations,
            })
            .collect();

        // Stable sort keeps ascending bucket order among equal averages.
        averages.sort_by(|a, b| {
            b.average
                .partial_cmp(&a.average)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        averages
    }

    pub fn detect_seasonal_pattern(&self, period: usize) -> Result<Decomposition> {
        if period < 2 {
            return Err(AnalysisError::invalid("period", "must be at least 2"));
        }
        let observed = self.series.values();
        let n = observed.len();
        if n < 2 * period {
            return Err(AnalysisError::insufficient(
                "seasonal decomposition",
                2 * period,
                n,
            ));
        }

        let trend = centered_trend(&observed, period);
        let detrended: Vec<f64> = observed.iter().zip(&trend).map(|(y, t)| y - t).collect();

        let mut phase_means: Vec<f64> = (0..period)
            .map(|phase| {
                let phase_values: Vec<f64> =
                    detrended.iter().skip(phase).step_by(period).copied().collect();
                stats::mean(&phase_values).unwrap_or(0.0)
            })
            .collect();
        let offset = stats::mean(&phase_means).unwrap_or(0.0);
        for value in phase_means.iter_mut() {
            *value -= offset;
        }

        let seasonal: Vec<f64> = (0..n).map(|i| phase_means[i % period]).collect();
        let residual: Vec<f64> = observed
            .iter()
            .zip(&trend)
            .zip(&seasonal)
            .map(|((y, t), s)| y - t - s)
            .collect();
        let residual_std = stats::std_dev(&residual).unwrap_or(0.0);

        debug!(period, points = n, residual_std, "decomposed series");

        Ok(Decomposition {
            period,
            periods: self.series.points.iter().map(|p| p.period_start).collect(),
            observed,
            trend,
            seasonal,
            residual,
            residual_std,
        })
    }

    /// Share of seasonal-plus-residual variance carried by the seasonal
    /// component, in [0, 1]. Zero when the series is too short to decompose.
    pub fn calculate_seasonality_strength(&self) -> f64 {
        let decomposition = match self.detect_seasonal_pattern(self.period) {
            Ok(decomposition) => decomposition,
            Err(err) => {
                debug!(error = %err, "seasonality strength unavailable");
                return 0.0;
            }
        };

        let seasonal_var = stats::variance(&decomposition.seasonal).unwrap_or(0.0);
        let residual_var = stats::variance(&decomposition.residual).unwrap_or(0.0);
        let total = seasonal_var + residual_var;
        if total < EPSILON {
            return 0.0;
        }
        (seasonal_var / total).clamp(0.0, 1.0)
    }

    pub fn anomaly_basis(&self) -> ResidualBasis {
        if self.period >= 2 && self.series.len() >= MIN_CYCLES_FOR_SEASONAL_RESIDUALS * self.period
        {
            ResidualBasis::Decomposition
        } else {
            ResidualBasis::SeriesMean
        }
    }

    /// Periods whose residual exceeds `threshold` residual standard deviations,
    /// ascending by period.
    pub fn detect_anomalous_periods(&self, threshold: f64) -> Result<Vec<AnomalousPeriod>> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(AnalysisError::invalid("anomaly_threshold", "must be positive"));
        }

        let residuals = match self.anomaly_basis() {
            ResidualBasis::Decomposition => self.detect_seasonal_pattern(self.period)?.residual,
            ResidualBasis::SeriesMean => {
                let values = self.series.values();
                let Some(mean) = stats::mean(&values) else {
                    return Ok(Vec::new());
                };
                values.iter().map(|v| v - mean).collect()
            }
        };

        let std = match stats::std_dev(&residuals) {
            Some(std) if std > EPSILON => std,
            _ => return Ok(Vec::new()),
        };

        Ok(self
            .series
            .points
            .iter()
            .zip(&residuals)
            .filter(|(_, residual)| residual.abs() > threshold * std)
            .map(|(point, residual)| {
                let z_score = residual / std;
                AnomalousPeriod {
                    period: point.period_start,
                    value: point.enrolments,
                    z_score,
                    kind: if z_score > 0.0 {
                        AnomalyKind::Spike
                    } else {
                        AnomalyKind::Drop
                    },
                }
            })
            .collect())
    }

    pub fn seasonal_summary(&self, threshold: f64) -> Result<SeasonalSummary> {
        let values = self.series.values();
        Ok(SeasonalSummary {
            peak_months: self.identify_peak_months(),
            peak_quarters: self.identify_peak_quarters(),
            seasonality_strength: self.calculate_seasonality_strength(),
            anomaly_basis: self.anomaly_basis(),
            anomalous_periods: self.detect_anomalous_periods(threshold)?,
            total_enrolments: self.series.total(),
            average_period_enrolments: stats::mean(&values),
        })
    }
}

/// Centered moving average of width `period` (2 x `period` weighting for even
/// periods), with the half-window at each edge extrapolated linearly from the
/// nearest computed trend values.
fn centered_trend(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let half = period / 2;
    let mut trend = vec![0.0; n];

    for i in half..n - half {
        trend[i] = if period % 2 == 1 {
            values[i - half..=i + half].iter().sum::<f64>() / period as f64
        } else {
            let inner: f64 = values[i - half + 1..i + half].iter().sum();
            (inner + 0.5 * (values[i - half] + values[i + half])) / period as f64
        };
    }

    let valid = n - 2 * half;
    let points = (period - 1).max(2).min(valid);

    let head_start = half;
    match fit_line(&trend[head_start..head_start + points], head_start as f64) {
        Some(fit) => (0..half).for_each(|i| trend[i] = fit.at(i as f64)),
        None => (0..half).for_each(|i| trend[i] = trend[head_start]),
    }

    let tail_start = n - half - points;
    match fit_line(&trend[tail_start..n - half], tail_start as f64) {
        Some(fit) => (n - half..n).for_each(|i| trend[i] = fit.at(i as f64)),
        None => (n - half..n).for_each(|i| trend[i] = trend[n - half - 1]),
    }

    trend
}
