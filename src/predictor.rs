//! Short-horizon demand forecasting.
//!
//! Training never mutates the predictor: `train_*` returns a
//! [`PredictionModel`] value and the caller holds it in a [`ModelState`],
//! so one series can be scored with several models and independent groups
//! can be forecast in parallel.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::debug;

use crate::aggregate::aggregate_overall;
use crate::error::{AnalysisError, Result};
use crate::models::{AggregatedSeries, EnrolmentRecord, Granularity, GroupBy};
use crate::stats::{self, fit_line, EPSILON};

/// Training refuses series shorter than this.
pub const MIN_TRAINING_POINTS: usize = 10;
pub const DEFAULT_MA_WINDOW: usize = 7;
pub const DEFAULT_SMOOTHING_ALPHA: f64 = 0.3;
pub const DEFAULT_ROLLING_WINDOW: usize = 7;
pub const DEFAULT_PEAK_K: f64 = 1.0;
const CONFIDENCE_LEVEL: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Linear,
    MovingAverage,
    ExponentialSmoothing,
}

impl FromStr for ModelKind {
    type Err = AnalysisError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(ModelKind::Linear),
            "ma" | "moving_average" => Ok(ModelKind::MovingAverage),
            "exponential" | "exponential_smoothing" => Ok(ModelKind::ExponentialSmoothing),
            _ => Err(AnalysisError::UnsupportedModel(value.to_string())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModelKind::Linear => "linear",
            ModelKind::MovingAverage => "ma",
            ModelKind::ExponentialSmoothing => "exponential",
        };
        f.write_str(label)
    }
}

/// Fitted parameters plus fit diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredictionModel {
    Linear {
        slope: f64,
        intercept: f64,
        r_squared: f64,
        /// Residual standard error, sqrt(SSR / (n - 2)).
        residual_se: f64,
        observations: usize,
    },
    MovingAverage {
        window: usize,
        level: f64,
    },
    ExponentialSmoothing {
        alpha: f64,
        level: f64,
    },
}

impl PredictionModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            PredictionModel::Linear { .. } => ModelKind::Linear,
            PredictionModel::MovingAverage { .. } => ModelKind::MovingAverage,
            PredictionModel::ExponentialSmoothing { .. } => ModelKind::ExponentialSmoothing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ModelState {
    #[default]
    Untrained,
    Trained(PredictionModel),
}

impl ModelState {
    pub fn model(&self) -> Option<&PredictionModel> {
        match self {
            ModelState::Untrained => None,
            ModelState::Trained(model) => Some(model),
        }
    }

    pub fn is_trained(&self) -> bool {
        matches!(self, ModelState::Trained(_))
    }
}

impl From<PredictionModel> for ModelState {
    fn from(model: PredictionModel) -> Self {
        ModelState::Trained(model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRow {
    pub period: NaiveDate,
    pub predicted_enrolments: f64,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemandIndicators {
    /// Percent change from the first to the last rolling average.
    pub growth_rate_pct: Option<f64>,
    /// Residual standard deviation over the series mean.
    pub volatility: Option<f64>,
    /// Requires a trained linear model.
    pub trend_direction: Option<TrendDirection>,
    pub slope: Option<f64>,
    pub r_squared: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakDemandPeriod {
    pub period: NaiveDate,
    pub predicted_enrolments: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictorSettings {
    pub ma_window: usize,
    pub smoothing_alpha: f64,
    pub rolling_window: usize,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            ma_window: DEFAULT_MA_WINDOW,
            smoothing_alpha: DEFAULT_SMOOTHING_ALPHA,
            rolling_window: DEFAULT_ROLLING_WINDOW,
        }
    }
}

pub struct DemandPredictor {
    series: AggregatedSeries,
    values: Vec<f64>,
    settings: PredictorSettings,
}

impl DemandPredictor {
    pub fn new(records: &[EnrolmentRecord], granularity: Granularity) -> Self {
        let series = aggregate_overall(records, granularity).unwrap_or(AggregatedSeries {
            key: GroupBy::OVERALL_KEY.to_string(),
            granularity,
            points: Vec::new(),
        });
        Self::from_series(series)
    }

    pub fn from_series(series: AggregatedSeries) -> Self {
        let values = series.values();
        Self {
            series,
            values,
            settings: PredictorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PredictorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn series(&self) -> &AggregatedSeries {
        &self.series
    }

    fn ensure_trainable(&self, context: &str) -> Result<()> {
        if self.values.len() < MIN_TRAINING_POINTS {
            return Err(AnalysisError::insufficient(
                context,
                MIN_TRAINING_POINTS,
                self.values.len(),
            ));
        }
        Ok(())
    }

    /// Ordinary least squares of enrolments against the period index.
    pub fn train_linear_model(&self) -> Result<PredictionModel> {
        self.ensure_trainable("linear model")?;

        let n = self.values.len();
        let fit = fit_line(&self.values, 0.0)
            .ok_or_else(|| AnalysisError::insufficient("linear model", 2, n))?;
        let ssr: f64 = self
            .values
            .iter()
            .enumerate()
            .map(|(i, y)| (y - fit.at(i as f64)).powi(2))
            .sum();
        let residual_se = (ssr / (n - 2) as f64).sqrt();

        debug!(
            slope = fit.slope,
            intercept = fit.intercept,
            r_squared = fit.r_squared,
            "trained linear model"
        );
        Ok(PredictionModel::Linear {
            slope: fit.slope,
            intercept: fit.intercept,
            r_squared: fit.r_squared,
            residual_se,
            observations: n,
        })
    }

    pub fn train_moving_average(&self, window: usize) -> Result<PredictionModel> {
        if window == 0 {
            return Err(AnalysisError::invalid("ma_window", "must be at least 1"));
        }
        self.ensure_trainable("moving average model")?;

        let window = window.min(self.values.len());
        let trailing = &self.values[self.values.len() - window..];
        let level = stats::mean(trailing).unwrap_or(0.0);
        Ok(PredictionModel::MovingAverage { window, level })
    }

    pub fn train_exponential_smoothing(&self, alpha: f64) -> Result<PredictionModel> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(AnalysisError::invalid(
                "smoothing_alpha",
                "must be in (0, 1]",
            ));
        }
        self.ensure_trainable("exponential smoothing model")?;

        let level = self.values[1..]
            .iter()
            .fold(self.values[0], |level, &y| alpha * y + (1.0 - alpha) * level);
        Ok(PredictionModel::ExponentialSmoothing { alpha, level })
    }

    pub fn train(&self, kind: ModelKind) -> Result<PredictionModel> {
        match kind {
            ModelKind::Linear => self.train_linear_model(),
            ModelKind::MovingAverage => self.train_moving_average(self.settings.ma_window),
            ModelKind::ExponentialSmoothing => {
                self.train_exponential_smoothing(self.settings.smoothing_alpha)
            }
        }
    }

    /// Projects `periods` native periods past the end of the series.
    pub fn predict_next_period(
        &self,
        state: &ModelState,
        periods: usize,
    ) -> Result<Vec<ForecastRow>> {
        if periods == 0 {
            return Err(AnalysisError::invalid("days", "horizon must be positive"));
        }
        let model = state.model().ok_or(AnalysisError::ModelNotTrained)?;
        let last = self
            .series
            .last_period()
            .ok_or_else(|| AnalysisError::insufficient("forecast", 1, 0))?;
        let granularity = self.series.granularity;

        let rows = match *model {
            PredictionModel::Linear {
                slope,
                intercept,
                residual_se,
                observations,
                ..
            } => {
                let n = observations as f64;
                let x_mean = (n - 1.0) / 2.0;
                let sum_sq_dev = n * (n * n - 1.0) / 12.0;
                let t_value = if residual_se < EPSILON || observations < 3 {
                    0.0
                } else {
                    StudentsT::new(0.0, 1.0, n - 2.0)
                        .map_err(|e| AnalysisError::invalid("degrees_of_freedom", e.to_string()))?
                        .inverse_cdf(1.0 - (1.0 - CONFIDENCE_LEVEL) / 2.0)
                };

                (1..=periods)
                    .map(|step| {
                        let x = n - 1.0 + step as f64;
                        let predicted = intercept + slope * x;
                        let width = t_value
                            * residual_se
                            * (1.0 + 1.0 / n + (x - x_mean).powi(2) / sum_sq_dev).sqrt();
                        ForecastRow {
                            period: granularity.advance(last, step),
                            predicted_enrolments: predicted,
                            lower_bound: Some(predicted - width),
                            upper_bound: Some(predicted + width),
                        }
                    })
                    .collect()
            }
            PredictionModel::MovingAverage { level, .. }
            | PredictionModel::ExponentialSmoothing { level, .. } => (1..=periods)
                .map(|step| ForecastRow {
                    period: granularity.advance(last, step),
                    predicted_enrolments: level,
                    lower_bound: None,
                    upper_bound: None,
                })
                .collect(),
        };
        Ok(rows)
    }

    /// Trains `kind` and forecasts with it in one step.
    pub fn forecast(&self, kind: ModelKind, periods: usize) -> Result<Vec<ForecastRow>> {
        let state = ModelState::from(self.train(kind)?);
        self.predict_next_period(&state, periods)
    }

    pub fn calculate_demand_indicators(&self, state: &ModelState) -> DemandIndicators {
        let n = self.values.len();
        let window = self.settings.rolling_window.max(1).min(n);
        let rolling = stats::rolling_means(&self.values, window);
        let growth_rate_pct = match (rolling.first(), rolling.last()) {
            (Some(&first), Some(&last)) => stats::percent_change(first, last),
            _ => None,
        };

        let linear = match state.model() {
            Some(&PredictionModel::Linear {
                slope,
                intercept,
                r_squared,
                ..
            }) => Some((slope, intercept, r_squared)),
            _ => None,
        };

        let mean = stats::mean(&self.values);
        let residuals: Vec<f64> = match (linear, mean) {
            (Some((slope, intercept, _)), _) => self
                .values
                .iter()
                .enumerate()
                .map(|(i, y)| y - (intercept + slope * i as f64))
                .collect(),
            (None, Some(mean)) => self.values.iter().map(|y| y - mean).collect(),
            (None, None) => Vec::new(),
        };
        let volatility = match (stats::std_dev(&residuals), mean) {
            (Some(std), Some(mean)) if mean.abs() > EPSILON => Some(std / mean),
            _ => None,
        };

        let trend_direction = linear.map(|(slope, _, _)| {
            if slope > EPSILON {
                TrendDirection::Increasing
            } else if slope < -EPSILON {
                TrendDirection::Decreasing
            } else {
                TrendDirection::Flat
            }
        });

        DemandIndicators {
            growth_rate_pct,
            volatility,
            trend_direction,
            slope: linear.map(|(slope, _, _)| slope),
            r_squared: linear.map(|(_, _, r_squared)| r_squared),
        }
    }

    /// Forecast periods above mean + k * std of the forecast itself, ascending.
    pub fn identify_peak_demand_periods(
        &self,
        state: &ModelState,
        future_periods: usize,
        k: f64,
    ) -> Result<Vec<PeakDemandPeriod>> {
        let forecast = self.predict_next_period(state, future_periods)?;
        let predictions: Vec<f64> = forecast.iter().map(|r| r.predicted_enrolments).collect();
        let mean = stats::mean(&predictions).unwrap_or(0.0);
        let std = stats::std_dev(&predictions).unwrap_or(0.0);
        let threshold = mean + k * std;

        Ok(forecast
            .into_iter()
            .filter(|row| row.predicted_enrolments > threshold)
            .map(|row| PeakDemandPeriod {
                period: row.period,
                predicted_enrolments: row.predicted_enrolments,
                threshold,
            })
            .collect())
    }
}

/// Forecasts every group independently and in parallel. A group that cannot
/// be trained yields its own error without affecting the others.
pub fn forecast_by_group(
    series: &BTreeMap<String, AggregatedSeries>,
    settings: PredictorSettings,
    kind: ModelKind,
    periods: usize,
) -> BTreeMap<String, Result<Vec<ForecastRow>>> {
    series
        .par_iter()
        .map(|(key, series)| {
            let predictor = DemandPredictor::from_series(series.clone()).with_settings(settings);
            (key.clone(), predictor.forecast(kind, periods))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn predictor(values: &[u64], granularity: Granularity) -> DemandPredictor {
        DemandPredictor::from_series(AggregatedSeries::from_values(
            "all",
            granularity,
            start(),
            values,
        ))
    }

    fn linear_values() -> Vec<u64> {
        (0..20).map(|x| 10 + 2 * x).collect()
    }

    #[test]
    fn linear_model_recovers_exact_line() {
        let predictor = predictor(&linear_values(), Granularity::Day);
        let model = predictor.train_linear_model().unwrap();

        match model {
            PredictionModel::Linear {
                slope,
                intercept,
                r_squared,
                observations,
                ..
            } => {
                assert!((slope - 2.0).abs() < 1e-9);
                assert!((intercept - 10.0).abs() < 1e-9);
                assert!((r_squared - 1.0).abs() < 1e-9);
                assert_eq!(observations, 20);
            }
            other => panic!("expected linear model, got {other:?}"),
        }

        let forecast = predictor
            .predict_next_period(&ModelState::from(model), 5)
            .unwrap();
        let predicted: Vec<f64> = forecast.iter().map(|r| r.predicted_enrolments).collect();
        let expected: Vec<f64> = (20..25).map(|x| 10.0 + 2.0 * x as f64).collect();
        assert_eq!(forecast.len(), 5);
        for (p, e) in predicted.iter().zip(&expected) {
            assert!((p - e).abs() < 1e-6);
        }
        assert_eq!(forecast[0].period, start() + chrono::Duration::days(20));
    }

    #[test]
    fn short_series_cannot_be_trained() {
        let predictor = predictor(&[1, 2, 3, 4, 5], Granularity::Day);
        let mut state = ModelState::Untrained;

        match predictor.train_linear_model() {
            Err(AnalysisError::InsufficientData {
                required, actual, ..
            }) => {
                assert_eq!(required, MIN_TRAINING_POINTS);
                assert_eq!(actual, 5);
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }
        if let Ok(model) = predictor.train_linear_model() {
            state = ModelState::from(model);
        }
        assert_eq!(state, ModelState::Untrained);
        assert!(predictor.train(ModelKind::MovingAverage).is_err());
    }

    #[test]
    fn predicting_untrained_fails() {
        let predictor = predictor(&linear_values(), Granularity::Day);
        assert!(matches!(
            predictor.predict_next_period(&ModelState::Untrained, 3),
            Err(AnalysisError::ModelNotTrained)
        ));
    }

    #[test]
    fn unknown_model_tag_is_rejected() {
        assert_eq!("ma".parse::<ModelKind>().unwrap(), ModelKind::MovingAverage);
        assert_eq!(
            "Exponential".parse::<ModelKind>().unwrap(),
            ModelKind::ExponentialSmoothing
        );
        match "arima".parse::<ModelKind>() {
            Err(AnalysisError::UnsupportedModel(tag)) => assert_eq!(tag, "arima"),
            other => panic!("expected UnsupportedModel, got {other:?}"),
        }
    }

    #[test]
    fn horizon_counts_native_periods() {
        let predictor = predictor(&linear_values(), Granularity::Month);
        let forecast = predictor.forecast(ModelKind::Linear, 3).unwrap();
        assert_eq!(forecast.len(), 3);
        let periods: Vec<NaiveDate> = forecast.iter().map(|r| r.period).collect();
        assert_eq!(
            periods,
            vec![
                NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 10, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 11, 1).unwrap(),
            ]
        );
        assert!(predictor.forecast(ModelKind::Linear, 0).is_err());
    }

    #[test]
    fn moving_average_repeats_trailing_mean() {
        let values = [10, 10, 10, 10, 10, 10, 10, 20, 30, 40];
        let predictor = predictor(&values, Granularity::Day);
        let model = predictor.train_moving_average(3).unwrap();
        assert_eq!(model, PredictionModel::MovingAverage { window: 3, level: 30.0 });

        let forecast = predictor.predict_next_period(&model.into(), 4).unwrap();
        assert!(forecast.iter().all(|r| (r.predicted_enrolments - 30.0).abs() < 1e-9));
        assert!(forecast.iter().all(|r| r.lower_bound.is_none()));
    }

    #[test]
    fn exponential_smoothing_tracks_level() {
        let values = [100; 12];
        let predictor = predictor(&values, Granularity::Day);
        let model = predictor.train_exponential_smoothing(0.5).unwrap();
        assert_eq!(
            model,
            PredictionModel::ExponentialSmoothing { alpha: 0.5, level: 100.0 }
        );
        assert!(predictor.train_exponential_smoothing(0.0).is_err());
        assert!(predictor.train_exponential_smoothing(1.5).is_err());
    }

    #[test]
    fn noisy_linear_forecast_has_widening_intervals() {
        let values: Vec<u64> = (0..30)
            .map(|x| 100 + 3 * x + [0, 4, 1, 5][x as usize % 4])
            .collect();
        let predictor = predictor(&values, Granularity::Day);
        let forecast = predictor.forecast(ModelKind::Linear, 5).unwrap();

        for row in &forecast {
            let (lower, upper) = (row.lower_bound.unwrap(), row.upper_bound.unwrap());
            assert!(lower < row.predicted_enrolments && row.predicted_enrolments < upper);
        }
        let first = forecast[0].upper_bound.unwrap() - forecast[0].lower_bound.unwrap();
        let last = forecast[4].upper_bound.unwrap() - forecast[4].lower_bound.unwrap();
        assert!(last > first);
    }

    #[test]
    fn indicators_use_training_only_for_slope() {
        let predictor = predictor(&linear_values(), Granularity::Day);

        let untrained = predictor.calculate_demand_indicators(&ModelState::Untrained);
        assert!(untrained.growth_rate_pct.unwrap() > 0.0);
        assert!(untrained.volatility.is_some());
        assert_eq!(untrained.trend_direction, None);

        let state = ModelState::from(predictor.train_linear_model().unwrap());
        let trained = predictor.calculate_demand_indicators(&state);
        assert_eq!(trained.trend_direction, Some(TrendDirection::Increasing));
        assert!(trained.volatility.unwrap().abs() < 1e-9);
        // rolling(7): first mean 16, last mean 42
        assert!((trained.growth_rate_pct.unwrap() - 162.5).abs() < 1e-9);
    }

    #[test]
    fn peak_periods_exceed_forecast_spread() {
        let predictor = predictor(&linear_values(), Granularity::Day);
        let state = ModelState::from(predictor.train_linear_model().unwrap());
        let peaks = predictor.identify_peak_demand_periods(&state, 5, 1.0).unwrap();

        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].predicted_enrolments - 58.0).abs() < 1e-6);
        assert!(predictor
            .identify_peak_demand_periods(&ModelState::Untrained, 5, 1.0)
            .is_err());
    }

    #[test]
    fn group_forecasts_isolate_failures() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "long".to_string(),
            AggregatedSeries::from_values("long", Granularity::Day, start(), &linear_values()),
        );
        groups.insert(
            "short".to_string(),
            AggregatedSeries::from_values("short", Granularity::Day, start(), &[1, 2, 3]),
        );

        let results =
            forecast_by_group(&groups, PredictorSettings::default(), ModelKind::Linear, 2);
        assert_eq!(results["long"].as_ref().unwrap().len(), 2);
        assert!(matches!(
            results["short"],
            Err(AnalysisError::InsufficientData { .. })
        ));
    }
}
