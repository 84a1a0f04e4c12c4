use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::models::Granularity;
use crate::predictor::{
    ModelKind, PredictorSettings, DEFAULT_MA_WINDOW, DEFAULT_PEAK_K, DEFAULT_ROLLING_WINDOW,
    DEFAULT_SMOOTHING_ALPHA,
};
use crate::pressure::{
    DEFAULT_CAPACITY_PER_CENTRE, DEFAULT_SURGE_THRESHOLD, DEFAULT_THRESHOLD_PERCENTILE,
    DEFAULT_WINDOW_DAYS,
};
use crate::seasonal::{DEFAULT_ANOMALY_THRESHOLD, DEFAULT_PERIOD};

pub const DEFAULT_HORIZON: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Granularity of the forecast series.
    pub granularity: Granularity,
    pub window_days: usize,
    pub threshold_percentile: f64,
    pub capacity_per_centre: f64,
    pub surge_threshold: f64,
    pub period: usize,
    pub anomaly_threshold: f64,
    pub horizon: usize,
    /// One of `linear`, `ma`, `exponential`.
    pub model: String,
    pub smoothing_alpha: f64,
    pub ma_window: usize,
    pub rolling_window: usize,
    pub peak_k: f64,
    pub centre_counts: HashMap<String, u32>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Day,
            window_days: DEFAULT_WINDOW_DAYS,
            threshold_percentile: DEFAULT_THRESHOLD_PERCENTILE,
            capacity_per_centre: DEFAULT_CAPACITY_PER_CENTRE,
            surge_threshold: DEFAULT_SURGE_THRESHOLD,
            period: DEFAULT_PERIOD,
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            horizon: DEFAULT_HORIZON,
            model: ModelKind::Linear.to_string(),
            smoothing_alpha: DEFAULT_SMOOTHING_ALPHA,
            ma_window: DEFAULT_MA_WINDOW,
            rolling_window: DEFAULT_ROLLING_WINDOW,
            peak_k: DEFAULT_PEAK_K,
            centre_counts: HashMap::new(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| AnalysisError::MalformedInput {
            line: Some(e.line() as u64),
            reason: format!("invalid config {}: {e}", path.display()),
        })
    }

    pub fn model_kind(&self) -> Result<ModelKind> {
        self.model.parse()
    }

    pub fn predictor_settings(&self) -> PredictorSettings {
        PredictorSettings {
            ma_window: self.ma_window,
            smoothing_alpha: self.smoothing_alpha,
            rolling_window: self.rolling_window,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.model_kind()?;
        if self.window_days == 0 {
            return Err(AnalysisError::invalid("window_days", "must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.threshold_percentile) {
            return Err(AnalysisError::invalid(
                "threshold_percentile",
                "must be between 0 and 100",
            ));
        }
        for (name, value) in [
            ("capacity_per_centre", self.capacity_per_centre),
            ("surge_threshold", self.surge_threshold),
            ("anomaly_threshold", self.anomaly_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(AnalysisError::invalid(name, "must be a positive number"));
            }
        }
        if self.period < 2 {
            return Err(AnalysisError::invalid("period", "must be at least 2"));
        }
        if self.horizon == 0 {
            return Err(AnalysisError::invalid("horizon", "must be positive"));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(AnalysisError::invalid("smoothing_alpha", "must be in (0, 1]"));
        }
        if self.ma_window == 0 {
            return Err(AnalysisError::invalid("ma_window", "must be at least 1"));
        }
        Ok(())
    }
}
