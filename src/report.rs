use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::aggregate::{aggregate, Span};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::models::{EnrolmentRecord, GroupBy, RejectedRow};
use crate::predictor::{
    forecast_by_group, DemandIndicators, DemandPredictor, ForecastRow, ModelState,
    PeakDemandPeriod, PredictionModel,
};
use crate::pressure::{
    CapacityRow, DistrictMetrics, DistrictMetricsRow, DistrictPressureAnalyzer, SurgeEvent,
};
use crate::seasonal::{SeasonalSummary, SeasonalTrendDetector};

/// A report section that either carries a value or says why it could not be
/// computed, so a missing metric never reads as a zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Section<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> Section<T> {
    fn unavailable(reason: impl Into<String>) -> Self {
        Section::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn available(&self) -> Option<&T> {
        match self {
            Section::Available(value) => Some(value),
            Section::Unavailable { .. } => None,
        }
    }
}

impl<T> From<Result<T>> for Section<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Section::Available(value),
            Err(err) => Section::unavailable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastSection {
    pub model: PredictionModel,
    pub rows: Vec<ForecastRow>,
    pub indicators: DemandIndicators,
    pub peak_periods: Vec<PeakDemandPeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub source: String,
    pub record_count: usize,
    pub rejected_rows: Vec<RejectedRow>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub seasonal: Section<SeasonalSummary>,
    pub district_metrics: Section<DistrictMetrics>,
    pub high_pressure_districts: Section<Vec<DistrictMetricsRow>>,
    pub surges: Section<Vec<SurgeEvent>>,
    /// Busiest period per district.
    pub peak_utilization: Section<Vec<CapacityRow>>,
    pub forecast: Section<ForecastSection>,
    pub district_forecasts: BTreeMap<String, Section<Vec<ForecastRow>>>,
}

/// Runs every engine over one dataset. Configuration errors abort; engine
/// failures only mark their own section unavailable.
pub fn build_report(
    source: &str,
    records: &[EnrolmentRecord],
    rejected: &[RejectedRow],
    config: &AnalysisConfig,
) -> Result<AnalysisReport> {
    config.validate()?;
    let kind = config.model_kind()?;

    let no_records = || AnalysisError::insufficient("analysis", 1, 0);

    let seasonal = if records.is_empty() {
        Section::from(Err(no_records()))
    } else {
        let detector = SeasonalTrendDetector::new(records).with_period(config.period);
        Section::from(detector.seasonal_summary(config.anomaly_threshold))
    };

    let analyzer = DistrictPressureAnalyzer::new(records)
        .with_window(config.window_days)
        .with_centre_counts(config.centre_counts.clone());
    let (district_metrics, high_pressure_districts, surges, peak_utilization) =
        if records.is_empty() {
            (
                Section::from(Err(no_records())),
                Section::from(Err(no_records())),
                Section::from(Err(no_records())),
                Section::from(Err(no_records())),
            )
        } else {
            (
                Section::from(analyzer.calculate_district_metrics(config.window_days)),
                Section::from(
                    analyzer.identify_high_pressure_districts(config.threshold_percentile),
                ),
                Section::from(analyzer.detect_surges(config.surge_threshold)),
                Section::from(
                    analyzer
                        .calculate_capacity_utilization(config.capacity_per_centre)
                        .map(peak_rows),
                ),
            )
        };

    let predictor = DemandPredictor::new(records, config.granularity)
        .with_settings(config.predictor_settings());
    let forecast = Section::from(predictor.train(kind).and_then(|model| {
        let state = ModelState::from(model.clone());
        let rows = predictor.predict_next_period(&state, config.horizon)?;
        let peak_periods =
            predictor.identify_peak_demand_periods(&state, config.horizon, config.peak_k)?;
        let indicators = predictor.calculate_demand_indicators(&state);
        Ok(ForecastSection {
            model,
            rows,
            indicators,
            peak_periods,
        })
    }));

    let district_series = aggregate(records, config.granularity, GroupBy::District, Span::Observed);
    let district_forecasts = forecast_by_group(
        &district_series,
        config.predictor_settings(),
        kind,
        config.horizon,
    )
    .into_iter()
    .map(|(district, result)| (district, Section::from(result)))
    .collect();

    info!(
        records = records.len(),
        rejected = rejected.len(),
        "analysis report built"
    );

    Ok(AnalysisReport {
        source: source.to_string(),
        record_count: records.len(),
        rejected_rows: rejected.to_vec(),
        first_date: records.iter().map(|r| r.date).min(),
        last_date: records.iter().map(|r| r.date).max(),
        seasonal,
        district_metrics,
        high_pressure_districts,
        surges,
        peak_utilization,
        forecast,
        district_forecasts,
    })
}

fn peak_rows(rows: Vec<CapacityRow>) -> Vec<CapacityRow> {
    let mut peaks: BTreeMap<String, CapacityRow> = BTreeMap::new();
    for row in rows {
        match peaks.get(&row.district) {
            Some(current) if current.utilization >= row.utilization => {}
            _ => {
                peaks.insert(row.district.clone(), row);
            }
        }
    }
    let mut values: Vec<CapacityRow> = peaks.into_values().collect();
    values.sort_by(|a, b| {
        b.utilization
            .partial_cmp(&a.utilization)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    values
}

fn write_unavailable<T>(output: &mut String, section: &Section<T>) -> bool {
    if let Section::Unavailable { reason } = section {
        let _ = writeln!(output, "No data: {reason}");
        true
    } else {
        false
    }
}

fn format_optional(value: Option<f64>, suffix: &str) -> String {
    match value {
        Some(value) => format!("{value:.1}{suffix}"),
        None => "n/a".to_string(),
    }
}

pub fn render_markdown(report: &AnalysisReport, limit: usize) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Enrolment Insights Report");
    let range = match (report.first_date, report.last_date) {
        (Some(first), Some(last)) => format!("{first} to {last}"),
        _ => "no dated records".to_string(),
    };
    let _ = writeln!(
        output,
        "Generated for {} ({} records, {})",
        report.source, report.record_count, range
    );
    if !report.rejected_rows.is_empty() {
        let _ = writeln!(
            output,
            "{} malformed rows excluded (first at line {}).",
            report.rejected_rows.len(),
            report.rejected_rows[0].line
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Seasonal Patterns");
    if let Section::Available(summary) = &report.seasonal {
        let _ = writeln!(
            output,
            "Seasonality strength {:.2}; {} total enrolments.",
            summary.seasonality_strength, summary.total_enrolments
        );
        for month in summary.peak_months.iter().take(3) {
            let _ = writeln!(
                output,
                "- Month {}: {:.1} average enrolments",
                month.bucket, month.average
            );
        }
        if summary.anomalous_periods.is_empty() {
            let _ = writeln!(output, "No anomalous periods.");
        }
        for anomaly in &summary.anomalous_periods {
            let _ = writeln!(
                output,
                "- {:?} in {}: {} enrolments (z {:.2})",
                anomaly.kind,
                anomaly.period.format("%Y-%m"),
                anomaly.value,
                anomaly.z_score
            );
        }
    } else {
        write_unavailable(&mut output, &report.seasonal);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## High Pressure Districts");
    if !write_unavailable(&mut output, &report.high_pressure_districts) {
        if let Some(rows) = report.high_pressure_districts.available() {
            if rows.is_empty() {
                let _ = writeln!(output, "No districts above the threshold.");
            }
            for row in rows.iter().take(limit) {
                let _ = writeln!(
                    output,
                    "- {} score {:.2} (mean {:.1}, rank {:.0}, trend {})",
                    row.district,
                    row.pressure_score,
                    row.rolling_mean,
                    row.percentile_rank,
                    format_optional(row.trend_pct, "%")
                );
            }
        }
    }
    if let Some(metrics) = report.district_metrics.available() {
        for skipped in &metrics.skipped {
            let _ = writeln!(output, "- skipped {}: {}", skipped.key, skipped.reason);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Surges");
    if !write_unavailable(&mut output, &report.surges) {
        if let Some(surges) = report.surges.available() {
            if surges.is_empty() {
                let _ = writeln!(output, "No surges detected.");
            }
            for surge in surges.iter().take(limit) {
                let _ = writeln!(
                    output,
                    "- {} on {}: {} vs baseline {:.1} ({:.1}x)",
                    surge.district,
                    surge.period,
                    surge.observed_value,
                    surge.baseline_value,
                    surge.ratio
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Capacity");
    if !write_unavailable(&mut output, &report.peak_utilization) {
        if let Some(rows) = report.peak_utilization.available() {
            for row in rows.iter().take(limit) {
                let _ = writeln!(
                    output,
                    "- {} peaked at {:.0}% on {}{}",
                    row.district,
                    row.utilization * 100.0,
                    row.period,
                    if row.centre_count_estimated {
                        " (estimated, 1 centre assumed)"
                    } else {
                        ""
                    }
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Demand Forecast");
    match &report.forecast {
        Section::Available(forecast) => {
            let _ = writeln!(
                output,
                "Model {}; growth {}, volatility {}.",
                forecast.model.kind(),
                format_optional(forecast.indicators.growth_rate_pct, "%"),
                format_optional(forecast.indicators.volatility, "")
            );
            if let Some(direction) = forecast.indicators.trend_direction {
                let _ = writeln!(output, "Trend is {direction:?}.");
            }
            for row in forecast.rows.iter().take(limit) {
                let _ = writeln!(
                    output,
                    "- {}: {:.1}",
                    row.period, row.predicted_enrolments
                );
            }
            for peak in &forecast.peak_periods {
                let _ = writeln!(
                    output,
                    "- peak {}: {:.1} (threshold {:.1})",
                    peak.period, peak.predicted_enrolments, peak.threshold
                );
            }
        }
        unavailable => {
            write_unavailable(&mut output, unavailable);
        }
    }

    output
}
