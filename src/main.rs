use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use enrolment_insights::aggregate::{parse_records, ParsePolicy, ParsedRecords};
use enrolment_insights::predictor::{DemandPredictor, ModelKind, ModelState};
use enrolment_insights::pressure::DistrictPressureAnalyzer;
use enrolment_insights::seasonal::SeasonalTrendDetector;
use enrolment_insights::{ingest, report, AnalysisConfig, Granularity};

#[derive(Parser)]
#[command(name = "enrolment-insights")]
#[command(
    about = "Seasonal, district pressure and demand analysis for enrolment counts",
    long_about = None
)]
struct Cli {
    /// JSON file with analysis options; flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Abort on the first row with an unparseable date or count instead of skipping it
    #[arg(long, global = true)]
    strict: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Peak months, seasonality strength and anomalous periods
    Seasonal {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        period: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// District metrics, high-pressure districts and surges
    Pressure {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        window_days: Option<usize>,
        #[arg(long)]
        threshold_percentile: Option<f64>,
        #[arg(long)]
        surge_threshold: Option<f64>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Forecast overall demand
    Forecast {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        days: Option<usize>,
        /// linear, ma or exponential
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        granularity: Option<Granularity>,
    },
    /// Run every analysis and write a report
    Report {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    Markdown,
    Json,
}

fn load(csv: &Path, strict: bool) -> anyhow::Result<ParsedRecords> {
    let raw = ingest::load_csv(csv).with_context(|| format!("failed to read {}", csv.display()))?;
    let policy = if strict {
        ParsePolicy::Strict
    } else {
        ParsePolicy::SkipMalformed
    };
    let parsed = parse_records(&raw, policy)?;
    if !parsed.rejected.is_empty() {
        eprintln!("Excluded {} malformed rows.", parsed.rejected.len());
    }
    Ok(parsed)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AnalysisConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AnalysisConfig::default(),
    };

    match cli.command {
        Commands::Seasonal {
            csv,
            period,
            threshold,
        } => {
            config.period = period.unwrap_or(config.period);
            config.anomaly_threshold = threshold.unwrap_or(config.anomaly_threshold);
            config.validate()?;

            let parsed = load(&csv, cli.strict)?;
            let detector = SeasonalTrendDetector::new(&parsed.records).with_period(config.period);
            let summary = detector.seasonal_summary(config.anomaly_threshold)?;

            println!("Seasonality strength: {:.2}", summary.seasonality_strength);
            println!("Peak months:");
            for month in &summary.peak_months {
                println!("- {:>2}: {:.1}", month.bucket, month.average);
            }
            println!("Peak quarters:");
            for quarter in &summary.peak_quarters {
                println!("- Q{}: {:.1}", quarter.bucket, quarter.average);
            }
            if summary.anomalous_periods.is_empty() {
                println!("No anomalous periods.");
            }
            for anomaly in &summary.anomalous_periods {
                println!(
                    "- {:?} {}: {} (z {:.2})",
                    anomaly.kind,
                    anomaly.period.format("%Y-%m"),
                    anomaly.value,
                    anomaly.z_score
                );
            }
        }
        Commands::Pressure {
            csv,
            window_days,
            threshold_percentile,
            surge_threshold,
            limit,
        } => {
            config.window_days = window_days.unwrap_or(config.window_days);
            config.threshold_percentile =
                threshold_percentile.unwrap_or(config.threshold_percentile);
            config.surge_threshold = surge_threshold.unwrap_or(config.surge_threshold);
            config.validate()?;

            let parsed = load(&csv, cli.strict)?;
            let analyzer = DistrictPressureAnalyzer::new(&parsed.records)
                .with_window(config.window_days)
                .with_centre_counts(config.centre_counts.clone());

            let districts = analyzer.identify_high_pressure_districts(config.threshold_percentile)?;
            if districts.is_empty() {
                println!("No districts with enough data in this window.");
            } else {
                println!("Top districts by pressure score:");
            }
            for row in districts.iter().take(limit) {
                println!(
                    "- {} score {:.2} (mean {:.1}, std {:.1}, trend {})",
                    row.district,
                    row.pressure_score,
                    row.rolling_mean,
                    row.rolling_std,
                    row.trend_pct
                        .map(|t| format!("{t:.1}%"))
                        .unwrap_or_else(|| "n/a".to_string())
                );
            }

            let surges = analyzer.detect_surges(config.surge_threshold)?;
            println!("{} surge events:", surges.len());
            for surge in surges.iter().take(limit) {
                println!(
                    "- {} on {}: {} vs {:.1} ({:.1}x)",
                    surge.district,
                    surge.period,
                    surge.observed_value,
                    surge.baseline_value,
                    surge.ratio
                );
            }
        }
        Commands::Forecast {
            csv,
            days,
            model,
            granularity,
        } => {
            config.horizon = days.unwrap_or(config.horizon);
            config.model = model.unwrap_or(config.model);
            config.granularity = granularity.unwrap_or(config.granularity);
            config.validate()?;
            let kind: ModelKind = config.model_kind()?;

            let parsed = load(&csv, cli.strict)?;
            let predictor = DemandPredictor::new(&parsed.records, config.granularity)
                .with_settings(config.predictor_settings());
            let state = ModelState::from(predictor.train(kind)?);
            let rows = predictor.predict_next_period(&state, config.horizon)?;
            let indicators = predictor.calculate_demand_indicators(&state);

            println!("Forecast ({kind}, {} periods of one {}):", rows.len(), config.granularity);
            for row in &rows {
                match (row.lower_bound, row.upper_bound) {
                    (Some(lower), Some(upper)) => println!(
                        "- {}: {:.1} [{:.1}, {:.1}]",
                        row.period, row.predicted_enrolments, lower, upper
                    ),
                    _ => println!("- {}: {:.1}", row.period, row.predicted_enrolments),
                }
            }
            println!("{}", serde_json::to_string_pretty(&indicators)?);
        }
        Commands::Report {
            csv,
            out,
            format,
            limit,
        } => {
            let parsed = load(&csv, cli.strict)?;
            let label = csv.display().to_string();
            let analysis =
                report::build_report(&label, &parsed.records, &parsed.rejected, &config)?;
            let contents = match format {
                ReportFormat::Markdown => report::render_markdown(&analysis, limit),
                ReportFormat::Json => serde_json::to_string_pretty(&analysis)?,
            };
            std::fs::write(&out, contents)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
