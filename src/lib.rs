//! Seasonal pattern detection, district pressure scoring and short-horizon
//! demand forecasting over enrolment counts.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod predictor;
pub mod pressure;
pub mod report;
pub mod seasonal;
pub mod stats;

pub use config::AnalysisConfig;
pub use error::{AnalysisError, Result};
pub use models::{AggregatedSeries, EnrolmentRecord, Granularity, GroupBy, RawCount, RawRecord};
