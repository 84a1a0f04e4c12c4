use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{AnalysisError, Result};
use crate::models::{RawCount, RawRecord};

/// Age-band columns summed into `enrolments` when that column is absent.
pub const AGE_BAND_COLUMNS: [&str; 3] = ["age_0_5", "age_5_17", "age_18_greater"];

#[derive(Deserialize)]
struct CsvRow {
    date: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    district: String,
    #[serde(default)]
    enrolments: Option<String>,
    #[serde(default)]
    age_0_5: Option<String>,
    #[serde(default)]
    age_5_17: Option<String>,
    #[serde(default)]
    age_18_greater: Option<String>,
}

fn parse_count(text: &str) -> RawCount {
    match text.parse::<u64>() {
        Ok(count) => RawCount::Valid(count),
        Err(_) => RawCount::Invalid(text.to_string()),
    }
}

impl CsvRow {
    /// The `enrolments` cell when present, otherwise the sum of the age bands.
    /// Empty cells are absent; any other non-integer makes the row invalid.
    fn total(&self) -> RawCount {
        if let Some(text) = &self.enrolments {
            return parse_count(text);
        }
        let bands = [&self.age_0_5, &self.age_5_17, &self.age_18_greater];
        let mut sum = 0u64;
        for (name, cell) in AGE_BAND_COLUMNS.iter().zip(bands) {
            let Some(text) = cell else { continue };
            match parse_count(text) {
                RawCount::Valid(count) => sum += count,
                RawCount::Invalid(text) => return RawCount::Invalid(format!("{name}={text}")),
            }
        }
        RawCount::Valid(sum)
    }
}

pub fn load_csv(csv_path: &Path) -> Result<Vec<RawRecord>> {
    let file = std::fs::File::open(csv_path)?;
    let records = read_csv(file)?;
    info!(rows = records.len(), path = %csv_path.display(), "loaded enrolment rows");
    Ok(records)
}

pub fn read_csv<R: Read>(source: R) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(source);

    let headers = reader.headers()?.clone();
    let has = |name: &str| headers.iter().any(|h| h == name);
    if !has("date") {
        return Err(AnalysisError::MalformedInput {
            line: Some(1),
            reason: "missing required column 'date'".to_string(),
        });
    }
    if !has("enrolments") && !AGE_BAND_COLUMNS.iter().any(|c| has(c)) {
        return Err(AnalysisError::MalformedInput {
            line: Some(1),
            reason: format!(
                "missing enrolment column: need 'enrolments' or one of {}",
                AGE_BAND_COLUMNS.join(", ")
            ),
        });
    }

    let mut records = Vec::new();
    for result in reader.records() {
        let record = result?;
        // line where the record starts; quoted fields may span lines
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let row: CsvRow = record.deserialize(Some(&headers))?;
        records.push(RawRecord {
            line,
            enrolments: row.total(),
            date: row.date,
            district: row.district,
            state: row.state,
        });
    }

    Ok(records)
}
