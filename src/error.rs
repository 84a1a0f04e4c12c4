use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Unparseable dates or missing required columns.
    #[error("Malformed input{}: {reason}", line_suffix(.line))]
    MalformedInput { line: Option<u64>, reason: String },

    #[error("Insufficient data for {context}: need at least {required} points, got {actual}")]
    InsufficientData {
        required: usize,
        actual: usize,
        context: String,
    },

    #[error("Model must be trained before prediction")]
    ModelNotTrained,

    #[error("Unsupported model type '{0}' (expected linear, ma or exponential)")]
    UnsupportedModel(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn line_suffix(line: &Option<u64>) -> String {
    match line {
        Some(line) => format!(" at line {line}"),
        None => String::new(),
    }
}

impl AnalysisError {
    pub fn insufficient(context: impl Into<String>, required: usize, actual: usize) -> Self {
        Self::InsufficientData {
            required,
            actual,
            context: context.into(),
        }
    }

    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
