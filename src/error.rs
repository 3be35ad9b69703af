use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cannot access {}: {source}", path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("cannot parse {field} value {value:?}")]
    Parse { field: &'static str, value: String },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

impl AnalysisError {
    /// Errors caused by the request rather than by the backing store.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            AnalysisError::InvalidParameter(_) | AnalysisError::InsufficientData(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
