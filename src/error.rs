//! Error types for evaluation and experimentation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Errors that can occur while evaluating a pipeline or running an experiment.
#[derive(Error, Debug)]
pub enum EvalError {
    /// The retrieval backend failed or returned an invalid result.
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// The answer generator failed or was given malformed context.
    #[error("Generation error: {0}")]
    Generation(String),

    /// The relevance scorer failed or produced an out-of-range score.
    #[error("Scoring error: {0}")]
    Scoring(String),

    /// An experiment configuration is structurally invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A call did not finish before its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Not enough samples to compute a quantity.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Caller supplied inputs that cannot be evaluated (empty query set, k = 0, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A saved report does not exist.
    #[error("Report not found at '{0}'")]
    ReportNotFound(PathBuf),

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration file error.
    #[error("Settings error: {0}")]
    Config(String),

    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// LLM API error.
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// LLM response parsing error.
    #[error("Failed to parse LLM response: {0}")]
    LlmParse(String),
}

impl EvalError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The report-level category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EvalError::Retrieval(_) => ErrorCategory::Retrieval,
            EvalError::Generation(_) => ErrorCategory::Generation,
            EvalError::Scoring(_) => ErrorCategory::Scoring,
            EvalError::Configuration(_) | EvalError::InvalidInput(_) | EvalError::Config(_) => {
                ErrorCategory::Configuration
            }
            EvalError::Timeout(_) => ErrorCategory::Timeout,
            EvalError::InsufficientData(_) => ErrorCategory::InsufficientData,
            EvalError::Http(_) | EvalError::LlmApi(_) | EvalError::LlmParse(_) => {
                ErrorCategory::Backend
            }
            EvalError::Io { .. } | EvalError::ReportNotFound(_) | EvalError::Serialization(_) => {
                ErrorCategory::Io
            }
        }
    }

    /// Attribute a backend failure to the retrieval stage.
    pub fn into_retrieval(self) -> Self {
        match self {
            EvalError::Retrieval(_) | EvalError::Timeout(_) => self,
            other => EvalError::Retrieval(other.to_string()),
        }
    }

    /// Attribute a backend failure to the generation stage.
    pub fn into_generation(self) -> Self {
        match self {
            EvalError::Generation(_) | EvalError::Timeout(_) => self,
            other => EvalError::Generation(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for EvalError {
    fn from(err: reqwest::Error) -> Self {
        EvalError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::LlmParse(err.to_string())
    }
}

/// Serializable error classification recorded in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Retrieval,
    Generation,
    Scoring,
    Configuration,
    Timeout,
    InsufficientData,
    Backend,
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Retrieval => "retrieval",
            ErrorCategory::Generation => "generation",
            ErrorCategory::Scoring => "scoring",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::InsufficientData => "insufficient_data",
            ErrorCategory::Backend => "backend",
            ErrorCategory::Io => "io",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            EvalError::Retrieval("down".into()).category(),
            ErrorCategory::Retrieval
        );
        assert_eq!(
            EvalError::Configuration("missing k".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            EvalError::LlmApi("500".into()).category(),
            ErrorCategory::Backend
        );
    }

    #[test]
    fn test_stage_attribution() {
        let err = EvalError::Http("connection refused".into()).into_retrieval();
        assert!(matches!(err, EvalError::Retrieval(_)));

        let err = EvalError::LlmApi("rate limited".into()).into_generation();
        assert!(matches!(err, EvalError::Generation(_)));

        // Timeouts keep their own category.
        let err = EvalError::Timeout("5s".into()).into_generation();
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::InsufficientData.to_string(), "insufficient_data");
    }
}
