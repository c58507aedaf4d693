//! Persistence layer for evaluation runs and experiment reports.
//!
//! Supports JSON (default) and YAML, chosen by file extension.

use crate::error::{EvalError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Default filename for experiment reports.
pub const DEFAULT_REPORT_FILENAME: &str = "experiment_report.json";

/// Save format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

impl ReportFormat {
    /// Determine format from file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ReportFormat::Yaml,
            _ => ReportFormat::Json,
        }
    }
}

/// Save a report (an `EvaluationRun` or an `ExperimentReport`) to a file.
pub fn save_report<T: Serialize>(report: &T, path: &Path) -> Result<()> {
    save_report_with_format(report, path, ReportFormat::from_path(path))
}

/// Save a report with a specific format.
pub fn save_report_with_format<T: Serialize>(
    report: &T,
    path: &Path,
    format: ReportFormat,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
        }
    }

    let data = match format {
        ReportFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|e| EvalError::Serialization(e.to_string()))?,
        ReportFormat::Yaml => {
            serde_yaml::to_string(report).map_err(|e| EvalError::Serialization(e.to_string()))?
        }
    };

    fs::write(path, data).map_err(|e| EvalError::io(path, e))?;

    Ok(())
}

/// Load a report from a file.
pub fn load_report<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(EvalError::ReportNotFound(path.to_path_buf()));
    }

    load_report_with_format(path, ReportFormat::from_path(path))
}

/// Load a report with a specific format.
pub fn load_report_with_format<T: DeserializeOwned>(path: &Path, format: ReportFormat) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;

    let report = match format {
        ReportFormat::Json => serde_json::from_str(&content)
            .map_err(|e| EvalError::Serialization(e.to_string()))?,
        ReportFormat::Yaml => serde_yaml::from_str(&content)
            .map_err(|e| EvalError::Serialization(e.to_string()))?,
    };

    Ok(report)
}

/// Check if a report file exists at the given path.
pub fn report_exists(path: &Path) -> bool {
    path.exists() && path.is_file()
}

/// Get the size of a report file in bytes.
pub fn report_size(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path).map_err(|e| EvalError::io(path, e))?;
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{ChunkConfig, Corpus};
    use crate::experiment::{
        ComparisonMode, CorpusPipelineFactory, Experiment, ExperimentConfig, ExperimentOptions,
        ExperimentReport,
    };
    use crate::query::{create_sample_query_set, sample_documents};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_report() -> ExperimentReport {
        let factory = CorpusPipelineFactory::new(
            Arc::new(Corpus::from_pairs(sample_documents())),
            ChunkConfig::default(),
        );
        Experiment::new("persisted", ExperimentOptions::default())
            .run_ab(
                ExperimentConfig::new("baseline").with_param("k", 2usize),
                ExperimentConfig::new("candidate")
                    .with_param("k", 4usize)
                    .with_param("chunk_size", 250usize),
                &create_sample_query_set(),
                &factory,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("ab.json");

        let original = create_test_report().await;
        save_report(&original, &path).unwrap();

        assert!(report_exists(&path));
        assert!(report_size(&path).unwrap() > 0);

        let loaded: ExperimentReport = load_report(&path).unwrap();
        assert_eq!(loaded.name, original.name);
        assert_eq!(loaded.mode, ComparisonMode::AbTest);
        assert_eq!(loaded.results.len(), 2);
        assert_eq!(loaded.summaries.len(), original.summaries.len());
    }

    #[tokio::test]
    async fn test_save_and_load_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ab.yaml");

        let original = create_test_report().await;
        save_report(&original, &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("name: persisted"));

        let loaded: ExperimentReport = load_report(&path).unwrap();
        assert_eq!(loaded.results[1].name, "candidate");
        assert_eq!(
            loaded.results[1].run().map(|r| r.k),
            original.results[1].run().map(|r| r.k)
        );
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ReportFormat::from_path(Path::new("report.json")),
            ReportFormat::Json
        );
        assert_eq!(
            ReportFormat::from_path(Path::new("report.yaml")),
            ReportFormat::Yaml
        );
        assert_eq!(
            ReportFormat::from_path(Path::new("report.yml")),
            ReportFormat::Yaml
        );
        assert_eq!(ReportFormat::from_path(Path::new("report")), ReportFormat::Json);
    }

    #[tokio::test]
    async fn test_default_report_filename_is_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_REPORT_FILENAME);
        assert_eq!(ReportFormat::from_path(&path), ReportFormat::Json);

        save_report(&create_test_report().await, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.trim_start().starts_with('{'));
    }

    #[test]
    fn test_load_nonexistent() {
        let result: Result<ExperimentReport> = load_report(Path::new("/nonexistent/report.json"));
        assert!(matches!(result, Err(EvalError::ReportNotFound(_))));
    }

    #[test]
    fn test_load_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let result: Result<ExperimentReport> = load_report(&path);
        assert!(matches!(result, Err(EvalError::Serialization(_))));
    }
}
