//! Configuration for evaluation runs and experiments.
//!
//! Supports both environment variables and YAML config file.
//! Environment variables take precedence over config file values.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// LLM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for an OpenAI-compatible API (e.g., "http://localhost:11434")
    pub api_base: String,

    /// API key for authentication (may be empty for local servers)
    pub api_key: String,

    /// Model name (e.g., "llama3")
    pub model: String,

    /// Maximum tokens for response (optional)
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for generation (optional)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.0
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:11434".to_string(),
            api_key: String::new(),
            model: "llama3".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Corpus and chunking settings used by the built-in lexical index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusConfig {
    /// Directory holding plain-text documents.
    pub data_dir: PathBuf,
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            chunk_size: 500,
            chunk_overlap: 80,
        }
    }
}

/// Evaluation engine and experiment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Default number of chunks to retrieve per query.
    pub retrieval_k: usize,
    /// Maximum number of queries in flight at once.
    pub concurrency: usize,
    /// Per-query deadline in seconds.
    pub query_timeout_secs: u64,
    /// Deadline for a whole evaluation run in seconds (unbounded when absent).
    pub run_timeout_secs: Option<u64>,
    /// Minimum queries per arm before an A/B significance test is attempted.
    pub min_significance_samples: usize,
    /// Two-sided significance level for A/B tests.
    pub significance_level: f64,
    /// Number of configurations evaluated concurrently in an experiment.
    pub max_parallel_configurations: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            retrieval_k: 4,
            concurrency: 4,
            query_timeout_secs: 60,
            run_timeout_secs: None,
            min_significance_samples: 10,
            significance_level: 0.05,
            max_parallel_configurations: 1,
        }
    }
}

impl EvalConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// LLM settings
    #[serde(default)]
    pub llm: LlmConfig,
    /// Corpus settings
    #[serde(default)]
    pub corpus: CorpusConfig,
    /// Evaluation settings
    #[serde(default)]
    pub eval: EvalConfig,
}

/// Configuration file structure (YAML format).
#[derive(Debug, Deserialize)]
struct ConfigFile {
    llm: Option<LlmFileSection>,
    corpus: Option<CorpusFileSection>,
    eval: Option<EvalFileSection>,
}

#[derive(Debug, Deserialize)]
struct LlmFileSection {
    api_base: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CorpusFileSection {
    data_dir: Option<PathBuf>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EvalFileSection {
    retrieval_k: Option<usize>,
    concurrency: Option<usize>,
    query_timeout_secs: Option<u64>,
    run_timeout_secs: Option<u64>,
    min_significance_samples: Option<usize>,
    significance_level: Option<f64>,
    max_parallel_configurations: Option<usize>,
}

/// Read and parse an environment variable, ignoring values that do not parse.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (LLM_*, RAG_*)
    /// 2. Config file (~/.config/rag-lab/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Load an explicit config file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env();
        Ok(config)
    }

    /// Override fields from environment variables.
    fn apply_env(&mut self) {
        if let Ok(api_base) = env::var("LLM_API_BASE") {
            self.llm.api_base = api_base;
        }
        if let Ok(api_key) = env::var("LLM_API_KEY") {
            self.llm.api_key = api_key;
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(tokens) = env_parse("LLM_MAX_TOKENS") {
            self.llm.max_tokens = tokens;
        }
        if let Some(temp) = env_parse("LLM_TEMPERATURE") {
            self.llm.temperature = temp;
        }

        if let Ok(data_dir) = env::var("RAG_DATA_DIR") {
            self.corpus.data_dir = PathBuf::from(data_dir);
        }
        if let Some(size) = env_parse("RAG_CHUNK_SIZE") {
            self.corpus.chunk_size = size;
        }
        if let Some(overlap) = env_parse("RAG_CHUNK_OVERLAP") {
            self.corpus.chunk_overlap = overlap;
        }

        if let Some(k) = env_parse("RAG_RETRIEVAL_K") {
            self.eval.retrieval_k = k;
        }
        if let Some(concurrency) = env_parse("RAG_CONCURRENCY") {
            self.eval.concurrency = concurrency;
        }
        if let Some(secs) = env_parse("RAG_QUERY_TIMEOUT_SECS") {
            self.eval.query_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("RAG_RUN_TIMEOUT_SECS") {
            self.eval.run_timeout_secs = Some(secs);
        }
        if let Some(min) = env_parse("RAG_MIN_SIGNIFICANCE_SAMPLES") {
            self.eval.min_significance_samples = min;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, filling missing fields with defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file_config: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| EvalError::Config(format!("Failed to parse config file: {}", e)))?;

        let mut config = Config::default();

        if let Some(llm) = file_config.llm {
            if let Some(api_base) = llm.api_base {
                config.llm.api_base = api_base;
            }
            if let Some(api_key) = llm.api_key {
                config.llm.api_key = api_key;
            }
            if let Some(model) = llm.model {
                config.llm.model = model;
            }
            if let Some(max_tokens) = llm.max_tokens {
                config.llm.max_tokens = max_tokens;
            }
            if let Some(temperature) = llm.temperature {
                config.llm.temperature = temperature;
            }
        }

        if let Some(corpus) = file_config.corpus {
            if let Some(data_dir) = corpus.data_dir {
                config.corpus.data_dir = data_dir;
            }
            if let Some(chunk_size) = corpus.chunk_size {
                config.corpus.chunk_size = chunk_size;
            }
            if let Some(chunk_overlap) = corpus.chunk_overlap {
                config.corpus.chunk_overlap = chunk_overlap;
            }
        }

        if let Some(eval) = file_config.eval {
            if let Some(k) = eval.retrieval_k {
                config.eval.retrieval_k = k;
            }
            if let Some(concurrency) = eval.concurrency {
                config.eval.concurrency = concurrency;
            }
            if let Some(secs) = eval.query_timeout_secs {
                config.eval.query_timeout_secs = secs;
            }
            if eval.run_timeout_secs.is_some() {
                config.eval.run_timeout_secs = eval.run_timeout_secs;
            }
            if let Some(min) = eval.min_significance_samples {
                config.eval.min_significance_samples = min;
            }
            if let Some(level) = eval.significance_level {
                config.eval.significance_level = level;
            }
            if let Some(parallel) = eval.max_parallel_configurations {
                config.eval.max_parallel_configurations = parallel;
            }
        }

        Ok(config)
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "rag-lab")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate evaluation and corpus settings.
    pub fn validate(&self) -> Result<()> {
        if self.eval.retrieval_k == 0 {
            return Err(EvalError::Config(
                "retrieval_k must be at least 1. Set RAG_RETRIEVAL_K or fix the config file."
                    .to_string(),
            ));
        }

        if self.eval.concurrency == 0 {
            return Err(EvalError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }

        if self.eval.max_parallel_configurations == 0 {
            return Err(EvalError::Config(
                "max_parallel_configurations must be at least 1".to_string(),
            ));
        }

        if self.eval.query_timeout_secs == 0 {
            return Err(EvalError::Config(
                "query_timeout_secs must be at least 1".to_string(),
            ));
        }

        if !(self.eval.significance_level > 0.0 && self.eval.significance_level < 1.0) {
            return Err(EvalError::Config(format!(
                "significance_level must be in (0, 1), got {}",
                self.eval.significance_level
            )));
        }

        if self.corpus.chunk_size == 0 || self.corpus.chunk_overlap >= self.corpus.chunk_size {
            return Err(EvalError::Config(format!(
                "chunk_overlap ({}) must be smaller than a non-zero chunk_size ({})",
                self.corpus.chunk_overlap, self.corpus.chunk_size
            )));
        }

        Ok(())
    }

    /// Validate the settings needed to call the LLM.
    pub fn validate_llm(&self) -> Result<()> {
        if self.llm.api_base.is_empty() {
            return Err(EvalError::Config(
                "LLM API base URL is required. Set LLM_API_BASE environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.model.is_empty() {
            return Err(EvalError::Config(
                "LLM model is required. Set LLM_MODEL environment variable or add to config file."
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Create a config from explicit LLM values (useful for testing).
    pub fn with_llm(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm: LlmConfig {
                api_base: api_base.into(),
                api_key: api_key.into(),
                model: model.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.llm.model, "llama3");
        assert_eq!(config.llm.temperature, 0.0);
        assert_eq!(config.corpus.chunk_size, 500);
        assert_eq!(config.corpus.chunk_overlap, 80);
        assert_eq!(config.eval.retrieval_k, 4);
        assert!(config.validate().is_ok());
        assert!(config.validate_llm().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_k() {
        let mut config = Config::default();
        config.eval.retrieval_k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlap_larger_than_chunk() {
        let mut config = Config::default();
        config.corpus.chunk_size = 100;
        config.corpus.chunk_overlap = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_llm_requires_model() {
        let config = Config::with_llm("http://localhost:11434", "", "");
        assert!(config.validate_llm().is_err());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
llm:
  model: mistral
corpus:
  chunk_size: 1000
eval:
  retrieval_k: 7
  run_timeout_secs: 300
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.llm.model, "mistral");
        assert_eq!(config.llm.api_base, "http://localhost:11434");
        assert_eq!(config.corpus.chunk_size, 1000);
        assert_eq!(config.corpus.chunk_overlap, 80);
        assert_eq!(config.eval.retrieval_k, 7);
        assert_eq!(config.eval.run_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_from_yaml_invalid() {
        assert!(Config::from_yaml("llm: [unclosed").is_err());
    }
}
