//! Pipeline factory over the built-in lexical corpus.
//!
//! Recognized parameters:
//! - `chunk_size`, `chunk_overlap`: chunking of the corpus
//! - `generator`: `extractive` or `llm`
//! - `model`: chat model for the LLM generator and judge
//! - `scorer`: `none`, `keyword`, `reference` or `llm_judge`

use super::config::{DEFAULT_OVERLAP_PERCENT, ExperimentConfig};
use crate::config::LlmConfig;
use crate::corpus::{ChunkConfig, Corpus, LexicalIndex};
use crate::error::{EvalError, Result};
use crate::generation::{ExtractiveGenerator, LlmGenerator};
use crate::llm::LlmClient;
use crate::pipeline::{Generator, Pipeline, PipelineFactory, RelevanceScorer};
use crate::scoring::{KeywordOverlapScorer, LlmJudgeScorer, ReferenceSimilarityScorer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Answer generator choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    Extractive,
    Llm,
}

impl FromStr for GeneratorKind {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "extractive" => Ok(GeneratorKind::Extractive),
            "llm" => Ok(GeneratorKind::Llm),
            other => Err(EvalError::Configuration(format!(
                "unknown generator '{}' (expected extractive or llm)",
                other
            ))),
        }
    }
}

/// Relevance scorer choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerKind {
    None,
    Keyword,
    Reference,
    LlmJudge,
}

impl FromStr for ScorerKind {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(ScorerKind::None),
            "keyword" => Ok(ScorerKind::Keyword),
            "reference" => Ok(ScorerKind::Reference),
            "llm_judge" | "judge" => Ok(ScorerKind::LlmJudge),
            other => Err(EvalError::Configuration(format!(
                "unknown scorer '{}' (expected none, keyword, reference or llm_judge)",
                other
            ))),
        }
    }
}

/// Builds lexical-index pipelines from experiment configurations.
pub struct CorpusPipelineFactory {
    corpus: Arc<Corpus>,
    chunking: ChunkConfig,
    llm: Option<LlmConfig>,
    generator: GeneratorKind,
    scorer: ScorerKind,
    indexes: Mutex<HashMap<(usize, usize), Arc<LexicalIndex>>>,
}

impl CorpusPipelineFactory {
    /// Offline factory: extractive answers scored by keyword overlap.
    pub fn new(corpus: Arc<Corpus>, chunking: ChunkConfig) -> Self {
        Self {
            corpus,
            chunking,
            llm: None,
            generator: GeneratorKind::Extractive,
            scorer: ScorerKind::Keyword,
            indexes: Mutex::new(HashMap::new()),
        }
    }

    /// Enable LLM-backed collaborators; LLM generation becomes the default.
    pub fn with_llm(mut self, llm: LlmConfig) -> Self {
        self.llm = Some(llm);
        self.generator = GeneratorKind::Llm;
        self
    }

    pub fn with_generator(mut self, generator: GeneratorKind) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_scorer(mut self, scorer: ScorerKind) -> Self {
        self.scorer = scorer;
        self
    }

    /// Chunking for `config`. Without an explicit overlap, the default overlap is
    /// kept when it fits the chunk size, else a proportional one is used.
    fn chunking_for(&self, config: &ExperimentConfig) -> Result<ChunkConfig> {
        let chunk_size = config
            .get_usize("chunk_size")?
            .unwrap_or(self.chunking.chunk_size);
        let chunk_overlap = match config.get_usize("chunk_overlap")? {
            Some(overlap) => overlap,
            None if self.chunking.chunk_overlap < chunk_size => self.chunking.chunk_overlap,
            None => chunk_size * DEFAULT_OVERLAP_PERCENT / 100,
        };

        let chunking = ChunkConfig {
            chunk_size,
            chunk_overlap,
        };
        chunking.validate()?;
        Ok(chunking)
    }

    fn index_for(&self, chunking: ChunkConfig) -> Result<Arc<LexicalIndex>> {
        let key = (chunking.chunk_size, chunking.chunk_overlap);
        let mut indexes = self
            .indexes
            .lock()
            .map_err(|_| EvalError::Retrieval("index cache lock poisoned".to_string()))?;

        if let Some(index) = indexes.get(&key) {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(LexicalIndex::build(&self.corpus, chunking)?);
        indexes.insert(key, Arc::clone(&index));
        Ok(index)
    }

    fn llm_client(&self, config: &ExperimentConfig, purpose: &str) -> Result<LlmClient> {
        let llm = self.llm.clone().ok_or_else(|| {
            EvalError::Configuration(format!(
                "{} requires an LLM endpoint, but none is configured",
                purpose
            ))
        })?;
        let client = LlmClient::new(llm);
        Ok(match config.get_str("model")? {
            Some(model) => client.with_model(model),
            None => client,
        })
    }
}

#[async_trait]
impl PipelineFactory for CorpusPipelineFactory {
    async fn build(&self, config: &ExperimentConfig) -> Result<Pipeline> {
        let chunking = self.chunking_for(config)?;

        let generator_kind = match config.get_str("generator")? {
            Some(name) => name.parse()?,
            None => self.generator,
        };
        let scorer_kind = match config.get_str("scorer")? {
            Some(name) => name.parse()?,
            None => self.scorer,
        };

        let generator: Arc<dyn Generator> = match generator_kind {
            GeneratorKind::Extractive => Arc::new(ExtractiveGenerator::default()),
            GeneratorKind::Llm => Arc::new(LlmGenerator::new(
                self.llm_client(config, "the llm generator")?,
            )),
        };

        let scorer: Option<Arc<dyn RelevanceScorer>> = match scorer_kind {
            ScorerKind::None => None,
            ScorerKind::Keyword => Some(Arc::new(KeywordOverlapScorer)),
            ScorerKind::Reference => Some(Arc::new(ReferenceSimilarityScorer)),
            ScorerKind::LlmJudge => Some(Arc::new(LlmJudgeScorer::new(
                self.llm_client(config, "the llm_judge scorer")?,
            ))),
        };

        let index = self.index_for(chunking)?;
        debug!(
            configuration = %config.name,
            chunks = index.len(),
            generator = ?generator_kind,
            scorer = ?scorer_kind,
            "Built pipeline"
        );

        let mut pipeline = Pipeline::new(index, generator);
        pipeline.scorer = scorer;
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Retriever;
    use crate::query::sample_documents;

    fn factory() -> CorpusPipelineFactory {
        CorpusPipelineFactory::new(
            Arc::new(Corpus::from_pairs(sample_documents())),
            ChunkConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_build_offline_pipeline() {
        let pipeline = factory()
            .build(&ExperimentConfig::new("default"))
            .await
            .unwrap();
        let chunks = pipeline.retriever.retrieve("login", 2).await.unwrap();
        assert!(!chunks.is_empty());
        assert_eq!(pipeline.scorer.as_ref().map(|s| s.name()), Some("keyword_overlap"));
    }

    #[tokio::test]
    async fn test_invalid_chunking_is_a_configuration_error() {
        let config = ExperimentConfig::new("bad-config")
            .with_param("chunk_size", 100usize)
            .with_param("chunk_overlap", 200usize);
        let err = factory().build(&config).await.unwrap_err();
        assert!(matches!(err, EvalError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_llm_generator_without_endpoint_is_excluded() {
        let config = ExperimentConfig::new("llm").with_param("generator", "llm");
        let err = factory().build(&config).await.unwrap_err();
        assert!(matches!(err, EvalError::Configuration(_)));

        let config = ExperimentConfig::new("odd").with_param("scorer", "vibes");
        let err = factory().build(&config).await.unwrap_err();
        assert!(matches!(err, EvalError::Configuration(_)));
    }

    #[test]
    fn test_default_overlap_adapts_to_small_chunks() {
        let f = factory();
        let config = ExperimentConfig::new("small").with_param("chunk_size", 60usize);
        let chunking = f.chunking_for(&config).unwrap();
        assert_eq!(chunking.chunk_overlap, 9);

        let config = ExperimentConfig::new("large").with_param("chunk_size", 1000usize);
        assert_eq!(f.chunking_for(&config).unwrap().chunk_overlap, 80);
    }

    #[test]
    fn test_index_cache_reuses_builds() {
        let f = factory();
        let a = f.index_for(ChunkConfig::default()).unwrap();
        let b = f.index_for(ChunkConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
