//! Collaborator contracts consumed by the evaluation engine.
//!
//! Retrieval, generation and scoring backends are reached only through these
//! traits, so any of them can be swapped for a remote service or a test double.

use crate::error::Result;
use crate::experiment::ExperimentConfig;
use crate::retrieval::ScoredChunk;
use async_trait::async_trait;
use std::sync::Arc;

/// An indexed corpus that answers top-k queries.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `k` chunks for `query`, best first.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>>;

    /// Whether `chunk_id` exists in the index right now.
    fn contains(&self, _chunk_id: &str) -> bool {
        true
    }

    /// Number of chunks in the index, when the backend can tell.
    fn chunk_count(&self) -> Option<usize> {
        None
    }
}

/// Produces an answer from a query and its retrieved context.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, query: &str, context: &[ScoredChunk]) -> Result<String>;
}

/// Scores a generated answer in [0, 1].
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// Short identifier written into reports.
    fn name(&self) -> &str;

    async fn score(&self, query: &str, answer: &str, reference: Option<&str>) -> Result<f64>;
}

/// A retrieval + generation pipeline, optionally with a relevance scorer.
#[derive(Clone)]
pub struct Pipeline {
    pub retriever: Arc<dyn Retriever>,
    pub generator: Arc<dyn Generator>,
    pub scorer: Option<Arc<dyn RelevanceScorer>>,
}

impl Pipeline {
    pub fn new(retriever: Arc<dyn Retriever>, generator: Arc<dyn Generator>) -> Self {
        Self {
            retriever,
            generator,
            scorer: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("scorer", &self.scorer.as_ref().map(|s| s.name().to_string()))
            .finish_non_exhaustive()
    }
}

/// Builds a pipeline for one experiment configuration.
///
/// Returning [`EvalError::Configuration`](crate::error::EvalError::Configuration)
/// marks the configuration as excluded rather than failed.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn build(&self, config: &ExperimentConfig) -> Result<Pipeline>;
}
