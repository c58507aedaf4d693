//! rag-lab - retrieval evaluation and experimentation for RAG pipelines.
//!
//! Runs a labeled query set through a retrieval + generation pipeline, computes
//! IR and answer-quality metrics, and compares pipeline configurations through
//! parameter sweeps and A/B tests.
//!
//! # Overview
//!
//! 1. A [`QuerySet`] holds queries with ground-truth relevant ids.
//! 2. A [`Pipeline`] bundles a [`Retriever`], a [`Generator`] and an optional
//!    [`RelevanceScorer`]; any of them can be a remote service.
//! 3. The [`Evaluator`] produces an [`EvaluationRun`] with per-query metric cells
//!    and aggregates over the successful queries.
//! 4. An [`Experiment`] evaluates many named configurations and produces an
//!    [`ExperimentReport`] with summaries and a sweep or A/B comparison.
//!
//! # Quick Start
//!
//! ```no_run
//! use rag_lab::{
//!     corpus::{ChunkConfig, Corpus, LexicalIndex},
//!     evaluation::Evaluator,
//!     generation::ExtractiveGenerator,
//!     persistence::save_report,
//!     pipeline::Pipeline,
//!     query::{create_sample_query_set, sample_documents},
//!     scoring::KeywordOverlapScorer,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let corpus = Corpus::from_pairs(sample_documents());
//!     let index = LexicalIndex::build(&corpus, ChunkConfig::default())?;
//!
//!     let pipeline = Pipeline::new(Arc::new(index), Arc::new(ExtractiveGenerator::default()))
//!         .with_scorer(Arc::new(KeywordOverlapScorer));
//!
//!     let run = Evaluator::default()
//!         .evaluate(&create_sample_query_set(), &pipeline, None, 4)
//!         .await?;
//!
//!     println!("recall@4 = {:?}", run.aggregate.recall.value.value());
//!     save_report(&run, Path::new("run.json"))?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **metrics / stats**: pure ranked-list metrics and summary statistics
//! - **evaluation**: the evaluation engine
//! - **analysis**: chunk popularity, per-rank scores and flagged queries of a run
//! - **experiment**: configurations, sweeps, A/B comparison, pipeline factory
//! - **corpus / generation / scoring / llm**: reference collaborators
//! - **persistence**: JSON and YAML reports

pub mod analysis;
pub mod config;
pub mod corpus;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod generation;
pub mod llm;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod query;
pub mod retrieval;
pub mod scoring;
pub mod stats;

// Re-export commonly used types
pub use config::Config;
pub use error::{ErrorCategory, EvalError, Result};
pub use evaluation::{EvaluationOptions, EvaluationRun, Evaluator, Metric, MetricValue};
pub use experiment::{Experiment, ExperimentConfig, ExperimentOptions, ExperimentReport};
pub use pipeline::{Generator, Pipeline, PipelineFactory, RelevanceScorer, Retriever};
pub use persistence::{load_report, save_report};
pub use query::{QueryRecord, QuerySet};
pub use retrieval::ScoredChunk;
