//! Evaluation engine.
//!
//! Runs every query of a [`QuerySet`] through a [`Pipeline`] (retrieve, validate,
//! generate, score), computes per-query metric cells and aggregates them over the
//! successful subset.
//!
//! Queries run concurrently up to [`EvaluationOptions::concurrency`]. Each query
//! has a deadline equal to the earlier of its own timeout and the run deadline;
//! an expired query is cancelled and recorded as a timeout failure. Results are
//! always reported in query-set order.

use crate::analysis::{AnalysisOptions, RetrievalAnalysis};
use crate::config::EvalConfig;
use crate::error::{ErrorCategory, EvalError, Result};
use crate::metrics::{GainFunction, Judgement};
use crate::pipeline::{Pipeline, RelevanceScorer};
use crate::query::{QueryRecord, QuerySet};
use crate::retrieval::{ScoredChunk, rank};
use crate::scoring::faithfulness;
use crate::stats::{Summary, mean};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// Metrics tracked per query and per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Precision,
    Recall,
    #[serde(rename = "mrr")]
    ReciprocalRank,
    Ndcg,
    #[serde(rename = "map")]
    AveragePrecision,
    HitRate,
    Relevance,
    Faithfulness,
    Similarity,
    LatencyMs,
}

impl Metric {
    pub const ALL: [Metric; 10] = [
        Metric::Precision,
        Metric::Recall,
        Metric::ReciprocalRank,
        Metric::Ndcg,
        Metric::AveragePrecision,
        Metric::HitRate,
        Metric::Relevance,
        Metric::Faithfulness,
        Metric::Similarity,
        Metric::LatencyMs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Precision => "precision",
            Metric::Recall => "recall",
            Metric::ReciprocalRank => "mrr",
            Metric::Ndcg => "ndcg",
            Metric::AveragePrecision => "map",
            Metric::HitRate => "hit_rate",
            Metric::Relevance => "relevance",
            Metric::Faithfulness => "faithfulness",
            Metric::Similarity => "similarity",
            Metric::LatencyMs => "latency_ms",
        }
    }

    /// Whether a larger value is better. Only latency is the other way round.
    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Metric::LatencyMs)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One metric cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricValue {
    Computed { value: f64 },
    Excluded { reason: String },
    Failed { category: ErrorCategory, message: String },
}

impl MetricValue {
    pub fn computed(value: f64) -> Self {
        MetricValue::Computed { value }
    }

    pub fn excluded(reason: impl Into<String>) -> Self {
        MetricValue::Excluded {
            reason: reason.into(),
        }
    }

    pub fn failed(error: &EvalError) -> Self {
        MetricValue::Failed {
            category: error.category(),
            message: error.to_string(),
        }
    }

    fn from_option(value: Option<f64>, reason: &str) -> Self {
        match value {
            Some(v) => Self::computed(v),
            None => Self::excluded(reason),
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            MetricValue::Computed { value } => Some(*value),
            _ => None,
        }
    }
}

const NO_GROUND_TRUTH: &str = "query has no ground-truth relevant items";

/// Metric cells of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub precision: MetricValue,
    pub recall: MetricValue,
    pub mrr: MetricValue,
    pub ndcg: MetricValue,
    pub map: MetricValue,
    pub hit_rate: MetricValue,
    pub relevance: MetricValue,
    pub faithfulness: MetricValue,
    /// Mean similarity score of the retrieved chunks.
    pub similarity: MetricValue,
}

impl QueryMetrics {
    /// Every cell failed with the same error.
    fn all_failed(error: &EvalError) -> Self {
        let cell = MetricValue::failed(error);
        Self {
            precision: cell.clone(),
            recall: cell.clone(),
            mrr: cell.clone(),
            ndcg: cell.clone(),
            map: cell.clone(),
            hit_rate: cell.clone(),
            relevance: cell.clone(),
            faithfulness: cell.clone(),
            similarity: cell,
        }
    }

    /// Cell for `metric`; `None` for latency, which is not a cell.
    pub fn get(&self, metric: Metric) -> Option<&MetricValue> {
        match metric {
            Metric::Precision => Some(&self.precision),
            Metric::Recall => Some(&self.recall),
            Metric::ReciprocalRank => Some(&self.mrr),
            Metric::Ndcg => Some(&self.ndcg),
            Metric::AveragePrecision => Some(&self.map),
            Metric::HitRate => Some(&self.hit_rate),
            Metric::Relevance => Some(&self.relevance),
            Metric::Faithfulness => Some(&self.faithfulness),
            Metric::Similarity => Some(&self.similarity),
            Metric::LatencyMs => None,
        }
    }
}

/// Wall-clock timings of one query in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryLatency {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_ms: Option<f64>,
    pub total_ms: f64,
}

/// Outcome of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryStatus {
    Succeeded,
    Failed { category: ErrorCategory, message: String },
}

/// Evaluation of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEvaluation {
    pub query_id: String,
    pub query: String,
    pub status: QueryStatus,
    /// Retrieved chunks, best first.
    #[serde(default)]
    pub retrieved: Vec<ScoredChunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub metrics: QueryMetrics,
    pub latency: QueryLatency,
}

impl QueryEvaluation {
    fn failed(record: &QueryRecord, error: EvalError, elapsed: Duration) -> Self {
        Self {
            query_id: record.id.clone(),
            query: record.query.clone(),
            status: QueryStatus::Failed {
                category: error.category(),
                message: error.to_string(),
            },
            retrieved: Vec::new(),
            answer: None,
            metrics: QueryMetrics::all_failed(&error),
            latency: QueryLatency {
                total_ms: millis(elapsed),
                ..Default::default()
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, QueryStatus::Succeeded)
    }

    /// Computed value of `metric`, if any. Latency counts only for successful queries.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::LatencyMs => self.succeeded().then_some(self.latency.total_ms),
            other => self.metrics.get(other).and_then(MetricValue::value),
        }
    }
}

/// An aggregate metric cell with the number of queries it was computed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCell {
    pub value: MetricValue,
    /// Queries contributing to the value.
    pub denominator: usize,
    /// Successful queries whose cell was excluded.
    pub excluded: usize,
    /// Queries whose cell failed.
    pub failed: usize,
}

impl AggregateCell {
    fn from_cells<'a>(cells: impl Iterator<Item = (&'a MetricValue, bool)>) -> Self {
        let mut values = Vec::new();
        let mut excluded = 0;
        let mut failed = 0;
        let mut first_reason: Option<String> = None;
        let mut any_succeeded = false;

        for (cell, succeeded) in cells {
            any_succeeded |= succeeded;
            match cell {
                MetricValue::Computed { value } => values.push(*value),
                MetricValue::Excluded { reason } => {
                    excluded += 1;
                    first_reason.get_or_insert_with(|| reason.clone());
                }
                MetricValue::Failed { .. } => failed += 1,
            }
        }

        let value = match mean(&values) {
            Some(m) => MetricValue::computed(m),
            None if !any_succeeded => MetricValue::excluded("no successful queries"),
            None => MetricValue::excluded(
                first_reason.unwrap_or_else(|| "no query produced a value".to_string()),
            ),
        };

        Self {
            value,
            denominator: values.len(),
            excluded,
            failed,
        }
    }
}

/// Latency statistics of the successful queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Summary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<Summary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Summary>,
}

/// Run-level metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub precision: AggregateCell,
    pub recall: AggregateCell,
    pub mrr: AggregateCell,
    pub ndcg: AggregateCell,
    pub map: AggregateCell,
    pub hit_rate: AggregateCell,
    pub relevance: AggregateCell,
    pub faithfulness: AggregateCell,
    pub similarity: AggregateCell,
    /// Similarity scores of every chunk retrieved for a successful query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_scores: Option<Summary>,
    /// Answer length in characters over the successful queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_length: Option<Summary>,
    pub latency: LatencySummary,
    /// Successful queries per second of run wall time.
    pub throughput_qps: f64,
}

impl AggregateMetrics {
    fn from_queries(queries: &[QueryEvaluation], duration: Duration) -> Self {
        let succeeded: Vec<&QueryEvaluation> = queries.iter().filter(|q| q.succeeded()).collect();

        let cell = |metric: Metric| {
            AggregateCell::from_cells(queries.iter().filter_map(|q| {
                q.metrics.get(metric).map(|cell| (cell, q.succeeded()))
            }))
        };

        let scores: Vec<f64> = succeeded
            .iter()
            .flat_map(|q| q.retrieved.iter().map(|c| c.score))
            .collect();
        let answer_chars: Vec<f64> = succeeded
            .iter()
            .filter_map(|q| q.answer.as_ref())
            .map(|a| a.chars().count() as f64)
            .collect();
        let total_ms: Vec<f64> = succeeded.iter().map(|q| q.latency.total_ms).collect();
        let retrieval_ms: Vec<f64> = succeeded
            .iter()
            .filter_map(|q| q.latency.retrieval_ms)
            .collect();
        let generation_ms: Vec<f64> = succeeded
            .iter()
            .filter_map(|q| q.latency.generation_ms)
            .collect();

        let seconds = duration.as_secs_f64();
        let throughput_qps = if seconds > 0.0 {
            succeeded.len() as f64 / seconds
        } else {
            0.0
        };

        Self {
            total: queries.len(),
            succeeded: succeeded.len(),
            failed: queries.len() - succeeded.len(),
            precision: cell(Metric::Precision),
            recall: cell(Metric::Recall),
            mrr: cell(Metric::ReciprocalRank),
            ndcg: cell(Metric::Ndcg),
            map: cell(Metric::AveragePrecision),
            hit_rate: cell(Metric::HitRate),
            relevance: cell(Metric::Relevance),
            faithfulness: cell(Metric::Faithfulness),
            similarity: cell(Metric::Similarity),
            retrieval_scores: Summary::from_values(&scores),
            answer_length: Summary::from_values(&answer_chars),
            latency: LatencySummary {
                total: Summary::from_values(&total_ms),
                retrieval: Summary::from_values(&retrieval_ms),
                generation: Summary::from_values(&generation_ms),
            },
            throughput_qps,
        }
    }

    /// Aggregate cell for `metric`; `None` for latency.
    pub fn cell(&self, metric: Metric) -> Option<&AggregateCell> {
        match metric {
            Metric::Precision => Some(&self.precision),
            Metric::Recall => Some(&self.recall),
            Metric::ReciprocalRank => Some(&self.mrr),
            Metric::Ndcg => Some(&self.ndcg),
            Metric::AveragePrecision => Some(&self.map),
            Metric::HitRate => Some(&self.hit_rate),
            Metric::Relevance => Some(&self.relevance),
            Metric::Faithfulness => Some(&self.faithfulness),
            Metric::Similarity => Some(&self.similarity),
            Metric::LatencyMs => None,
        }
    }

    /// Headline cell of `metric`: the aggregate cell, or mean latency.
    pub fn metric_value(&self, metric: Metric) -> MetricValue {
        match self.cell(metric) {
            Some(cell) => cell.value.clone(),
            None => MetricValue::from_option(
                self.latency.total.as_ref().map(|s| s.mean),
                "no successful queries",
            ),
        }
    }

    /// Headline value of `metric`: the cell mean, or mean latency.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::LatencyMs => self.latency.total.as_ref().map(|s| s.mean),
            other => self.cell(other).and_then(|c| c.value.value()),
        }
    }
}

/// Result of evaluating one query set against one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub query_set: String,
    pub k: usize,
    pub gain: GainFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorer: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    /// Chunks in the retriever's index, when it reports its size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_chunks: Option<usize>,
    /// Per-query results in query-set order.
    pub queries: Vec<QueryEvaluation>,
    pub aggregate: AggregateMetrics,
    #[serde(default)]
    pub analysis: RetrievalAnalysis,
}

impl EvaluationRun {
    /// Per-query values of `metric` over the queries that computed it, in query order.
    pub fn samples(&self, metric: Metric) -> Vec<f64> {
        self.queries.iter().filter_map(|q| q.value(metric)).collect()
    }

    /// Failed queries.
    pub fn failures(&self) -> impl Iterator<Item = &QueryEvaluation> {
        self.queries.iter().filter(|q| !q.succeeded())
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOptions {
    /// Maximum queries in flight.
    pub concurrency: usize,
    pub query_timeout: Duration,
    pub run_timeout: Option<Duration>,
    pub gain: GainFunction,
    pub analysis: AnalysisOptions,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self::from(&EvalConfig::default())
    }
}

impl From<&EvalConfig> for EvaluationOptions {
    fn from(config: &EvalConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            query_timeout: config.query_timeout(),
            run_timeout: config.run_timeout(),
            gain: GainFunction::Binary,
            analysis: AnalysisOptions::default(),
        }
    }
}

/// Stage output of a query that got through retrieval and generation.
struct StageOutput {
    retrieved: Vec<ScoredChunk>,
    answer: String,
    retrieval: Duration,
    generation: Duration,
}

/// Evaluates query sets against pipelines.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    options: EvaluationOptions,
}

impl Evaluator {
    pub fn new(options: EvaluationOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EvaluationOptions {
        &self.options
    }

    /// Evaluate `queries` against `pipeline` at cutoff `k`.
    ///
    /// `scorer` overrides the pipeline's own scorer. Only setup problems (empty
    /// query set, `k = 0`, zero concurrency) return an error; per-query failures
    /// are recorded on the query.
    pub async fn evaluate(
        &self,
        queries: &QuerySet,
        pipeline: &Pipeline,
        scorer: Option<Arc<dyn RelevanceScorer>>,
        k: usize,
    ) -> Result<EvaluationRun> {
        queries.validate()?;
        if k == 0 {
            return Err(EvalError::InvalidInput("k must be at least 1".to_string()));
        }
        if self.options.concurrency == 0 {
            return Err(EvalError::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let scorer = scorer.or_else(|| pipeline.scorer.clone());
        let scorer_ref = scorer.as_deref();
        let started_at = Utc::now();
        let start = Instant::now();
        let run_deadline = self.options.run_timeout.map(|t| start + t);

        info!(
            query_set = %queries.name,
            queries = queries.len(),
            k,
            concurrency = self.options.concurrency,
            scorer = scorer_ref.map(|s| s.name()).unwrap_or("none"),
            "Starting evaluation run"
        );

        let mut results: Vec<(usize, QueryEvaluation)> =
            stream::iter(queries.queries.iter().enumerate())
                .map(|(index, record)| async move {
                    let evaluation = self
                        .evaluate_query(record, pipeline, scorer_ref, k, run_deadline)
                        .await;
                    (index, evaluation)
                })
                .buffer_unordered(self.options.concurrency)
                .collect()
                .await;

        results.sort_by_key(|(index, _)| *index);
        let evaluations: Vec<QueryEvaluation> = results.into_iter().map(|(_, q)| q).collect();

        let duration = start.elapsed();
        let aggregate = AggregateMetrics::from_queries(&evaluations, duration);
        let index_chunks = pipeline.retriever.chunk_count();
        let analysis =
            RetrievalAnalysis::from_queries(&evaluations, index_chunks, &self.options.analysis);

        info!(
            query_set = %queries.name,
            succeeded = aggregate.succeeded,
            failed = aggregate.failed,
            flagged = analysis.flagged.len(),
            duration_ms = millis(duration),
            "Evaluation run finished"
        );

        Ok(EvaluationRun {
            query_set: queries.name.clone(),
            k,
            gain: self.options.gain,
            scorer: scorer_ref.map(|s| s.name().to_string()),
            started_at,
            duration_ms: millis(duration),
            index_chunks,
            queries: evaluations,
            aggregate,
            analysis,
        })
    }

    async fn evaluate_query(
        &self,
        record: &QueryRecord,
        pipeline: &Pipeline,
        scorer: Option<&dyn RelevanceScorer>,
        k: usize,
        run_deadline: Option<Instant>,
    ) -> QueryEvaluation {
        let start = Instant::now();

        if run_deadline.is_some_and(|deadline| start >= deadline) {
            let error = EvalError::Timeout("run deadline passed before the query started".into());
            warn!(query_id = %record.id, "Query skipped: run deadline passed");
            return QueryEvaluation::failed(record, error, Duration::ZERO);
        }

        let mut deadline = start + self.options.query_timeout;
        if let Some(run_deadline) = run_deadline {
            deadline = deadline.min(run_deadline);
        }

        let stages = match timeout_at(deadline, run_stages(record, pipeline, k)).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                warn!(query_id = %record.id, category = %error.category(), error = %error, "Query failed");
                return QueryEvaluation::failed(record, error, start.elapsed());
            }
            Err(_) => {
                let error = EvalError::Timeout(format!(
                    "query did not finish within {} ms",
                    millis(deadline.saturating_duration_since(start))
                ));
                warn!(query_id = %record.id, "Query timed out");
                return QueryEvaluation::failed(record, error, start.elapsed());
            }
        };

        let relevance = match scorer {
            None => MetricValue::excluded("no relevance scorer configured"),
            Some(scorer) => {
                let scored = timeout_at(
                    deadline,
                    scorer.score(&record.query, &stages.answer, record.reference_answer.as_deref()),
                )
                .await
                .unwrap_or_else(|_| Err(EvalError::Timeout("relevance scoring timed out".into())))
                .and_then(|score| {
                    if (0.0..=1.0).contains(&score) {
                        Ok(score)
                    } else {
                        Err(EvalError::Scoring(format!(
                            "scorer '{}' returned {} outside [0, 1]",
                            scorer.name(),
                            score
                        )))
                    }
                });
                match scored {
                    Ok(score) => MetricValue::computed(score),
                    Err(error) => {
                        warn!(query_id = %record.id, error = %error, "Relevance scoring failed");
                        MetricValue::failed(&error)
                    }
                }
            }
        };

        let metrics = compute_metrics(record, &stages, k, self.options.gain, relevance);
        let total = start.elapsed();

        debug!(
            query_id = %record.id,
            retrieved = stages.retrieved.len(),
            total_ms = millis(total),
            "Query evaluated"
        );

        QueryEvaluation {
            query_id: record.id.clone(),
            query: record.query.clone(),
            status: QueryStatus::Succeeded,
            latency: QueryLatency {
                retrieval_ms: Some(millis(stages.retrieval)),
                generation_ms: Some(millis(stages.generation)),
                total_ms: millis(total),
            },
            answer: Some(stages.answer),
            retrieved: stages.retrieved,
            metrics,
        }
    }
}

/// Retrieve, validate chunk ids and generate.
async fn run_stages(record: &QueryRecord, pipeline: &Pipeline, k: usize) -> Result<StageOutput> {
    let retrieval_start = Instant::now();
    let chunks = pipeline
        .retriever
        .retrieve(&record.query, k)
        .await
        .map_err(EvalError::into_retrieval)?;
    let retrieved = rank(chunks, k);
    let retrieval = retrieval_start.elapsed();

    // Scores must be finite to survive a JSON round trip.
    if let Some(bad) = retrieved.iter().find(|chunk| !chunk.score.is_finite()) {
        return Err(EvalError::Retrieval(format!(
            "retrieved chunk '{}' has non-finite score {}",
            bad.chunk_id, bad.score
        )));
    }

    if let Some(unknown) = retrieved
        .iter()
        .find(|chunk| !pipeline.retriever.contains(&chunk.chunk_id))
    {
        return Err(EvalError::Retrieval(format!(
            "retrieved chunk '{}' is not in the index",
            unknown.chunk_id
        )));
    }

    let generation_start = Instant::now();
    let answer = pipeline
        .generator
        .generate(&record.query, &retrieved)
        .await
        .map_err(EvalError::into_generation)?;
    let generation = generation_start.elapsed();

    Ok(StageOutput {
        retrieved,
        answer,
        retrieval,
        generation,
    })
}

fn compute_metrics(
    record: &QueryRecord,
    stages: &StageOutput,
    k: usize,
    gain: GainFunction,
    relevance: MetricValue,
) -> QueryMetrics {
    let judgement = Judgement::new(record, &stages.retrieved, gain);
    let similarity: Vec<f64> = stages.retrieved.iter().map(|c| c.score).collect();

    QueryMetrics {
        precision: MetricValue::computed(judgement.precision_at_k(k)),
        recall: MetricValue::from_option(judgement.recall_at_k(k), NO_GROUND_TRUTH),
        mrr: MetricValue::computed(judgement.reciprocal_rank(k)),
        ndcg: MetricValue::from_option(judgement.ndcg_at_k(k), NO_GROUND_TRUTH),
        map: MetricValue::from_option(judgement.average_precision(k), NO_GROUND_TRUTH),
        hit_rate: MetricValue::computed(if judgement.hits_at_k(k) > 0 { 1.0 } else { 0.0 }),
        relevance,
        faithfulness: MetricValue::computed(faithfulness(&stages.answer, &stages.retrieved)),
        similarity: MetricValue::from_option(mean(&similarity), "no chunks retrieved"),
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
