//! Experiment framework.
//!
//! Runs the evaluation engine once per named configuration and collects the
//! outcomes into an [`ExperimentReport`], with cross-configuration summaries
//! and an optional sweep or A/B comparison.
//!
//! ```no_run
//! use rag_lab::corpus::{ChunkConfig, Corpus};
//! use rag_lab::experiment::{
//!     CorpusPipelineFactory, Experiment, ExperimentConfig, ExperimentOptions, ParameterSweep,
//! };
//! use rag_lab::query::{create_sample_query_set, sample_documents};
//! use std::sync::Arc;
//!
//! # async fn demo() -> rag_lab::Result<()> {
//! let corpus = Arc::new(Corpus::from_pairs(sample_documents()));
//! let factory = CorpusPipelineFactory::new(corpus, ChunkConfig::default());
//! let sweep = ParameterSweep::k_values(ExperimentConfig::new("base"), &[3, 5, 7]);
//!
//! let experiment = Experiment::new("k-sweep", ExperimentOptions::default());
//! let report = experiment
//!     .run_sweep(&sweep, &create_sample_query_set(), &factory)
//!     .await?;
//! println!("{} configurations", report.results.len());
//! # Ok(())
//! # }
//! ```

mod config;
mod factory;
mod report;

pub use config::{
    DEFAULT_CHUNK_SIZES, DEFAULT_K_VALUES, DEFAULT_OVERLAP_PERCENT, ExperimentConfig,
    ParamValue, ParameterSweep,
};
pub use factory::{CorpusPipelineFactory, GeneratorKind, ScorerKind};
pub use report::{
    AbComparison, Comparison, ComparisonMode, ConfigurationOutcome, ConfigurationResult,
    ConfigurationScore, ExperimentReport, MetricDelta, MetricSummary, MetricTrend,
    Significance, SweepComparison, TrendDirection, TrendPoint,
};

use crate::config::EvalConfig;
use crate::error::{EvalError, Result};
use crate::evaluation::{EvaluationOptions, Evaluator};
use crate::pipeline::PipelineFactory;
use crate::query::QuerySet;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use tracing::{info, warn};

/// Experiment settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentOptions {
    /// Retrieval depth for configurations without a `k` parameter.
    pub default_k: usize,
    pub evaluation: EvaluationOptions,
    /// Configurations evaluated at once; 1 runs them sequentially.
    pub max_parallel_configurations: usize,
    /// Minimum queries per arm before an A/B t-test is attempted.
    pub min_significance_samples: usize,
    pub significance_level: f64,
}

impl Default for ExperimentOptions {
    fn default() -> Self {
        Self::from(&EvalConfig::default())
    }
}

impl From<&EvalConfig> for ExperimentOptions {
    fn from(config: &EvalConfig) -> Self {
        Self {
            default_k: config.retrieval_k,
            evaluation: EvaluationOptions::from(config),
            max_parallel_configurations: config.max_parallel_configurations,
            min_significance_samples: config.min_significance_samples,
            significance_level: config.significance_level,
        }
    }
}

/// A named experiment over a set of configurations.
#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    options: ExperimentOptions,
    mode: ComparisonMode,
    evaluator: Evaluator,
}

impl Experiment {
    pub fn new(name: impl Into<String>, options: ExperimentOptions) -> Self {
        Self {
            name: name.into(),
            evaluator: Evaluator::new(options.evaluation.clone()),
            options,
            mode: ComparisonMode::Independent,
        }
    }

    pub fn with_mode(mut self, mode: ComparisonMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate every configuration and build the report.
    ///
    /// Returns an error only for setup problems: no configurations, duplicate
    /// names, an unusable query set, or an A/B experiment without exactly two
    /// configurations. Failing configurations are recorded in the report.
    pub async fn run(
        &self,
        configurations: &[ExperimentConfig],
        query_set: &QuerySet,
        factory: &dyn PipelineFactory,
    ) -> Result<ExperimentReport> {
        self.validate(configurations)?;
        query_set.validate()?;

        info!(
            experiment = %self.name,
            configurations = configurations.len(),
            queries = query_set.len(),
            parallel = self.options.max_parallel_configurations.max(1),
            "Starting experiment"
        );

        let mut slots: Vec<Option<ConfigurationResult>> = vec![None; configurations.len()];
        let mut finished = stream::iter(configurations.iter().enumerate())
            .map(|(index, config)| async move {
                (index, self.run_configuration(config, query_set, factory).await)
            })
            .buffer_unordered(self.options.max_parallel_configurations.max(1));

        while let Some((index, result)) = finished.next().await {
            slots[index] = Some(result);
        }
        let results: Vec<ConfigurationResult> = slots.into_iter().flatten().collect();

        let comparison = match &self.mode {
            ComparisonMode::Independent => None,
            ComparisonMode::Sweep { parameter } => {
                Some(Comparison::Sweep(SweepComparison::build(parameter, &results)))
            }
            ComparisonMode::AbTest => Some(Comparison::AbTest(AbComparison::build(
                &results[0],
                &results[1],
                self.options.min_significance_samples,
                self.options.significance_level,
            ))),
        };

        let report = ExperimentReport {
            name: self.name.clone(),
            created_at: Utc::now(),
            mode: self.mode.clone(),
            query_set: query_set.name.clone(),
            query_count: query_set.len(),
            summaries: report::summarize(&results),
            results,
            comparison,
        };

        info!(
            experiment = %self.name,
            completed = report.completed().count(),
            total = report.results.len(),
            "Experiment finished"
        );

        Ok(report)
    }

    /// Run every configuration of `sweep` and report trends over the swept parameter.
    pub async fn run_sweep(
        &self,
        sweep: &ParameterSweep,
        query_set: &QuerySet,
        factory: &dyn PipelineFactory,
    ) -> Result<ExperimentReport> {
        let experiment = self.clone().with_mode(ComparisonMode::Sweep {
            parameter: sweep.parameter().to_string(),
        });
        experiment
            .run(&sweep.configurations(), query_set, factory)
            .await
    }

    /// Compare `candidate` against `baseline`.
    pub async fn run_ab(
        &self,
        baseline: ExperimentConfig,
        candidate: ExperimentConfig,
        query_set: &QuerySet,
        factory: &dyn PipelineFactory,
    ) -> Result<ExperimentReport> {
        let experiment = self.clone().with_mode(ComparisonMode::AbTest);
        experiment
            .run(&[baseline, candidate], query_set, factory)
            .await
    }

    fn validate(&self, configurations: &[ExperimentConfig]) -> Result<()> {
        if configurations.is_empty() {
            return Err(EvalError::InvalidInput(format!(
                "experiment '{}' has no configurations",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for config in configurations {
            if !seen.insert(config.name.as_str()) {
                return Err(EvalError::InvalidInput(format!(
                    "duplicate configuration name '{}'",
                    config.name
                )));
            }
        }

        if self.mode == ComparisonMode::AbTest && configurations.len() != 2 {
            return Err(EvalError::InvalidInput(format!(
                "an A/B experiment needs exactly 2 configurations, got {}",
                configurations.len()
            )));
        }

        Ok(())
    }

    async fn run_configuration(
        &self,
        config: &ExperimentConfig,
        query_set: &QuerySet,
        factory: &dyn PipelineFactory,
    ) -> ConfigurationResult {
        let outcome = async {
            let k = config.retrieval_k(self.options.default_k)?;
            let pipeline = factory.build(config).await?;
            self.evaluator.evaluate(query_set, &pipeline, None, k).await
        }
        .await;

        match outcome {
            Ok(run) => {
                info!(
                    configuration = %config.name,
                    succeeded = run.aggregate.succeeded,
                    failed = run.aggregate.failed,
                    "Configuration completed"
                );
                ConfigurationResult::completed(config, run)
            }
            Err(error) => {
                warn!(
                    configuration = %config.name,
                    category = %error.category(),
                    error = %error,
                    "Configuration did not complete"
                );
                ConfigurationResult::from_error(config, &error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{ChunkConfig, Corpus};
    use crate::error::ErrorCategory;
    use crate::evaluation::{Metric, MetricValue};
    use crate::pipeline::{Generator, Pipeline, Retriever};
    use crate::query::{QueryRecord, create_sample_query_set, sample_documents};
    use crate::retrieval::ScoredChunk;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    fn sample_factory() -> CorpusPipelineFactory {
        CorpusPipelineFactory::new(
            Arc::new(Corpus::from_pairs(sample_documents())),
            ChunkConfig::default(),
        )
    }

    /// Ranks `doc0..doc9` in order, with a delay taken from the `delay_ms` parameter.
    struct ListRetriever {
        delay: Duration,
    }

    #[async_trait]
    impl Retriever for ListRetriever {
        async fn retrieve(&self, _query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
            tokio::time::sleep(self.delay).await;
            Ok((0..k.min(10))
                .map(|i| ScoredChunk::new(format!("doc{}", i), 1.0 - i as f64 * 0.05))
                .collect())
        }
    }

    struct EmptyGenerator;

    #[async_trait]
    impl Generator for EmptyGenerator {
        async fn generate(&self, _query: &str, _context: &[ScoredChunk]) -> Result<String> {
            Ok(String::new())
        }
    }

    /// Fails configurations named `broken`, otherwise builds a list pipeline.
    struct MockFactory;

    #[async_trait]
    impl PipelineFactory for MockFactory {
        async fn build(&self, config: &ExperimentConfig) -> Result<Pipeline> {
            if config.name == "broken" {
                return Err(EvalError::Http("vector store unreachable".into()));
            }
            let delay = config.get_usize("delay_ms")?.unwrap_or(0) as u64;
            Ok(Pipeline::new(
                Arc::new(ListRetriever {
                    delay: Duration::from_millis(delay),
                }),
                Arc::new(EmptyGenerator),
            ))
        }
    }

    /// Queries whose relevant items are `doc<i>` for i in `relevant`.
    fn list_queries(n: usize, relevant: &[usize]) -> QuerySet {
        let mut set = QuerySet::new("list");
        for i in 0..n {
            set.add(
                QueryRecord::new(format!("q{}", i), format!("question {}", i))
                    .with_relevant(relevant.iter().map(|r| format!("doc{}", r))),
            );
        }
        set
    }

    #[tokio::test]
    async fn test_bad_config_is_excluded_and_others_complete() {
        let configs = vec![
            ExperimentConfig::new("baseline"),
            ExperimentConfig::new("bad-config")
                .with_param("chunk_size", 100usize)
                .with_param("chunk_overlap", 150usize),
            ExperimentConfig::new("bigger-chunks").with_param("chunk_size", 1000usize),
        ];

        let report = Experiment::new("exclusion", ExperimentOptions::default())
            .run(&configs, &create_sample_query_set(), &sample_factory())
            .await
            .unwrap();

        assert_eq!(report.results.len(), 3);
        let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["baseline", "bad-config", "bigger-chunks"]);

        match &report.result("bad-config").unwrap().outcome {
            ConfigurationOutcome::Excluded { reason } => assert!(reason.contains("chunk_overlap")),
            other => panic!("expected excluded, got {:?}", other),
        }
        assert!(report.result("baseline").unwrap().is_completed());
        assert!(report.result("bigger-chunks").unwrap().is_completed());
        assert_eq!(report.summaries[&Metric::Recall].configurations(), 2);
    }

    #[tokio::test]
    async fn test_invalid_k_excludes_configuration() {
        let configs = vec![
            ExperimentConfig::new("zero").with_param("k", 0usize),
            ExperimentConfig::new("ok").with_param("k", 2usize),
        ];
        let report = Experiment::new("k", ExperimentOptions::default())
            .run(&configs, &list_queries(2, &[0]), &MockFactory)
            .await
            .unwrap();

        assert!(matches!(
            report.results[0].outcome,
            ConfigurationOutcome::Excluded { .. }
        ));
        assert_eq!(report.results[1].run().unwrap().k, 2);
    }

    #[tokio::test]
    async fn test_failing_configuration_does_not_abort() {
        let configs = vec![
            ExperimentConfig::new("broken"),
            ExperimentConfig::new("working"),
        ];
        let report = Experiment::new("failures", ExperimentOptions::default())
            .run(&configs, &list_queries(3, &[0]), &MockFactory)
            .await
            .unwrap();

        assert_eq!(report.results.len(), 2);
        assert!(matches!(
            report.results[0].outcome,
            ConfigurationOutcome::Failed {
                category: ErrorCategory::Backend,
                ..
            }
        ));
        assert!(report.results[1].is_completed());
    }

    #[tokio::test]
    async fn test_setup_errors() {
        let experiment = Experiment::new("setup", ExperimentOptions::default());
        let queries = list_queries(1, &[0]);

        let err = experiment.run(&[], &queries, &MockFactory).await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidInput(_)));

        let duplicate = vec![ExperimentConfig::new("a"), ExperimentConfig::new("a")];
        let err = experiment
            .run(&duplicate, &queries, &MockFactory)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidInput(_)));

        let err = experiment
            .clone()
            .with_mode(ComparisonMode::AbTest)
            .run(&[ExperimentConfig::new("only")], &queries, &MockFactory)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_recall_at_10_not_below_recall_at_3() {
        let configs = vec![
            ExperimentConfig::new("k3").with_param("k", 3usize),
            ExperimentConfig::new("k10").with_param("k", 10usize),
        ];
        let queries = create_sample_query_set();
        let report = Experiment::new("depth", ExperimentOptions::default())
            .run(&configs, &queries, &sample_factory())
            .await
            .unwrap();

        let k3 = report.result("k3").unwrap().run().unwrap();
        let k10 = report.result("k10").unwrap().run().unwrap();
        for (a, b) in k3.queries.iter().zip(&k10.queries) {
            assert_eq!(a.query_id, b.query_id);
            let (ra, rb) = (a.metrics.recall.value(), b.metrics.recall.value());
            assert!(rb.unwrap_or(0.0) >= ra.unwrap_or(0.0));
        }
    }

    #[tokio::test]
    async fn test_sweep_trend() {
        // Relevant items sit at ranks 1 and 6, so recall rises with k.
        let queries = list_queries(4, &[0, 5]);
        let sweep = ParameterSweep::k_values(ExperimentConfig::new("base"), &[1, 3, 6]);

        let report = Experiment::new("sweep", ExperimentOptions::default())
            .run_sweep(&sweep, &queries, &MockFactory)
            .await
            .unwrap();

        let Some(Comparison::Sweep(sweep)) = &report.comparison else {
            panic!("expected sweep comparison");
        };
        assert_eq!(sweep.parameter, "k");

        let recall = sweep.trend(Metric::Recall).unwrap();
        let values: Vec<_> = recall.points.iter().map(|p| p.value.value()).collect();
        assert_eq!(values, vec![Some(0.5), Some(0.5), Some(1.0)]);
        assert_eq!(recall.direction, TrendDirection::Increasing);
        assert_eq!(recall.best.as_ref().unwrap().configuration, "k=6");

        let precision = sweep.trend(Metric::Precision).unwrap();
        assert_eq!(precision.direction, TrendDirection::Decreasing);
        assert_eq!(precision.best.as_ref().unwrap().configuration, "k=1");

        assert_eq!(
            report.summaries[&Metric::Recall].best().unwrap().configuration,
            "k=6"
        );
    }

    #[tokio::test]
    async fn test_sweep_reports_excluded_metric_and_failed_configuration() {
        let configs = vec![
            ExperimentConfig::new("k=1").with_param("k", 1usize),
            ExperimentConfig::new("broken").with_param("k", 3usize),
            ExperimentConfig::new("k=0").with_param("k", 0usize),
        ];
        let report = Experiment::new("partial", ExperimentOptions::default())
            .with_mode(ComparisonMode::Sweep {
                parameter: "k".to_string(),
            })
            .run(&configs, &list_queries(2, &[0]), &MockFactory)
            .await
            .unwrap();

        // No scorer is configured, so relevance is never computed.
        assert_eq!(report.summaries.len(), Metric::ALL.len());
        match &report.summaries[&Metric::Relevance] {
            MetricSummary::Excluded { reason } => {
                assert!(reason.contains("k=1"));
                assert!(reason.contains("no relevance scorer"));
            }
            other => panic!("expected excluded summary, got {:?}", other),
        }
        assert_eq!(report.summaries[&Metric::Recall].configurations(), 1);

        let Some(Comparison::Sweep(sweep)) = &report.comparison else {
            panic!("expected sweep comparison");
        };
        let recall = sweep.trend(Metric::Recall).unwrap();
        assert_eq!(recall.points.len(), 3);
        assert_eq!(recall.points[0].value, MetricValue::Computed { value: 1.0 });
        assert!(matches!(
            recall.points[1].value,
            MetricValue::Failed {
                category: ErrorCategory::Backend,
                ..
            }
        ));
        assert!(matches!(recall.points[2].value, MetricValue::Excluded { .. }));
        assert_eq!(recall.best.as_ref().unwrap().configuration, "k=1");

        let relevance = sweep.trend(Metric::Relevance).unwrap();
        assert!(matches!(relevance.points[0].value, MetricValue::Excluded { .. }));
        assert!(relevance.best.is_none());
    }

    #[tokio::test]
    async fn test_ab_with_few_queries_reports_insufficient_data() {
        let report = Experiment::new("ab", ExperimentOptions::default())
            .run_ab(
                ExperimentConfig::new("baseline").with_param("k", 1usize),
                ExperimentConfig::new("candidate").with_param("k", 6usize),
                &list_queries(5, &[0, 5]),
                &MockFactory,
            )
            .await
            .unwrap();

        let Some(Comparison::AbTest(ab)) = &report.comparison else {
            panic!("expected A/B comparison");
        };
        let recall = ab.metric(Metric::Recall).unwrap();
        assert_eq!(recall.baseline.value(), Some(0.5));
        assert_eq!(recall.candidate.value(), Some(1.0));
        let relevance = ab.metric(Metric::Relevance).unwrap();
        assert!(matches!(relevance.baseline, MetricValue::Excluded { .. }));
        assert_eq!(relevance.delta, None);
        assert_eq!(recall.delta, Some(0.5));
        assert_eq!(recall.relative_change, Some(1.0));
        assert_eq!(
            recall.significance,
            Significance::InsufficientData {
                required: 10,
                available: 5
            }
        );
    }

    #[tokio::test]
    async fn test_ab_significance_and_unavailable_arm() {
        let options = ExperimentOptions {
            min_significance_samples: 3,
            ..Default::default()
        };
        let mut queries = list_queries(6, &[0]);
        for i in 6..12 {
            queries.add(
                QueryRecord::new(format!("q{}", i), format!("question {}", i))
                    .with_relevant(["doc2"]),
            );
        }

        let report = Experiment::new("ab", options.clone())
            .run_ab(
                ExperimentConfig::new("baseline").with_param("k", 4usize),
                ExperimentConfig::new("candidate").with_param("k", 4usize),
                &queries,
                &MockFactory,
            )
            .await
            .unwrap();
        let Some(Comparison::AbTest(ab)) = &report.comparison else {
            panic!("expected A/B comparison");
        };
        // Identical pipelines: MRR samples are equal, so the test finds no difference.
        match &ab.metric(Metric::ReciprocalRank).unwrap().significance {
            Significance::Computed { significant, test, .. } => {
                assert!(!significant);
                assert_eq!(test.mean_difference, 0.0);
            }
            other => panic!("expected computed significance, got {:?}", other),
        }

        let report = Experiment::new("ab", options)
            .run_ab(
                ExperimentConfig::new("broken"),
                ExperimentConfig::new("candidate"),
                &queries,
                &MockFactory,
            )
            .await
            .unwrap();
        assert!(matches!(
            report.comparison,
            Some(Comparison::AbTest(AbComparison::Unavailable { .. }))
        ));
    }

    #[tokio::test]
    async fn test_parallel_configurations_keep_input_order() {
        let options = ExperimentOptions {
            max_parallel_configurations: 3,
            ..Default::default()
        };
        let configs = vec![
            ExperimentConfig::new("slow").with_param("delay_ms", 60usize),
            ExperimentConfig::new("medium").with_param("delay_ms", 30usize),
            ExperimentConfig::new("fast"),
        ];

        let report = Experiment::new("parallel", options)
            .run(&configs, &list_queries(2, &[1]), &MockFactory)
            .await
            .unwrap();

        let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "medium", "fast"]);
        assert!(report.results.iter().all(|r| r.is_completed()));
    }

    #[tokio::test]
    async fn test_report_round_trips_through_json() {
        let report = Experiment::new("json", ExperimentOptions::default())
            .run_ab(
                ExperimentConfig::new("baseline"),
                ExperimentConfig::new("broken"),
                &list_queries(2, &[0]),
                &MockFactory,
            )
            .await
            .unwrap();

        let json = serde_json::to_string_pretty(&report).unwrap();
        let back: ExperimentReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.results.len(), 2);
        assert_eq!(back.mode, ComparisonMode::AbTest);
        assert_eq!(
            back.results[0].run().unwrap().queries[0].metrics.recall,
            MetricValue::Computed { value: 1.0 }
        );
    }
}
