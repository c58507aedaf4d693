//! Experiment reports: per-configuration outcomes, cross-configuration
//! summaries, sweep trends and A/B comparisons.

use super::config::{ExperimentConfig, ParamValue};
use crate::error::{ErrorCategory, EvalError};
use crate::evaluation::{EvaluationRun, Metric, MetricValue};
use crate::stats::{TTest, interpret_effect_size, mean, std_dev, variance, welch_t_test};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Differences smaller than this are treated as equal in trends.
const TREND_TOLERANCE: f64 = 1e-9;

/// How the configurations of an experiment relate to each other.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Unrelated configurations; only summaries are reported.
    #[default]
    Independent,
    /// Configurations differ in one parameter.
    Sweep { parameter: String },
    /// Exactly two configurations: baseline first, candidate second.
    AbTest,
}

/// What happened to one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfigurationOutcome {
    Completed { run: Box<EvaluationRun> },
    Excluded { reason: String },
    Failed { category: ErrorCategory, message: String },
}

/// Result of one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationResult {
    pub name: String,
    pub params: BTreeMap<String, ParamValue>,
    pub outcome: ConfigurationOutcome,
}

impl ConfigurationResult {
    pub(crate) fn completed(config: &ExperimentConfig, run: EvaluationRun) -> Self {
        Self::with_outcome(
            config,
            ConfigurationOutcome::Completed { run: Box::new(run) },
        )
    }

    /// Configuration errors exclude the configuration; anything else fails it.
    pub(crate) fn from_error(config: &ExperimentConfig, error: &EvalError) -> Self {
        let outcome = match error {
            EvalError::Configuration(reason) => ConfigurationOutcome::Excluded {
                reason: reason.clone(),
            },
            other => ConfigurationOutcome::Failed {
                category: other.category(),
                message: other.to_string(),
            },
        };
        Self::with_outcome(config, outcome)
    }

    fn with_outcome(config: &ExperimentConfig, outcome: ConfigurationOutcome) -> Self {
        Self {
            name: config.name.clone(),
            params: config.params.clone(),
            outcome,
        }
    }

    pub fn run(&self) -> Option<&EvaluationRun> {
        match &self.outcome {
            ConfigurationOutcome::Completed { run } => Some(run),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.run().is_some()
    }

    /// Headline cell of `metric`. Configurations that did not complete carry
    /// their own exclusion or failure.
    pub fn cell(&self, metric: Metric) -> MetricValue {
        match &self.outcome {
            ConfigurationOutcome::Completed { run } => run.aggregate.metric_value(metric),
            ConfigurationOutcome::Excluded { reason } => {
                MetricValue::excluded(format!("configuration excluded: {}", reason))
            }
            ConfigurationOutcome::Failed { category, message } => MetricValue::Failed {
                category: *category,
                message: message.clone(),
            },
        }
    }

    /// Headline value of `metric` for a completed configuration.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        self.run().and_then(|run| run.aggregate.value(metric))
    }

    /// Chunks in the index this configuration retrieved from.
    pub fn index_chunks(&self) -> Option<usize> {
        self.run().and_then(|run| run.index_chunks)
    }

    /// Mean answer length in characters.
    pub fn mean_answer_length(&self) -> Option<f64> {
        self.run()
            .and_then(|run| run.aggregate.answer_length.as_ref())
            .map(|s| s.mean)
    }
}

/// A configuration and its value of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationScore {
    pub configuration: String,
    pub value: f64,
}

/// One metric across all completed configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricSummary {
    Computed {
        configurations: usize,
        mean: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variance: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        std_dev: Option<f64>,
        best: ConfigurationScore,
        worst: ConfigurationScore,
    },
    /// No configuration produced a value.
    Excluded { reason: String },
}

impl MetricSummary {
    pub fn configurations(&self) -> usize {
        match self {
            MetricSummary::Computed { configurations, .. } => *configurations,
            MetricSummary::Excluded { .. } => 0,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        match self {
            MetricSummary::Computed { mean, .. } => Some(*mean),
            MetricSummary::Excluded { .. } => None,
        }
    }

    pub fn best(&self) -> Option<&ConfigurationScore> {
        match self {
            MetricSummary::Computed { best, .. } => Some(best),
            MetricSummary::Excluded { .. } => None,
        }
    }

    pub fn worst(&self) -> Option<&ConfigurationScore> {
        match self {
            MetricSummary::Computed { worst, .. } => Some(worst),
            MetricSummary::Excluded { .. } => None,
        }
    }
}

/// One summary per metric, excluded with a reason when nothing computed it.
pub(crate) fn summarize(results: &[ConfigurationResult]) -> BTreeMap<Metric, MetricSummary> {
    Metric::ALL
        .iter()
        .map(|&metric| {
            let scores: Vec<ConfigurationScore> = results
                .iter()
                .filter_map(|r| {
                    r.value(metric).map(|value| ConfigurationScore {
                        configuration: r.name.clone(),
                        value,
                    })
                })
                .collect();
            let values: Vec<f64> = scores.iter().map(|s| s.value).collect();
            let higher = metric.higher_is_better();

            let summary = match (
                mean(&values),
                best_of(&scores, higher),
                best_of(&scores, !higher),
            ) {
                (Some(mean), Some(best), Some(worst)) => MetricSummary::Computed {
                    configurations: scores.len(),
                    mean,
                    variance: variance(&values),
                    std_dev: std_dev(&values),
                    best: best.clone(),
                    worst: worst.clone(),
                },
                _ => MetricSummary::Excluded {
                    reason: missing_reason(results, metric),
                },
            };
            (metric, summary)
        })
        .collect()
}

/// Why no configuration has a value for `metric`: the first completed
/// configuration's cell reason, or the fact that none completed.
fn missing_reason(results: &[ConfigurationResult], metric: Metric) -> String {
    results
        .iter()
        .filter(|r| r.is_completed())
        .find_map(|r| match r.cell(metric) {
            MetricValue::Excluded { reason } => Some(format!("{}: {}", r.name, reason)),
            MetricValue::Failed { message, .. } => Some(format!("{}: failed: {}", r.name, message)),
            MetricValue::Computed { .. } => None,
        })
        .unwrap_or_else(|| "no configuration completed".to_string())
}

/// Best score in the given direction; the first configuration wins ties.
fn best_of(scores: &[ConfigurationScore], higher_is_better: bool) -> Option<&ConfigurationScore> {
    scores.iter().reduce(|best, candidate| {
        let better = if higher_is_better {
            candidate.value > best.value
        } else {
            candidate.value < best.value
        };
        if better { candidate } else { best }
    })
}

/// Shape of a metric across swept values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Flat,
    Mixed,
}

impl TrendDirection {
    /// Direction of `values` in order. Fewer than two values is flat.
    pub fn of(values: &[f64]) -> Self {
        let mut rising = false;
        let mut falling = false;
        for pair in values.windows(2) {
            let diff = pair[1] - pair[0];
            if diff > TREND_TOLERANCE {
                rising = true;
            } else if diff < -TREND_TOLERANCE {
                falling = true;
            }
        }
        match (rising, falling) {
            (false, false) => TrendDirection::Flat,
            (true, false) => TrendDirection::Increasing,
            (false, true) => TrendDirection::Decreasing,
            (true, true) => TrendDirection::Mixed,
        }
    }
}

/// One swept value and the metric it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub configuration: String,
    pub parameter_value: ParamValue,
    pub value: MetricValue,
}

/// Trend of one metric over the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTrend {
    pub metric: Metric,
    pub points: Vec<TrendPoint>,
    pub direction: TrendDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<TrendPoint>,
}

/// Sweep comparison: one trend per metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepComparison {
    pub parameter: String,
    pub trends: Vec<MetricTrend>,
}

impl SweepComparison {
    pub(crate) fn build(parameter: &str, results: &[ConfigurationResult]) -> Self {
        let trends = Metric::ALL
            .iter()
            .map(|&metric| {
                let points: Vec<TrendPoint> = results
                    .iter()
                    .filter_map(|r| {
                        r.params.get(parameter).map(|value| TrendPoint {
                            configuration: r.name.clone(),
                            parameter_value: value.clone(),
                            value: r.cell(metric),
                        })
                    })
                    .collect();

                let computed: Vec<(&TrendPoint, f64)> = points
                    .iter()
                    .filter_map(|p| p.value.value().map(|v| (p, v)))
                    .collect();
                let values: Vec<f64> = computed.iter().map(|(_, v)| *v).collect();
                let best = computed
                    .iter()
                    .copied()
                    .reduce(|best, candidate| {
                        let better = if metric.higher_is_better() {
                            candidate.1 > best.1
                        } else {
                            candidate.1 < best.1
                        };
                        if better { candidate } else { best }
                    })
                    .map(|(point, _)| point.clone());

                MetricTrend {
                    metric,
                    direction: TrendDirection::of(&values),
                    points,
                    best,
                }
            })
            .collect();

        Self {
            parameter: parameter.to_string(),
            trends,
        }
    }

    pub fn trend(&self, metric: Metric) -> Option<&MetricTrend> {
        self.trends.iter().find(|t| t.metric == metric)
    }
}

/// Statistical significance of an A/B difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Significance {
    Computed {
        test: TTest,
        significant: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        effect_size: Option<String>,
    },
    InsufficientData { required: usize, available: usize },
    Unavailable { reason: String },
}

/// Baseline vs candidate for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub metric: Metric,
    pub baseline: MetricValue,
    pub candidate: MetricValue,
    /// candidate - baseline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    /// delta / |baseline|; absent when the baseline is zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_change: Option<f64>,
    pub significance: Significance,
}

/// A/B comparison of two configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AbComparison {
    Available {
        baseline: String,
        candidate: String,
        metrics: Vec<MetricDelta>,
    },
    Unavailable {
        baseline: String,
        candidate: String,
        reason: String,
    },
}

impl AbComparison {
    pub(crate) fn build(
        baseline: &ConfigurationResult,
        candidate: &ConfigurationResult,
        min_samples: usize,
        significance_level: f64,
    ) -> Self {
        let (base_run, cand_run) = match (baseline.run(), candidate.run()) {
            (Some(b), Some(c)) => (b, c),
            _ => {
                let missing: Vec<&str> = [baseline, candidate]
                    .into_iter()
                    .filter(|r| !r.is_completed())
                    .map(|r| r.name.as_str())
                    .collect();
                return AbComparison::Unavailable {
                    baseline: baseline.name.clone(),
                    candidate: candidate.name.clone(),
                    reason: format!("configuration(s) did not complete: {}", missing.join(", ")),
                };
            }
        };

        let metrics = Metric::ALL
            .iter()
            .map(|&metric| {
                let base_cell = base_run.aggregate.metric_value(metric);
                let cand_cell = cand_run.aggregate.metric_value(metric);
                let base_value = base_cell.value();
                let delta = base_value.zip(cand_cell.value()).map(|(b, c)| c - b);
                let relative_change = delta
                    .zip(base_value)
                    .filter(|(_, b)| b.abs() > f64::EPSILON)
                    .map(|(d, b)| d / b.abs());

                MetricDelta {
                    metric,
                    baseline: base_cell,
                    candidate: cand_cell,
                    delta,
                    relative_change,
                    significance: significance(
                        &base_run.samples(metric),
                        &cand_run.samples(metric),
                        min_samples,
                        significance_level,
                    ),
                }
            })
            .collect();

        AbComparison::Available {
            baseline: baseline.name.clone(),
            candidate: candidate.name.clone(),
            metrics,
        }
    }

    pub fn metric(&self, metric: Metric) -> Option<&MetricDelta> {
        match self {
            AbComparison::Available { metrics, .. } => metrics.iter().find(|m| m.metric == metric),
            AbComparison::Unavailable { .. } => None,
        }
    }
}

fn significance(a: &[f64], b: &[f64], min_samples: usize, level: f64) -> Significance {
    let required = min_samples.max(2);
    let available = a.len().min(b.len());
    if available < required {
        return Significance::InsufficientData {
            required,
            available,
        };
    }

    match welch_t_test(a, b) {
        Ok(test) => Significance::Computed {
            significant: test.p_value < level,
            effect_size: test.cohens_d.map(|d| interpret_effect_size(d).to_string()),
            test,
        },
        Err(e) => Significance::Unavailable {
            reason: e.to_string(),
        },
    }
}

/// Comparison section of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Comparison {
    Sweep(SweepComparison),
    AbTest(AbComparison),
}

/// Full experiment report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub mode: ComparisonMode,
    pub query_set: String,
    pub query_count: usize,
    /// One entry per configuration, in input order.
    pub results: Vec<ConfigurationResult>,
    pub summaries: BTreeMap<Metric, MetricSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<Comparison>,
}

impl ExperimentReport {
    pub fn result(&self, name: &str) -> Option<&ConfigurationResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn completed(&self) -> impl Iterator<Item = &ConfigurationResult> {
        self.results.iter().filter(|r| r.is_completed())
    }
}
