//! Retrieval analysis of an evaluation run.
//!
//! Looks at what the retriever returned rather than at ground truth:
//! - chunk and source popularity, and how much of the index was ever retrieved
//! - score statistics per rank position
//! - queries with no results, a weak best match, or scores too close to tell apart
//!
//! Only successful queries are analysed; failed queries carry their own error.

use crate::evaluation::QueryEvaluation;
use crate::stats::{Summary, std_dev};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Best-match similarity below which a query is flagged.
pub const DEFAULT_MIN_BEST_SCORE: f64 = 0.2;

/// Score standard deviation below which a query's results are flagged as indistinct.
pub const DEFAULT_MIN_SCORE_SPREAD: f64 = 0.01;

/// Number of most-retrieved chunks kept in the popularity listing.
pub const DEFAULT_TOP_CHUNKS: usize = 10;

/// Thresholds for retrieval analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    pub min_best_score: f64,
    pub min_score_spread: f64,
    pub top_chunks: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            min_best_score: DEFAULT_MIN_BEST_SCORE,
            min_score_spread: DEFAULT_MIN_SCORE_SPREAD,
            top_chunks: DEFAULT_TOP_CHUNKS,
        }
    }
}

/// How often one chunk or source was retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalCount {
    pub id: String,
    pub count: usize,
}

/// Which chunks and sources the retriever returns across a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkPopularity {
    /// Successful queries counted.
    pub queries: usize,
    pub total_retrievals: usize,
    pub unique_chunks: usize,
    /// Most retrieved chunks, most frequent first.
    pub top_chunks: Vec<RetrievalCount>,
    /// Every source document, most frequent first.
    pub sources: Vec<RetrievalCount>,
    /// unique chunks / index size; absent when the index size is unknown or zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
}

/// Score statistics of the chunks retrieved at one rank (1-based).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankStatistics {
    pub rank: usize,
    pub scores: Summary,
}

/// Why a query's retrieval looks problematic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum QueryIssue {
    NoResults,
    PoorSimilarity { best_score: f64 },
    LowDiscrimination { std_dev: f64 },
}

/// A query flagged by the analysis. One query can be flagged more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedQuery {
    pub query_id: String,
    pub query: String,
    pub issue: QueryIssue,
}

/// Retrieval analysis of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalAnalysis {
    pub popularity: ChunkPopularity,
    #[serde(default)]
    pub rank_statistics: Vec<RankStatistics>,
    #[serde(default)]
    pub flagged: Vec<FlaggedQuery>,
}

impl RetrievalAnalysis {
    /// Analyse the successful queries of a run. `index_chunks` is the index size, if known.
    pub fn from_queries(
        queries: &[QueryEvaluation],
        index_chunks: Option<usize>,
        options: &AnalysisOptions,
    ) -> Self {
        let succeeded: Vec<&QueryEvaluation> = queries.iter().filter(|q| q.succeeded()).collect();

        Self {
            popularity: popularity(&succeeded, index_chunks, options.top_chunks),
            rank_statistics: rank_statistics(&succeeded),
            flagged: succeeded
                .iter()
                .flat_map(|q| {
                    issues(q, options).into_iter().map(|issue| FlaggedQuery {
                        query_id: q.query_id.clone(),
                        query: q.query.clone(),
                        issue,
                    })
                })
                .collect(),
        }
    }
}

fn popularity(
    queries: &[&QueryEvaluation],
    index_chunks: Option<usize>,
    top_chunks: usize,
) -> ChunkPopularity {
    let mut chunk_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut source_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut total_retrievals = 0;

    for chunk in queries.iter().flat_map(|q| &q.retrieved) {
        *chunk_counts.entry(chunk.chunk_id.as_str()).or_default() += 1;
        let source = chunk.document_id.as_deref().unwrap_or("unknown");
        *source_counts.entry(source).or_default() += 1;
        total_retrievals += 1;
    }

    let unique_chunks = chunk_counts.len();
    let coverage = index_chunks
        .filter(|&total| total > 0)
        .map(|total| unique_chunks as f64 / total as f64);

    let mut top = by_count(chunk_counts);
    top.truncate(top_chunks);

    ChunkPopularity {
        queries: queries.len(),
        total_retrievals,
        unique_chunks,
        top_chunks: top,
        sources: by_count(source_counts),
        coverage,
    }
}

/// Counts sorted by descending count; equal counts stay in id order.
fn by_count(counts: BTreeMap<&str, usize>) -> Vec<RetrievalCount> {
    let mut sorted: Vec<RetrievalCount> = counts
        .into_iter()
        .map(|(id, count)| RetrievalCount {
            id: id.to_string(),
            count,
        })
        .collect();
    sorted.sort_by(|a, b| b.count.cmp(&a.count));
    sorted
}

fn rank_statistics(queries: &[&QueryEvaluation]) -> Vec<RankStatistics> {
    let mut by_rank: Vec<Vec<f64>> = Vec::new();
    for query in queries {
        for (position, chunk) in query.retrieved.iter().enumerate() {
            if by_rank.len() <= position {
                by_rank.resize_with(position + 1, Vec::new);
            }
            by_rank[position].push(chunk.score);
        }
    }

    by_rank
        .iter()
        .enumerate()
        .filter_map(|(position, scores)| {
            Summary::from_values(scores).map(|scores| RankStatistics {
                rank: position + 1,
                scores,
            })
        })
        .collect()
}

fn issues(query: &QueryEvaluation, options: &AnalysisOptions) -> Vec<QueryIssue> {
    let scores: Vec<f64> = query.retrieved.iter().map(|c| c.score).collect();
    let Some(best_score) = scores.iter().copied().reduce(f64::max) else {
        return vec![QueryIssue::NoResults];
    };

    let mut found = Vec::new();
    if best_score < options.min_best_score {
        found.push(QueryIssue::PoorSimilarity { best_score });
    }
    if let Some(spread) = std_dev(&scores) {
        if spread < options.min_score_spread {
            found.push(QueryIssue::LowDiscrimination { std_dev: spread });
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, EvalError};
    use crate::evaluation::{QueryLatency, QueryMetrics, QueryStatus};
    use crate::retrieval::ScoredChunk;

    fn evaluation(id: &str, retrieved: Vec<ScoredChunk>) -> QueryEvaluation {
        let cell = crate::evaluation::MetricValue::computed(0.0);
        QueryEvaluation {
            query_id: id.to_string(),
            query: format!("question {}", id),
            status: QueryStatus::Succeeded,
            retrieved,
            answer: Some(String::new()),
            metrics: QueryMetrics {
                precision: cell.clone(),
                recall: cell.clone(),
                mrr: cell.clone(),
                ndcg: cell.clone(),
                map: cell.clone(),
                hit_rate: cell.clone(),
                relevance: cell.clone(),
                faithfulness: cell.clone(),
                similarity: cell,
            },
            latency: QueryLatency::default(),
        }
    }

    fn chunk(id: &str, source: &str, score: f64) -> ScoredChunk {
        ScoredChunk::new(id, score).with_document(source)
    }

    #[test]
    fn test_popularity_and_coverage() {
        let queries = vec![
            evaluation("q1", vec![chunk("a#0", "a", 0.9), chunk("b#0", "b", 0.4)]),
            evaluation("q2", vec![chunk("a#0", "a", 0.8), chunk("a#1", "a", 0.5)]),
        ];
        let analysis = RetrievalAnalysis::from_queries(&queries, Some(10), &AnalysisOptions::default());
        let popularity = &analysis.popularity;

        assert_eq!(popularity.queries, 2);
        assert_eq!(popularity.total_retrievals, 4);
        assert_eq!(popularity.unique_chunks, 3);
        assert_eq!(popularity.coverage, Some(0.3));
        assert_eq!(
            popularity.top_chunks[0],
            RetrievalCount {
                id: "a#0".into(),
                count: 2
            }
        );
        let sources: Vec<_> = popularity
            .sources
            .iter()
            .map(|s| (s.id.as_str(), s.count))
            .collect();
        assert_eq!(sources, vec![("a", 3), ("b", 1)]);
    }

    #[test]
    fn test_coverage_unknown_without_index_size() {
        let queries = vec![evaluation("q1", vec![chunk("a#0", "a", 0.9)])];
        let analysis = RetrievalAnalysis::from_queries(&queries, None, &AnalysisOptions::default());
        assert_eq!(analysis.popularity.coverage, None);

        let analysis = RetrievalAnalysis::from_queries(&queries, Some(0), &AnalysisOptions::default());
        assert_eq!(analysis.popularity.coverage, None);
    }

    #[test]
    fn test_rank_statistics() {
        let queries = vec![
            evaluation("q1", vec![chunk("a#0", "a", 0.9), chunk("b#0", "b", 0.3)]),
            evaluation("q2", vec![chunk("a#0", "a", 0.7)]),
        ];
        let analysis = RetrievalAnalysis::from_queries(&queries, None, &AnalysisOptions::default());

        assert_eq!(analysis.rank_statistics.len(), 2);
        let first = &analysis.rank_statistics[0];
        assert_eq!(first.rank, 1);
        assert_eq!(first.scores.count, 2);
        assert!((first.scores.mean - 0.8).abs() < 1e-12);
        assert_eq!(first.scores.max, 0.9);
        assert_eq!(analysis.rank_statistics[1].scores.count, 1);
    }

    #[test]
    fn test_flagged_queries() {
        let queries = vec![
            evaluation("empty", vec![]),
            evaluation("weak", vec![chunk("a#0", "a", 0.1), chunk("b#0", "b", 0.02)]),
            evaluation("flat", vec![chunk("a#0", "a", 0.6), chunk("b#0", "b", 0.6)]),
            evaluation("fine", vec![chunk("a#0", "a", 0.9), chunk("b#0", "b", 0.4)]),
        ];
        let analysis = RetrievalAnalysis::from_queries(&queries, None, &AnalysisOptions::default());

        let flagged: Vec<_> = analysis
            .flagged
            .iter()
            .map(|f| (f.query_id.as_str(), &f.issue))
            .collect();
        assert_eq!(flagged.len(), 3);
        assert_eq!(flagged[0], ("empty", &QueryIssue::NoResults));
        assert_eq!(
            flagged[1],
            ("weak", &QueryIssue::PoorSimilarity { best_score: 0.1 })
        );
        assert!(matches!(
            flagged[2],
            ("flat", QueryIssue::LowDiscrimination { .. })
        ));
    }

    #[test]
    fn test_failed_queries_are_skipped() {
        let mut failed = evaluation("broken", vec![chunk("a#0", "a", 0.9)]);
        let error = EvalError::Retrieval("index offline".into());
        failed.status = QueryStatus::Failed {
            category: ErrorCategory::Retrieval,
            message: error.to_string(),
        };

        let analysis = RetrievalAnalysis::from_queries(&[failed], Some(4), &AnalysisOptions::default());
        assert_eq!(analysis.popularity.queries, 0);
        assert_eq!(analysis.popularity.coverage, Some(0.0));
        assert!(analysis.rank_statistics.is_empty());
        assert!(analysis.flagged.is_empty());
    }
}
