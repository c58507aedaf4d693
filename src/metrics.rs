//! Ranked-list retrieval metrics.
//!
//! Provides standard IR metrics over one ranked list:
//! - Precision@K: proportion of the top-K that is relevant
//! - Recall@K: proportion of relevant items found in the top-K
//! - Reciprocal rank: 1/rank of the first relevant item
//! - NDCG@K: normalized discounted cumulative gain (binary or graded)
//! - Average precision
//!
//! All functions are pure. Functions whose value is undefined for a query
//! without ground truth return `None` instead of dividing by zero.

use crate::query::QueryRecord;
use crate::retrieval::ScoredChunk;
use serde::{Deserialize, Serialize};

/// Gain function used for NDCG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainFunction {
    /// Every relevant item has gain 1.
    #[default]
    Binary,
    /// Relevant items use their grade from the query record (default 1).
    Graded,
}

/// A ranked list judged against one query's ground truth.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    /// Whether each rank credited a not-yet-credited relevant id.
    pub hits: Vec<bool>,
    /// Gain at each rank (0 for non-hits).
    pub gains: Vec<f64>,
    /// Gains of all relevant ids, best first.
    pub ideal_gains: Vec<f64>,
    /// Number of distinct relevant ids.
    pub total_relevant: usize,
}

impl Judgement {
    /// Judge `ranked` (already ordered best first) against `record`.
    ///
    /// Each relevant id is credited at most once, at the first rank whose chunk
    /// matches it, so several chunks of one relevant document count once.
    pub fn new(record: &QueryRecord, ranked: &[ScoredChunk], gain: GainFunction) -> Self {
        let mut relevant: Vec<&str> = Vec::new();
        for id in &record.relevant {
            if !relevant.contains(&id.as_str()) {
                relevant.push(id);
            }
        }

        let gain_of = |id: &str| match gain {
            GainFunction::Binary => 1.0,
            GainFunction::Graded => record.grade_of(id),
        };

        let mut credited = vec![false; relevant.len()];
        let mut hits = Vec::with_capacity(ranked.len());
        let mut gains = Vec::with_capacity(ranked.len());

        for chunk in ranked {
            let slot = relevant
                .iter()
                .enumerate()
                .find(|(i, id)| !credited[*i] && chunk.matches(id))
                .map(|(i, _)| i);

            match slot {
                Some(i) => {
                    credited[i] = true;
                    hits.push(true);
                    gains.push(gain_of(relevant[i]));
                }
                None => {
                    hits.push(false);
                    gains.push(0.0);
                }
            }
        }

        let mut ideal_gains: Vec<f64> = relevant.iter().map(|id| gain_of(id)).collect();
        ideal_gains.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        Self {
            hits,
            gains,
            ideal_gains,
            total_relevant: relevant.len(),
        }
    }

    /// Number of hits within the top `k`.
    pub fn hits_at_k(&self, k: usize) -> usize {
        self.hits.iter().take(k).filter(|h| **h).count()
    }

    pub fn precision_at_k(&self, k: usize) -> f64 {
        precision_at_k(&self.hits, k)
    }

    pub fn recall_at_k(&self, k: usize) -> Option<f64> {
        recall_at_k(&self.hits, k, self.total_relevant)
    }

    pub fn reciprocal_rank(&self, k: usize) -> f64 {
        reciprocal_rank(&self.hits[..k.min(self.hits.len())])
    }

    pub fn ndcg_at_k(&self, k: usize) -> Option<f64> {
        ndcg_at_k(&self.gains, &self.ideal_gains, k)
    }

    pub fn average_precision(&self, k: usize) -> Option<f64> {
        average_precision(&self.hits[..k.min(self.hits.len())], self.total_relevant)
    }
}

/// Precision@K = hits in top K / K. Returns 0 for K = 0.
pub fn precision_at_k(hits: &[bool], k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let found = hits.iter().take(k).filter(|h| **h).count();
    found as f64 / k as f64
}

/// Recall@K = hits in top K / total relevant; `None` when nothing is relevant.
pub fn recall_at_k(hits: &[bool], k: usize, total_relevant: usize) -> Option<f64> {
    if total_relevant == 0 {
        return None;
    }
    let found = hits.iter().take(k).filter(|h| **h).count();
    Some((found as f64 / total_relevant as f64).min(1.0))
}

/// RR = 1 / rank of first hit, 0 if there is none.
pub fn reciprocal_rank(hits: &[bool]) -> f64 {
    hits.iter()
        .position(|h| *h)
        .map(|i| 1.0 / (i + 1) as f64)
        .unwrap_or(0.0)
}

/// DCG@K = Σ gain_i / log2(i + 1), ranks starting at 1.
pub fn dcg_at_k(gains: &[f64], k: usize) -> f64 {
    gains
        .iter()
        .take(k)
        .enumerate()
        .map(|(i, gain)| gain / (i as f64 + 2.0).log2())
        .sum()
}

/// NDCG@K = DCG@K / IDCG@K; `None` when the ideal DCG is zero.
///
/// `ideal_gains` must be sorted best first.
pub fn ndcg_at_k(gains: &[f64], ideal_gains: &[f64], k: usize) -> Option<f64> {
    let idcg = dcg_at_k(ideal_gains, k);
    if idcg <= 0.0 {
        return None;
    }
    Some((dcg_at_k(gains, k) / idcg).clamp(0.0, 1.0))
}

/// AP = (1/|relevant|) · Σ precision@i over ranks i holding a hit.
pub fn average_precision(hits: &[bool], total_relevant: usize) -> Option<f64> {
    if total_relevant == 0 {
        return None;
    }

    let mut found = 0usize;
    let mut sum = 0.0;
    for (i, hit) in hits.iter().enumerate() {
        if *hit {
            found += 1;
            sum += found as f64 / (i + 1) as f64;
        }
    }

    Some(sum / total_relevant as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(ids: &[&str]) -> Vec<ScoredChunk> {
        let n = ids.len() as f64;
        ids.iter()
            .enumerate()
            .map(|(i, id)| ScoredChunk::new(*id, (n - i as f64) / n))
            .collect()
    }

    fn france() -> QueryRecord {
        QueryRecord::new("q1", "capital of France").with_relevant(["doc1"])
    }

    #[test]
    fn test_relevant_first() {
        let judged = Judgement::new(&france(), &chunks(&["doc1", "doc2"]), GainFunction::Binary);
        assert_eq!(judged.precision_at_k(2), 0.5);
        assert_eq!(judged.recall_at_k(2), Some(1.0));
        assert_eq!(judged.reciprocal_rank(2), 1.0);
        assert_eq!(judged.ndcg_at_k(2), Some(1.0));
    }

    #[test]
    fn test_relevant_second() {
        let judged = Judgement::new(&france(), &chunks(&["doc2", "doc1"]), GainFunction::Binary);
        assert_eq!(judged.precision_at_k(2), 0.5);
        assert_eq!(judged.recall_at_k(2), Some(1.0));
        assert_eq!(judged.reciprocal_rank(2), 0.5);

        let expected = (1.0 / 3f64.log2()) / 1.0;
        assert!((judged.ndcg_at_k(2).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_no_ground_truth_is_undefined() {
        let record = QueryRecord::new("q", "anything");
        let judged = Judgement::new(&record, &chunks(&["a", "b"]), GainFunction::Binary);
        assert_eq!(judged.recall_at_k(2), None);
        assert_eq!(judged.ndcg_at_k(2), None);
        assert_eq!(judged.average_precision(2), None);
        assert_eq!(judged.precision_at_k(2), 0.0);
        assert_eq!(judged.reciprocal_rank(2), 0.0);
    }

    #[test]
    fn test_document_credited_once() {
        let record = QueryRecord::new("q", "q").with_relevant(["doc1"]);
        let ranked = vec![
            ScoredChunk::new("doc1#0", 0.9).with_document("doc1"),
            ScoredChunk::new("doc1#1", 0.8).with_document("doc1"),
        ];
        let judged = Judgement::new(&record, &ranked, GainFunction::Binary);
        assert_eq!(judged.hits, vec![true, false]);
        assert_eq!(judged.precision_at_k(2), 0.5);
        assert_eq!(judged.ndcg_at_k(2), Some(1.0));
    }

    #[test]
    fn test_recall_monotonic_in_k() {
        let record = QueryRecord::new("q", "q").with_relevant(["b", "d", "f", "z"]);
        let judged = Judgement::new(
            &record,
            &chunks(&["a", "b", "c", "d", "e", "f", "g"]),
            GainFunction::Binary,
        );

        let mut previous = 0.0;
        for k in 1..=10 {
            let recall = judged.recall_at_k(k).unwrap();
            assert!((0.0..=1.0).contains(&recall));
            assert!(recall >= previous, "recall dropped at k={}", k);
            previous = recall;
        }
        assert_eq!(judged.recall_at_k(10), Some(0.75));
    }

    #[test]
    fn test_ndcg_ideal_order_is_one() {
        let record = QueryRecord::new("q", "q")
            .with_grade("a", 3.0)
            .with_grade("b", 2.0)
            .with_grade("c", 1.0);

        let ideal = Judgement::new(&record, &chunks(&["a", "b", "c", "x"]), GainFunction::Graded);
        assert!((ideal.ndcg_at_k(4).unwrap() - 1.0).abs() < 1e-12);

        let reversed =
            Judgement::new(&record, &chunks(&["c", "b", "a", "x"]), GainFunction::Graded);
        let ndcg = reversed.ndcg_at_k(4).unwrap();
        assert!(ndcg > 0.0 && ndcg < 1.0);
    }

    #[test]
    fn test_ndcg_bounded_when_k_exceeds_relevant() {
        let record = QueryRecord::new("q", "q").with_relevant(["a"]);
        let judged = Judgement::new(&record, &chunks(&["x", "y", "a"]), GainFunction::Binary);
        let ndcg = judged.ndcg_at_k(3).unwrap();
        assert!((0.0..=1.0).contains(&ndcg));
        assert!((ndcg - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_average_precision() {
        // Hits at ranks 1 and 3 out of 2 relevant: (1/1 + 2/3) / 2
        let ap = average_precision(&[true, false, true], 2).unwrap();
        assert!((ap - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        assert_eq!(average_precision(&[true], 0), None);
    }

    #[test]
    fn test_precision_divides_by_k_not_retrieved() {
        assert_eq!(precision_at_k(&[true], 4), 0.25);
        assert_eq!(precision_at_k(&[true], 0), 0.0);
    }

    #[test]
    fn test_reciprocal_rank_bounded() {
        assert_eq!(reciprocal_rank(&[]), 0.0);
        assert_eq!(reciprocal_rank(&[false, false, true]), 1.0 / 3.0);
    }
}
