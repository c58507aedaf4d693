//! Answer scoring: lexical scorers, faithfulness and an LLM-as-judge scorer.
//!
//! Every scorer returns a value in [0, 1].

use crate::corpus::tokenize;
use crate::error::{EvalError, Result};
use crate::llm::{LlmClient, Prompts, extract_json};
use crate::pipeline::RelevanceScorer;
use crate::retrieval::ScoredChunk;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::debug;

fn term_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Share of the question's terms that appear in the answer.
pub fn keyword_overlap(question: &str, answer: &str) -> f64 {
    let question_terms = term_set(question);
    if question_terms.is_empty() {
        return 0.0;
    }
    let answer_terms = term_set(answer);
    question_terms.intersection(&answer_terms).count() as f64 / question_terms.len() as f64
}

/// Share of the answer's terms supported by the retrieved context.
///
/// Empty context or an answer without content terms scores 0.
pub fn faithfulness(answer: &str, context: &[ScoredChunk]) -> f64 {
    if context.is_empty() {
        return 0.0;
    }
    let answer_terms = term_set(answer);
    if answer_terms.is_empty() {
        return 0.0;
    }
    let context_terms: HashSet<String> = context
        .iter()
        .flat_map(|chunk| tokenize(&chunk.text))
        .collect();
    answer_terms.intersection(&context_terms).count() as f64 / answer_terms.len() as f64
}

/// Similarity ratio 2 * LCS / (|a| + |b|) over the token sequences.
pub fn sequence_similarity(a: &str, b: &str) -> f64 {
    let a = tokenize(a);
    let b = tokenize(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for token_a in &a {
        for (j, token_b) in b.iter().enumerate() {
            current[j + 1] = if token_a == token_b {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }

    2.0 * previous[b.len()] as f64 / (a.len() + b.len()) as f64
}

/// Relevance as keyword overlap between question and answer.
#[derive(Debug, Clone, Default)]
pub struct KeywordOverlapScorer;

#[async_trait]
impl RelevanceScorer for KeywordOverlapScorer {
    fn name(&self) -> &str {
        "keyword_overlap"
    }

    async fn score(&self, query: &str, answer: &str, _reference: Option<&str>) -> Result<f64> {
        Ok(keyword_overlap(query, answer))
    }
}

/// Relevance as similarity to the reference answer.
///
/// Falls back to keyword overlap with the question when the query has no reference.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSimilarityScorer;

#[async_trait]
impl RelevanceScorer for ReferenceSimilarityScorer {
    fn name(&self) -> &str {
        "reference_similarity"
    }

    async fn score(&self, query: &str, answer: &str, reference: Option<&str>) -> Result<f64> {
        Ok(match reference {
            Some(reference) if !reference.trim().is_empty() => {
                sequence_similarity(answer, reference)
            }
            _ => keyword_overlap(query, answer),
        })
    }
}

/// LLM-as-judge relevance: a 1-5 rating mapped onto [0, 1].
#[derive(Clone)]
pub struct LlmJudgeScorer {
    client: LlmClient,
}

#[derive(Debug, Deserialize)]
struct RawJudgement {
    relevance: f64,
    #[serde(default)]
    explanation: String,
}

impl LlmJudgeScorer {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// Parse the judge's JSON and map the rating onto [0, 1].
    fn parse_response(response: &str) -> Result<f64> {
        let raw: RawJudgement = serde_json::from_str(extract_json(response)).map_err(|e| {
            EvalError::Scoring(format!(
                "Failed to parse judge response: {}. Response: {}",
                e, response
            ))
        })?;

        if !(1.0..=5.0).contains(&raw.relevance) {
            return Err(EvalError::Scoring(format!(
                "judge rating {} outside 1-5",
                raw.relevance
            )));
        }
        debug!(rating = raw.relevance, explanation = %raw.explanation, "Judge verdict");

        Ok((raw.relevance - 1.0) / 4.0)
    }
}

#[async_trait]
impl RelevanceScorer for LlmJudgeScorer {
    fn name(&self) -> &str {
        "llm_judge"
    }

    async fn score(&self, query: &str, answer: &str, reference: Option<&str>) -> Result<f64> {
        let prompt = Prompts::render_answer_relevance_judge(query, answer, reference);
        let response = self
            .client
            .complete(None, &prompt)
            .await
            .map_err(|e| match e {
                EvalError::Timeout(_) | EvalError::Scoring(_) => e,
                other => EvalError::Scoring(other.to_string()),
            })?;
        Self::parse_response(&response)
    }
}
