//! Answer generators.
//!
//! [`ExtractiveGenerator`] answers offline by quoting the context sentences that
//! share the most terms with the question. [`LlmGenerator`] asks an
//! OpenAI-compatible model to answer from the retrieved context.

use crate::corpus::tokenize;
use crate::error::Result;
use crate::llm::{LlmClient, Prompts};
use crate::pipeline::Generator;
use crate::retrieval::{ScoredChunk, format_context};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

/// Answer returned when the context holds nothing usable.
pub const NO_ANSWER: &str = "I don't know based on the provided context.";

/// Offline generator that extracts the best matching sentences from the context.
#[derive(Debug, Clone)]
pub struct ExtractiveGenerator {
    max_sentences: usize,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self { max_sentences: 2 }
    }
}

impl ExtractiveGenerator {
    pub fn new(max_sentences: usize) -> Self {
        Self {
            max_sentences: max_sentences.max(1),
        }
    }

    fn split_sentences(text: &str) -> Vec<&str> {
        text.split_inclusive(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Pick sentences by query-term overlap; earlier chunks win ties.
    pub fn extract(&self, query: &str, context: &[ScoredChunk]) -> String {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();

        let mut candidates: Vec<(usize, usize, &str)> = Vec::new();
        for chunk in context {
            for sentence in Self::split_sentences(&chunk.text) {
                let overlap = tokenize(sentence)
                    .into_iter()
                    .collect::<HashSet<_>>()
                    .intersection(&query_terms)
                    .count();
                let position = candidates.len();
                candidates.push((overlap, position, sentence));
            }
        }

        // Stable sort: equal overlap keeps context order.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut picked: Vec<(usize, &str)> = candidates
            .into_iter()
            .filter(|(overlap, _, _)| *overlap > 0)
            .take(self.max_sentences)
            .map(|(_, position, sentence)| (position, sentence))
            .collect();

        if picked.is_empty() {
            return NO_ANSWER.to_string();
        }

        picked.sort_by_key(|(position, _)| *position);
        picked
            .into_iter()
            .map(|(_, sentence)| sentence)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    async fn generate(&self, query: &str, context: &[ScoredChunk]) -> Result<String> {
        Ok(self.extract(query, context))
    }
}

/// Generator backed by a chat-completion model.
#[derive(Clone)]
pub struct LlmGenerator {
    client: LlmClient,
}

impl LlmGenerator {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, query: &str, context: &[ScoredChunk]) -> Result<String> {
        if context.is_empty() {
            return Ok(NO_ANSWER.to_string());
        }

        let prompt = Prompts::render_rag_answer(query, &format_context(context));
        debug!(model = %self.client.model(), chunks = context.len(), "Generating answer");

        let answer = self
            .client
            .complete(Some(Prompts::system_rag_assistant()), &prompt)
            .await
            .map_err(|e| e.into_generation())?;

        Ok(answer.trim().to_string())
    }
}
