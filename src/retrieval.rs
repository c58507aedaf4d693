//! Retrieved chunks and their deterministic ranking.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One retrieved chunk with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    /// Chunk identifier within the index.
    pub chunk_id: String,
    /// Identifier of the document the chunk was cut from (if known).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Similarity score; higher is better.
    pub score: f64,
    /// Chunk text, used as generation context. Not persisted in reports.
    #[serde(default, skip_serializing)]
    pub text: String,
}

impl ScoredChunk {
    pub fn new(chunk_id: impl Into<String>, score: f64) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            document_id: None,
            score,
            text: String::new(),
        }
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Whether this chunk is identified by `id`, either as chunk or as source document.
    pub fn matches(&self, id: &str) -> bool {
        self.chunk_id == id || self.document_id.as_deref() == Some(id)
    }
}

/// Order chunks by descending score, keeping insertion order among equal scores,
/// and keep at most `k`. NaN scores sort last.
pub fn rank(mut chunks: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    // `sort_by` is stable, so ties keep the collaborator's order.
    chunks.sort_by(|a, b| match (a.score.is_nan(), b.score.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal),
    });
    chunks.truncate(k);
    chunks
}

/// Concatenate chunk texts into a generation context.
pub fn format_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("[{} | score {:.3}]\n{}", c.chunk_id, c.score, c.text))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
