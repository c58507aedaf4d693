//! In-memory lexical index used as the reference retrieval backend.
//!
//! Documents are split into overlapping character chunks and scored with
//! TF-IDF weighted cosine similarity.

use crate::error::{EvalError, Result};
use crate::pipeline::Retriever;
use crate::retrieval::{ScoredChunk, rank};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Words ignored by tokenization.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from", "how",
    "in", "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "were", "what",
    "when", "which", "who", "with",
];

/// Lowercase alphanumeric tokens without stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Configuration for text chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 80,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EvalError::Configuration(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(EvalError::Configuration(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A plain-text source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub text: String,
}

/// A collection of source documents.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    documents: Vec<SourceDocument>,
}

impl Corpus {
    /// Build from (id, text) pairs.
    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            documents: pairs
                .into_iter()
                .map(|(id, text)| SourceDocument {
                    id: id.into(),
                    text: text.into(),
                })
                .collect(),
        }
    }

    /// Load every `.txt` and `.md` file under `dir`. Document ids are file stems.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(EvalError::Configuration(format!(
                "corpus path '{}' does not exist or is not a directory",
                dir.display()
            )));
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                EvalError::io(path, std::io::Error::other(e.to_string()))
            })?;
            let path = entry.path();
            let is_text = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("txt") | Some("md")
            );
            if !entry.file_type().is_file() || !is_text {
                continue;
            }

            let text = std::fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("document")
                .to_string();
            documents.push(SourceDocument { id, text });
        }

        if documents.is_empty() {
            return Err(EvalError::Configuration(format!(
                "no .txt or .md documents found in '{}'",
                dir.display()
            )));
        }

        info!(dir = %dir.display(), documents = documents.len(), "Loaded corpus");
        Ok(Self { documents })
    }

    pub fn documents(&self) -> &[SourceDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// A chunk of text with metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `<document id>#<index>`
    pub id: String,
    pub document_id: String,
    pub text: String,
    /// Start character position in original document.
    pub start_pos: usize,
    /// End character position in original document.
    pub end_pos: usize,
    /// Chunk index within its document.
    pub index: usize,
}

/// Split text into overlapping segments, preferring sentence boundaries.
pub fn chunk_text(document_id: &str, text: &str, config: &ChunkConfig) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let text_len = chars.len();

    let mut start = 0;
    let mut index = 0;

    while start < text_len {
        let end = (start + config.chunk_size).min(text_len);

        // Break after the last sentence end within the final 100 characters.
        let adjusted_end = if end < text_len {
            let search_start = end.saturating_sub(100).max(start);
            chars[search_start..end]
                .iter()
                .rposition(|c| matches!(c, '.' | '!' | '?'))
                .map(|pos| search_start + pos + 1)
                .filter(|candidate| *candidate > start)
                .unwrap_or(end)
        } else {
            end
        };

        let final_end = adjusted_end.max(start + 1).min(text_len);
        let final_text: String = chars[start..final_end].iter().collect();

        if !final_text.trim().is_empty() {
            chunks.push(Chunk {
                id: format!("{}#{}", document_id, index),
                document_id: document_id.to_string(),
                text: final_text.trim().to_string(),
                start_pos: start,
                end_pos: final_end,
                index,
            });
            index += 1;
        }

        if final_end >= text_len {
            break;
        }

        let next_start = if config.chunk_overlap > 0 && final_end > config.chunk_overlap {
            final_end - config.chunk_overlap
        } else {
            final_end
        };

        // Drop the overlap when it would not move past the previous start.
        start = if next_start <= start { final_end } else { next_start };
    }

    chunks
}

/// A sparse TF-IDF vector with its L2 norm.
#[derive(Debug, Clone)]
struct TermVector {
    weights: HashMap<String, f64>,
    norm: f64,
}

impl TermVector {
    fn from_tokens(tokens: &[String], idf: &HashMap<String, f64>) -> Self {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for token in tokens {
            *counts.entry(token.clone()).or_insert(0.0) += 1.0;
        }

        let weights: HashMap<String, f64> = counts
            .into_iter()
            .filter_map(|(term, tf)| idf.get(&term).map(|w| (term, tf * w)))
            .collect();
        let norm = weights.values().map(|w| w * w).sum::<f64>().sqrt();

        Self { weights, norm }
    }

    fn cosine(&self, other: &TermVector) -> f64 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let (small, large) = if self.weights.len() <= other.weights.len() {
            (self, other)
        } else {
            (other, self)
        };
        let dot: f64 = small
            .weights
            .iter()
            .filter_map(|(term, w)| large.weights.get(term).map(|o| w * o))
            .sum();
        dot / (self.norm * other.norm)
    }
}

/// Lexical search index over chunked documents.
pub struct LexicalIndex {
    chunks: Vec<Chunk>,
    vectors: Vec<TermVector>,
    idf: HashMap<String, f64>,
    ids: HashSet<String>,
    config: ChunkConfig,
}

impl LexicalIndex {
    /// Chunk every document of `corpus` and index the chunks.
    pub fn build(corpus: &Corpus, config: ChunkConfig) -> Result<Self> {
        config.validate()?;

        let chunks: Vec<Chunk> = corpus
            .documents()
            .iter()
            .flat_map(|doc| chunk_text(&doc.id, &doc.text, &config))
            .collect();

        let tokenized: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.text)).collect();

        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for tokens in &tokenized {
            let unique: HashSet<&String> = tokens.iter().collect();
            for token in unique {
                *document_frequency.entry(token.clone()).or_insert(0) += 1;
            }
        }

        let n = chunks.len() as f64;
        let idf: HashMap<String, f64> = document_frequency
            .into_iter()
            .map(|(term, df)| (term, ((n + 1.0) / (df as f64 + 1.0)).ln() + 1.0))
            .collect();

        let vectors = tokenized
            .iter()
            .map(|tokens| TermVector::from_tokens(tokens, &idf))
            .collect();
        let ids = chunks.iter().map(|c| c.id.clone()).collect();

        debug!(
            chunks = chunks.len(),
            terms = idf.len(),
            chunk_size = config.chunk_size,
            chunk_overlap = config.chunk_overlap,
            "Built lexical index"
        );

        Ok(Self {
            chunks,
            vectors,
            idf,
            ids,
            config,
        })
    }

    /// Number of chunks in the index.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check if index is empty.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Score every chunk against `query` and return the best `k`.
    pub fn search(&self, query: &str, k: usize) -> Vec<ScoredChunk> {
        let query_vector = TermVector::from_tokens(&tokenize(query), &self.idf);

        let scored = self
            .chunks
            .iter()
            .zip(&self.vectors)
            .map(|(chunk, vector)| {
                ScoredChunk::new(chunk.id.clone(), query_vector.cosine(vector))
                    .with_document(chunk.document_id.clone())
                    .with_text(chunk.text.clone())
            })
            .collect();

        rank(scored, k)
    }
}

#[async_trait]
impl Retriever for LexicalIndex {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if self.is_empty() {
            return Err(EvalError::Retrieval("index is empty".to_string()));
        }
        Ok(self.search(query, k))
    }

    fn contains(&self, chunk_id: &str) -> bool {
        self.ids.contains(chunk_id)
    }

    fn chunk_count(&self) -> Option<usize> {
        Some(self.len())
    }
}
