//! Labeled query sets for evaluation.
//!
//! Query sets are JSON files, either an object with a name and a list of
//! queries or a bare array of query records. Plain text files with one
//! question per line load as query sets without ground truth.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// A single labeled query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Unique identifier for this query.
    pub id: String,
    /// The query text.
    #[serde(alias = "q", alias = "question")]
    pub query: String,
    /// Identifiers of relevant documents or chunks (ground truth).
    #[serde(default)]
    pub relevant: Vec<String>,
    /// Graded relevance per identifier, used when NDCG runs with graded gains.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub graded: BTreeMap<String, f64>,
    /// Reference answer (if available).
    #[serde(default, alias = "expected_answer", skip_serializing_if = "Option::is_none")]
    pub reference_answer: Option<String>,
}

impl QueryRecord {
    /// Create a query without ground truth.
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            relevant: Vec::new(),
            graded: BTreeMap::new(),
            reference_answer: None,
        }
    }

    /// Set the relevant identifiers.
    pub fn with_relevant<I, S>(mut self, relevant: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relevant = relevant.into_iter().map(Into::into).collect();
        self
    }

    /// Set a graded relevance for one identifier. The identifier also becomes relevant.
    pub fn with_grade(mut self, id: impl Into<String>, gain: f64) -> Self {
        let id = id.into();
        if !self.relevant.contains(&id) {
            self.relevant.push(id.clone());
        }
        self.graded.insert(id, gain);
        self
    }

    /// Set the reference answer.
    pub fn with_reference(mut self, answer: impl Into<String>) -> Self {
        self.reference_answer = Some(answer.into());
        self
    }

    /// Whether this query carries any ground-truth relevance labels.
    pub fn has_ground_truth(&self) -> bool {
        !self.relevant.is_empty()
    }

    /// Gain of a relevant identifier: its grade if present, 1.0 otherwise.
    pub fn grade_of(&self, id: &str) -> f64 {
        self.graded.get(id).copied().unwrap_or(1.0)
    }
}

/// A named collection of query records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySet {
    /// Query set name.
    pub name: String,
    /// Query records.
    pub queries: Vec<QueryRecord>,
}

/// Accepted on-disk shapes.
#[derive(Deserialize)]
#[serde(untagged)]
enum QuerySetFile {
    Named(QuerySet),
    Bare(Vec<QueryRecord>),
}

impl QuerySet {
    /// Create a new empty query set.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queries: Vec::new(),
        }
    }

    /// Add a query to the set.
    pub fn add(&mut self, query: QueryRecord) {
        self.queries.push(query);
    }

    /// Number of queries in the set.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Get a subset of queries (for quick testing).
    pub fn take(&self, n: usize) -> Self {
        Self {
            name: self.name.clone(),
            queries: self.queries.iter().take(n).cloned().collect(),
        }
    }

    /// Check that the set can be evaluated: non-empty, unique ids, non-empty queries.
    pub fn validate(&self) -> Result<()> {
        if self.queries.is_empty() {
            return Err(EvalError::InvalidInput(format!(
                "query set '{}' is empty",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for record in &self.queries {
            if record.query.trim().is_empty() {
                return Err(EvalError::InvalidInput(format!(
                    "query '{}' has empty text",
                    record.id
                )));
            }
            if !seen.insert(record.id.as_str()) {
                return Err(EvalError::InvalidInput(format!(
                    "duplicate query id '{}'",
                    record.id
                )));
            }
            if let Some((id, gain)) = record.graded.iter().find(|(_, g)| !(**g >= 0.0)) {
                return Err(EvalError::InvalidInput(format!(
                    "query '{}' has invalid grade {} for '{}'",
                    record.id, gain, id
                )));
            }
        }

        Ok(())
    }

    /// Load by extension: `.json` as JSON, anything else as one question per line.
    pub fn load(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::load_json(path),
            _ => Self::load_questions(path),
        }
    }

    /// Load a plain text file with one question per line.
    pub fn load_questions(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        Ok(Self::from_lines(file_name(path), &content))
    }

    /// One query per non-blank line, with ids `q1`, `q2`, ... in line order.
    pub fn from_lines(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            queries: content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .enumerate()
                .map(|(i, line)| QueryRecord::new(format!("q{}", i + 1), line))
                .collect(),
        }
    }

    /// Load from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        Self::from_json(file_name(path), &content)
    }

    /// Parse from JSON text. `fallback_name` names bare arrays.
    pub fn from_json(fallback_name: &str, content: &str) -> Result<Self> {
        let parsed: QuerySetFile = serde_json::from_str(content)
            .map_err(|e| EvalError::Serialization(format!("Failed to parse query set: {}", e)))?;

        Ok(match parsed {
            QuerySetFile::Named(set) => set,
            QuerySetFile::Bare(queries) => Self {
                name: fallback_name.to_string(),
                queries,
            },
        })
    }

    /// Save to a JSON file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EvalError::Serialization(e.to_string()))?;
        fs::write(path, content).map_err(|e| EvalError::io(path, e))?;
        Ok(())
    }
}

fn file_name(path: &Path) -> &str {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("queries")
}

/// Create the sample query set matching the bundled sample corpus.
pub fn create_sample_query_set() -> QuerySet {
    let mut set = QuerySet::new("sample");

    set.add(
        QueryRecord::new("login-optimization", "How was the login process optimized?")
            .with_relevant(["login-case-study"])
            .with_reference("The login process was optimized with an Infinispan distributed cache and parallel API calls, reducing the time from 4s to 1.2s."),
    );
    set.add(
        QueryRecord::new("cache-technology", "Which technology was used for caching?")
            .with_relevant(["login-case-study", "cache-architecture"])
            .with_reference("Infinispan was used as the distributed cache technology."),
    );
    set.add(
        QueryRecord::new("login-before", "How long did login take before the optimization?")
            .with_relevant(["login-case-study"])
            .with_reference("Login took 4 seconds before the optimization."),
    );
    set.add(
        QueryRecord::new("login-now", "What is the current duration of the login process?")
            .with_relevant(["login-case-study"])
            .with_reference("The login process currently takes 1.2 seconds."),
    );
    set.add(
        QueryRecord::new("parallelism", "What kind of parallelism was implemented?")
            .with_relevant(["login-case-study", "api-gateway"])
            .with_reference("Parallelism was implemented in the API calls."),
    );

    set
}

/// Sample documents matching [`create_sample_query_set`], as (id, text) pairs.
pub fn sample_documents() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "login-case-study",
            "Login performance case study. Before the optimization the login process took 4 seconds on average. \
The team introduced an Infinispan distributed cache for session and profile data. \
Calls to the profile, permissions and preferences APIs were made in parallel instead of sequentially. \
After both changes the login process takes 1.2 seconds, a reduction of 70 percent.",
        ),
        (
            "cache-architecture",
            "Cache architecture. Infinispan runs as a distributed cache cluster with three nodes. \
Entries are replicated to two owners and expire after thirty minutes. \
The cache stores user sessions and frequently read profile data.",
        ),
        (
            "api-gateway",
            "API gateway notes. The gateway fans out requests to downstream services. \
Independent API calls are executed in parallel using an asynchronous client, \
and responses are merged before returning to the caller.",
        ),
        (
            "release-notes",
            "Release notes. Version 2.3 updates the user interface colors, fixes a typo on the settings page \
and upgrades the logging library.",
        ),
    ]
}
