//! Pluggable rerank strategies.
//!
//! A reranker re-scores the merged candidate set of a query using
//! `(query_text, chunk_text)` pairs. Strategies form a closed, string-keyed
//! registry; callers select one by name at query time.

use anyhow::{bail, Result};

use crate::fuzzy::{token_jaccard, FuzzyScorer};

/// Secondary scorer applied to a candidate set after retrieval.
pub trait Reranker: Send + Sync {
    /// Registry key for this strategy.
    fn name(&self) -> &'static str;
    /// Relevance of `chunk_text` to `query` in `[0, 1]`.
    fn score(&self, query: &str, chunk_text: &str) -> f32;
}

/// Jaccard overlap of word tokens between query and chunk.
pub struct TokenOverlapReranker;

impl Reranker for TokenOverlapReranker {
    fn name(&self) -> &'static str {
        "token-overlap"
    }

    fn score(&self, query: &str, chunk_text: &str) -> f32 {
        token_jaccard(query, chunk_text)
    }
}

/// Trigram-Jaccard similarity, the same scorer the fuzzy pass uses.
pub struct TrigramReranker;

impl Reranker for TrigramReranker {
    fn name(&self) -> &'static str {
        "trigram"
    }

    fn score(&self, query: &str, chunk_text: &str) -> f32 {
        FuzzyScorer::new(query).score(chunk_text)
    }
}

/// Instantiate a rerank strategy by name.
///
/// Unknown names are an error; the engine surfaces them as validation
/// failures without touching the index.
pub fn create_reranker(name: &str) -> Result<Box<dyn Reranker>> {
    match name {
        "token-overlap" => Ok(Box::new(TokenOverlapReranker)),
        "trigram" => Ok(Box::new(TrigramReranker)),
        other => bail!(
            "Unknown rerank strategy: '{}'. Available: token-overlap, trigram.",
            other
        ),
    }
}
