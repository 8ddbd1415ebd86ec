//! Query-merge algorithm: vector hits, fuzzy supplement, optional rerank.
//!
//! Operates on a single immutable [`IndexSnapshot`]; embedding the query and
//! attaching document metadata are the engine's concern. The ordering rules
//! here are deliberately total so that repeated queries against the same
//! snapshot return byte-identical rankings:
//!
//! 1. score descending;
//! 2. vector matches ahead of fuzzy-only matches at equal score;
//! 3. ascending chunk id.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::fuzzy::FuzzyScorer;
use crate::index::IndexSnapshot;
use crate::rerank::Reranker;

/// How a candidate entered the result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Vector,
    Fuzzy,
}

/// Query knobs, engine-validated before reaching this layer.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// Maximum results to return.
    pub n: usize,
    /// Minimum clamped cosine similarity for vector matches.
    pub similarity_threshold: f32,
    /// Supplement with lexical matches when vector search under-fills `n`.
    pub fuzzy: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            n: 10,
            similarity_threshold: 0.7,
            fuzzy: false,
        }
    }
}

/// A ranked chunk from one query against one snapshot.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub score: f32,
    pub source: MatchSource,
}

/// Run the retrieval-and-merge pipeline against a snapshot.
pub fn run_query(
    snapshot: &IndexSnapshot,
    query_text: &str,
    query_vec: &[f32],
    opts: &QueryOptions,
    reranker: Option<&dyn Reranker>,
) -> Vec<QueryHit> {
    let mut hits: Vec<QueryHit> = snapshot
        .search(query_vec, opts.n, opts.similarity_threshold)
        .into_iter()
        .map(|scored| {
            let entry = snapshot.entry(scored.entry);
            QueryHit {
                chunk_id: entry.chunk.id.clone(),
                document_id: entry.chunk.document_id.clone(),
                text: entry.chunk.text.clone(),
                score: scored.score,
                source: MatchSource::Vector,
            }
        })
        .collect();

    if opts.fuzzy && hits.len() < opts.n {
        let seen: HashSet<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        let scorer = FuzzyScorer::new(query_text);
        let mut fuzzy_hits: Vec<QueryHit> = snapshot
            .entries()
            .iter()
            .filter(|e| !seen.contains(e.chunk.id.as_str()))
            .filter_map(|e| {
                let score = scorer.score(&e.chunk.text);
                if score > 0.0 {
                    Some(QueryHit {
                        chunk_id: e.chunk.id.clone(),
                        document_id: e.chunk.document_id.clone(),
                        text: e.chunk.text.clone(),
                        score,
                        source: MatchSource::Fuzzy,
                    })
                } else {
                    None
                }
            })
            .collect();
        hits.append(&mut fuzzy_hits);
    }

    if let Some(reranker) = reranker {
        for hit in hits.iter_mut() {
            hit.score = reranker.score(query_text, &hit.text);
        }
    }

    hits.sort_by(compare_hits);
    hits.truncate(opts.n);
    hits
}

fn compare_hits(a: &QueryHit, b: &QueryHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| source_rank(a.source).cmp(&source_rank(b.source)))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

fn source_rank(source: MatchSource) -> u8 {
    match source {
        MatchSource::Vector => 0,
        MatchSource::Fuzzy => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::EmbeddedChunk;
    use crate::models::{chunk_id, Chunk};
    use crate::rerank::create_reranker;

    fn embedded(doc: &str, index: i64, text: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                id: chunk_id(doc, index),
                document_id: doc.to_string(),
                chunk_index: index,
                text: text.to_string(),
                offset_start: 0,
                offset_end: text.len(),
                hash: String::new(),
            },
            vector,
        }
    }

    fn snapshot() -> IndexSnapshot {
        IndexSnapshot::build(
            1,
            2,
            vec![
                embedded("d1", 0, "the quick brown fox", vec![1.0, 0.0]),
                embedded("d2", 0, "lazy dogs sleeping", vec![0.0, 1.0]),
                embedded("d3", 0, "fox dens and burrows", vec![0.5, 0.5]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn vector_only_respects_threshold() {
        let snap = snapshot();
        let opts = QueryOptions {
            n: 10,
            similarity_threshold: 0.9,
            fuzzy: false,
        };
        let hits = run_query(&snap, "fox", &[1.0, 0.0], &opts, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d1");
        assert_eq!(hits[0].source, MatchSource::Vector);
    }

    #[test]
    fn fuzzy_supplements_when_vector_underfills() {
        let snap = snapshot();
        let opts = QueryOptions {
            n: 3,
            similarity_threshold: 0.9,
            fuzzy: true,
        };
        let hits = run_query(&snap, "fox", &[1.0, 0.0], &opts, None);
        // d1 by vector; d3 contains "fox" lexically.
        assert!(hits.len() >= 2);
        assert_eq!(hits[0].source, MatchSource::Vector);
        assert!(hits.iter().any(|h| h.document_id == "d3" && h.source == MatchSource::Fuzzy));
    }

    #[test]
    fn fuzzy_disabled_when_vector_fills_n() {
        let snap = snapshot();
        let opts = QueryOptions {
            n: 1,
            similarity_threshold: 0.0,
            fuzzy: true,
        };
        let hits = run_query(&snap, "fox", &[1.0, 0.0], &opts, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, MatchSource::Vector);
    }

    #[test]
    fn vector_ranks_ahead_of_fuzzy_at_equal_score() {
        let a = QueryHit {
            chunk_id: "z".into(),
            document_id: "d".into(),
            text: String::new(),
            score: 0.5,
            source: MatchSource::Vector,
        };
        let b = QueryHit {
            chunk_id: "a".into(),
            document_id: "d".into(),
            text: String::new(),
            score: 0.5,
            source: MatchSource::Fuzzy,
        };
        assert_eq!(compare_hits(&a, &b), Ordering::Less);
    }

    #[test]
    fn reranker_reorders_candidates() {
        let snap = snapshot();
        let opts = QueryOptions {
            n: 10,
            similarity_threshold: 0.0,
            fuzzy: false,
        };
        let reranker = create_reranker("token-overlap").unwrap();
        let hits = run_query(&snap, "lazy dogs sleeping", &[1.0, 0.0], &opts, Some(reranker.as_ref()));
        // Vector order favors d1, but rerank puts the lexically identical
        // chunk first.
        assert_eq!(hits[0].document_id, "d2");
    }

    #[test]
    fn truncates_to_n() {
        let snap = snapshot();
        let opts = QueryOptions {
            n: 2,
            similarity_threshold: 0.0,
            fuzzy: true,
        };
        let hits = run_query(&snap, "fox", &[1.0, 0.0], &opts, None);
        assert_eq!(hits.len(), 2);
    }
}
