//! Lexical fuzzy matching over chunk text.
//!
//! Used by the query pipeline to supplement vector search when it returns
//! fewer than the requested number of results. Scoring is trigram Jaccard
//! over ASCII-folded text, with a boost when the normalized query appears
//! verbatim in the chunk. Scores are in `[0, 1]`.

use std::cmp::Ordering;
use std::collections::HashSet;

/// A query prepared for repeated fuzzy scoring against chunk texts.
#[derive(Debug)]
pub struct FuzzyScorer {
    normalized_query: String,
    query_trigrams: Vec<u32>,
}

impl FuzzyScorer {
    pub fn new(query: &str) -> Self {
        let normalized_query = normalize(query);
        let query_trigrams = unique_sorted_trigrams(&normalized_query);
        Self {
            normalized_query,
            query_trigrams,
        }
    }

    /// Score a chunk text against the query. `0.0` means no lexical affinity.
    pub fn score(&self, text: &str) -> f32 {
        if self.normalized_query.trim().is_empty() {
            return 0.0;
        }
        let normalized = normalize(text);
        let trigrams = unique_sorted_trigrams(&normalized);
        let jaccard = trigram_jaccard(&self.query_trigrams, &trigrams);

        // Verbatim containment of the whole query outranks any pure
        // trigram overlap.
        if contains_token(&normalized, self.normalized_query.trim()) {
            (0.6 + 0.4 * jaccard).min(1.0)
        } else {
            jaccard
        }
    }
}

/// Whitespace-bounded containment, so "fox" does not match "foxtrot".
fn contains_token(haystack: &str, needle: &str) -> bool {
    if needle.contains(' ') {
        // Multi-word queries: collapse runs of spaces and look for the
        // phrase as a substring.
        let collapsed = haystack.split_whitespace().collect::<Vec<_>>().join(" ");
        let needle = needle.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.contains(&needle)
    } else {
        haystack.split_whitespace().any(|w| w == needle)
    }
}

/// ASCII-fold: lowercase alphanumerics kept, everything else a space.
fn normalize(text: &str) -> String {
    let mut out = Vec::with_capacity(text.len());
    for &b in text.as_bytes() {
        let folded = b.to_ascii_lowercase();
        if folded.is_ascii_alphanumeric() {
            out.push(folded);
        } else {
            out.push(b' ');
        }
    }
    // Only ASCII bytes were pushed.
    String::from_utf8(out).unwrap_or_default()
}

/// Pack each 3-byte window into a `u32` and return the sorted unique set.
fn unique_sorted_trigrams(text: &str) -> Vec<u32> {
    let bytes = text.as_bytes();
    if bytes.len() < 3 {
        return Vec::new();
    }
    let mut set: HashSet<u32> = HashSet::new();
    for window in bytes.windows(3) {
        let tri = (window[0] as u32) | ((window[1] as u32) << 8) | ((window[2] as u32) << 16);
        set.insert(tri);
    }
    let mut out: Vec<u32> = set.into_iter().collect();
    out.sort_unstable();
    out
}

/// Jaccard similarity of two sorted trigram sets via a linear merge.
fn trigram_jaccard(a: &[u32], b: &[u32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut i = 0usize;
    let mut j = 0usize;
    let mut intersection = 0usize;
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Equal => {
                intersection += 1;
                i += 1;
                j += 1;
            }
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
        }
    }
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// Jaccard similarity over whitespace-separated word tokens. Used by the
/// token-overlap rerank strategy.
pub fn token_jaccard(a: &str, b: &str) -> f32 {
    let ta: HashSet<&str> = normalize_tokens(a);
    let tb: HashSet<&str> = normalize_tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - intersection;
    intersection as f32 / union as f32
}

fn normalize_tokens(text: &str) -> HashSet<&str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}
