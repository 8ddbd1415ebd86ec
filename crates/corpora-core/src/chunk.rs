//! Deterministic paragraph-boundary chunker with overlap carry.
//!
//! Splits extracted text into [`Chunk`]s that respect a `max_tokens` limit
//! (chars-per-token approximation). Splitting occurs on paragraph boundaries
//! (`\n\n`) to preserve semantic coherence; paragraphs that alone exceed the
//! limit are split at whitespace boundaries. The tail of each chunk is
//! carried as overlap context into the start of the next chunk.
//!
//! Identical input and parameters always yield an identical chunk sequence,
//! which re-indexing relies on: chunk ids are derived from the document id
//! and index, and content hashes from the chunk text.

use sha2::{Digest, Sha256};

use crate::models::{chunk_id, Chunk};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    /// Maximum tokens per chunk (approximated as chars / 4).
    pub max_tokens: usize,
    /// Tokens of trailing context carried into the next chunk.
    pub overlap_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 40,
        }
    }
}

/// A trimmed span of the source text with its byte offsets.
struct Segment<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`
/// and carrying `overlap_tokens` of context between adjacent chunks.
///
/// Returns chunks with contiguous indices starting at 0. Empty or
/// whitespace-only text yields zero chunks.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let max_chars = params.max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = params.overlap_tokens * CHARS_PER_TOKEN;

    let segments = collect_segments(text, max_chars);

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut group: Vec<&Segment> = Vec::new();
    let mut group_len = 0usize;
    let mut carry = String::new();

    for seg in &segments {
        let would_be = if group.is_empty() {
            seg.text.len()
        } else {
            group_len + 2 + seg.text.len() // +2 for the \n\n separator
        };

        if would_be > max_chars && !group.is_empty() {
            flush_group(document_id, &group, &mut carry, overlap_chars, &mut chunks);
            group.clear();
            group_len = 0;
        }

        group_len = if group.is_empty() {
            seg.text.len()
        } else {
            group_len + 2 + seg.text.len()
        };
        group.push(seg);
    }

    if !group.is_empty() {
        flush_group(document_id, &group, &mut carry, overlap_chars, &mut chunks);
    }

    chunks
}

/// Break the source text into trimmed paragraph segments, further splitting
/// any paragraph that alone exceeds `max_chars` at whitespace boundaries.
fn collect_segments(text: &str, max_chars: usize) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut pos = 0usize;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            pos += para.len() + 2;
            continue;
        }
        let lead = para.len() - para.trim_start().len();
        let start = pos + lead;

        if trimmed.len() <= max_chars {
            segments.push(Segment {
                text: trimmed,
                start,
                end: start + trimmed.len(),
            });
        } else {
            split_oversized(trimmed, start, max_chars, &mut segments);
        }
        pos += para.len() + 2;
    }

    segments
}

/// Hard-split an oversized paragraph at whitespace boundaries, falling back
/// to a raw cut when no whitespace exists within the window.
fn split_oversized<'a>(
    para: &'a str,
    base: usize,
    max_chars: usize,
    out: &mut Vec<Segment<'a>>,
) {
    let mut remaining = para;
    let mut offset = base;

    while !remaining.is_empty() {
        let mut split_at = remaining.len().min(max_chars);
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        let actual = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|p| p + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };

        let piece = &remaining[..actual];
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            let lead = piece.len() - piece.trim_start().len();
            out.push(Segment {
                text: trimmed,
                start: offset + lead,
                end: offset + lead + trimmed.len(),
            });
        }
        offset += actual;
        remaining = &remaining[actual..];
    }
}

/// Emit one chunk for the packed segment group and update the overlap carry.
fn flush_group(
    document_id: &str,
    group: &[&Segment],
    carry: &mut String,
    overlap_chars: usize,
    chunks: &mut Vec<Chunk>,
) {
    let own_text = group
        .iter()
        .map(|s| s.text)
        .collect::<Vec<_>>()
        .join("\n\n");

    let text = if carry.is_empty() {
        own_text.clone()
    } else {
        format!("{} {}", carry, own_text)
    };

    let index = chunks.len() as i64;
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    chunks.push(Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        text,
        offset_start: group[0].start,
        offset_end: group[group.len() - 1].end,
        hash,
    });

    *carry = overlap_tail(&own_text, overlap_chars);
}

/// The trailing `overlap_chars` of a chunk's own text, snapped forward to a
/// word boundary so the carry never starts mid-word.
fn overlap_tail(text: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 {
        return String::new();
    }
    if text.len() <= overlap_chars {
        return text.trim().to_string();
    }
    let mut start = text.len() - overlap_chars;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(i) => tail[i..].trim().to_string(),
        None => tail.trim().to_string(),
    }
}
