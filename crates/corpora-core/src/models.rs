//! Core data models for the collection index engine.
//!
//! These types represent the collections, documents, and chunks that flow
//! through the ingestion and retrieval pipeline. Raw file bytes live in the
//! metadata store; a [`Document`] only carries index-relevant state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A named, authored set of documents sharing one extraction configuration
/// and one embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    /// Opaque unique key (UUID string).
    pub id: String,
    /// Unique among non-deleted collections.
    pub name: String,
    /// Ordered author list.
    pub authors: Vec<String>,
    /// Maps a content-type tag to an extraction strategy name.
    pub extraction_strategy: BTreeMap<String, String>,
    /// Embedding model identifier (e.g. `"text-embedding-003-small"`).
    pub embedding_model: String,
    /// Unix timestamp, set on creation.
    pub created_at: i64,
    /// Unix timestamp, bumped on every successful update.
    pub updated_at: i64,
}

/// Ingestion lifecycle of a document.
///
/// `Indexed` means every chunk of the document is present in the
/// collection's active snapshot; `Failed` means none are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Queued,
    Extracting,
    Chunking,
    Embedding,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Queued => "queued",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }
}

/// A document belonging to exactly one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub collection_id: String,
    pub file_name: String,
    pub content_type: String,
    pub status: DocumentStatus,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    /// Permanent failures (unsupported strategy or content type) are
    /// skipped by later rebuilds instead of being retried.
    pub permanent_failure: bool,
    pub created_at: i64,
}

/// A contiguous span of a document's extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from `(document_id, chunk_index)` so that
    /// rebuilding an unchanged document yields an identical chunk set.
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Byte offset into the extracted text where this chunk's own span
    /// starts. Carried overlap text belongs to the previous chunk's span.
    pub offset_start: usize,
    /// Byte offset one past the end of this chunk's own span.
    pub offset_end: usize,
    /// SHA-256 of `text`, for staleness detection.
    pub hash: String,
}

/// Build the deterministic chunk id for a `(document_id, index)` pair.
///
/// Zero-padded so that lexicographic order on ids matches chunk order
/// within a document, which keeps score-tie ordering stable.
pub fn chunk_id(document_id: &str, index: i64) -> String {
    format!("{}:{:06}", document_id, index)
}
