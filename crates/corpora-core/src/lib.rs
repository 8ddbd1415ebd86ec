//! # corpora-core
//!
//! Runtime-free logic for the corpora collection index engine: data models,
//! deterministic chunking, immutable vector index snapshots, the lexical
//! fuzzy scorer, rerank strategies, and the query-merge algorithm.
//!
//! This crate contains no tokio, network, or filesystem I/O. The async
//! engine (`corpora`) drives ingestion and owns snapshot lifecycles; this
//! crate answers the pure questions: how text becomes chunks, how chunk
//! embeddings become a searchable snapshot, and how one query produces one
//! deterministic ranking.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `Collection`, `Document`, `Chunk`, status lifecycle |
//! | [`chunk`] | Paragraph-boundary chunker with overlap carry |
//! | [`index`] | Immutable vector index snapshots: build + ranked search |
//! | [`fuzzy`] | Trigram-Jaccard lexical scoring |
//! | [`rerank`] | Named rerank strategy registry |
//! | [`query`] | Vector + fuzzy merge, rerank, truncation |

pub mod chunk;
pub mod fuzzy;
pub mod index;
pub mod models;
pub mod query;
pub mod rerank;

pub use chunk::{chunk_text, ChunkParams};
pub use index::{EmbeddedChunk, IndexBuildError, IndexSnapshot};
pub use models::{Chunk, Collection, Document, DocumentStatus};
pub use query::{run_query, MatchSource, QueryHit, QueryOptions};
pub use rerank::{create_reranker, Reranker};
