//! # corpora
//!
//! Async collection index engine: ingest documents into named collections,
//! keep one immutable vector snapshot per collection fresh through
//! coalesced background rebuilds, and serve deterministic semantic search
//! with optional fuzzy supplement and reranking.
//!
//! The engine never serves a partially built index. Mutations write the
//! metadata store, then schedule a rebuild; queries read whatever snapshot
//! is active at that instant. See [`engine::CollectionEngine`] for the
//! public surface.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with serde defaults |
//! | [`engine`] | Public facade: collections, documents, search |
//! | [`coordinator`] | Snapshot ownership, coalesced single-flight rebuilds |
//! | [`store`] | Metadata storage trait plus in-memory backend |
//! | [`embedding`] | Embedding providers: remote HTTP and deterministic hashed |
//! | [`extract`] | Bytes-to-text extraction strategy registry |
//! | [`error`] | Engine error taxonomy |

pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod store;

pub use config::{load_config, Config};
pub use embedding::{
    ConfigProviderFactory, EmbeddingProvider, HashedProvider, ProviderFactory, RemoteProvider,
};
pub use engine::{
    CollectionEngine, CollectionPatch, NewCollection, SearchHit, SearchOptions, SearchResponse,
};
pub use error::{EngineError, Result};
pub use store::{DuplicateNameError, ListOptions, MemoryStore, MetadataStore};

pub use corpora_core::models::{Collection, Document, DocumentStatus};
