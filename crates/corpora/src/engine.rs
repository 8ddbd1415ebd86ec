//! Collection engine: the public surface over store, coordinator, and
//! query pipeline.
//!
//! All mutations follow read-after-write ordering: the store write lands
//! first, then the rebuild is scheduled, so a subsequent rebuild always
//! sees the mutation. Searches are validated, embedded with the
//! collection's model, and run against the active snapshot without ever
//! blocking on a rebuild.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;
use uuid::Uuid;

use corpora_core::models::{Collection, Document, DocumentStatus};
use corpora_core::rerank::create_reranker;
use corpora_core::{run_query, QueryOptions, Reranker};

use crate::config::Config;
use crate::coordinator::ReindexCoordinator;
use crate::embedding::{embed_query, ProviderFactory};
use crate::error::{EngineError, Result};
use crate::store::{CollectionPage, DuplicateNameError, ListOptions, MetadataStore};

/// Parameters for creating a collection.
#[derive(Debug, Clone)]
pub struct NewCollection {
    pub name: String,
    pub authors: Vec<String>,
    /// Content-type tag to extraction strategy name. Unmapped types use
    /// built-in defaults.
    pub extraction_strategy: BTreeMap<String, String>,
    pub embedding_model: String,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct CollectionPatch {
    pub name: Option<String>,
    pub authors: Option<Vec<String>>,
    pub extraction_strategy: Option<BTreeMap<String, String>>,
    pub embedding_model: Option<String>,
}

/// Search parameters. Bounds are validated per call: `1 <= n <= 100`,
/// `0.0 <= similarity_threshold <= 1.0`.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub n: usize,
    pub similarity_threshold: f32,
    pub rerank_strategy: Option<String>,
    pub fuzzy: bool,
    /// Per-call override of the configured search timeout.
    pub timeout: Option<Duration>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            n: 10,
            similarity_threshold: 0.7,
            rerank_strategy: None,
            fuzzy: false,
            timeout: None,
        }
    }
}

/// One search result with document metadata attached.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub file_name: String,
    pub collection_id: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub total: usize,
    pub elapsed: Duration,
}

pub struct CollectionEngine {
    store: Arc<dyn MetadataStore>,
    providers: Arc<dyn ProviderFactory>,
    coordinator: Arc<ReindexCoordinator>,
    config: Config,
}

impl CollectionEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn MetadataStore>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        let coordinator =
            ReindexCoordinator::new(config.clone(), Arc::clone(&store), Arc::clone(&providers));
        Self {
            store,
            providers,
            coordinator,
            config,
        }
    }

    /// Search options seeded from `[search]` config.
    pub fn default_search_options(&self) -> SearchOptions {
        SearchOptions {
            n: self.config.search.default_limit,
            similarity_threshold: self.config.search.default_similarity_threshold,
            rerank_strategy: None,
            fuzzy: false,
            timeout: match self.config.search.timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    // ============ Collections ============

    pub async fn create_collection(&self, new: NewCollection) -> Result<Collection> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("collection name must not be empty".into()));
        }
        if new.embedding_model.trim().is_empty() {
            return Err(EngineError::Validation("embedding model must not be empty".into()));
        }
        let now = chrono::Utc::now().timestamp();
        let collection = Collection {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            authors: new.authors,
            extraction_strategy: new.extraction_strategy,
            embedding_model: new.embedding_model,
            created_at: now,
            updated_at: now,
        };
        // Uniqueness is the store's to enforce atomically; a pre-check here
        // would race concurrent creates.
        self.store
            .insert_collection(&collection)
            .await
            .map_err(store_error)?;
        info!(collection_id = %collection.id, name = %collection.name, "collection created");
        Ok(collection)
    }

    pub async fn get_collection(&self, id: &str) -> Result<Collection> {
        self.store
            .get_collection(id)
            .await?
            .ok_or_else(|| EngineError::CollectionNotFound(id.to_string()))
    }

    pub async fn list_collections(&self, opts: &ListOptions) -> Result<CollectionPage> {
        if !(1..=100).contains(&opts.limit) {
            return Err(EngineError::Validation("limit must be between 1 and 100".into()));
        }
        Ok(self.store.list_collections(opts).await?)
    }

    /// Apply a partial update. Changing the embedding model or the
    /// extraction strategy schedules a rebuild; existing chunks were
    /// produced under the old configuration.
    pub async fn update_collection(&self, id: &str, patch: CollectionPatch) -> Result<Collection> {
        let mut collection = self.get_collection(id).await?;
        let mut needs_rebuild = false;

        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(EngineError::Validation("collection name must not be empty".into()));
            }
            collection.name = name;
        }
        if let Some(authors) = patch.authors {
            collection.authors = authors;
        }
        if let Some(strategy) = patch.extraction_strategy {
            if strategy != collection.extraction_strategy {
                collection.extraction_strategy = strategy;
                needs_rebuild = true;
            }
        }
        if let Some(model) = patch.embedding_model {
            if model.trim().is_empty() {
                return Err(EngineError::Validation("embedding model must not be empty".into()));
            }
            if model != collection.embedding_model {
                collection.embedding_model = model;
                needs_rebuild = true;
            }
        }

        collection.updated_at = chrono::Utc::now().timestamp();
        self.store
            .update_collection(&collection)
            .await
            .map_err(store_error)?;
        if needs_rebuild {
            // Cached extraction output and vectors are both stale under the
            // new configuration. Clearing permanent_failure gives previously
            // unsupported documents another chance under the new strategy.
            for document in self.store.list_documents(id).await? {
                self.store.invalidate_cached_text(&document.file_id).await?;
                self.store
                    .set_document_status(&document.file_id, DocumentStatus::Queued, None, false)
                    .await?;
            }
            self.coordinator.schedule_rebuild(id);
        }
        Ok(collection)
    }

    pub async fn delete_collection(&self, id: &str) -> Result<()> {
        if !self.store.delete_collection(id).await? {
            return Err(EngineError::CollectionNotFound(id.to_string()));
        }
        self.coordinator.drop_collection(id);
        info!(collection_id = %id, "collection deleted");
        Ok(())
    }

    // ============ Documents ============

    pub async fn add_document(
        &self,
        collection_id: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Document> {
        self.get_collection(collection_id).await?;
        if file_name.trim().is_empty() {
            return Err(EngineError::Validation("file name must not be empty".into()));
        }
        if bytes.is_empty() {
            return Err(EngineError::Validation("document body must not be empty".into()));
        }
        let document = Document {
            file_id: Uuid::new_v4().to_string(),
            collection_id: collection_id.to_string(),
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            status: DocumentStatus::Queued,
            error: None,
            permanent_failure: false,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.insert_document(&document, &bytes).await?;
        self.touch_collection(collection_id).await?;
        self.coordinator.schedule_rebuild(collection_id);
        info!(
            collection_id,
            file_id = %document.file_id,
            file_name,
            "document queued"
        );
        Ok(document)
    }

    pub async fn get_document(&self, collection_id: &str, file_id: &str) -> Result<Document> {
        let document = self
            .store
            .get_document(file_id)
            .await?
            .filter(|d| d.collection_id == collection_id)
            .ok_or_else(|| EngineError::DocumentNotFound(file_id.to_string()))?;
        Ok(document)
    }

    pub async fn delete_document(&self, collection_id: &str, file_id: &str) -> Result<()> {
        // Scope check before the destructive write.
        self.get_document(collection_id, file_id).await?;
        self.store.delete_document(file_id).await?;
        self.touch_collection(collection_id).await?;
        self.coordinator.schedule_rebuild(collection_id);
        info!(collection_id, file_id, "document deleted");
        Ok(())
    }

    // ============ Search ============

    pub async fn search(
        &self,
        collection_id: &str,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<SearchResponse> {
        if query.trim().is_empty() {
            return Err(EngineError::Validation("query must not be empty".into()));
        }
        if !(1..=100).contains(&opts.n) {
            return Err(EngineError::Validation("n must be between 1 and 100".into()));
        }
        if !(0.0..=1.0).contains(&opts.similarity_threshold) {
            return Err(EngineError::Validation(
                "similarity_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        let reranker: Option<Box<dyn Reranker>> = match &opts.rerank_strategy {
            Some(name) => Some(
                create_reranker(name).map_err(|e| EngineError::Validation(e.to_string()))?,
            ),
            None => None,
        };
        let collection = self.get_collection(collection_id).await?;

        let started = Instant::now();
        let fut = self.search_inner(&collection, query, opts, reranker.as_deref());
        let results = match opts.timeout {
            Some(budget) => tokio::time::timeout(budget, fut)
                .await
                .map_err(|_| EngineError::Timeout(budget))??,
            None => fut.await?,
        };
        let total = results.len();
        Ok(SearchResponse {
            results,
            total,
            elapsed: started.elapsed(),
        })
    }

    async fn search_inner(
        &self,
        collection: &Collection,
        query: &str,
        opts: &SearchOptions,
        reranker: Option<&dyn Reranker>,
    ) -> Result<Vec<SearchHit>> {
        // No snapshot yet means nothing has been indexed; an empty result
        // is the honest answer.
        let snapshot = match self.coordinator.active_snapshot(&collection.id) {
            Some(snapshot) => snapshot,
            None => return Ok(Vec::new()),
        };
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let provider = self
            .providers
            .provider_for(&collection.embedding_model)
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
        let query_vec = embed_query(provider.as_ref(), query)
            .await
            .map_err(|e| EngineError::Embedding(e.to_string()))?;

        let query_opts = QueryOptions {
            n: opts.n,
            similarity_threshold: opts.similarity_threshold,
            fuzzy: opts.fuzzy,
        };
        let hits = run_query(&snapshot, query, &query_vec, &query_opts, reranker);

        let mut file_names: HashMap<String, String> = HashMap::new();
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let file_name = match file_names.get(&hit.document_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self
                        .store
                        .get_document(&hit.document_id)
                        .await?
                        .map(|d| d.file_name)
                        .unwrap_or_default();
                    file_names.insert(hit.document_id.clone(), name.clone());
                    name
                }
            };
            results.push(SearchHit {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                file_name,
                collection_id: collection.id.clone(),
                text: hit.text,
                score: hit.score,
            });
        }
        Ok(results)
    }

    /// Block until the collection has no rebuild running or pending.
    /// Intended for tests and graceful shutdown.
    pub async fn wait_for_idle(&self, collection_id: &str) {
        self.coordinator.wait_idle(collection_id).await;
    }

    async fn touch_collection(&self, collection_id: &str) -> Result<()> {
        if let Some(mut collection) = self.store.get_collection(collection_id).await? {
            collection.updated_at = chrono::Utc::now().timestamp();
            self.store.update_collection(&collection).await?;
        }
        Ok(())
    }
}

fn store_error(e: anyhow::Error) -> EngineError {
    match e.downcast::<DuplicateNameError>() {
        Ok(dup) => EngineError::DuplicateName(dup.0),
        Err(e) => EngineError::Store(e),
    }
}
