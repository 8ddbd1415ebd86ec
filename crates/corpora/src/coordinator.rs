//! Reindex coordinator: snapshot ownership and coalesced rebuilds.
//!
//! Each collection owns at most one rebuild job at a time. Mutations call
//! [`ReindexCoordinator::schedule_rebuild`] after their store write lands;
//! if a rebuild is already running the request coalesces into a single
//! rerun flag, so any burst of mutations costs at most one extra pass.
//! A global semaphore bounds how many collections rebuild concurrently.
//!
//! Queries never wait on rebuilds. They read the active snapshot pointer,
//! which is swapped atomically only after a full rebuild succeeds. A failed
//! or cancelled rebuild leaves the previous snapshot serving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use corpora_core::models::{Document, DocumentStatus};
use corpora_core::{chunk_text, ChunkParams, EmbeddedChunk, IndexSnapshot};

use crate::config::Config;
use crate::embedding::{embed_in_batches, ProviderFactory};
use crate::extract::{extract_text, resolve_strategy};
use crate::store::MetadataStore;

enum Phase {
    Idle,
    /// A job owns the collection; `rerun` records schedule requests that
    /// arrived while it was running.
    Rebuilding {
        rerun: bool,
    },
}

struct CollectionIndexState {
    collection_id: String,
    /// Snapshot served to queries. Swapped whole, never mutated in place.
    active: RwLock<Option<Arc<IndexSnapshot>>>,
    phase: Mutex<Phase>,
    /// Set when the collection is deleted; in-flight rebuilds discard
    /// their result instead of swapping.
    cancelled: AtomicBool,
    version: AtomicU64,
    idle_notify: Notify,
}

pub struct ReindexCoordinator {
    states: RwLock<HashMap<String, Arc<CollectionIndexState>>>,
    store: Arc<dyn MetadataStore>,
    providers: Arc<dyn ProviderFactory>,
    config: Config,
    permits: Arc<Semaphore>,
}

impl ReindexCoordinator {
    pub fn new(
        config: Config,
        store: Arc<dyn MetadataStore>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.reindex.max_concurrent_rebuilds));
        Arc::new(Self {
            states: RwLock::new(HashMap::new()),
            store,
            providers,
            config,
            permits,
        })
    }

    /// The snapshot currently serving queries for a collection, if any.
    pub fn active_snapshot(&self, collection_id: &str) -> Option<Arc<IndexSnapshot>> {
        let state = self.state(collection_id)?;
        let guard = state.active.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Request a rebuild. Returns immediately; the rebuild runs on a
    /// spawned task. Coalesces with any rebuild already in flight.
    pub fn schedule_rebuild(self: &Arc<Self>, collection_id: &str) {
        let state = self.state_or_create(collection_id);
        let mut phase = state.phase.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *phase {
            Phase::Idle => {
                *phase = Phase::Rebuilding { rerun: false };
                drop(phase);
                debug!(collection_id, "rebuild scheduled");
                let coordinator = Arc::clone(self);
                tokio::spawn(async move {
                    coordinator.run_rebuild_loop(state).await;
                });
            }
            Phase::Rebuilding { rerun } => {
                *rerun = true;
                debug!(collection_id, "rebuild coalesced into running job");
            }
        }
    }

    /// Drop all index state for a deleted collection and cancel any
    /// in-flight rebuild.
    pub fn drop_collection(&self, collection_id: &str) {
        let removed = {
            let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
            states.remove(collection_id)
        };
        if let Some(state) = removed {
            state.cancelled.store(true, Ordering::SeqCst);
            info!(collection_id, "collection index state dropped");
        }
    }

    /// Wait until no rebuild is running or pending for a collection.
    pub async fn wait_idle(&self, collection_id: &str) {
        let state = match self.state(collection_id) {
            Some(state) => state,
            None => return,
        };
        loop {
            let notified = state.idle_notify.notified();
            {
                let phase = state.phase.lock().unwrap_or_else(|e| e.into_inner());
                if matches!(*phase, Phase::Idle) {
                    return;
                }
            }
            notified.await;
        }
    }

    fn state(&self, collection_id: &str) -> Option<Arc<CollectionIndexState>> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states.get(collection_id).cloned()
    }

    fn state_or_create(&self, collection_id: &str) -> Arc<CollectionIndexState> {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states
            .entry(collection_id.to_string())
            .or_insert_with(|| {
                Arc::new(CollectionIndexState {
                    collection_id: collection_id.to_string(),
                    active: RwLock::new(None),
                    phase: Mutex::new(Phase::Idle),
                    cancelled: AtomicBool::new(false),
                    version: AtomicU64::new(0),
                    idle_notify: Notify::new(),
                })
            })
            .clone()
    }

    async fn run_rebuild_loop(self: Arc<Self>, state: Arc<CollectionIndexState>) {
        loop {
            {
                let Ok(_permit) = self.permits.clone().acquire_owned().await else {
                    break;
                };
                self.rebuild_pass(&state).await;
            }

            if state.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let mut phase = state.phase.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *phase {
                Phase::Rebuilding { rerun: true } => {
                    *phase = Phase::Rebuilding { rerun: false };
                    debug!(collection_id = %state.collection_id, "rerunning coalesced rebuild");
                }
                _ => {
                    *phase = Phase::Idle;
                    drop(phase);
                    state.idle_notify.notify_waiters();
                    break;
                }
            }
        }
        // Cancelled jobs still release the phase so waiters wake up.
        if state.cancelled.load(Ordering::SeqCst) {
            let mut phase = state.phase.lock().unwrap_or_else(|e| e.into_inner());
            *phase = Phase::Idle;
            drop(phase);
            state.idle_notify.notify_waiters();
        }
    }

    /// One full rebuild: extract, chunk, and embed every document, then
    /// build a fresh snapshot and swap it in. Per-document failures are
    /// recorded on the document; only pipeline-level failures (store,
    /// provider resolution, index build) abort the pass, and those leave
    /// the previous snapshot serving.
    async fn rebuild_pass(&self, state: &CollectionIndexState) {
        let collection_id = state.collection_id.as_str();
        let collection = match self.store.get_collection(collection_id).await {
            Ok(Some(collection)) => collection,
            Ok(None) => {
                debug!(collection_id, "collection gone, skipping rebuild");
                return;
            }
            Err(e) => {
                error!(collection_id, error = %e, "failed to load collection");
                return;
            }
        };
        let documents = match self.store.list_documents(collection_id).await {
            Ok(documents) => documents,
            Err(e) => {
                error!(collection_id, error = %e, "failed to list documents");
                return;
            }
        };
        let provider = match self.providers.provider_for(&collection.embedding_model) {
            Ok(provider) => provider,
            Err(e) => {
                error!(
                    collection_id,
                    model = %collection.embedding_model,
                    error = %e,
                    "no embedding provider for model"
                );
                return;
            }
        };

        let params = ChunkParams {
            max_tokens: self.config.chunking.max_tokens,
            overlap_tokens: self.config.chunking.overlap_tokens,
        };
        let mut embedded: Vec<EmbeddedChunk> = Vec::new();
        let mut indexed_ids: Vec<String> = Vec::new();

        for document in &documents {
            if state.cancelled.load(Ordering::SeqCst) {
                debug!(collection_id, "rebuild cancelled mid-pass");
                return;
            }
            if document.status == DocumentStatus::Failed && document.permanent_failure {
                debug!(
                    collection_id,
                    file_id = %document.file_id,
                    "skipping permanently failed document"
                );
                continue;
            }
            match self
                .process_document(&collection.extraction_strategy, document, &params, provider.as_ref())
                .await
            {
                Ok(mut chunks) => {
                    embedded.append(&mut chunks);
                    indexed_ids.push(document.file_id.clone());
                }
                Err(DocumentFailure { message, permanent }) => {
                    warn!(
                        collection_id,
                        file_id = %document.file_id,
                        permanent,
                        error = %message,
                        "document failed during rebuild"
                    );
                    if let Err(e) = self
                        .store
                        .set_document_status(
                            &document.file_id,
                            DocumentStatus::Failed,
                            Some(message),
                            permanent,
                        )
                        .await
                    {
                        error!(collection_id, error = %e, "failed to record document failure");
                        return;
                    }
                }
            }
        }

        let version = state.version.fetch_add(1, Ordering::SeqCst) + 1;
        let chunk_count = embedded.len();
        let snapshot = match IndexSnapshot::build(version, provider.dims(), embedded) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(collection_id, error = %e, "index build failed, keeping previous snapshot");
                return;
            }
        };

        if state.cancelled.load(Ordering::SeqCst) {
            debug!(collection_id, "rebuild cancelled, discarding snapshot");
            return;
        }
        {
            let mut active = state.active.write().unwrap_or_else(|e| e.into_inner());
            *active = Some(Arc::new(snapshot));
        }
        // Status flips to indexed only after the swap, so an indexed
        // document's chunks are always queryable.
        for file_id in &indexed_ids {
            if let Err(e) = self
                .store
                .set_document_status(file_id, DocumentStatus::Indexed, None, false)
                .await
            {
                error!(collection_id, file_id = %file_id, error = %e, "failed to mark indexed");
            }
        }
        info!(
            collection_id,
            version,
            documents = indexed_ids.len(),
            chunks = chunk_count,
            "snapshot swapped in"
        );
    }

    async fn process_document(
        &self,
        strategy_mapping: &std::collections::BTreeMap<String, String>,
        document: &Document,
        params: &ChunkParams,
        provider: &dyn crate::embedding::EmbeddingProvider,
    ) -> std::result::Result<Vec<EmbeddedChunk>, DocumentFailure> {
        let file_id = document.file_id.as_str();
        self.set_status(file_id, DocumentStatus::Extracting).await?;

        let text = match self.store.cached_text(file_id).await.map_err(store_failure)? {
            Some(text) => text,
            None => {
                let strategy = resolve_strategy(strategy_mapping, &document.content_type)
                    .map_err(|e| DocumentFailure {
                        message: e.to_string(),
                        permanent: e.is_permanent(),
                    })?;
                let bytes = self
                    .store
                    .document_bytes(file_id)
                    .await
                    .map_err(store_failure)?
                    .ok_or_else(|| DocumentFailure {
                        message: "raw bytes missing from store".to_string(),
                        permanent: false,
                    })?;
                let text = extract_text(&bytes, &strategy).map_err(|e| DocumentFailure {
                    message: e.to_string(),
                    permanent: e.is_permanent(),
                })?;
                self.store
                    .cache_text(file_id, &text)
                    .await
                    .map_err(store_failure)?;
                text
            }
        };

        self.set_status(file_id, DocumentStatus::Chunking).await?;
        let chunks = chunk_text(file_id, &text, params);

        self.set_status(file_id, DocumentStatus::Embedding).await?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_in_batches(provider, &texts, self.config.embedding.batch_size)
            .await
            .map_err(|e| DocumentFailure {
                message: e.to_string(),
                permanent: false,
            })?;

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
            .collect())
    }

    async fn set_status(
        &self,
        file_id: &str,
        status: DocumentStatus,
    ) -> std::result::Result<(), DocumentFailure> {
        self.store
            .set_document_status(file_id, status, None, false)
            .await
            .map_err(store_failure)
    }
}

struct DocumentFailure {
    message: String,
    permanent: bool,
}

fn store_failure(e: anyhow::Error) -> DocumentFailure {
    DocumentFailure {
        message: format!("store error: {}", e),
        permanent: false,
    }
}
