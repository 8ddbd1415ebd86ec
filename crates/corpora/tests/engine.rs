//! End-to-end engine tests: ingest, rebuild, search, failure handling.
//!
//! Embedding is stubbed with deterministic in-process providers so that
//! scores are known exactly and no test touches the network.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use corpora::coordinator::ReindexCoordinator;
use corpora::embedding::{EmbedError, EmbeddingProvider, ProviderFactory};
use corpora::store::CollectionPage;
use corpora::{
    Collection, CollectionEngine, CollectionPatch, Config, Document, DocumentStatus, EngineError,
    HashedProvider, ListOptions, MemoryStore, MetadataStore, NewCollection, SearchOptions,
};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Maps keyword families onto fixed axes so cosine scores are 0 or 1.
struct KeywordProvider;

fn keyword_axis(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    if lower.contains("fox") {
        vec![1.0, 0.0, 0.0, 0.0]
    } else if lower.contains("dog") {
        vec![0.0, 1.0, 0.0, 0.0]
    } else if lower.contains("breeze") {
        vec![0.0, 0.0, 0.0, 1.0]
    } else {
        vec![0.0, 0.0, 1.0, 0.0]
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordProvider {
    fn model_name(&self) -> &str {
        "keyword-test"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| keyword_axis(t)).collect())
    }
}

/// Fails the first `failures` batches, then behaves like [`KeywordProvider`].
struct FlakyProvider {
    remaining_failures: AtomicUsize,
}

impl FlakyProvider {
    fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyProvider {
    fn model_name(&self) -> &str {
        "flaky-test"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let prior = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prior > 0 {
            return Err(EmbedError::Request("synthetic outage".to_string()));
        }
        Ok(texts.iter().map(|t| keyword_axis(t)).collect())
    }
}

/// Sleeps before answering, for timeout tests.
struct SlowProvider;

#[async_trait]
impl EmbeddingProvider for SlowProvider {
    fn model_name(&self) -> &str {
        "slow-test"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(texts.iter().map(|t| keyword_axis(t)).collect())
    }
}

/// Holds document embeddings at a gate so a rebuild can be kept in flight
/// while the test observes the engine from outside. Query embeddings pass
/// straight through; only texts carrying the `[body]` marker wait.
struct GatedProvider {
    gate: tokio::sync::Semaphore,
    completed: AtomicUsize,
}

impl GatedProvider {
    fn new(initial_permits: usize) -> Self {
        Self {
            gate: tokio::sync::Semaphore::new(initial_permits),
            completed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GatedProvider {
    fn model_name(&self) -> &str {
        "gated-test"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.iter().any(|t| t.contains("[body]")) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| EmbedError::Request("gate closed".to_string()))?;
            permit.forget();
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| keyword_axis(t)).collect())
    }
}

/// Serves the same provider for every model name.
struct FixedFactory(Arc<dyn EmbeddingProvider>);

impl ProviderFactory for FixedFactory {
    fn provider_for(&self, _model: &str) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        Ok(Arc::clone(&self.0))
    }
}

fn engine_with(provider: Arc<dyn EmbeddingProvider>) -> CollectionEngine {
    init_tracing();
    CollectionEngine::new(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(FixedFactory(provider)),
    )
}

/// Delegates to a memory store but suspends before collection writes,
/// interleaving concurrent writers the way any remote backend would.
struct YieldingStore(MemoryStore);

#[async_trait]
impl MetadataStore for YieldingStore {
    async fn insert_collection(&self, collection: &Collection) -> anyhow::Result<()> {
        tokio::task::yield_now().await;
        self.0.insert_collection(collection).await
    }
    async fn get_collection(&self, id: &str) -> anyhow::Result<Option<Collection>> {
        self.0.get_collection(id).await
    }
    async fn find_collection_by_name(&self, name: &str) -> anyhow::Result<Option<Collection>> {
        self.0.find_collection_by_name(name).await
    }
    async fn update_collection(&self, collection: &Collection) -> anyhow::Result<()> {
        tokio::task::yield_now().await;
        self.0.update_collection(collection).await
    }
    async fn delete_collection(&self, id: &str) -> anyhow::Result<bool> {
        self.0.delete_collection(id).await
    }
    async fn list_collections(&self, opts: &ListOptions) -> anyhow::Result<CollectionPage> {
        self.0.list_collections(opts).await
    }
    async fn insert_document(&self, document: &Document, bytes: &[u8]) -> anyhow::Result<()> {
        self.0.insert_document(document, bytes).await
    }
    async fn get_document(&self, file_id: &str) -> anyhow::Result<Option<Document>> {
        self.0.get_document(file_id).await
    }
    async fn delete_document(&self, file_id: &str) -> anyhow::Result<bool> {
        self.0.delete_document(file_id).await
    }
    async fn list_documents(&self, collection_id: &str) -> anyhow::Result<Vec<Document>> {
        self.0.list_documents(collection_id).await
    }
    async fn document_bytes(&self, file_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.0.document_bytes(file_id).await
    }
    async fn set_document_status(
        &self,
        file_id: &str,
        status: DocumentStatus,
        error: Option<String>,
        permanent: bool,
    ) -> anyhow::Result<()> {
        self.0.set_document_status(file_id, status, error, permanent).await
    }
    async fn cached_text(&self, file_id: &str) -> anyhow::Result<Option<String>> {
        self.0.cached_text(file_id).await
    }
    async fn cache_text(&self, file_id: &str, text: &str) -> anyhow::Result<()> {
        self.0.cache_text(file_id, text).await
    }
    async fn invalidate_cached_text(&self, file_id: &str) -> anyhow::Result<()> {
        self.0.invalidate_cached_text(file_id).await
    }
}

async fn create_collection(engine: &CollectionEngine, name: &str) -> String {
    engine
        .create_collection(NewCollection {
            name: name.to_string(),
            authors: vec!["tester".to_string()],
            extraction_strategy: BTreeMap::new(),
            embedding_model: "test-model".to_string(),
        })
        .await
        .unwrap()
        .id
}

async fn add_text(
    engine: &CollectionEngine,
    collection_id: &str,
    file_name: &str,
    text: &str,
) -> Document {
    engine
        .add_document(collection_id, file_name, "text/plain", text.as_bytes().to_vec())
        .await
        .unwrap()
}

#[tokio::test]
async fn ingest_and_search_end_to_end() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "animals").await;

    let fox = add_text(&engine, &cid, "fox.txt", "The quick brown fox jumps.").await;
    add_text(&engine, &cid, "dog.txt", "A lazy dog sleeps all day.").await;
    engine.wait_for_idle(&cid).await;

    let doc = engine.get_document(&cid, &fox.file_id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Indexed);

    let response = engine
        .search(&cid, "fox", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    let hit = &response.results[0];
    assert!(hit.score >= 0.7, "score {}", hit.score);
    assert_eq!(hit.document_id, fox.file_id);
    assert_eq!(hit.file_name, "fox.txt");
    assert_eq!(hit.collection_id, cid);
}

#[tokio::test]
async fn search_before_any_document_returns_empty() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "empty").await;
    let response = engine
        .search(&cid, "anything", &SearchOptions::default())
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.total, 0);
}

#[tokio::test]
async fn raising_threshold_never_grows_results() {
    let engine = engine_with(Arc::new(HashedProvider::new("hashed", 64)));
    let cid = create_collection(&engine, "notes").await;
    for (i, text) in [
        "alpha beta gamma delta",
        "alpha beta something else",
        "alpha only here",
        "completely different words",
    ]
    .iter()
    .enumerate()
    {
        add_text(&engine, &cid, &format!("n{}.txt", i), text).await;
    }
    engine.wait_for_idle(&cid).await;

    let mut prev = usize::MAX;
    for threshold in [0.0, 0.2, 0.5, 0.9] {
        let opts = SearchOptions {
            similarity_threshold: threshold,
            ..Default::default()
        };
        let count = engine
            .search(&cid, "alpha beta gamma", &opts)
            .await
            .unwrap()
            .results
            .len();
        assert!(count <= prev, "threshold {} grew results", threshold);
        prev = count;
    }
}

#[tokio::test]
async fn raising_n_never_shrinks_results() {
    let engine = engine_with(Arc::new(HashedProvider::new("hashed", 64)));
    let cid = create_collection(&engine, "notes").await;
    for i in 0..5 {
        add_text(&engine, &cid, &format!("n{}.txt", i), &format!("alpha topic number {}", i)).await;
    }
    engine.wait_for_idle(&cid).await;

    let mut prev = 0usize;
    for n in [1, 2, 4, 8] {
        let opts = SearchOptions {
            n,
            similarity_threshold: 0.0,
            ..Default::default()
        };
        let results = engine.search(&cid, "alpha", &opts).await.unwrap().results;
        assert!(results.len() >= prev, "n {} shrank results", n);
        prev = results.len();
    }
}

#[tokio::test]
async fn fuzzy_supplements_vector_misses() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "weather").await;
    // Vector axis for this text comes from "breeze"; the query "zephyr"
    // embeds onto a different axis, so vector search finds nothing.
    add_text(&engine, &cid, "wind.txt", "A zephyr is a gentle breeze.").await;
    engine.wait_for_idle(&cid).await;

    let without = engine
        .search(&cid, "zephyr", &SearchOptions::default())
        .await
        .unwrap();
    assert!(without.results.is_empty());

    let opts = SearchOptions {
        fuzzy: true,
        ..Default::default()
    };
    let with = engine.search(&cid, "zephyr", &opts).await.unwrap();
    assert_eq!(with.results.len(), 1);
    assert!(with.results[0].text.contains("zephyr"));
}

#[tokio::test]
async fn rerank_reorders_by_lexical_overlap() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "rerank").await;
    let fox = add_text(&engine, &cid, "fox.txt", "a fox in the meadow").await;
    let dog = add_text(&engine, &cid, "dog.txt", "the dog sleeps all day").await;
    engine.wait_for_idle(&cid).await;

    // Vector search alone puts the dog chunk first for a dog query.
    let base = SearchOptions {
        similarity_threshold: 0.0,
        ..Default::default()
    };
    let plain = engine.search(&cid, "dog in the meadow", &base).await.unwrap();
    assert_eq!(plain.results[0].document_id, dog.file_id);

    // Token overlap favors the chunk sharing more query words.
    let reranked = engine
        .search(
            &cid,
            "dog in the meadow",
            &SearchOptions {
                rerank_strategy: Some("token-overlap".to_string()),
                ..base
            },
        )
        .await
        .unwrap();
    assert_eq!(reranked.results[0].document_id, fox.file_id);
}

#[tokio::test]
async fn unknown_rerank_strategy_is_a_validation_error() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "c").await;
    let err = engine
        .search(
            &cid,
            "fox",
            &SearchOptions {
                rerank_strategy: Some("cross-encoder".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn search_parameter_bounds_are_enforced() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "c").await;

    for opts in [
        SearchOptions { n: 0, ..Default::default() },
        SearchOptions { n: 101, ..Default::default() },
        SearchOptions { similarity_threshold: 1.5, ..Default::default() },
        SearchOptions { similarity_threshold: -0.1, ..Default::default() },
    ] {
        let err = engine.search(&cid, "fox", &opts).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{:?} accepted", opts);
    }
    let err = engine
        .search(&cid, "   ", &SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn unsupported_content_type_fails_only_that_document() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "mixed").await;
    let good = add_text(&engine, &cid, "fox.txt", "a fox ran by").await;
    let bad = engine
        .add_document(&cid, "blob.bin", "application/octet-stream", vec![1, 2, 3])
        .await
        .unwrap();
    engine.wait_for_idle(&cid).await;

    let good_doc = engine.get_document(&cid, &good.file_id).await.unwrap();
    assert_eq!(good_doc.status, DocumentStatus::Indexed);
    let bad_doc = engine.get_document(&cid, &bad.file_id).await.unwrap();
    assert_eq!(bad_doc.status, DocumentStatus::Failed);
    assert!(bad_doc.permanent_failure);
    assert!(bad_doc.error.is_some());

    let response = engine
        .search(&cid, "fox", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].document_id, good.file_id);
}

#[tokio::test]
async fn permanent_failures_are_not_retried_on_later_rebuilds() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "mixed").await;
    let bad = engine
        .add_document(&cid, "blob.bin", "application/octet-stream", vec![1, 2, 3])
        .await
        .unwrap();
    engine.wait_for_idle(&cid).await;
    let first_error = engine.get_document(&cid, &bad.file_id).await.unwrap().error;

    // A later mutation triggers another rebuild; the failed document
    // must stay failed rather than cycling back through the pipeline.
    add_text(&engine, &cid, "fox.txt", "a fox again").await;
    engine.wait_for_idle(&cid).await;
    let doc = engine.get_document(&cid, &bad.file_id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(doc.error, first_error);
}

#[tokio::test]
async fn transient_embedding_failure_recovers_on_next_rebuild() {
    let flaky = Arc::new(FlakyProvider::new(1));
    let engine = engine_with(flaky.clone());
    let cid = create_collection(&engine, "flaky").await;

    let doc = add_text(&engine, &cid, "fox.txt", "a fox in trouble").await;
    engine.wait_for_idle(&cid).await;
    let failed = engine.get_document(&cid, &doc.file_id).await.unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(!failed.permanent_failure);

    // Any later mutation reruns the pipeline; the provider now works.
    add_text(&engine, &cid, "dog.txt", "a dog too").await;
    engine.wait_for_idle(&cid).await;
    let recovered = engine.get_document(&cid, &doc.file_id).await.unwrap();
    assert_eq!(recovered.status, DocumentStatus::Indexed);
    assert!(recovered.error.is_none());
}

#[tokio::test]
async fn deleted_document_leaves_the_index() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "animals").await;
    let fox = add_text(&engine, &cid, "fox.txt", "the fox itself").await;
    add_text(&engine, &cid, "dog.txt", "the dog stays").await;
    engine.wait_for_idle(&cid).await;

    engine.delete_document(&cid, &fox.file_id).await.unwrap();
    engine.wait_for_idle(&cid).await;

    let response = engine
        .search(&cid, "fox", &SearchOptions::default())
        .await
        .unwrap();
    assert!(response.results.is_empty());
    let err = engine.get_document(&cid, &fox.file_id).await.unwrap_err();
    assert!(matches!(err, EngineError::DocumentNotFound(_)));
}

#[tokio::test]
async fn burst_of_mutations_converges() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "burst").await;
    let mut ids = Vec::new();
    for i in 0..8 {
        let doc = add_text(&engine, &cid, &format!("fox{}.txt", i), &format!("fox number {}", i)).await;
        ids.push(doc.file_id);
    }
    engine.wait_for_idle(&cid).await;

    for file_id in &ids {
        let doc = engine.get_document(&cid, file_id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
    }
    let opts = SearchOptions {
        n: 20,
        ..Default::default()
    };
    let response = engine.search(&cid, "fox", &opts).await.unwrap();
    assert_eq!(response.results.len(), 8);
}

#[tokio::test]
async fn duplicate_collection_name_is_rejected() {
    let engine = engine_with(Arc::new(KeywordProvider));
    create_collection(&engine, "unique").await;
    let err = engine
        .create_collection(NewCollection {
            name: "unique".to_string(),
            authors: vec![],
            extraction_strategy: BTreeMap::new(),
            embedding_model: "m".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(_)));
}

#[tokio::test]
async fn deleting_a_collection_removes_everything() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "doomed").await;
    add_text(&engine, &cid, "fox.txt", "a fox").await;
    engine.wait_for_idle(&cid).await;

    engine.delete_collection(&cid).await.unwrap();
    let err = engine
        .search(&cid, "fox", &SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CollectionNotFound(_)));
    let err = engine.delete_collection(&cid).await.unwrap_err();
    assert!(matches!(err, EngineError::CollectionNotFound(_)));
}

#[tokio::test]
async fn changing_extraction_strategy_requeues_failed_documents() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "retry").await;
    let doc = engine
        .add_document(&cid, "notes.bin", "application/x-notes", b"fox notes".to_vec())
        .await
        .unwrap();
    engine.wait_for_idle(&cid).await;
    assert_eq!(
        engine.get_document(&cid, &doc.file_id).await.unwrap().status,
        DocumentStatus::Failed
    );

    let mut strategy = BTreeMap::new();
    strategy.insert("application/x-notes".to_string(), "plain".to_string());
    engine
        .update_collection(
            &cid,
            CollectionPatch {
                extraction_strategy: Some(strategy),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine.wait_for_idle(&cid).await;

    let doc = engine.get_document(&cid, &doc.file_id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Indexed);
    let response = engine
        .search(&cid, "fox", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
}

#[tokio::test]
async fn update_bumps_updated_at_and_rejects_duplicate_rename() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "first").await;
    create_collection(&engine, "second").await;

    let err = engine
        .update_collection(
            &cid,
            CollectionPatch {
                name: Some("second".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(_)));

    let before = engine.get_collection(&cid).await.unwrap();
    let updated = engine
        .update_collection(
            &cid,
            CollectionPatch {
                authors: Some(vec!["new author".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(updated.updated_at >= before.updated_at);
    assert_eq!(updated.authors, vec!["new author".to_string()]);
}

#[tokio::test]
async fn slow_embedding_hits_the_search_timeout() {
    let engine = engine_with(Arc::new(SlowProvider));
    let cid = create_collection(&engine, "slow").await;
    add_text(&engine, &cid, "fox.txt", "a fox").await;
    engine.wait_for_idle(&cid).await;

    let err = engine
        .search(
            &cid,
            "fox",
            &SearchOptions {
                timeout: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));
}

#[tokio::test]
async fn rebuild_of_unchanged_documents_is_idempotent() {
    let engine = engine_with(Arc::new(KeywordProvider));
    let cid = create_collection(&engine, "stable-set").await;
    add_text(&engine, &cid, "fox1.txt", "first fox chunk").await;
    add_text(&engine, &cid, "fox2.txt", "second fox chunk").await;
    engine.wait_for_idle(&cid).await;

    let opts = SearchOptions {
        n: 10,
        ..Default::default()
    };
    let before = engine.search(&cid, "fox", &opts).await.unwrap();

    // Adding and removing an unrelated document forces two more rebuilds
    // over the same surviving set.
    let extra = add_text(&engine, &cid, "dog.txt", "a passing dog").await;
    engine.wait_for_idle(&cid).await;
    engine.delete_document(&cid, &extra.file_id).await.unwrap();
    engine.wait_for_idle(&cid).await;

    let after = engine.search(&cid, "fox", &opts).await.unwrap();
    let a: Vec<(&str, f32)> = before.results.iter().map(|h| (h.chunk_id.as_str(), h.score)).collect();
    let b: Vec<(&str, f32)> = after.results.iter().map(|h| (h.chunk_id.as_str(), h.score)).collect();
    assert_eq!(a, b);
}

#[tokio::test]
async fn repeated_searches_return_identical_rankings() {
    let engine = engine_with(Arc::new(HashedProvider::new("hashed", 64)));
    let cid = create_collection(&engine, "stable").await;
    for i in 0..6 {
        add_text(&engine, &cid, &format!("n{}.txt", i), &format!("alpha beta note {}", i)).await;
    }
    engine.wait_for_idle(&cid).await;

    let opts = SearchOptions {
        similarity_threshold: 0.0,
        ..Default::default()
    };
    let first = engine.search(&cid, "alpha beta", &opts).await.unwrap();
    for _ in 0..3 {
        let again = engine.search(&cid, "alpha beta", &opts).await.unwrap();
        let a: Vec<(&str, f32)> = first.results.iter().map(|h| (h.chunk_id.as_str(), h.score)).collect();
        let b: Vec<(&str, f32)> = again.results.iter().map(|h| (h.chunk_id.as_str(), h.score)).collect();
        assert_eq!(a, b);
    }
}

#[tokio::test]
async fn concurrent_creates_with_the_same_name_leave_one_collection() {
    init_tracing();
    let engine = Arc::new(CollectionEngine::new(
        Config::default(),
        Arc::new(YieldingStore(MemoryStore::new())),
        Arc::new(FixedFactory(Arc::new(KeywordProvider))),
    ));

    let spawn_create = |engine: Arc<CollectionEngine>| {
        tokio::spawn(async move {
            engine
                .create_collection(NewCollection {
                    name: "research papers".to_string(),
                    authors: vec![],
                    extraction_strategy: BTreeMap::new(),
                    embedding_model: "m".to_string(),
                })
                .await
        })
    };
    let a = spawn_create(engine.clone());
    let b = spawn_create(engine.clone());
    let results = [a.await.unwrap(), b.await.unwrap()];

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1, "exactly one create may win the name");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::DuplicateName(_)))));

    let page = engine
        .list_collections(&ListOptions::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn searches_during_a_rebuild_see_exactly_one_snapshot() {
    let gated = Arc::new(GatedProvider::new(1));
    let engine = engine_with(gated.clone());
    let cid = create_collection(&engine, "atomic").await;

    // First rebuild consumes the preloaded permit.
    add_text(&engine, &cid, "one.txt", "fox alpha [body]").await;
    engine.wait_for_idle(&cid).await;

    let opts = SearchOptions::default();
    let before = engine.search(&cid, "fox", &opts).await.unwrap();
    assert_eq!(before.results.len(), 1);
    let before_ids: Vec<String> = before.results.iter().map(|h| h.chunk_id.clone()).collect();

    // The second rebuild parks inside embedding with the gate closed.
    add_text(&engine, &cid, "two.txt", "fox beta [body]").await;
    for _ in 0..5 {
        let during = engine.search(&cid, "fox", &opts).await.unwrap();
        let ids: Vec<String> = during.results.iter().map(|h| h.chunk_id.clone()).collect();
        assert_eq!(ids, before_ids, "search observed a partially built index");
        tokio::task::yield_now().await;
    }

    // Release both documents; the swapped snapshot is complete.
    gated.gate.add_permits(2);
    engine.wait_for_idle(&cid).await;
    let after = engine.search(&cid, "fox", &opts).await.unwrap();
    assert_eq!(after.results.len(), 2);
}

#[tokio::test]
async fn dropping_a_collection_cancels_an_inflight_rebuild() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let gated = Arc::new(GatedProvider::new(0));
    let coordinator = ReindexCoordinator::new(
        Config::default(),
        store.clone(),
        Arc::new(FixedFactory(gated.clone())),
    );

    let collection = Collection {
        id: "c1".to_string(),
        name: "doomed".to_string(),
        authors: vec![],
        extraction_strategy: BTreeMap::new(),
        embedding_model: "m".to_string(),
        created_at: 0,
        updated_at: 0,
    };
    store.insert_collection(&collection).await.unwrap();
    let document = Document {
        file_id: "d1".to_string(),
        collection_id: "c1".to_string(),
        file_name: "d1.txt".to_string(),
        content_type: "text/plain".to_string(),
        status: DocumentStatus::Queued,
        error: None,
        permanent_failure: false,
        created_at: 0,
    };
    store.insert_document(&document, b"fox mid flight [body]").await.unwrap();

    coordinator.schedule_rebuild("c1");

    // Wait until the job is parked inside the embedding step.
    let mut parked = false;
    for _ in 0..200 {
        let status = store.get_document("d1").await.unwrap().unwrap().status;
        if status == DocumentStatus::Embedding {
            parked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(parked, "rebuild never reached the embedding step");

    coordinator.drop_collection("c1");
    gated.gate.add_permits(1);

    // Let the embed finish and the cancelled pass wind down.
    for _ in 0..200 {
        if gated.completed.load(Ordering::SeqCst) >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The partial snapshot was discarded: nothing became active and the
    // document was never promoted to indexed.
    assert!(coordinator.active_snapshot("c1").is_none());
    let status = store.get_document("d1").await.unwrap().unwrap().status;
    assert_ne!(status, DocumentStatus::Indexed);
    coordinator.wait_idle("c1").await;
}
