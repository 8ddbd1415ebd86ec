//! Metadata storage abstraction.
//!
//! The [`MetadataStore`] trait defines the persistence operations the
//! engine needs: collections, documents, raw uploaded bytes, and the
//! extracted-text cache. Index snapshots never touch the store; they live
//! in the coordinator and are rebuilt from store contents.
//!
//! Implementations must be `Send + Sync`. [`MemoryStore`] backs tests and
//! single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;

use corpora_core::models::{Collection, Document, DocumentStatus};

/// A collection write would break name uniqueness. Stores raise this
/// inside `anyhow::Error`; the engine downcasts it back out. Keeping the
/// check inside the store's write path makes it atomic, which a
/// check-then-insert at the engine layer cannot be.
#[derive(Debug, Error)]
#[error("collection name already in use: {0}")]
pub struct DuplicateNameError(pub String);

/// Filters, sort, and pagination for collection listing.
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Case-insensitive substring match on the collection name.
    pub name: Option<String>,
    /// Exact match on the embedding model.
    pub embedding_model: Option<String>,
    /// Comma-separated sort fields, `-` prefix for descending
    /// (e.g. `"-created_at,name"`). Defaults to `"name"`.
    pub sort: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            name: None,
            embedding_model: None,
            sort: None,
            offset: 0,
            limit: 10,
        }
    }
}

/// One page of collections plus the total count before pagination.
#[derive(Debug, Clone)]
pub struct CollectionPage {
    pub collections: Vec<Collection>,
    pub total: usize,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fails with [`DuplicateNameError`] when another collection already
    /// holds the name. The check and the insert must be one atomic step.
    async fn insert_collection(&self, collection: &Collection) -> Result<()>;
    async fn get_collection(&self, id: &str) -> Result<Option<Collection>>;
    async fn find_collection_by_name(&self, name: &str) -> Result<Option<Collection>>;
    /// Fails with [`DuplicateNameError`] when a rename collides with
    /// another collection's name.
    async fn update_collection(&self, collection: &Collection) -> Result<()>;
    /// Remove a collection and everything belonging to it. Returns whether
    /// the collection existed.
    async fn delete_collection(&self, id: &str) -> Result<bool>;
    async fn list_collections(&self, opts: &ListOptions) -> Result<CollectionPage>;

    async fn insert_document(&self, document: &Document, bytes: &[u8]) -> Result<()>;
    async fn get_document(&self, file_id: &str) -> Result<Option<Document>>;
    async fn delete_document(&self, file_id: &str) -> Result<bool>;
    /// Documents of a collection, ordered by `file_id`.
    async fn list_documents(&self, collection_id: &str) -> Result<Vec<Document>>;
    async fn document_bytes(&self, file_id: &str) -> Result<Option<Vec<u8>>>;
    async fn set_document_status(
        &self,
        file_id: &str,
        status: DocumentStatus,
        error: Option<String>,
        permanent: bool,
    ) -> Result<()>;

    /// Extracted-text cache, keyed by document. Invalidated on delete and
    /// when the collection's extraction configuration changes.
    async fn cached_text(&self, file_id: &str) -> Result<Option<String>>;
    async fn cache_text(&self, file_id: &str, text: &str) -> Result<()>;
    async fn invalidate_cached_text(&self, file_id: &str) -> Result<()>;
}

/// In-memory store. Uses `HashMap` behind `std::sync::RwLock`; every
/// operation completes without awaiting.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Collection>,
    documents: HashMap<String, Document>,
    bytes: HashMap<String, Vec<u8>>,
    texts: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn insert_collection(&self, collection: &Collection) -> Result<()> {
        let mut inner = self.write();
        if inner.collections.contains_key(&collection.id) {
            bail!("collection id already exists: {}", collection.id);
        }
        if inner.collections.values().any(|c| c.name == collection.name) {
            return Err(DuplicateNameError(collection.name.clone()).into());
        }
        inner
            .collections
            .insert(collection.id.clone(), collection.clone());
        Ok(())
    }

    async fn get_collection(&self, id: &str) -> Result<Option<Collection>> {
        Ok(self.read().collections.get(id).cloned())
    }

    async fn find_collection_by_name(&self, name: &str) -> Result<Option<Collection>> {
        Ok(self
            .read()
            .collections
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn update_collection(&self, collection: &Collection) -> Result<()> {
        let mut inner = self.write();
        if !inner.collections.contains_key(&collection.id) {
            bail!("collection does not exist: {}", collection.id);
        }
        if inner
            .collections
            .values()
            .any(|c| c.id != collection.id && c.name == collection.name)
        {
            return Err(DuplicateNameError(collection.name.clone()).into());
        }
        inner
            .collections
            .insert(collection.id.clone(), collection.clone());
        Ok(())
    }

    async fn delete_collection(&self, id: &str) -> Result<bool> {
        let mut inner = self.write();
        if inner.collections.remove(id).is_none() {
            return Ok(false);
        }
        let doomed: Vec<String> = inner
            .documents
            .values()
            .filter(|d| d.collection_id == id)
            .map(|d| d.file_id.clone())
            .collect();
        for file_id in doomed {
            inner.documents.remove(&file_id);
            inner.bytes.remove(&file_id);
            inner.texts.remove(&file_id);
        }
        Ok(true)
    }

    async fn list_collections(&self, opts: &ListOptions) -> Result<CollectionPage> {
        let inner = self.read();
        let name_filter = opts.name.as_ref().map(|n| n.to_lowercase());
        let mut matched: Vec<Collection> = inner
            .collections
            .values()
            .filter(|c| {
                name_filter
                    .as_ref()
                    .map(|n| c.name.to_lowercase().contains(n))
                    .unwrap_or(true)
            })
            .filter(|c| {
                opts.embedding_model
                    .as_ref()
                    .map(|m| &c.embedding_model == m)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        let sort = opts.sort.as_deref().unwrap_or("name");
        sort_collections(&mut matched, sort)?;

        let total = matched.len();
        let page: Vec<Collection> = matched
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit)
            .collect();
        Ok(CollectionPage {
            collections: page,
            total,
        })
    }

    async fn insert_document(&self, document: &Document, bytes: &[u8]) -> Result<()> {
        let mut inner = self.write();
        if inner.documents.contains_key(&document.file_id) {
            bail!("document id already exists: {}", document.file_id);
        }
        inner
            .documents
            .insert(document.file_id.clone(), document.clone());
        inner.bytes.insert(document.file_id.clone(), bytes.to_vec());
        Ok(())
    }

    async fn get_document(&self, file_id: &str) -> Result<Option<Document>> {
        Ok(self.read().documents.get(file_id).cloned())
    }

    async fn delete_document(&self, file_id: &str) -> Result<bool> {
        let mut inner = self.write();
        let existed = inner.documents.remove(file_id).is_some();
        inner.bytes.remove(file_id);
        inner.texts.remove(file_id);
        Ok(existed)
    }

    async fn list_documents(&self, collection_id: &str) -> Result<Vec<Document>> {
        let inner = self.read();
        let mut docs: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| d.collection_id == collection_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(docs)
    }

    async fn document_bytes(&self, file_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read().bytes.get(file_id).cloned())
    }

    async fn set_document_status(
        &self,
        file_id: &str,
        status: DocumentStatus,
        error: Option<String>,
        permanent: bool,
    ) -> Result<()> {
        let mut inner = self.write();
        // Deleted mid-rebuild is not an error; the next rebuild reconciles.
        if let Some(doc) = inner.documents.get_mut(file_id) {
            doc.status = status;
            doc.error = error;
            doc.permanent_failure = permanent;
        }
        Ok(())
    }

    async fn cached_text(&self, file_id: &str) -> Result<Option<String>> {
        Ok(self.read().texts.get(file_id).cloned())
    }

    async fn cache_text(&self, file_id: &str, text: &str) -> Result<()> {
        self.write().texts.insert(file_id.to_string(), text.to_string());
        Ok(())
    }

    async fn invalidate_cached_text(&self, file_id: &str) -> Result<()> {
        self.write().texts.remove(file_id);
        Ok(())
    }
}

fn sort_collections(collections: &mut [Collection], sort: &str) -> Result<()> {
    let mut keys: Vec<(bool, String)> = Vec::new();
    for field in sort.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        let (descending, name) = match field.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, field),
        };
        match name {
            "name" | "created_at" | "updated_at" => keys.push((descending, name.to_string())),
            other => bail!("unknown sort field: {}", other),
        }
    }
    collections.sort_by(|a, b| {
        for (descending, key) in &keys {
            let ord = match key.as_str() {
                "name" => a.name.cmp(&b.name),
                "created_at" => a.created_at.cmp(&b.created_at),
                _ => a.updated_at.cmp(&b.updated_at),
            };
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        // Stable overall order regardless of requested keys.
        a.id.cmp(&b.id)
    });
    Ok(())
}
