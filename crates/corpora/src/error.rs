//! Engine error taxonomy.
//!
//! Validation and not-found errors surface to API callers directly;
//! extraction and embedding errors are recorded on documents during
//! rebuilds and only reach callers through document status.

use std::time::Duration;

use thiserror::Error;

use corpora_core::IndexBuildError;

use crate::extract::ExtractError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("collection name already in use: {0}")]
    DuplicateName(String),
    #[error(transparent)]
    Extraction(#[from] ExtractError),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error(transparent)]
    IndexBuild(#[from] IndexBuildError),
    #[error("search timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
