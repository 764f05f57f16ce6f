//! Document Store Backends
//!
//! Implementations of [`DocumentStore`] plus a typed repository that the
//! controllers use instead of raw JSON documents.

mod file;
mod memory;

pub use file::{FileDocumentStore, FileStoreConfig};
pub use memory::MemoryDocumentStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::domain::{Collection, DocumentStore, DocumentStoreRef, ResourceId, Revision};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

/// Open the document store selected by configuration
pub async fn open_store(config: &StorageConfig) -> Result<DocumentStoreRef> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory document store");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
        StorageBackend::File => {
            info!("Using file document store: {}", config.data_dir.display());
            let store = FileDocumentStore::with_path(&config.data_dir).await?;
            Ok(Arc::new(store))
        }
    }
}

// =============================================================================
// Typed Repository
// =============================================================================

/// A value together with the revision it was read or written at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: Revision,
}

/// Typed view over one collection of the document store
///
/// Documents are keyed by [`ResourceId`]; absence is reported as `None`
/// rather than an error.
pub struct Repository<T> {
    store: DocumentStoreRef,
    collection: Collection,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            collection: self.collection,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Repository<T> {
    pub fn new(store: DocumentStoreRef, collection: Collection) -> Self {
        Self {
            store,
            collection,
            _marker: PhantomData,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Load the document stored under `id`
    pub async fn find(&self, id: &ResourceId) -> Result<Option<Versioned<T>>> {
        match self.store.find_one(self.collection, id.as_str()).await {
            Ok(stored) => Ok(Some(Versioned {
                value: serde_json::from_value(stored.document)?,
                revision: stored.revision,
            })),
            Err(Error::DocumentNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert or replace unconditionally
    pub async fn upsert(&self, id: &ResourceId, value: &T) -> Result<Revision> {
        let document = serde_json::to_value(value)?;
        self.store.upsert(self.collection, id.as_str(), document).await
    }

    /// Conditional write; `None` expected means insert-if-absent
    ///
    /// Returns `None` when the condition did not hold.
    pub async fn put_if_revision(
        &self,
        id: &ResourceId,
        value: &T,
        expected: Option<Revision>,
    ) -> Result<Option<Revision>> {
        let document = serde_json::to_value(value)?;
        self.store
            .put_if_revision(self.collection, id.as_str(), document, expected)
            .await
    }

    /// Remove the document; `false` if it did not exist
    pub async fn remove(&self, id: &ResourceId) -> Result<bool> {
        match self.store.remove(self.collection, id.as_str()).await {
            Ok(()) => Ok(true),
            Err(Error::DocumentNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove only if the document is still at `expected`
    pub async fn remove_if_revision(&self, id: &ResourceId, expected: Revision) -> Result<bool> {
        self.store
            .remove_if_revision(self.collection, id.as_str(), expected)
            .await
    }

    /// Every document of the collection
    pub async fn list(&self) -> Result<Vec<(ResourceId, Versioned<T>)>> {
        let documents = self.store.list(self.collection).await?;
        documents
            .into_iter()
            .map(|(key, stored)| {
                Ok((
                    ResourceId::from_raw(key),
                    Versioned {
                        value: serde_json::from_value(stored.document)?,
                        revision: stored.revision,
                    },
                ))
            })
            .collect()
    }
}

impl<T> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("collection", &self.collection)
            .finish()
    }
}

/// Shared store health check used by the readiness endpoints
pub async fn store_ready(store: &dyn DocumentStore) -> bool {
    store.health_check().await.unwrap_or(false)
}
