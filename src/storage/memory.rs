//! In-Memory Document Store
//!
//! DashMap-backed store for tests and single-process development setups.
//! Conditional writes go through the DashMap entry API, which holds the shard
//! lock for the duration of the compare-and-swap.

use crate::domain::{Collection, DocumentStore, Revision, StoredDocument};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Document store held entirely in process memory
pub struct MemoryDocumentStore {
    provider_registrations: DashMap<String, StoredDocument>,
    resources: DashMap<String, StoredDocument>,
    /// Store-wide counter; revisions are never reused, even after a remove
    last_revision: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            provider_registrations: DashMap::new(),
            resources: DashMap::new(),
            last_revision: AtomicU64::new(0),
        }
    }

    fn map(&self, collection: Collection) -> &DashMap<String, StoredDocument> {
        match collection {
            Collection::ProviderRegistrations => &self.provider_registrations,
            Collection::Resources => &self.resources,
        }
    }

    fn next_revision(&self) -> Revision {
        self.last_revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of documents in a collection
    pub fn len(&self, collection: Collection) -> usize {
        self.map(collection).len()
    }

    pub fn is_empty(&self, collection: Collection) -> bool {
        self.map(collection).is_empty()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, collection: Collection, key: &str, document: Value) -> Result<Revision> {
        let revision = self.next_revision();
        self.map(collection)
            .insert(key.to_string(), StoredDocument { document, revision });
        Ok(revision)
    }

    async fn find_one(&self, collection: Collection, key: &str) -> Result<StoredDocument> {
        self.map(collection)
            .get(key)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::DocumentNotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            })
    }

    async fn remove(&self, collection: Collection, key: &str) -> Result<()> {
        self.map(collection)
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::DocumentNotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            })
    }

    async fn put_if_revision(
        &self,
        collection: Collection,
        key: &str,
        document: Value,
        expected: Option<Revision>,
    ) -> Result<Option<Revision>> {
        match (self.map(collection).entry(key.to_string()), expected) {
            (Entry::Vacant(vacant), None) => {
                let revision = self.next_revision();
                vacant.insert(StoredDocument { document, revision });
                Ok(Some(revision))
            }
            (Entry::Occupied(mut occupied), Some(expected))
                if occupied.get().revision == expected =>
            {
                let revision = self.next_revision();
                occupied.insert(StoredDocument { document, revision });
                Ok(Some(revision))
            }
            _ => Ok(None),
        }
    }

    async fn remove_if_revision(
        &self,
        collection: Collection,
        key: &str,
        expected: Revision,
    ) -> Result<bool> {
        Ok(self
            .map(collection)
            .remove_if(key, |_, doc| doc.revision == expected)
            .is_some())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<(String, StoredDocument)>> {
        Ok(self
            .map(collection)
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
