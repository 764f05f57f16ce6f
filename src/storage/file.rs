//! File Document Store
//!
//! Single-node durable store: one JSON file per document under
//! `{root}/{collection}/{sha256(key)}.json`. The file name has a fixed
//! length whatever the key, and the key itself is kept in the record. Writes
//! go to a temporary file that is renamed into place, so readers never
//! observe partial documents.

use crate::domain::{Collection, DocumentStore, Revision, StoredDocument};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Root directory holding one subdirectory per collection
    pub root_path: PathBuf,
    /// fsync every document before it is renamed into place
    pub sync_writes: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/declarative-control-plane"),
            sync_writes: true,
        }
    }
}

/// On-disk record
#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    key: String,
    revision: Revision,
    document: Value,
}

// =============================================================================
// File Store
// =============================================================================

pub struct FileDocumentStore {
    root_path: PathBuf,
    sync_writes: bool,
    /// Serialises every write so read-compare-write is atomic
    write_lock: Mutex<()>,
    last_revision: AtomicU64,
}

impl FileDocumentStore {
    pub async fn with_path(root_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(FileStoreConfig {
            root_path: root_path.into(),
            ..Default::default()
        })
        .await
    }

    pub async fn with_config(config: FileStoreConfig) -> Result<Self> {
        for collection in [Collection::ProviderRegistrations, Collection::Resources] {
            fs::create_dir_all(config.root_path.join(collection.name())).await?;
        }

        let store = Self {
            root_path: config.root_path,
            sync_writes: config.sync_writes,
            write_lock: Mutex::new(()),
            last_revision: AtomicU64::new(0),
        };

        // Resume the revision counter past anything already on disk
        let mut highest = 0;
        for collection in [Collection::ProviderRegistrations, Collection::Resources] {
            for (_, doc) in store.list(collection).await? {
                highest = highest.max(doc.revision);
            }
        }
        store.last_revision.store(highest, Ordering::SeqCst);
        info!(
            "Opened file document store at {} (revision {})",
            store.root_path.display(),
            highest
        );

        Ok(store)
    }

    fn document_path(&self, collection: Collection, key: &str) -> PathBuf {
        self.root_path
            .join(collection.name())
            .join(format!("{}.json", hex::encode(Sha256::digest(key.as_bytes()))))
    }

    fn next_revision(&self) -> Revision {
        self.last_revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn read_record(path: &Path) -> Result<Option<DocumentRecord>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", path, e)),
        }
    }

    async fn write_record(&self, path: &Path, record: &DocumentRecord) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(record)?;

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| io_error("create", &tmp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        if self.sync_writes {
            file.sync_all()
                .await
                .map_err(|e| io_error("sync", &tmp, e))?;
        }
        drop(file);

        fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error("rename", path, e))?;
        debug!("Wrote document: {} (revision {})", path.display(), record.revision);
        Ok(())
    }

    async fn delete_file(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("remove", path, e)),
        }
    }

    fn not_found(collection: Collection, key: &str) -> Error {
        Error::DocumentNotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }
}

/// Map an io failure; only failures a retry could fix are transient
fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    let message = format!("{} {}: {}", action, path.display(), e);
    match e.kind() {
        ErrorKind::PermissionDenied
        | ErrorKind::InvalidInput
        | ErrorKind::InvalidData
        | ErrorKind::Unsupported => Error::Internal(message),
        _ => Error::Store(message),
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn upsert(&self, collection: Collection, key: &str, document: Value) -> Result<Revision> {
        let _guard = self.write_lock.lock().await;
        let revision = self.next_revision();
        let path = self.document_path(collection, key);
        let record = DocumentRecord {
            key: key.to_string(),
            revision,
            document,
        };
        self.write_record(&path, &record).await?;
        Ok(revision)
    }

    async fn find_one(&self, collection: Collection, key: &str) -> Result<StoredDocument> {
        let path = self.document_path(collection, key);
        match Self::read_record(&path).await? {
            Some(record) => Ok(StoredDocument {
                document: record.document,
                revision: record.revision,
            }),
            None => Err(Self::not_found(collection, key)),
        }
    }

    async fn remove(&self, collection: Collection, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.document_path(collection, key);
        if Self::delete_file(&path).await? {
            Ok(())
        } else {
            Err(Self::not_found(collection, key))
        }
    }

    async fn put_if_revision(
        &self,
        collection: Collection,
        key: &str,
        document: Value,
        expected: Option<Revision>,
    ) -> Result<Option<Revision>> {
        let _guard = self.write_lock.lock().await;
        let path = self.document_path(collection, key);
        let current = Self::read_record(&path).await?.map(|r| r.revision);
        if current != expected {
            return Ok(None);
        }

        let record = DocumentRecord {
            key: key.to_string(),
            revision: self.next_revision(),
            document,
        };
        self.write_record(&path, &record).await?;
        Ok(Some(record.revision))
    }

    async fn remove_if_revision(
        &self,
        collection: Collection,
        key: &str,
        expected: Revision,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.document_path(collection, key);
        match Self::read_record(&path).await? {
            Some(record) if record.revision == expected => Self::delete_file(&path).await,
            _ => Ok(false),
        }
    }

    async fn list(&self, collection: Collection) -> Result<Vec<(String, StoredDocument)>> {
        let dir = self.root_path.join(collection.name());
        let mut entries = fs::read_dir(&dir).await?;
        let mut documents = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                documents.push((
                    record.key,
                    StoredDocument {
                        document: record.document,
                        revision: record.revision,
                    },
                ));
            }
        }

        Ok(documents)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(fs::metadata(&self.root_path).await.map(|m| m.is_dir()).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    const KEY: &str =
        "/subscriptions/s/resourceGroups/rg/providers/Declarative.ResourceProvider/resources/r1";

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::with_path(dir.path()).await.unwrap();

        let rev = store
            .upsert(Collection::Resources, KEY, json!({"state": null}))
            .await
            .unwrap();
        let found = store.find_one(Collection::Resources, KEY).await.unwrap();
        assert_eq!(found.revision, rev);

        let listed = store.list(Collection::Resources).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, KEY);

        store.remove(Collection::Resources, KEY).await.unwrap();
        assert_matches!(
            store.find_one(Collection::Resources, KEY).await,
            Err(Error::DocumentNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_conditional_write() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::with_path(dir.path()).await.unwrap();

        let rev = store
            .put_if_revision(Collection::Resources, KEY, json!({"v": 1}), None)
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .put_if_revision(Collection::Resources, KEY, json!({"v": 2}), None)
            .await
            .unwrap()
            .is_none());
        assert!(!store
            .remove_if_revision(Collection::Resources, KEY, rev + 100)
            .await
            .unwrap());
        assert!(store
            .remove_if_revision(Collection::Resources, KEY, rev)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_revision_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let rev = {
            let store = FileDocumentStore::with_path(dir.path()).await.unwrap();
            store
                .upsert(Collection::ProviderRegistrations, "/p1", json!({}))
                .await
                .unwrap()
        };

        let reopened = FileDocumentStore::with_path(dir.path()).await.unwrap();
        let next = reopened
            .upsert(Collection::ProviderRegistrations, "/p2", json!({}))
            .await
            .unwrap();
        assert!(next > rev);
        assert!(reopened.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_long_keys_fit_in_file_names() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::with_path(dir.path()).await.unwrap();
        let key = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Declarative.ResourceProvider/resources/{}",
            "s".repeat(100),
            "g".repeat(100),
            "r".repeat(200)
        );

        let rev = store
            .put_if_revision(Collection::Resources, &key, json!({"v": 1}), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            store.find_one(Collection::Resources, &key).await.unwrap().revision,
            rev
        );

        let listed = store.list(Collection::Resources).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, key);

        assert!(store
            .remove_if_revision(Collection::Resources, &key, rev)
            .await
            .unwrap());
    }

    #[test]
    fn test_permanent_io_errors_are_not_transient() {
        let path = Path::new("/data/resources/x.json");
        let denied = std::io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert!(!io_error("write", path, denied).is_transient());
        let interrupted = std::io::Error::new(ErrorKind::Interrupted, "interrupted");
        assert!(io_error("write", path, interrupted).is_transient());
    }
}
