//! Persistent document store.
//!
//! Every durable document (registry, seed list, device state, presence and
//! routine configuration) is a JSON value stored under a short key. The file
//! backed store keeps one `<key>.json` per document in the data directory.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Registry of device names to `{ip, id}`
pub const REGISTRY_KEY: &str = "bulbs";
/// Hand-authored seed list, same shape as the registry
pub const SEED_KEY: &str = "bulbs.seed";
/// Group name -> ordered device names
pub const GROUPS_KEY: &str = "groups";
/// Scene name -> steps
pub const SCENES_KEY: &str = "scenes";
/// Last-known device state
pub const STATE_KEY: &str = "state";
/// Presence automation configuration
pub const PRESENCE_KEY: &str = "presence";
/// Routine overrides
pub const ROUTINES_KEY: &str = "routines";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("invalid document {0}: {1}")]
    Json(String, #[source] serde_json::Error),
}

/// Key-value document storage
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` if it was never written
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replace a document
    async fn put(&self, key: &str, document: Value) -> Result<(), StoreError>;
}

/// Fetch and deserialize a document.
pub async fn load<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Json(key.to_string(), e)),
        None => Ok(None),
    }
}

/// Fetch a document, falling back to `T::default()` when it is absent.
pub async fn load_or_default<T: DeserializeOwned + Default>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<T, StoreError> {
    Ok(load(store, key).await?.unwrap_or_default())
}

/// Serialize and write a document.
pub async fn save<T: Serialize>(
    store: &dyn DocumentStore,
    key: &str,
    document: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(document).map_err(|e| StoreError::Json(key.to_string(), e))?;
    store.put(key, value).await
}

/// Document store backed by a directory of pretty-printed JSON files
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Io(dir.clone(), e))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(path, e)),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| StoreError::Json(key.to_string(), e))
    }

    async fn put(&self, key: &str, document: Value) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let contents = serde_json::to_vec_pretty(&document)
            .map_err(|e| StoreError::Json(key.to_string(), e))?;

        // Write next to the target and rename so readers never see half a file
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| StoreError::Io(tmp.clone(), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Io(path, e))?;

        tracing::debug!("Wrote document {}", key);
        Ok(())
    }
}

/// In-memory document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: std::sync::Mutex<HashMap<String, Value>>,
    writes: std::sync::atomic::AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document before handing the store to the engine
    pub fn with(self, key: &str, document: Value) -> Self {
        if let Ok(mut documents) = self.documents.lock() {
            documents.insert(key.to_string(), document);
        }
        self
    }

    /// Number of `put` calls so far
    pub fn writes(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .documents
            .lock()
            .ok()
            .and_then(|documents| documents.get(key).cloned()))
    }

    async fn put(&self, key: &str, document: Value) -> Result<(), StoreError> {
        if let Ok(mut documents) = self.documents.lock() {
            documents.insert(key.to_string(), document);
        }
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
