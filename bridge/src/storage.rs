//! Persistent key-value store consumed as an opaque async map.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use blake3::Hasher as Blake3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BridgeError, BridgeResult};

const STORE_VERSION: u16 = 1;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> BridgeResult<Option<Value>>;

    async fn set(&self, entries: BTreeMap<String, Value>) -> BridgeResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> BridgeResult<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, entries: BTreeMap<String, Value>) -> BridgeResult<()> {
        self.entries.lock().extend(entries);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreEnvelope {
    version: u16,
    checksum: [u8; 32],
    entries: BTreeMap<String, Value>,
}

/// JSON file backed store; every `set` rewrites the file atomically.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let envelope: StoreEnvelope = serde_json::from_slice(&fs::read(&path)?)?;
            if envelope.version != STORE_VERSION {
                return Err(BridgeError::ValidationError(format!(
                    "Unsupported store version {}",
                    envelope.version
                )));
            }
            if checksum(&envelope.entries)? != envelope.checksum {
                return Err(BridgeError::ValidationError(
                    "Store integrity verification failed".to_string(),
                ));
            }
            envelope.entries
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            cache: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> BridgeResult<()> {
        let envelope = StoreEnvelope {
            version: STORE_VERSION,
            checksum: checksum(entries)?,
            entries: entries.clone(),
        };
        let serialized = serde_json::to_vec_pretty(&envelope)?;
        let tmp_path = self.path.with_extension("new");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> BridgeResult<Option<Value>> {
        Ok(self.cache.lock().get(key).cloned())
    }

    async fn set(&self, entries: BTreeMap<String, Value>) -> BridgeResult<()> {
        let mut cache = self.cache.lock();
        let mut next = cache.clone();
        next.extend(entries);
        self.persist(&next)?;
        *cache = next;
        Ok(())
    }
}

fn checksum(entries: &BTreeMap<String, Value>) -> BridgeResult<[u8; 32]> {
    let mut hasher = Blake3::new();
    hasher.update(&serde_json::to_vec(entries)?);
    Ok(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");

        let store = FileStore::open(&path).unwrap();
        store
            .set(BTreeMap::from([("permissions:https://a.example".to_string(), json!(["eth_accounts"]))]))
            .await
            .unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("permissions:https://a.example").await.unwrap(),
            Some(json!(["eth_accounts"]))
        );
        assert_eq!(reopened.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn tampered_store_detected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        let store = FileStore::open(&path).unwrap();
        store
            .set(BTreeMap::from([("k".to_string(), json!("value"))]))
            .await
            .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("\"value\"", "\"other\"")).unwrap();

        assert!(matches!(
            FileStore::open(&path),
            Err(BridgeError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_merges_entries() {
        let store = MemoryStore::new();
        store
            .set(BTreeMap::from([("a".to_string(), json!(1))]))
            .await
            .unwrap();
        store
            .set(BTreeMap::from([("b".to_string(), json!(2))]))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("b").await.unwrap(), Some(json!(2)));
    }
}
