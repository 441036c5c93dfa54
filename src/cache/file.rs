use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{CacheRecord, CacheStore};

const ENTRY_EXTENSION: &str = "json";
const VARY_INDEX_FILE: &str = "vary-index.json";

/// Durable store: one JSON file per key, named by the SHA-256 of the key so
/// header values that end up in Vary-suffixed keys never reach the file
/// system in clear text.
///
/// The learned `Vary` names live next to the entries in `vary-index.json`, so
/// partitioned entries stay reachable after a restart.
///
/// I/O failures degrade to cache misses and are logged; they never fail a
/// request.
#[derive(Clone, Debug)]
pub struct FileCacheStore {
    directory: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    record: CacheRecord,
}

impl FileCacheStore {
    pub async fn open(directory: impl Into<PathBuf>) -> std::io::Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let name = encode_hex_lower(&hasher.finalize());
        self.directory.join(format!("{name}.{ENTRY_EXTENSION}"))
    }

    fn vary_index_path(&self) -> PathBuf {
        self.directory.join(VARY_INDEX_FILE)
    }
}

/// Writes through a temporary sibling and renames it into place so readers
/// never observe a partial file.
async fn write_atomically(path: &Path, raw: &[u8]) {
    let temporary = path.with_extension(format!("tmp-{:016x}", rand::random::<u64>()));
    if let Err(error) = tokio::fs::write(&temporary, raw).await {
        warn!(path = %temporary.display(), error = %error, "failed to write cache file");
        return;
    }
    if let Err(error) = tokio::fs::rename(&temporary, path).await {
        warn!(path = %path.display(), error = %error, "failed to commit cache file");
        let _ = tokio::fs::remove_file(&temporary).await;
    }
}

fn encode_hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push(HEX[(byte >> 4) as usize] as char);
        output.push(HEX[(byte & 0x0f) as usize] as char);
    }
    output
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Option<CacheRecord> {
        let path = self.entry_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to read cache entry");
                return None;
            }
        };
        match serde_json::from_slice::<StoredEntry>(&raw) {
            Ok(entry) if entry.key == key => Some(entry.record),
            Ok(_) => None,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "discarding corrupt cache entry");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    async fn put(&self, key: &str, record: CacheRecord) {
        let path = self.entry_path(key);
        let entry = StoredEntry {
            key: key.to_owned(),
            record,
        };
        let raw = match serde_json::to_vec(&entry) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(error = %error, "failed to serialize cache entry");
                return;
            }
        };
        write_atomically(&path, &raw).await;
    }

    async fn remove(&self, key: &str) {
        let path = self.entry_path(key);
        if let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %error, "failed to remove cache entry");
        }
    }

    async fn clear(&self) {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(error = %error, "failed to list cache directory");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|extension| extension.to_str()) == Some(ENTRY_EXTENSION) {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }

    async fn load_vary(&self) -> Option<BTreeMap<String, Vec<String>>> {
        let path = self.vary_index_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to read vary index");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(index) => Some(index),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "ignoring corrupt vary index");
                None
            }
        }
    }

    async fn save_vary(&self, index: &BTreeMap<String, Vec<String>>) {
        match serde_json::to_vec(index) {
            Ok(raw) => write_atomically(&self.vary_index_path(), &raw).await,
            Err(error) => warn!(error = %error, "failed to serialize vary index"),
        }
    }
}
