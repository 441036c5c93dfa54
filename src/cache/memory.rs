use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CacheRecord, CacheStore};
use crate::util::lock_unpoisoned;

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheRecord>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock_unpoisoned(&self.entries).keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<CacheRecord> {
        lock_unpoisoned(&self.entries).get(key).cloned()
    }

    async fn put(&self, key: &str, record: CacheRecord) {
        lock_unpoisoned(&self.entries).insert(key.to_owned(), record);
    }

    async fn remove(&self, key: &str) {
        lock_unpoisoned(&self.entries).remove(key);
    }

    async fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }
}
