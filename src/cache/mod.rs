//! Conditional response caching.
//!
//! Records are keyed by `"METHOD absolute-url"`, optionally suffixed with
//! `|name=value` pairs for every request header the origin listed in `Vary`
//! for that base key. Only a small subset of HTTP caching is modelled: a
//! time-to-live measured from the moment of storage, `ETag` revalidation via
//! `If-None-Match`, and `Vary` partitioning. `Cache-Control` is not parsed.

mod coordinator;
mod file;
mod memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::ETAG;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};

use crate::util::{header_map_from_pairs, lock_unpoisoned};

pub(crate) use coordinator::{CacheCoordinator, CacheProbe};
pub use file::FileCacheStore;
pub use memory::MemoryCacheStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "ttl_secs", rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    None,
    #[serde(rename = "etag")]
    ETag,
    Ttl(u64),
    #[serde(rename = "etag_or_ttl")]
    ETagOrTtl(u64),
}

impl CachePolicy {
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::None)
    }

    pub(crate) const fn ttl(self) -> Option<Duration> {
        match self {
            Self::Ttl(seconds) | Self::ETagOrTtl(seconds) => Some(Duration::from_secs(seconds)),
            Self::None | Self::ETag => None,
        }
    }

    pub(crate) const fn revalidates(self) -> bool {
        matches!(self, Self::ETag | Self::ETagOrTtl(_))
    }
}

/// A stored 2xx `GET` response. Never mutated once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub stored_at: SystemTime,
}

impl CacheRecord {
    pub fn etag(&self) -> Option<&str> {
        self.headers.get(ETAG.as_str()).map(String::as_str)
    }

    pub fn is_fresh(&self, ttl: Duration, now: SystemTime) -> bool {
        match now.duration_since(self.stored_at) {
            Ok(age) => age < ttl,
            // Stored "in the future" (clock moved backwards): treat as age zero.
            Err(_) => !ttl.is_zero(),
        }
    }

    pub fn header_map(&self) -> HeaderMap {
        header_map_from_pairs(&self.headers)
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheRecord>;

    async fn put(&self, key: &str, record: CacheRecord);

    async fn remove(&self, key: &str);

    async fn clear(&self);

    /// Learned `Vary` names saved by an earlier process. Stores that do not
    /// outlive the process keep the default.
    async fn load_vary(&self) -> Option<BTreeMap<String, Vec<String>>> {
        None
    }

    async fn save_vary(&self, _index: &BTreeMap<String, Vec<String>>) {}
}

/// Learned mapping of base key to the lowercase header names the origin
/// varies on, in the order the origin listed them.
#[derive(Debug, Default)]
pub struct VaryIndex {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl VaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, base_key: &str, names: Vec<String>) {
        lock_unpoisoned(&self.entries).insert(base_key.to_owned(), names);
    }

    pub fn names(&self, base_key: &str) -> Vec<String> {
        lock_unpoisoned(&self.entries)
            .get(base_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        lock_unpoisoned(&self.entries)
            .iter()
            .map(|(key, names)| (key.clone(), names.clone()))
            .collect()
    }

    pub fn restore(&self, snapshot: BTreeMap<String, Vec<String>>) {
        let mut entries = lock_unpoisoned(&self.entries);
        entries.clear();
        entries.extend(snapshot);
    }
}

pub fn base_key(method: &Method, absolute_url: &str) -> String {
    format!("{} {absolute_url}", method.as_str())
}

pub fn effective_key(base_key: &str, vary_names: &[String], headers: &HeaderMap) -> String {
    let mut key = base_key.to_owned();
    for name in vary_names {
        let value = headers
            .get_all(name.as_str())
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        key.push('|');
        key.push_str(name);
        key.push('=');
        key.push_str(&value);
    }
    key
}

/// Parses a `Vary` header value into trimmed, lowercase, de-duplicated names.
pub fn parse_vary(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for value in headers.get_all(http::header::VARY) {
        let Ok(text) = value.to_str() else {
            continue;
        };
        for name in text.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}
