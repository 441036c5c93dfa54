use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{HeaderValue, IF_NONE_MATCH};
use http::{HeaderMap, Method};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{CachePolicy, CacheRecord, CacheStore, VaryIndex, effective_key, parse_vary};
use crate::util::lowercase_header_map;

/// Outcome of the pre-dispatch cache lookup.
#[derive(Clone, Debug)]
pub(crate) enum CacheProbe {
    /// Caching does not apply to this call.
    Bypass,
    Miss,
    /// Fresh within the TTL; the call completes without dispatch.
    Fresh(CacheRecord),
    /// `If-None-Match` was attached; a 304 resolves to this record.
    Conditional(CacheRecord),
}

impl CacheProbe {
    pub(crate) fn revalidation_record(&self) -> Option<&CacheRecord> {
        match self {
            Self::Conditional(record) => Some(record),
            _ => None,
        }
    }
}

pub(crate) struct CacheCoordinator {
    store: Arc<dyn CacheStore>,
    vary_index: VaryIndex,
    vary_loaded: OnceCell<()>,
}

impl CacheCoordinator {
    pub(crate) fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            vary_index: VaryIndex::new(),
            vary_loaded: OnceCell::new(),
        }
    }

    /// Pulls the store's saved `Vary` names into the index, once, before the
    /// first lookup or write.
    pub(crate) async fn load_vary_index(&self) {
        self.vary_loaded
            .get_or_init(|| async {
                if let Some(saved) = self.store.load_vary().await {
                    debug!(base_keys = saved.len(), "restored vary index");
                    self.vary_index.restore(saved);
                }
            })
            .await;
    }

    pub(crate) fn vary_index(&self) -> &VaryIndex {
        &self.vary_index
    }

    pub(crate) fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub(crate) fn effective_key(&self, base_key: &str, headers: &HeaderMap) -> String {
        effective_key(base_key, &self.vary_index.names(base_key), headers)
    }

    /// Looks up the record for this request and, when revalidation applies,
    /// attaches `If-None-Match` to `headers`.
    pub(crate) async fn probe(
        &self,
        policy: CachePolicy,
        method: &Method,
        base_key: &str,
        headers: &mut HeaderMap,
        now: SystemTime,
    ) -> CacheProbe {
        if !policy.is_enabled() || *method != Method::GET {
            return CacheProbe::Bypass;
        }

        self.load_vary_index().await;
        let key = self.effective_key(base_key, headers);
        let Some(record) = self.store.get(&key).await else {
            debug!(cache_key = %key, "cache miss");
            return CacheProbe::Miss;
        };

        if let Some(ttl) = policy.ttl()
            && record.is_fresh(ttl, now)
        {
            debug!(cache_key = %key, "cache hit within ttl");
            return CacheProbe::Fresh(record);
        }

        if policy.revalidates()
            && let Some(etag) = record.etag()
            && let Ok(value) = HeaderValue::from_str(etag)
        {
            debug!(cache_key = %key, "revalidating cached entry");
            headers.insert(IF_NONE_MATCH, value);
            return CacheProbe::Conditional(record);
        }

        CacheProbe::Miss
    }

    /// Persists a successful `GET`. Returns the key written, if any.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn write_back(
        &self,
        policy: CachePolicy,
        method: &Method,
        base_key: &str,
        request_headers: &HeaderMap,
        status: u16,
        response_headers: &HeaderMap,
        body: &Bytes,
        now: SystemTime,
    ) -> Option<String> {
        if !policy.is_enabled() || *method != Method::GET || !(200..300).contains(&status) {
            return None;
        }

        let vary_names = parse_vary(response_headers);
        if vary_names.iter().any(|name| name == "*") {
            debug!(base_key = %base_key, "response varies on everything; not cached");
            return None;
        }
        self.load_vary_index().await;
        if !vary_names.is_empty() && self.vary_index.names(base_key) != vary_names {
            self.vary_index.register(base_key, vary_names);
            self.store.save_vary(&self.vary_index.snapshot()).await;
        }

        let key = self.effective_key(base_key, request_headers);
        let record = CacheRecord {
            status,
            headers: lowercase_header_map(response_headers),
            body: body.clone(),
            stored_at: now,
        };
        self.store.put(&key, record).await;
        debug!(cache_key = %key, "stored response in cache");
        Some(key)
    }
}
