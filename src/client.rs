use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};

use crate::Result;
use crate::auth::AuthProvider;
use crate::cache::{
    CacheCoordinator, CachePolicy, CacheStore, MemoryCacheStore, VaryIndex, base_key,
};
use crate::config::{ClientConfig, ClientProfile};
use crate::hyper_transport::{HyperTransport, HyperTransportOptions};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::plugin::{Plugin, PluginChain};
use crate::redact::Redactor;
use crate::request::{RequestBuilder, RequestModifier};
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use crate::util::{parse_header_name, parse_header_value, resolve_uri, validate_base_url};

pub struct ClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    connect_timeout: Duration,
    transport: Option<Arc<dyn Transport>>,
    cache_policy: CachePolicy,
    cache_store: Option<Arc<dyn CacheStore>>,
    auth: Option<Arc<dyn AuthProvider>>,
    retry_policy: RetryPolicy,
    plugins: PluginChain,
    modifiers: Vec<Arc<dyn RequestModifier>>,
    redactor: Redactor,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        let defaults = ClientProfile::default().defaults();
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            request_timeout: defaults.request_timeout,
            connect_timeout: defaults.connect_timeout,
            transport: None,
            cache_policy: CachePolicy::None,
            cache_store: None,
            auth: None,
            retry_policy: defaults.retry_policy,
            plugins: PluginChain::default(),
            modifiers: Vec::new(),
            redactor: Redactor::default(),
        }
    }

    /// Replaces timeouts and retry policy with the profile's values.
    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.request_timeout = defaults.request_timeout;
        self.connect_timeout = defaults.connect_timeout;
        self.retry_policy = defaults.retry_policy;
        self
    }

    /// Applies every field set in `config`, profile first.
    pub fn config(mut self, config: &ClientConfig) -> Result<Self> {
        if let Some(profile) = config.profile {
            self = self.profile(profile);
        }
        if let Some(request_timeout) = config.request_timeout() {
            self = self.request_timeout(request_timeout);
        }
        if let Some(connect_timeout) = config.connect_timeout() {
            self = self.connect_timeout(connect_timeout);
        }
        if let Some(cache_policy) = config.cache {
            self.cache_policy = cache_policy;
        }
        if let Some(retry) = &config.retry {
            self.retry_policy = retry.apply(self.retry_policy);
        }
        for (name, value) in &config.default_headers {
            self = self.try_default_header(name, value)?;
        }
        if let Some(sensitive_keys) = &config.sensitive_keys {
            self.redactor = Redactor::with_sensitive_keys(sensitive_keys);
        }
        Ok(self)
    }

    /// Deadline for a single dispatch. Retry waits are not counted.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    /// Only used by the built-in hyper transport.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    /// Defaults to an in-memory store.
    pub fn cache_store<S>(self, cache_store: S) -> Self
    where
        S: CacheStore + 'static,
    {
        self.cache_store_arc(Arc::new(cache_store))
    }

    pub fn cache_store_arc(mut self, cache_store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(cache_store);
        self
    }

    pub fn auth<A>(self, auth: A) -> Self
    where
        A: AuthProvider + 'static,
    {
        self.auth_arc(Arc::new(auth))
    }

    pub fn auth_arc(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn plugin<P>(self, plugin: P) -> Self
    where
        P: Plugin + 'static,
    {
        self.plugin_arc(Arc::new(plugin))
    }

    pub fn plugin_arc(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Client-wide modifier, applied at send time after the request's own
    /// modifiers.
    pub fn modifier<M>(mut self, modifier: M) -> Self
    where
        M: RequestModifier + 'static,
    {
        self.modifiers.push(Arc::new(modifier));
        self
    }

    pub fn redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn build(self) -> Result<Client> {
        validate_base_url(&self.base_url)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::with_options(HyperTransportOptions {
                connect_timeout: self.connect_timeout,
                ..HyperTransportOptions::default()
            })?),
        };
        let cache_store = self
            .cache_store
            .unwrap_or_else(|| Arc::new(MemoryCacheStore::new()));

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url: self.base_url,
                default_headers: self.default_headers,
                request_timeout: self.request_timeout,
                transport,
                cache_policy: self.cache_policy,
                cache: CacheCoordinator::new(cache_store),
                auth: self.auth,
                retry_policy: self.retry_policy,
                plugins: self.plugins,
                modifiers: self.modifiers,
                redactor: self.redactor,
                metrics: ClientMetrics::default(),
            }),
        })
    }
}

pub(crate) struct ClientInner {
    pub(crate) base_url: String,
    pub(crate) default_headers: HeaderMap,
    pub(crate) request_timeout: Duration,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cache_policy: CachePolicy,
    pub(crate) cache: CacheCoordinator,
    pub(crate) auth: Option<Arc<dyn AuthProvider>>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) plugins: PluginChain,
    pub(crate) modifiers: Vec<Arc<dyn RequestModifier>>,
    pub(crate) redactor: Redactor,
    pub(crate) metrics: ClientMetrics,
}

/// Cheap to clone; clones share transport, cache, credentials and metrics.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("base_url", &self.inner.base_url)
            .field("request_timeout", &self.inner.request_timeout)
            .field("cache_policy", &self.inner.cache_policy)
            .field("retry_policy", &self.inner.retry_policy)
            .field("auth", &self.inner.auth.is_some())
            .field("plugins", &self.inner.plugins.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.inner.cache_policy
    }

    pub fn vary_index(&self) -> &VaryIndex {
        self.inner.cache.vary_index()
    }

    /// Drops the cached entry for `GET path`: the bare base key and the key
    /// the client's default headers select under the learned `Vary` names.
    pub async fn invalidate_cache(&self, path: &str) -> Result<()> {
        let (uri_text, _) = resolve_uri(&self.inner.base_url, path)?;
        let base_key = base_key(&Method::GET, &uri_text);
        self.inner.cache.load_vary_index().await;
        let store = self.inner.cache.store();
        let varied_key = self
            .inner
            .cache
            .effective_key(&base_key, &self.inner.default_headers);
        if varied_key != base_key {
            store.remove(&varied_key).await;
        }
        store.remove(&base_key).await;
        Ok(())
    }

    pub async fn clear_cache(&self) {
        self.inner.cache.store().clear().await;
    }
}
