//! Credential injection and single-flight token refresh.
//!
//! [`AuthCoordinator`] owns the current credentials behind a mutex. A refresh
//! runs as its own task; a shared handle to that task is stored next to the
//! credentials. The first caller to need a refresh spawns it, every other
//! caller clones the handle and awaits the same outcome, and the task clears
//! its own slot when it completes, whether or not anybody is still waiting.
//!
//! Each credential change bumps a generation counter. [`AuthProvider::authenticate`]
//! returns the generation it attached, and a caller whose failed request was
//! signed with an older generation skips the refresh entirely: somebody else
//! already replaced the token it was rejected with.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::Shared;
use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::error::{BoxError, Error};
use crate::util::lock_unpoisoned;

/// Opaque stamp identifying which credentials signed a request.
pub type CredentialGeneration = u64;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Exchanges a refresh token for new credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, BoxError>;
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Attaches credentials to an otherwise final request. Must not block.
    fn authenticate(&self, headers: &mut HeaderMap) -> CredentialGeneration;

    fn is_expired(&self, error: &Error) -> bool {
        matches!(error, Error::Unauthorized { .. })
    }

    /// Makes fresh credentials available. `stale` is the generation the
    /// rejected request was signed with.
    async fn refresh(&self, _stale: CredentialGeneration) -> bool {
        false
    }
}

type RefreshFuture = Shared<Pin<Box<dyn Future<Output = bool> + Send>>>;

struct CredentialState {
    credentials: Option<Credentials>,
    generation: CredentialGeneration,
    in_flight: Option<(u64, RefreshFuture)>,
    next_refresh_id: u64,
}

struct AuthInner {
    state: Mutex<CredentialState>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    header_name: HeaderName,
    scheme: Option<String>,
    refresh_invocations: AtomicUsize,
}

impl AuthInner {
    fn install(&self, credentials: Credentials) -> CredentialGeneration {
        let mut state = lock_unpoisoned(&self.state);
        state.credentials = Some(credentials);
        state.generation += 1;
        state.generation
    }

    fn finish_refresh(&self, refresh_id: u64) {
        let mut state = lock_unpoisoned(&self.state);
        if matches!(&state.in_flight, Some((id, _)) if *id == refresh_id) {
            state.in_flight = None;
        }
    }
}

/// Bearer-style credential holder with single-flight refresh.
#[derive(Clone)]
pub struct AuthCoordinator {
    inner: Arc<AuthInner>,
}

impl std::fmt::Debug for AuthCoordinator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthCoordinator")
            .field("header_name", &self.inner.header_name)
            .field("scheme", &self.inner.scheme)
            .field("generation", &self.generation())
            .field("refresh_configured", &self.inner.refresher.is_some())
            .finish()
    }
}

impl AuthCoordinator {
    pub fn builder() -> AuthCoordinatorBuilder {
        AuthCoordinatorBuilder::default()
    }

    pub fn bearer(credentials: Credentials) -> Self {
        Self::builder().credentials(credentials).build()
    }

    pub fn generation(&self) -> CredentialGeneration {
        lock_unpoisoned(&self.inner.state).generation
    }

    pub fn credentials(&self) -> Option<Credentials> {
        lock_unpoisoned(&self.inner.state).credentials.clone()
    }

    /// Replaces credentials from outside the pipeline, e.g. after a login.
    pub fn update_credentials(&self, credentials: Credentials) -> CredentialGeneration {
        self.inner.install(credentials)
    }

    /// Number of times the refresh callback has actually been invoked.
    pub fn refresh_count(&self) -> usize {
        self.inner.refresh_invocations.load(Ordering::SeqCst)
    }

    pub fn is_refresh_in_flight(&self) -> bool {
        lock_unpoisoned(&self.inner.state).in_flight.is_some()
    }

    /// Refreshes unconditionally, joining a refresh that is already running.
    pub async fn refresh_now(&self) -> bool {
        let generation = self.generation();
        self.refresh_from(generation).await
    }

    async fn refresh_from(&self, stale: CredentialGeneration) -> bool {
        let refresh = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if let Some((_, in_flight)) = &state.in_flight {
                in_flight.clone()
            } else if state.generation != stale {
                debug!(
                    stale_generation = stale,
                    current_generation = state.generation,
                    "credentials already replaced; skipping refresh"
                );
                return true;
            } else {
                let Some(refresher) = self.inner.refresher.clone() else {
                    return false;
                };
                let Some(refresh_token) = state
                    .credentials
                    .as_ref()
                    .and_then(|credentials| credentials.refresh_token.clone())
                else {
                    return false;
                };

                let refresh_id = state.next_refresh_id;
                state.next_refresh_id += 1;
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    inner.refresh_invocations.fetch_add(1, Ordering::SeqCst);
                    let outcome = match refresher.refresh(&refresh_token).await {
                        Ok(credentials) => {
                            let generation = inner.install(credentials);
                            debug!(generation, "token refresh succeeded");
                            true
                        }
                        Err(error) => {
                            warn!(error = %error, "token refresh failed");
                            false
                        }
                    };
                    inner.finish_refresh(refresh_id);
                    outcome
                });
                let inner = Arc::clone(&self.inner);
                let future: Pin<Box<dyn Future<Output = bool> + Send>> =
                    Box::pin(task.map(move |joined| match joined {
                        Ok(outcome) => outcome,
                        Err(error) => {
                            warn!(error = %error, "token refresh task did not complete");
                            inner.finish_refresh(refresh_id);
                            false
                        }
                    }));
                let shared = future.shared();
                state.in_flight = Some((refresh_id, shared.clone()));
                shared
            }
        };
        refresh.await
    }
}

#[async_trait]
impl AuthProvider for AuthCoordinator {
    fn authenticate(&self, headers: &mut HeaderMap) -> CredentialGeneration {
        let state = lock_unpoisoned(&self.inner.state);
        let Some(credentials) = &state.credentials else {
            return state.generation;
        };
        if credentials.access_token.is_empty() {
            return state.generation;
        }

        let text = match &self.inner.scheme {
            Some(scheme) => format!("{scheme} {}", credentials.access_token),
            None => credentials.access_token.clone(),
        };
        match HeaderValue::from_str(&text) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(self.inner.header_name.clone(), value);
            }
            Err(_) => warn!(
                header = %self.inner.header_name,
                "access token is not a valid header value; request sent unauthenticated"
            ),
        }
        state.generation
    }

    async fn refresh(&self, stale: CredentialGeneration) -> bool {
        self.refresh_from(stale).await
    }
}

pub struct AuthCoordinatorBuilder {
    credentials: Option<Credentials>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    header_name: HeaderName,
    scheme: Option<String>,
}

impl Default for AuthCoordinatorBuilder {
    fn default() -> Self {
        Self {
            credentials: None,
            refresher: None,
            header_name: AUTHORIZATION,
            scheme: Some("Bearer".to_owned()),
        }
    }
}

impl AuthCoordinatorBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn refresher_arc(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn refresher<R>(self, refresher: R) -> Self
    where
        R: TokenRefresher + 'static,
    {
        self.refresher_arc(Arc::new(refresher))
    }

    /// Header the access token is written to; `Authorization` by default.
    pub fn header_name(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }

    /// Prefix placed before the token, `Bearer` by default. `None` sends the
    /// raw token.
    pub fn scheme(mut self, scheme: Option<&str>) -> Self {
        self.scheme = scheme.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> AuthCoordinator {
        let generation = u64::from(self.credentials.is_some());
        AuthCoordinator {
            inner: Arc::new(AuthInner {
                state: Mutex::new(CredentialState {
                    credentials: self.credentials,
                    generation,
                    in_flight: None,
                    next_refresh_id: 0,
                }),
                refresher: self.refresher,
                header_name: self.header_name,
                scheme: self.scheme,
                refresh_invocations: AtomicUsize::new(0),
            }),
        }
    }
}
