//! `callflow` executes HTTP calls for API SDKs: conditional response caching,
//! single-flight credential refresh, retry with backoff and a uniform error
//! taxonomy, on top of any [`Transport`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use callflow::prelude::{AuthCoordinator, CachePolicy, Client, Credentials, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Repository {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com")
//!         .request_timeout(Duration::from_secs(3))
//!         .cache_policy(CachePolicy::ETagOrTtl(30))
//!         .auth(AuthCoordinator::bearer(Credentials::new("token")))
//!         .retry_policy(RetryPolicy::standard().max_retries(3))
//!         .build()?;
//!
//!     let repository: Repository = client
//!         .get("/v1/repos/{owner}/{name}")
//!         .path_param("owner", "acme")
//!         .path_param("name", "widgets")
//!         .send_json()
//!         .await?;
//!
//!     println!("repository id={}", repository.id);
//!     Ok(())
//! }
//! ```
//!
//! # Failure handling
//!
//! Every call ends with a decoded value or exactly one [`Error`]. A failed
//! dispatch is either re-sent once after a successful credential refresh
//! (`401` only), retried after a backoff when [`Error::is_retryable`] holds
//! and budget remains, or returned.

mod auth;
mod cache;
pub mod classify;
mod client;
mod config;
mod error;
mod execute;
mod hyper_transport;
mod metrics;
mod plugin;
mod redact;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::auth::{
    AuthCoordinator, AuthCoordinatorBuilder, AuthProvider, CredentialGeneration, Credentials,
    TokenRefresher,
};
pub use crate::cache::{
    CachePolicy, CacheRecord, CacheStore, FileCacheStore, MemoryCacheStore, VaryIndex, base_key,
    effective_key, parse_vary,
};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{ClientConfig, ClientProfile, ProfileDefaults, RetryConfig};
pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::hyper_transport::{HyperTransport, HyperTransportOptions};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::plugin::{FailureContext, Plugin, RequestContext};
pub use crate::redact::{REDACTED, Redactor};
pub use crate::request::{
    MultipartPart, RequestBody, RequestBuilder, RequestDescriptor, RequestModifier,
    RequestOptions,
};
pub use crate::response::{NoContent, Response};
pub use crate::retry::RetryPolicy;
pub use crate::transport::{PreparedRequest, RawResponse, Transport, TransportError};
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AuthCoordinator, AuthProvider, CachePolicy, CancellationToken, Client, ClientBuilder,
        ClientConfig, ClientProfile, Credentials, Error, ErrorCode, NoContent, Plugin, Response,
        Result, RetryPolicy, TokenRefresher, Transport,
    };
}
