use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{Error, TransportErrorKind};
use crate::transport::{PreparedRequest, RawResponse, Transport, TransportError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

type RustlsHyperClient = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Clone, Debug)]
pub struct HyperTransportOptions {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub http2_only: bool,
}

impl Default for HyperTransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            http2_only: false,
        }
    }
}

/// Default transport: pooled hyper client over rustls (ring provider,
/// webpki roots). One exchange per call, body fully buffered.
#[derive(Clone)]
pub struct HyperTransport {
    client: RustlsHyperClient,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new() -> Result<Self, Error> {
        Self::with_options(HyperTransportOptions::default())
    }

    pub fn with_options(options: HyperTransportOptions) -> Result<Self, Error> {
        let tls_config = build_rustls_tls_config()?;

        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        connector.set_connect_timeout(Some(options.connect_timeout));

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(options.pool_idle_timeout)
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .http2_only(options.http2_only)
            .build(https);
        Ok(Self { client })
    }
}

fn build_rustls_tls_config() -> Result<rustls::ClientConfig, Error> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|source| Error::TransportFailure {
        kind: TransportErrorKind::Tls,
        message: format!("failed to initialise rustls: {source}"),
    })?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

pub(crate) fn classify_hyper_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    let text = error_chain_text(error);
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("connection closed")
        || text.contains("connection aborted")
    {
        return TransportErrorKind::ConnectionLost;
    }
    if text.contains("parse") || text.contains("invalid") || text.contains("unexpected eof") {
        return TransportErrorKind::Protocol;
    }
    TransportErrorKind::Other
}

fn error_chain_text(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text.to_ascii_lowercase()
}

#[async_trait]
impl Transport for HyperTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse, TransportError> {
        let PreparedRequest {
            method,
            uri,
            headers,
            body,
        } = request;
        let mut outgoing = http::Request::new(Full::new(body));
        *outgoing.method_mut() = method;
        *outgoing.uri_mut() = uri;
        *outgoing.headers_mut() = headers;

        let response = self.client.request(outgoing).await.map_err(|source| {
            let kind = classify_hyper_error(&source);
            debug!(kind = kind.as_str(), error = %source, "hyper request failed");
            TransportError::failed(kind, source)
        })?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|source| TransportError::failed(TransportErrorKind::Protocol, source))?
            .to_bytes();
        Ok(RawResponse::new(parts.status.as_u16(), parts.headers, body))
    }
}
