use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

use crate::error::{BoxError, TransportErrorKind};

/// A fully resolved request, ready for one exchange on the wire.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What came back from one exchange.
///
/// `status` is `None` when the peer answered with something that is not an
/// HTTP response.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: Option<u16>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status: Some(status),
            headers,
            body: body.into(),
        }
    }
}

#[derive(Debug)]
pub enum TransportError {
    Cancelled,
    TimedOut,
    Failed {
        kind: TransportErrorKind,
        source: BoxError,
    },
}

impl TransportError {
    pub fn failed(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self::Failed {
            kind,
            source: source.into(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => formatter.write_str("transport call cancelled"),
            Self::TimedOut => formatter.write_str("transport call timed out"),
            Self::Failed { kind, source } => write!(formatter, "{kind} failure: {source}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Performs exactly one HTTP exchange. No retries, no status interpretation.
///
/// Implementations are dropped mid-flight when the caller cancels, so any
/// in-progress I/O must be safe to abandon.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse, TransportError>;
}
