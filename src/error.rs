use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use thiserror::Error;

use crate::util::truncate_body;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    ConnectionLost,
    Tls,
    Protocol,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::ConnectionLost => "connection_lost",
            Self::Tls => "tls",
            Self::Protocol => "protocol",
            Self::Other => "other",
        }
    }

    /// Kinds that mean the peer could not be reached at all.
    pub const fn is_connectivity(self) -> bool {
        matches!(self, Self::Dns | Self::Connect | Self::ConnectionLost)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidRequest,
    InvalidResponse,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    ClientError,
    ServerError,
    TooManyRequests,
    DecodingError,
    EncodingError,
    TransportFailure,
    Unknown,
    Cancelled,
    TimedOut,
    NoConnection,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidResponse => "invalid_response",
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::TooManyRequests => "too_many_requests",
            Self::DecodingError => "decoding_error",
            Self::EncodingError => "encoding_error",
            Self::TransportFailure => "transport_failure",
            Self::Unknown => "unknown",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::NoConnection => "no_connection",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Terminal outcome of a failed call.
///
/// Every failure the engine can observe (request construction, transport,
/// HTTP status, body decoding) is folded into exactly one variant. Status
/// variants keep the raw body and response headers for diagnostics.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
    #[error("bad request (400): {}", truncate_body(.body))]
    BadRequest { body: Bytes, headers: Box<HeaderMap> },
    #[error("unauthorized (401): {}", truncate_body(.body))]
    Unauthorized { body: Bytes, headers: Box<HeaderMap> },
    #[error("forbidden (403): {}", truncate_body(.body))]
    Forbidden { body: Bytes, headers: Box<HeaderMap> },
    #[error("not found (404): {}", truncate_body(.body))]
    NotFound { body: Bytes, headers: Box<HeaderMap> },
    #[error("client error ({status}): {}", truncate_body(.body))]
    ClientError {
        status: u16,
        body: Bytes,
        headers: Box<HeaderMap>,
        retry_after: Option<Duration>,
    },
    #[error("server error ({status}): {}", truncate_body(.body))]
    ServerError {
        status: u16,
        body: Bytes,
        headers: Box<HeaderMap>,
        retry_after: Option<Duration>,
    },
    #[error("too many requests (429): {}", truncate_body(.body))]
    TooManyRequests {
        body: Bytes,
        headers: Box<HeaderMap>,
        retry_after: Option<Duration>,
    },
    #[error("failed to decode response body: {message}; body={}", truncate_body(.body))]
    DecodingError { message: String, body: Bytes },
    #[error("failed to encode request: {message}")]
    EncodingError { message: String },
    #[error("transport failure ({kind}): {message}")]
    TransportFailure {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("unexpected http status {status}: {}", truncate_body(.body))]
    Unknown { status: u16, body: Bytes },
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out{}", format_timeout(.timeout))]
    TimedOut { timeout: Option<Duration> },
    #[error("no connection ({kind}): {message}")]
    NoConnection {
        kind: TransportErrorKind,
        message: String,
    },
}

fn format_timeout(timeout: &Option<Duration>) -> String {
    match timeout {
        Some(timeout) => format!(" after {}ms", timeout.as_millis()),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub(crate) fn encoding(message: impl std::fmt::Display) -> Self {
        Self::EncodingError {
            message: message.to_string(),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::InvalidResponse { .. } => ErrorCode::InvalidResponse,
            Self::BadRequest { .. } => ErrorCode::BadRequest,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::Forbidden { .. } => ErrorCode::Forbidden,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::ClientError { .. } => ErrorCode::ClientError,
            Self::ServerError { .. } => ErrorCode::ServerError,
            Self::TooManyRequests { .. } => ErrorCode::TooManyRequests,
            Self::DecodingError { .. } => ErrorCode::DecodingError,
            Self::EncodingError { .. } => ErrorCode::EncodingError,
            Self::TransportFailure { .. } => ErrorCode::TransportFailure,
            Self::Unknown { .. } => ErrorCode::Unknown,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::TimedOut { .. } => ErrorCode::TimedOut,
            Self::NoConnection { .. } => ErrorCode::NoConnection,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::BadRequest { .. } => Some(400),
            Self::Unauthorized { .. } => Some(401),
            Self::Forbidden { .. } => Some(403),
            Self::NotFound { .. } => Some(404),
            Self::TooManyRequests { .. } => Some(429),
            Self::ClientError { status, .. }
            | Self::ServerError { status, .. }
            | Self::Unknown { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        match self {
            Self::BadRequest { body, .. }
            | Self::Unauthorized { body, .. }
            | Self::Forbidden { body, .. }
            | Self::NotFound { body, .. }
            | Self::ClientError { body, .. }
            | Self::ServerError { body, .. }
            | Self::TooManyRequests { body, .. }
            | Self::DecodingError { body, .. }
            | Self::Unknown { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            Self::BadRequest { headers, .. }
            | Self::Unauthorized { headers, .. }
            | Self::Forbidden { headers, .. }
            | Self::NotFound { headers, .. }
            | Self::ClientError { headers, .. }
            | Self::ServerError { headers, .. }
            | Self::TooManyRequests { headers, .. } => Some(headers),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        crate::classify::is_retryable(self)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        crate::classify::retry_after(self)
    }
}
