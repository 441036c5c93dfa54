//! Maps every observable failure onto exactly one [`Error`] variant.
//!
//! Classification happens once, at the point of failure. The retry and
//! `Retry-After` projections below read only the classified value, so the
//! same error always yields the same disposition.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::HeaderMap;

use crate::error::{Error, TransportErrorKind};
use crate::transport::TransportError;
use crate::util::parse_retry_after;

/// Transport failure kinds that are worth another attempt even though they
/// are not connectivity problems.
const RETRYABLE_TRANSPORT_FAILURES: &[TransportErrorKind] = &[TransportErrorKind::Protocol];

pub fn from_status(status: u16, body: Bytes, headers: HeaderMap) -> Error {
    from_status_at(status, body, headers, SystemTime::now())
}

pub(crate) fn from_status_at(
    status: u16,
    body: Bytes,
    headers: HeaderMap,
    now: SystemTime,
) -> Error {
    let retry_after = || parse_retry_after(&headers, now);
    match status {
        400 => Error::BadRequest {
            body,
            headers: Box::new(headers),
        },
        401 => Error::Unauthorized {
            body,
            headers: Box::new(headers),
        },
        403 => Error::Forbidden {
            body,
            headers: Box::new(headers),
        },
        404 => Error::NotFound {
            body,
            headers: Box::new(headers),
        },
        429 => {
            let retry_after = retry_after();
            Error::TooManyRequests {
                body,
                headers: Box::new(headers),
                retry_after,
            }
        }
        405..=499 => {
            let retry_after = retry_after();
            Error::ClientError {
                status,
                body,
                headers: Box::new(headers),
                retry_after,
            }
        }
        500..=599 => {
            let retry_after = retry_after();
            Error::ServerError {
                status,
                body,
                headers: Box::new(headers),
                retry_after,
            }
        }
        _ => Error::Unknown { status, body },
    }
}

pub fn from_transport_error(error: TransportError) -> Error {
    match error {
        TransportError::Cancelled => Error::Cancelled,
        TransportError::TimedOut => Error::TimedOut { timeout: None },
        TransportError::Failed { kind, source } if kind.is_connectivity() => Error::NoConnection {
            kind,
            message: source.to_string(),
        },
        TransportError::Failed { kind, source } => Error::TransportFailure {
            kind,
            message: source.to_string(),
        },
    }
}

pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::ServerError { .. }
        | Error::TooManyRequests { .. }
        | Error::TimedOut { .. }
        | Error::NoConnection { .. } => true,
        Error::TransportFailure { kind, .. } => RETRYABLE_TRANSPORT_FAILURES.contains(kind),
        _ => false,
    }
}

pub fn retry_after(error: &Error) -> Option<Duration> {
    match error {
        Error::TooManyRequests { retry_after, .. }
        | Error::ClientError { retry_after, .. }
        | Error::ServerError { retry_after, .. } => *retry_after,
        _ => None,
    }
}
