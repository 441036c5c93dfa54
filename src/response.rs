use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;

/// Returned by `send_no_content` for any successful status; the body, if
/// any, is dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoContent;

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    from_cache: bool,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            from_cache: false,
        }
    }

    pub(crate) fn cached(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            from_cache: true,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// True when the body came from the cache, either as a fresh hit or
    /// after a `304 Not Modified` revalidation.
    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Lossy UTF-8 text. Like [`Response::json`], an empty body is a
    /// `DecodingError`; use `no_content` when no body is expected.
    pub fn text(&self) -> Result<String> {
        if self.body.is_empty() {
            return Err(empty_body());
        }
        Ok(self.text_lossy())
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if self.body.is_empty() {
            return Err(empty_body());
        }
        serde_json::from_slice(&self.body).map_err(|source| Error::DecodingError {
            message: source.to_string(),
            body: self.body.clone(),
        })
    }

    pub fn no_content(&self) -> NoContent {
        NoContent
    }
}

fn empty_body() -> Error {
    Error::DecodingError {
        message: "empty response body".to_owned(),
        body: Bytes::new(),
    }
}
