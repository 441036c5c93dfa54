use std::time::Duration;

use http::{HeaderMap, Method};

use crate::util::redact_uri_for_logs;

pub const REDACTED: &str = "<redacted>";

const DEFAULT_SENSITIVE_KEYS: [&str; 8] = [
    "authorization",
    "cookie",
    "api-key",
    "apikey",
    "token",
    "secret",
    "password",
    "session",
];

/// Masks header values before they reach logs or plugins.
///
/// A header is sensitive when its lowercase name contains any configured key,
/// so `authorization` also covers `proxy-authorization` and `token` covers
/// `x-auth-token`.
#[derive(Clone, Debug)]
pub struct Redactor {
    sensitive_keys: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self {
            sensitive_keys: DEFAULT_SENSITIVE_KEYS
                .iter()
                .map(|key| (*key).to_owned())
                .collect(),
        }
    }
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the sensitive-key set.
    pub fn with_sensitive_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut redactor = Self {
            sensitive_keys: Vec::new(),
        };
        for key in keys {
            redactor = redactor.sensitive_key(key.as_ref());
        }
        redactor
    }

    pub fn sensitive_key(mut self, key: &str) -> Self {
        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() && !self.sensitive_keys.contains(&key) {
            self.sensitive_keys.push(key);
        }
        self
    }

    pub fn sensitive_keys(&self) -> &[String] {
        &self.sensitive_keys
    }

    pub fn is_sensitive(&self, header_name: &str) -> bool {
        let header_name = header_name.to_ascii_lowercase();
        self.sensitive_keys
            .iter()
            .any(|key| header_name.contains(key.as_str()))
    }

    pub fn mask_value<'a>(&self, header_name: &str, value: &'a str) -> &'a str {
        if self.is_sensitive(header_name) {
            REDACTED
        } else {
            value
        }
    }

    pub fn mask_headers(&self, headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(name, value)| {
                let name = name.as_str().to_owned();
                let value = if self.is_sensitive(&name) {
                    REDACTED.to_owned()
                } else {
                    value
                        .to_str()
                        .map(ToOwned::to_owned)
                        .unwrap_or_else(|_| "<binary>".to_owned())
                };
                (name, value)
            })
            .collect()
    }

    /// `--> GET https://host/path {accept: application/json, authorization: <redacted>}`
    pub fn request_line(&self, method: &Method, uri: &str, headers: &HeaderMap) -> String {
        let headers = self
            .mask_headers(headers)
            .into_iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("--> {method} {} {{{headers}}}", redact_uri_for_logs(uri))
    }

    /// `<-- 200 GET https://host/path (12ms)`
    pub fn response_line(
        &self,
        status: u16,
        method: &Method,
        uri: &str,
        elapsed: Duration,
    ) -> String {
        format!(
            "<-- {status} {method} {} ({}ms)",
            redact_uri_for_logs(uri),
            elapsed.as_millis()
        )
    }
}
