use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Uri};

use crate::error::Error;

const MAX_ERROR_BODY_CHARS: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Request headers replace client defaults name by name; every value of a
/// request header is kept.
pub(crate) fn merge_headers(defaults: &HeaderMap, request: &HeaderMap) -> HeaderMap {
    let mut merged = HeaderMap::with_capacity(defaults.len() + request.len());
    for (name, value) in defaults {
        if !request.contains_key(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    for (name, value) in request {
        merged.append(name.clone(), value.clone());
    }
    merged
}

/// Userinfo, query and fragment never reach logs or plugins.
pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    match url::Url::parse(uri_text) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            if url.has_host() {
                let _ = url.set_username("");
                let _ = url.set_password(None);
            }
            url.into()
        }
        Err(_) => uri_text
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_owned(),
    }
}

/// Absolute `http(s)` paths are used as-is; anything else is joined onto
/// the base URL.
pub(crate) fn resolve_uri(base_url: &str, path: &str) -> Result<(String, Uri), Error> {
    let absolute = match path.parse::<Uri>() {
        Ok(parsed) if parsed.host().is_some() => match parsed.scheme_str() {
            Some(scheme)
                if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") =>
            {
                path.to_owned()
            }
            _ => {
                return Err(Error::invalid_request(format!(
                    "unsupported uri scheme: {path}"
                )));
            }
        },
        _ => join_base_path(base_url, path),
    };
    let uri = absolute
        .parse()
        .map_err(|_| Error::invalid_request(format!("invalid request uri: {absolute}")))?;
    Ok((absolute, uri))
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<(), Error> {
    let invalid = || Error::invalid_request(format!("invalid base url: {base_url}"));
    if base_url.is_empty() || base_url.trim() != base_url {
        return Err(invalid());
    }
    let url = url::Url::parse(base_url).map_err(|_| invalid())?;
    let acceptable = matches!(url.scheme(), "http" | "https")
        && url.has_host()
        && url.username().is_empty()
        && url.password().is_none()
        && url.query().is_none()
        && url.fragment().is_none();
    if acceptable { Ok(()) } else { Err(invalid()) }
}

/// Appends form-encoded pairs after any query already in `path`, keeping a
/// trailing fragment in place.
pub(crate) fn append_query_pairs(path: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return path.to_owned();
    }

    let (rest, fragment) = path
        .split_once('#')
        .map_or((path, None), |(head, tail)| (head, Some(tail)));
    let (base, existing) = rest.split_once('?').unwrap_or((rest, ""));

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(url::form_urlencoded::parse(existing.as_bytes()))
        .extend_pairs(pairs.iter().map(|(name, value)| (name.as_str(), value.as_str())))
        .finish();

    match fragment {
        Some(fragment) => format!("{base}?{query}#{fragment}"),
        None => format!("{base}?{query}"),
    }
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        base.to_owned()
    } else if base.is_empty() {
        relative.to_owned()
    } else {
        format!("{base}/{relative}")
    }
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::invalid_request(format!("invalid header name: {name}")))
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::invalid_request(format!("invalid header value for {name}")))
}

/// Delta-seconds or an HTTP date; a date in the past means "now".
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    match raw.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => httpdate::parse_http_date(raw)
            .ok()
            .map(|at| at.duration_since(now).unwrap_or_default()),
    }
}

/// Flattens a header map into lowercase names; repeated values are joined
/// with `", "`.
pub(crate) fn lowercase_header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flattened: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        flattened
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    flattened
}

pub(crate) fn header_map_from_pairs<'a>(
    pairs: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.into_owned(),
    }
}
