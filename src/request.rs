use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::cache::CachePolicy;
use crate::client::Client;
use crate::error::Error;
use crate::response::{NoContent, Response};
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestBody {
    Json(Bytes),
    Form(Bytes),
    Text(String),
    Xml(String),
    Raw { bytes: Bytes, content_type: String },
}

impl RequestBody {
    pub fn content_type(&self) -> &str {
        match self {
            Self::Json(_) => "application/json",
            Self::Form(_) => "application/x-www-form-urlencoded",
            Self::Text(_) => "text/plain; charset=utf-8",
            Self::Xml(_) => "application/xml; charset=utf-8",
            Self::Raw { content_type, .. } => content_type.as_str(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Json(bytes) | Self::Form(bytes) | Self::Raw { bytes, .. } => bytes.clone(),
            Self::Text(text) | Self::Xml(text) => Bytes::copy_from_slice(text.as_bytes()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: Some("application/octet-stream".to_owned()),
            data: data.into(),
        }
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

fn quoted_parameter(value: &str) -> Result<String> {
    if value.contains(['\r', '\n']) {
        return Err(Error::encoding(format!(
            "multipart parameter contains a line break: {value:?}"
        )));
    }
    Ok(value.replace('"', "%22"))
}

pub(crate) fn encode_multipart(parts: &[MultipartPart], boundary: &str) -> Result<Bytes> {
    let mut body = BytesMut::new();
    for part in parts {
        let mut head = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"",
            quoted_parameter(&part.name)?
        );
        if let Some(filename) = &part.filename {
            let _ = write!(head, "; filename=\"{}\"", quoted_parameter(filename)?);
        }
        head.push_str("\r\n");
        if let Some(content_type) = &part.content_type {
            let _ = write!(head, "Content-Type: {}\r\n", quoted_parameter(content_type)?);
        }
        head.push_str("\r\n");
        body.put_slice(head.as_bytes());
        body.put_slice(&part.data);
        body.put_slice(b"\r\n");
    }
    body.put_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(body.freeze())
}

/// Per-request overrides of client settings.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub cache_policy: Option<CachePolicy>,
    pub auth_required: bool,
    pub cancel_token: Option<CancellationToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cache_policy: None,
            auth_required: true,
            cancel_token: None,
        }
    }
}

/// Everything the pipeline needs to issue one logical call. Built once and
/// never mutated; modifiers receive it by value and return a replacement.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    path_params: BTreeMap<String, String>,
    headers: HeaderMap,
    query_pairs: Vec<(String, String)>,
    body: Option<RequestBody>,
    multipart: Option<Vec<MultipartPart>>,
    options: RequestOptions,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            path_params: BTreeMap::new(),
            headers: HeaderMap::new(),
            query_pairs: Vec::new(),
            body: None,
            multipart: None,
            options: RequestOptions::default(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path_template(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn multipart(&self) -> Option<&[MultipartPart]> {
        self.multipart.as_deref()
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self.multipart = None;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Path with `{name}` placeholders substituted and the query appended.
    pub fn resolved_path(&self) -> Result<String> {
        let path = expand_path_template(&self.path, &self.path_params)?;
        Ok(append_query_pairs(&path, &self.query_pairs))
    }

    /// Encoded body and the content type it forces, if any.
    pub(crate) fn encode_body(&self) -> Result<(Option<HeaderValue>, Bytes)> {
        if let Some(parts) = &self.multipart {
            let boundary = format!("callflow-{:016x}", rand::random::<u64>());
            let body = encode_multipart(parts, &boundary)?;
            let content_type = parse_header_value(
                CONTENT_TYPE.as_str(),
                &format!("multipart/form-data; boundary={boundary}"),
            )?;
            return Ok((Some(content_type), body));
        }
        match &self.body {
            Some(body) => {
                let content_type = parse_header_value(CONTENT_TYPE.as_str(), body.content_type())?;
                Ok((Some(content_type), body.to_bytes()))
            }
            None => Ok((None, Bytes::new())),
        }
    }
}

/// Everything outside the RFC 3986 unreserved set.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub(crate) fn encode_path_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

pub(crate) fn expand_path_template(
    template: &str,
    params: &BTreeMap<String, String>,
) -> Result<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        expanded.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else {
            return Err(Error::invalid_request(format!(
                "unterminated path parameter in `{template}`"
            )));
        };
        let name = &after_open[..close];
        let Some(value) = params.get(name) else {
            return Err(Error::invalid_request(format!(
                "unresolved path parameter `{name}` in `{template}`"
            )));
        };
        expanded.push_str(&encode_path_segment(value));
        rest = &after_open[close + 1..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}

/// Rewrites a descriptor before it is resolved. Modifiers run in the order
/// they were registered: request-level ones when the request is built,
/// client-level ones at send time.
pub trait RequestModifier: Send + Sync {
    fn modify(&self, descriptor: RequestDescriptor) -> Result<RequestDescriptor>;
}

impl<F> RequestModifier for F
where
    F: Fn(RequestDescriptor) -> Result<RequestDescriptor> + Send + Sync,
{
    fn modify(&self, descriptor: RequestDescriptor) -> Result<RequestDescriptor> {
        self(descriptor)
    }
}

pub(crate) fn apply_modifiers<'a, I>(
    descriptor: RequestDescriptor,
    modifiers: I,
) -> Result<RequestDescriptor>
where
    I: IntoIterator<Item = &'a Arc<dyn RequestModifier>>,
{
    modifiers
        .into_iter()
        .try_fold(descriptor, |descriptor, modifier| modifier.modify(descriptor))
}

pub struct RequestBuilder<'a> {
    client: &'a Client,
    descriptor: RequestDescriptor,
    modifiers: Vec<Arc<dyn RequestModifier>>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, path: String) -> Self {
        Self {
            client,
            descriptor: RequestDescriptor::new(method, path),
            modifiers: Vec::new(),
        }
    }

    pub fn path_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.descriptor = self.descriptor.with_path_param(name, value.to_string());
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.descriptor = self.descriptor.with_header(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.with_query_pair(name, value);
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params).map_err(Error::encoding)?;
        for (name, value) in url::form_urlencoded::parse(encoded.as_bytes()) {
            self.descriptor = self
                .descriptor
                .with_query_pair(name.into_owned(), value.into_owned());
        }
        Ok(self)
    }

    pub fn json<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(Error::encoding)?;
        Ok(self.body(RequestBody::Json(Bytes::from(body))))
    }

    pub fn form<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload).map_err(Error::encoding)?;
        Ok(self.body(RequestBody::Form(Bytes::from(encoded))))
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.body(RequestBody::Text(text.into()))
    }

    pub fn xml(self, xml: impl Into<String>) -> Self {
        self.body(RequestBody::Xml(xml.into()))
    }

    pub fn body_bytes(self, bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.body(RequestBody::Raw {
            bytes: bytes.into(),
            content_type: content_type.into(),
        })
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.descriptor = self.descriptor.with_body(body);
        self
    }

    pub fn multipart(mut self, parts: Vec<MultipartPart>) -> Self {
        self.descriptor.body = None;
        self.descriptor.multipart = Some(parts);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.options.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.descriptor.options.cache_policy = Some(cache_policy);
        self
    }

    /// Whether credentials are attached and a 401 may trigger a refresh.
    pub fn auth_required(mut self, auth_required: bool) -> Self {
        self.descriptor.options.auth_required = auth_required;
        self
    }

    pub fn cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.descriptor.options.cancel_token = Some(cancel_token);
        self
    }

    pub fn modifier<M>(mut self, modifier: M) -> Self
    where
        M: RequestModifier + 'static,
    {
        self.modifiers.push(Arc::new(modifier));
        self
    }

    /// Applies this builder's modifiers and returns the final descriptor.
    pub fn build(self) -> Result<RequestDescriptor> {
        apply_modifiers(self.descriptor, &self.modifiers)
    }

    pub async fn send(self) -> Result<Response> {
        let client = self.client;
        let descriptor = self.build()?;
        client.send(descriptor).await
    }

    pub async fn send_json<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.send().await?.json()
    }

    pub async fn send_text(self) -> Result<String> {
        self.send().await?.text()
    }

    pub async fn send_no_content(self) -> Result<NoContent> {
        Ok(self.send().await?.no_content())
    }
}
