use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tracing::warn;

use crate::error::{BoxError, Error};
use crate::response::Response;

/// What a plugin may see about an outgoing attempt. The URI has credentials
/// and query stripped and sensitive header values are already masked.
#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    uri: String,
    attempt: usize,
    auth_retry_count: usize,
    headers: Vec<(String, String)>,
}

impl RequestContext {
    pub(crate) fn new(
        method: Method,
        uri: String,
        attempt: usize,
        auth_retry_count: usize,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            method,
            uri,
            attempt,
            auth_retry_count,
            headers,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Zero for the first dispatch; auth re-dispatches keep the same number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn auth_retry_count(&self) -> usize {
        self.auth_retry_count
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct FailureContext {
    method: Method,
    uri: String,
    attempts: usize,
    auth_retry_count: usize,
    elapsed: Duration,
}

impl FailureContext {
    pub(crate) fn new(
        method: Method,
        uri: String,
        attempts: usize,
        auth_retry_count: usize,
        elapsed: Duration,
    ) -> Self {
        Self {
            method,
            uri,
            attempts,
            auth_retry_count,
            elapsed,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Number of dispatches made before giving up. Zero when the call failed
    /// before reaching the transport.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn auth_retry_count(&self) -> usize {
        self.auth_retry_count
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Observes the request pipeline. Errors returned from a hook are logged and
/// otherwise ignored.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_request(&self, _context: &RequestContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_retry_scheduled(
        &self,
        _context: &RequestContext,
        _error: &Error,
        _delay: Duration,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_success(&self, _context: &RequestContext, _response: &Response) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_failure(&self, _context: &FailureContext, _error: &Error) -> Result<(), BoxError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub(crate) struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub(crate) fn push(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub(crate) fn len(&self) -> usize {
        self.plugins.len()
    }

    pub(crate) fn request(&self, context: &RequestContext) {
        for plugin in &self.plugins {
            report(plugin.as_ref(), "on_request", plugin.on_request(context));
        }
    }

    pub(crate) fn retry_scheduled(&self, context: &RequestContext, error: &Error, delay: Duration) {
        for plugin in &self.plugins {
            report(
                plugin.as_ref(),
                "on_retry_scheduled",
                plugin.on_retry_scheduled(context, error, delay),
            );
        }
    }

    pub(crate) fn success(&self, context: &RequestContext, response: &Response) {
        for plugin in &self.plugins {
            report(plugin.as_ref(), "on_success", plugin.on_success(context, response));
        }
    }

    pub(crate) fn failure(&self, context: &FailureContext, error: &Error) {
        for plugin in &self.plugins {
            report(plugin.as_ref(), "on_failure", plugin.on_failure(context, error));
        }
    }
}

fn report(plugin: &dyn Plugin, hook: &'static str, outcome: Result<(), BoxError>) {
    if let Err(error) = outcome {
        warn!(plugin = plugin.name(), hook, error = %error, "plugin callback failed");
    }
}
