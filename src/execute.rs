//! The per-call state machine.
//!
//! ```text
//! resolve -> cache probe -> authenticate -> dispatch -> classify
//!                 |                                        |
//!              (fresh)          success <------------------+-> auth refresh -> dispatch
//!                 v                                        +-> backoff wait -> dispatch
//!              success                                     +-> fail
//! ```
//!
//! Each failed dispatch takes exactly one of the three exits on the right.
//! An auth re-dispatch keeps the attempt number, so the refresh allowance
//! and the retry budget are spent independently.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::auth::AuthProvider;
use crate::cache::{CachePolicy, CacheProbe, CacheRecord, base_key};
use crate::classify;
use crate::client::Client;
use crate::error::Error;
use crate::plugin::{FailureContext, RequestContext};
use crate::request::{RequestDescriptor, apply_modifiers};
use crate::response::Response;
use crate::transport::{PreparedRequest, RawResponse};
use crate::util::{merge_headers, redact_uri_for_logs, resolve_uri};

/// Progress of one logical call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AttemptContext {
    /// Ordinary retries consumed so far.
    pub(crate) attempt: usize,
    pub(crate) auth_retry_count: usize,
    pub(crate) dispatches: usize,
    pub(crate) started_at: Instant,
}

impl AttemptContext {
    fn new() -> Self {
        Self {
            attempt: 0,
            auth_retry_count: 0,
            dispatches: 0,
            started_at: Instant::now(),
        }
    }
}

const MAX_AUTH_RETRIES: usize = 1;

impl Client {
    /// Executes a prepared descriptor through the full pipeline.
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<Response> {
        let metrics = &self.inner.metrics;
        metrics.record_request_started();
        let _in_flight = metrics.enter_in_flight();

        let method = descriptor.method().clone();
        let mut log_uri = redact_uri_for_logs(descriptor.path_template());
        let mut context = AttemptContext::new();

        let result = self.run(descriptor, &mut context, &mut log_uri).await;
        let elapsed = context.started_at.elapsed();
        match &result {
            Ok(response) => metrics.record_success(response.status().as_u16(), elapsed),
            Err(error) => {
                metrics.record_failure(error, elapsed);
                let failure = FailureContext::new(
                    method,
                    log_uri,
                    context.dispatches,
                    context.auth_retry_count,
                    elapsed,
                );
                self.inner.plugins.failure(&failure, error);
            }
        }
        result
    }

    async fn run(
        &self,
        descriptor: RequestDescriptor,
        context: &mut AttemptContext,
        log_uri: &mut String,
    ) -> Result<Response> {
        let inner = &self.inner;
        let descriptor = apply_modifiers(descriptor, &inner.modifiers)?;
        let method = descriptor.method().clone();
        let path = descriptor.resolved_path()?;
        let (uri_text, uri) = resolve_uri(&inner.base_url, &path)?;
        *log_uri = redact_uri_for_logs(&uri_text);

        let mut headers = merge_headers(&inner.default_headers, descriptor.headers());
        let (content_type, body) = descriptor.encode_body()?;
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, content_type);
        }

        let options = descriptor.options();
        let cache_policy = options.cache_policy.unwrap_or(inner.cache_policy);
        let timeout = options.timeout.unwrap_or(inner.request_timeout);
        let cancel = options.cancel_token.clone();
        let auth = if options.auth_required {
            inner.auth.clone()
        } else {
            None
        };
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }

        let base_key = base_key(&method, &uri_text);
        let probe = inner
            .cache
            .probe(cache_policy, &method, &base_key, &mut headers, SystemTime::now())
            .await;
        if let CacheProbe::Fresh(record) = &probe {
            inner.metrics.record_cache_hit();
            debug!(method = %method, uri = %log_uri, "served from cache");
            let response = cached_response(record)?;
            self.notify_success(&method, log_uri, context, &headers, &response);
            return Ok(response);
        }

        loop {
            let mut attempt_headers = headers.clone();
            let generation = auth
                .as_ref()
                .map(|auth| auth.authenticate(&mut attempt_headers));

            let request_context = RequestContext::new(
                method.clone(),
                log_uri.clone(),
                context.attempt,
                context.auth_retry_count,
                inner.redactor.mask_headers(&attempt_headers),
            );
            inner.plugins.request(&request_context);

            let span = info_span!(
                "callflow.request",
                method = %method,
                uri = %log_uri,
                attempt = context.attempt,
                auth_retry = context.auth_retry_count
            );
            let request = PreparedRequest {
                method: method.clone(),
                uri: uri.clone(),
                headers: attempt_headers,
                body: body.clone(),
            };
            let dispatch_started = Instant::now();
            let outcome = self
                .dispatch(request, &uri_text, timeout, cancel.as_ref())
                .instrument(span.clone())
                .await;
            context.dispatches += 1;
            inner.metrics.record_dispatch();

            let error = match outcome {
                Ok(raw) => {
                    if let Some(status) = raw.status {
                        span.in_scope(|| {
                            debug!(
                                "{}",
                                inner.redactor.response_line(
                                    status,
                                    &method,
                                    &uri_text,
                                    dispatch_started.elapsed()
                                )
                            )
                        });
                    }
                    match self
                        .settle(raw, &probe, cache_policy, &method, &base_key, &headers)
                        .await
                    {
                        Ok(response) => {
                            inner.plugins.success(&request_context, &response);
                            return Ok(response);
                        }
                        Err(error) => error,
                    }
                }
                Err(error) => error,
            };

            if let (Some(auth), Some(generation)) = (&auth, generation)
                && context.auth_retry_count < MAX_AUTH_RETRIES
                && auth.is_expired(&error)
            {
                let refreshed = wait_for_refresh(auth, generation, cancel.as_ref()).await?;
                inner.metrics.record_auth_refresh(refreshed);
                if !refreshed {
                    span.in_scope(|| debug!("credential refresh failed; giving up"));
                    return Err(error);
                }
                span.in_scope(|| debug!("credentials refreshed; re-dispatching"));
                context.auth_retry_count += 1;
                continue;
            }

            if inner.retry_policy.should_retry(&error, context.attempt) {
                let delay = inner.retry_policy.delay(&error, context.attempt);
                span.in_scope(|| {
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request"
                    )
                });
                inner.metrics.record_retry();
                inner
                    .plugins
                    .retry_scheduled(&request_context, &error, delay);
                backoff(delay, cancel.as_ref()).await?;
                context.attempt += 1;
                continue;
            }

            return Err(error);
        }
    }

    /// One exchange, bounded by `timeout` and abandoned on cancellation.
    async fn dispatch(
        &self,
        request: PreparedRequest,
        uri_text: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<RawResponse> {
        debug!(
            "{}",
            self.inner
                .redactor
                .request_line(&request.method, uri_text, &request.headers)
        );
        let exchange = tokio::time::timeout(timeout, self.inner.transport.execute(request));
        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    outcome = exchange => outcome,
                }
            }
            None => exchange.await,
        };
        match outcome {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(error)) => Err(classify::from_transport_error(error)),
            Err(_) => Err(Error::TimedOut {
                timeout: Some(timeout),
            }),
        }
    }

    /// Turns a raw reply into a response or a classified error, updating the
    /// cache on the way.
    async fn settle(
        &self,
        raw: RawResponse,
        probe: &CacheProbe,
        cache_policy: CachePolicy,
        method: &Method,
        base_key: &str,
        request_headers: &HeaderMap,
    ) -> Result<Response> {
        let Some(status) = raw.status else {
            return Err(Error::InvalidResponse {
                message: "reply carried no http status".to_owned(),
            });
        };

        if status == StatusCode::NOT_MODIFIED.as_u16()
            && let Some(record) = probe.revalidation_record()
        {
            self.inner.metrics.record_cache_revalidation();
            debug!(base_key = %base_key, "not modified; serving cached body");
            return cached_response(record);
        }

        if !(200..300).contains(&status) {
            return Err(classify::from_status(status, raw.body, raw.headers));
        }

        let status_code = StatusCode::from_u16(status).map_err(|_| Error::InvalidResponse {
            message: format!("invalid http status {status}"),
        })?;
        let written = self
            .inner
            .cache
            .write_back(
                cache_policy,
                method,
                base_key,
                request_headers,
                status,
                &raw.headers,
                &raw.body,
                SystemTime::now(),
            )
            .await;
        if written.is_some() {
            self.inner.metrics.record_cache_write();
        }
        Ok(Response::new(status_code, raw.headers, raw.body))
    }

    fn notify_success(
        &self,
        method: &Method,
        log_uri: &str,
        context: &AttemptContext,
        headers: &HeaderMap,
        response: &Response,
    ) {
        let request_context = RequestContext::new(
            method.clone(),
            log_uri.to_owned(),
            context.attempt,
            context.auth_retry_count,
            self.inner.redactor.mask_headers(headers),
        );
        self.inner.plugins.success(&request_context, response);
    }
}

fn cached_response(record: &CacheRecord) -> Result<Response> {
    let status = StatusCode::from_u16(record.status).map_err(|_| Error::InvalidResponse {
        message: format!("cached record has invalid status {}", record.status),
    })?;
    Ok(Response::cached(
        status,
        record.header_map(),
        record.body.clone(),
    ))
}

async fn wait_for_refresh(
    auth: &Arc<dyn AuthProvider>,
    generation: u64,
    cancel: Option<&CancellationToken>,
) -> Result<bool> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            refreshed = auth.refresh(generation) => Ok(refreshed),
        },
        None => Ok(auth.refresh(generation).await),
    }
}

async fn backoff(delay: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
    if let Some(token) = cancel
        && token.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    if delay.is_zero() {
        return Ok(());
    }
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}
