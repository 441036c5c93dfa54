use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use callflow::{
    AuthCoordinator, BoxError, CachePolicy, CancellationToken, Client, Credentials, Error,
    ErrorCode, FileCacheStore, MemoryCacheStore, Plugin, PreparedRequest, REDACTED, RawResponse,
    RequestContext, Response, RetryPolicy, TokenRefresher, Transport, TransportError,
};
use http::HeaderMap;
use http::header::{
    ACCEPT_LANGUAGE, AUTHORIZATION, ETAG, HeaderValue, IF_NONE_MATCH, RETRY_AFTER, VARY,
};
use serde_json::Value;
use tokio::sync::Barrier;

const BASE_URL: &str = "https://api.example.test";

enum Step {
    Reply(RawResponse),
    Fail(TransportError),
    Stall(Duration, RawResponse),
}

/// Plays back a fixed list of exchanges and records every request it saw.
struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<PreparedRequest>>,
}

impl ScriptedTransport {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<PreparedRequest> {
        self.seen.lock().expect("seen lock").clone()
    }

    fn dispatches(&self) -> usize {
        self.seen.lock().expect("seen lock").len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse, TransportError> {
        self.seen.lock().expect("seen lock").push(request);
        let step = self.steps.lock().expect("steps lock").pop_front();
        match step {
            Some(Step::Reply(reply)) => Ok(reply),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Stall(delay, reply)) => {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            None => Err(TransportError::failed(
                callflow::TransportErrorKind::Other,
                "script exhausted",
            )),
        }
    }
}

fn reply(status: u16, headers: &[(&'static str, &'static str)], body: &'static str) -> Step {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(*name, HeaderValue::from_static(*value));
    }
    Step::Reply(RawResponse::new(status, map, Bytes::from_static(body.as_bytes())))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client_with(transport: Arc<ScriptedTransport>) -> callflow::ClientBuilder {
    init_tracing();
    Client::builder(BASE_URL)
        .transport_arc(transport)
        .retry_policy(RetryPolicy::disabled())
}

fn fast_retries(max_retries: usize) -> RetryPolicy {
    RetryPolicy::standard()
        .max_retries(max_retries)
        .base_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(5))
        .jitter(false)
}

#[tokio::test]
async fn ttl_hit_skips_dispatch_and_returns_identical_body() {
    let transport = ScriptedTransport::new([reply(200, &[], r#"{"id":1}"#)]);
    let client = client_with(transport.clone())
        .cache_policy(CachePolicy::Ttl(60))
        .build()
        .expect("client builds");

    let first = client.get("/items/1").send().await.expect("first call");
    let second = client.get("/items/1").send().await.expect("second call");

    assert_eq!(transport.dispatches(), 1);
    assert!(!first.is_from_cache());
    assert!(second.is_from_cache());
    assert_eq!(first.body(), second.body());
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.dispatches, 1);
    assert_eq!(metrics.requests_succeeded, 2);
}

#[tokio::test]
async fn etag_revalidation_serves_cached_body_on_not_modified() {
    let transport = ScriptedTransport::new([
        reply(200, &[("etag", "\"v1\"")], "first body"),
        reply(304, &[], ""),
    ]);
    let client = client_with(transport.clone())
        .cache_policy(CachePolicy::ETag)
        .build()
        .expect("client builds");

    let first = client.get("/doc").send().await.expect("first call");
    let second = client.get("/doc").send().await.expect("revalidated call");

    let seen = transport.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].headers.get(IF_NONE_MATCH).is_none());
    assert_eq!(
        seen[1].headers.get(IF_NONE_MATCH),
        Some(&HeaderValue::from_static("\"v1\""))
    );
    assert_eq!(second.status().as_u16(), 200);
    assert_eq!(second.body(), first.body());
    assert!(second.is_from_cache());
    assert_eq!(
        second.headers().get(ETAG),
        Some(&HeaderValue::from_static("\"v1\""))
    );

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.cache_writes, 1);
    assert_eq!(metrics.cache_revalidations, 1);
}

#[tokio::test]
async fn vary_partitions_entries_by_request_header() {
    let transport = ScriptedTransport::new([
        reply(200, &[("vary", "Accept-Language")], "hello"),
        reply(200, &[("vary", "Accept-Language")], "annyeong"),
    ]);
    let store = Arc::new(MemoryCacheStore::new());
    let client = client_with(transport.clone())
        .cache_policy(CachePolicy::Ttl(60))
        .cache_store_arc(store.clone())
        .build()
        .expect("client builds");

    let english = client
        .get("/greeting")
        .header(ACCEPT_LANGUAGE, HeaderValue::from_static("en"))
        .send_text()
        .await
        .expect("english");
    let korean = client
        .get("/greeting")
        .header(ACCEPT_LANGUAGE, HeaderValue::from_static("ko"))
        .send_text()
        .await
        .expect("korean");
    let english_again = client
        .get("/greeting")
        .header(ACCEPT_LANGUAGE, HeaderValue::from_static("en"))
        .send()
        .await
        .expect("english again");

    assert_eq!(english, "hello");
    assert_eq!(korean, "annyeong");
    assert!(english_again.is_from_cache());
    assert_eq!(english_again.text_lossy(), "hello");
    assert_eq!(transport.dispatches(), 2);

    let base = format!("GET {BASE_URL}/greeting");
    let mut keys = store.keys();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            format!("{base}|accept-language=en"),
            format!("{base}|accept-language=ko"),
        ]
    );
    assert_eq!(
        client.vary_index().names(&base),
        vec!["accept-language".to_owned()]
    );
}

#[tokio::test]
async fn vary_partitions_stay_reachable_after_reopening_a_file_cache() {
    let directory =
        std::env::temp_dir().join(format!("callflow-pipeline-vary-{}", std::process::id()));
    let _ = tokio::fs::remove_dir_all(&directory).await;

    let first_transport =
        ScriptedTransport::new([reply(200, &[("vary", "Accept-Language")], "hello")]);
    let first = client_with(first_transport.clone())
        .cache_policy(CachePolicy::Ttl(600))
        .cache_store(FileCacheStore::open(&directory).await.expect("open store"))
        .build()
        .expect("client builds");
    let english = first
        .get("/greeting")
        .header(ACCEPT_LANGUAGE, HeaderValue::from_static("en"))
        .send_text()
        .await
        .expect("english");
    assert_eq!(english, "hello");
    drop(first);

    let second_transport = ScriptedTransport::new([reply(200, &[], "fresh-dispatch")]);
    let second = client_with(second_transport.clone())
        .cache_policy(CachePolicy::Ttl(600))
        .cache_store(FileCacheStore::open(&directory).await.expect("reopen store"))
        .build()
        .expect("client builds");
    let again = second
        .get("/greeting")
        .header(ACCEPT_LANGUAGE, HeaderValue::from_static("en"))
        .send()
        .await
        .expect("served after reopen");

    assert!(again.is_from_cache());
    assert_eq!(again.text_lossy(), "hello");
    assert_eq!(second_transport.dispatches(), 0);
    assert_eq!(
        second.vary_index().names(&format!("GET {BASE_URL}/greeting")),
        vec!["accept-language".to_owned()]
    );
    let _ = tokio::fs::remove_dir_all(&directory).await;
}

#[tokio::test]
async fn vary_star_is_never_stored() {
    let transport = ScriptedTransport::new([
        reply(200, &[("vary", "*")], "one"),
        reply(200, &[("vary", "*")], "two"),
    ]);
    let client = client_with(transport.clone())
        .cache_policy(CachePolicy::Ttl(60))
        .build()
        .expect("client builds");

    assert_eq!(client.get("/live").send_text().await.expect("first"), "one");
    assert_eq!(client.get("/live").send_text().await.expect("second"), "two");
    assert_eq!(client.metrics_snapshot().cache_writes, 0);
}

#[tokio::test]
async fn invalidate_cache_forces_a_new_dispatch() {
    let transport = ScriptedTransport::new([reply(200, &[], "a"), reply(200, &[], "b")]);
    let client = client_with(transport.clone())
        .cache_policy(CachePolicy::Ttl(60))
        .build()
        .expect("client builds");

    assert_eq!(client.get("/x").send_text().await.expect("first"), "a");
    client.invalidate_cache("/x").await.expect("invalidate");
    assert_eq!(client.get("/x").send_text().await.expect("second"), "b");
    assert_eq!(transport.dispatches(), 2);
}

#[tokio::test]
async fn non_get_requests_bypass_cache() {
    let transport = ScriptedTransport::new([reply(200, &[], "a"), reply(200, &[], "b")]);
    let client = client_with(transport.clone())
        .cache_policy(CachePolicy::Ttl(60))
        .build()
        .expect("client builds");

    client.post("/x").text("one").send().await.expect("first post");
    client.post("/x").text("two").send().await.expect("second post");
    assert_eq!(transport.dispatches(), 2);
    assert_eq!(client.metrics_snapshot().cache_writes, 0);
}

#[tokio::test]
async fn retries_stop_after_budget_is_spent() {
    let transport = ScriptedTransport::new([
        reply(503, &[], "busy"),
        reply(503, &[], "busy"),
        reply(503, &[], "busy"),
        reply(200, &[], "never reached"),
    ]);
    let client = client_with(transport.clone())
        .retry_policy(fast_retries(2))
        .build()
        .expect("client builds");

    let error = client.get("/flaky").send().await.expect_err("budget spent");
    assert_eq!(error.code(), ErrorCode::ServerError);
    assert_eq!(error.status(), Some(503));
    assert_eq!(transport.dispatches(), 3);
    assert_eq!(client.metrics_snapshot().retries, 2);
}

#[tokio::test]
async fn transient_failures_recover_within_budget() {
    let transport = ScriptedTransport::new([
        Step::Fail(TransportError::failed(
            callflow::TransportErrorKind::ConnectionLost,
            "connection reset by peer",
        )),
        reply(429, &[], "slow down"),
        reply(200, &[], r#"{"ok":true}"#),
    ]);
    let client = client_with(transport.clone())
        .retry_policy(fast_retries(3))
        .build()
        .expect("client builds");

    let body: Value = client.get("/eventually").send_json().await.expect("recovers");
    assert_eq!(body["ok"], Value::Bool(true));
    assert_eq!(transport.dispatches(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let transport = ScriptedTransport::new([reply(404, &[], "missing"), reply(200, &[], "")]);
    let client = client_with(transport.clone())
        .retry_policy(fast_retries(3))
        .build()
        .expect("client builds");

    let error = client.get("/gone").send().await.expect_err("404 fails");
    assert_eq!(error.code(), ErrorCode::NotFound);
    assert_eq!(transport.dispatches(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_zero_retries_immediately() {
    let transport = ScriptedTransport::new([
        reply(429, &[("retry-after", "0")], ""),
        reply(200, &[], "ok"),
    ]);
    let client = client_with(transport.clone())
        .retry_policy(
            RetryPolicy::standard()
                .max_retries(1)
                .base_backoff(Duration::from_secs(1))
                .max_backoff(Duration::from_secs(10)),
        )
        .build()
        .expect("client builds");

    let started = tokio::time::Instant::now();
    client.get("/now").send().await.expect("retried");
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(transport.dispatches(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_after_seconds_delays_the_next_dispatch() {
    let transport = ScriptedTransport::new([
        Step::Reply(RawResponse::new(
            503,
            HeaderMap::from_iter([(RETRY_AFTER, HeaderValue::from_static("1"))]),
            Bytes::new(),
        )),
        reply(200, &[], "ok"),
    ]);
    let client = client_with(transport.clone())
        .retry_policy(
            RetryPolicy::standard()
                .max_retries(1)
                .base_backoff(Duration::from_millis(10))
                .max_backoff(Duration::from_secs(10))
                .jitter(false),
        )
        .build()
        .expect("client builds");

    let started = tokio::time::Instant::now();
    client.get("/later").send().await.expect("retried");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn long_retry_after_outlasts_the_standard_backoff_cap() {
    let transport = ScriptedTransport::new([
        reply(429, &[("retry-after", "30")], "slow down"),
        reply(200, &[], "ok"),
    ]);
    let client = client_with(transport.clone())
        .retry_policy(RetryPolicy::standard().max_retries(1))
        .build()
        .expect("client builds");

    let started = tokio::time::Instant::now();
    let text = client.get("/throttled").send_text().await.expect("retried");
    let elapsed = started.elapsed();
    assert_eq!(text, "ok");
    assert!(elapsed >= Duration::from_secs(30), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(31), "elapsed {elapsed:?}");
    assert_eq!(transport.dispatches(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_further_dispatch() {
    let transport = ScriptedTransport::new([
        reply(503, &[("retry-after", "30")], ""),
        reply(200, &[], "too late"),
    ]);
    let client = client_with(transport.clone())
        .retry_policy(fast_retries(3).max_backoff(Duration::from_secs(60)))
        .build()
        .expect("client builds");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let error = client
        .get("/slow")
        .cancel_token(cancel)
        .send()
        .await
        .expect_err("cancelled");
    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert_eq!(transport.dispatches(), 1);
}

#[tokio::test]
async fn cancelled_token_fails_before_dispatch() {
    let transport = ScriptedTransport::new([reply(200, &[], "")]);
    let client = client_with(transport.clone()).build().expect("client builds");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = client
        .get("/x")
        .cancel_token(cancel)
        .send()
        .await
        .expect_err("already cancelled");
    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert_eq!(transport.dispatches(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_exchange_times_out_per_attempt() {
    let transport = ScriptedTransport::new([Step::Stall(
        Duration::from_secs(5),
        RawResponse::new(200, HeaderMap::new(), Bytes::new()),
    )]);
    let client = client_with(transport.clone())
        .request_timeout(Duration::from_millis(100))
        .build()
        .expect("client builds");

    let error = client.get("/stall").send().await.expect_err("timed out");
    match error {
        Error::TimedOut { timeout } => assert_eq!(timeout, Some(Duration::from_millis(100))),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn reply_without_status_is_invalid_response_and_not_retried() {
    let transport = ScriptedTransport::new([
        Step::Reply(RawResponse {
            status: None,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"garbage"),
        }),
        reply(200, &[], ""),
    ]);
    let client = client_with(transport.clone())
        .retry_policy(fast_retries(3))
        .build()
        .expect("client builds");

    let error = client.get("/odd").send().await.expect_err("invalid");
    assert_eq!(error.code(), ErrorCode::InvalidResponse);
    assert_eq!(transport.dispatches(), 1);
}

#[tokio::test]
async fn empty_body_fails_json_decoding_but_not_no_content() {
    let transport = ScriptedTransport::new([reply(200, &[], ""), reply(204, &[], "")]);
    let client = client_with(transport.clone()).build().expect("client builds");

    let error = client
        .get("/empty")
        .send_json::<Value>()
        .await
        .expect_err("empty body");
    assert_eq!(error.code(), ErrorCode::DecodingError);

    client
        .delete("/items/1")
        .send_no_content()
        .await
        .expect("no content");
}

#[tokio::test]
async fn empty_body_fails_text_decoding() {
    let transport = ScriptedTransport::new([reply(200, &[], "")]);
    let client = client_with(transport.clone()).build().expect("client builds");

    let error = client
        .get("/empty")
        .send_text()
        .await
        .expect_err("empty body is not text");
    assert_eq!(error.code(), ErrorCode::DecodingError);
    assert_eq!(transport.dispatches(), 1);
}

#[tokio::test]
async fn request_is_assembled_from_template_query_and_body() {
    let transport = ScriptedTransport::new([reply(201, &[], "{}")]);
    let client = client_with(transport.clone())
        .try_default_header("x-client", "callflow-tests")
        .expect("valid header")
        .build()
        .expect("client builds");

    client
        .post("/v1/{org}/members")
        .path_param("org", "acme labs")
        .query_pair("notify", "true")
        .json(&serde_json::json!({ "name": "kim" }))
        .expect("json body")
        .send()
        .await
        .expect("created");

    let seen = transport.seen();
    let request = &seen[0];
    assert_eq!(
        request.uri.to_string(),
        format!("{BASE_URL}/v1/acme%20labs/members?notify=true")
    );
    assert_eq!(
        request.headers.get("content-type"),
        Some(&HeaderValue::from_static("application/json"))
    );
    assert_eq!(
        request.headers.get("x-client"),
        Some(&HeaderValue::from_static("callflow-tests"))
    );
    assert_eq!(request.body, Bytes::from_static(br#"{"name":"kim"}"#));
}

#[tokio::test]
async fn missing_path_param_never_dispatches() {
    let transport = ScriptedTransport::new([]);
    let client = client_with(transport.clone()).build().expect("client builds");

    let error = client.get("/users/{id}").send().await.expect_err("unresolved");
    assert_eq!(error.code(), ErrorCode::InvalidRequest);
    assert_eq!(transport.dispatches(), 0);
    assert_eq!(client.metrics_snapshot().requests_failed, 1);
}

#[test]
fn invalid_base_url_is_rejected_at_build() {
    let error = Client::builder("not a url")
        .transport_arc(ScriptedTransport::new([]))
        .build()
        .expect_err("invalid base url");
    assert_eq!(error.code(), ErrorCode::InvalidRequest);
}

struct TokenGate {
    stale_barrier: Barrier,
    stale_seen: AtomicUsize,
}

impl TokenGate {
    fn new(concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            stale_barrier: Barrier::new(concurrency),
            stale_seen: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for TokenGate {
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse, TransportError> {
        let token = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        if token == "Bearer fresh" {
            return Ok(RawResponse::new(200, HeaderMap::new(), "{}"));
        }
        self.stale_seen.fetch_add(1, Ordering::SeqCst);
        self.stale_barrier.wait().await;
        Ok(RawResponse::new(401, HeaderMap::new(), "expired"))
    }
}

struct SlowRefresher {
    succeed: bool,
}

#[async_trait]
impl TokenRefresher for SlowRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<Credentials, BoxError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if self.succeed {
            Ok(Credentials::new("fresh").with_refresh_token("rotated"))
        } else {
            Err("refresh endpoint rejected the token".into())
        }
    }
}

fn expiring_auth(succeed: bool) -> AuthCoordinator {
    AuthCoordinator::builder()
        .credentials(Credentials::new("expired").with_refresh_token("refresh-1"))
        .refresher(SlowRefresher { succeed })
        .build()
}

const CONCURRENT_CALLS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unauthorized_calls_share_one_refresh() {
    let gate = TokenGate::new(CONCURRENT_CALLS);
    let auth = expiring_auth(true);
    let client = Client::builder(BASE_URL)
        .transport_arc(gate.clone())
        .auth(auth.clone())
        .retry_policy(RetryPolicy::disabled())
        .build()
        .expect("client builds");

    let mut tasks = Vec::new();
    for _ in 0..CONCURRENT_CALLS {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.get("/me").send().await }));
    }
    for task in tasks {
        let response = task.await.expect("task joins").expect("call succeeds");
        assert_eq!(response.status().as_u16(), 200);
    }

    assert_eq!(auth.refresh_count(), 1);
    assert_eq!(gate.stale_seen.load(Ordering::SeqCst), CONCURRENT_CALLS);
    assert_eq!(
        auth.credentials().map(|credentials| credentials.access_token),
        Some("fresh".to_owned())
    );
    assert_eq!(client.metrics_snapshot().auth_refreshes, CONCURRENT_CALLS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_refresh_fails_every_waiting_call_with_unauthorized() {
    let gate = TokenGate::new(CONCURRENT_CALLS);
    let auth = expiring_auth(false);
    let client = Client::builder(BASE_URL)
        .transport_arc(gate.clone())
        .auth(auth.clone())
        .retry_policy(RetryPolicy::disabled())
        .build()
        .expect("client builds");

    let mut tasks = Vec::new();
    for _ in 0..CONCURRENT_CALLS {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.get("/me").send().await }));
    }
    for task in tasks {
        let error = task.await.expect("task joins").expect_err("call fails");
        assert_eq!(error.code(), ErrorCode::Unauthorized);
    }

    assert_eq!(auth.refresh_count(), 1);
    assert!(!auth.is_refresh_in_flight());
    assert_eq!(
        client.metrics_snapshot().auth_refresh_failures,
        CONCURRENT_CALLS as u64
    );
}

#[tokio::test]
async fn second_unauthorized_after_refresh_is_returned() {
    let transport = ScriptedTransport::new([
        reply(401, &[], "expired"),
        reply(401, &[], "still expired"),
        reply(200, &[], "unreachable"),
    ]);
    let auth = refreshing_auth();
    let client = client_with(transport.clone())
        .auth(auth.clone())
        .retry_policy(fast_retries(3))
        .build()
        .expect("client builds");

    let error = client.get("/me").send().await.expect_err("second 401");
    assert_eq!(error.code(), ErrorCode::Unauthorized);
    assert_eq!(transport.dispatches(), 2);
    assert_eq!(auth.refresh_count(), 1);

    let seen = transport.seen();
    assert_eq!(
        seen[0].headers.get(AUTHORIZATION),
        Some(&HeaderValue::from_static("Bearer old"))
    );
    assert_eq!(
        seen[1].headers.get(AUTHORIZATION),
        Some(&HeaderValue::from_static("Bearer fresh"))
    );
}

fn refreshing_auth() -> AuthCoordinator {
    AuthCoordinator::builder()
        .credentials(Credentials::new("old").with_refresh_token("r"))
        .refresher(SlowRefresher { succeed: true })
        .build()
}

#[tokio::test]
async fn auth_redispatch_does_not_consume_the_retry_budget() {
    let transport = ScriptedTransport::new([
        reply(503, &[], "busy"),
        reply(401, &[], "expired"),
        reply(503, &[], "busy again"),
        reply(200, &[], "ok"),
    ]);
    let auth = refreshing_auth();
    let client = client_with(transport.clone())
        .auth(auth.clone())
        .retry_policy(fast_retries(2))
        .build()
        .expect("client builds");

    let text = client.get("/me").send_text().await.expect("recovers");
    assert_eq!(text, "ok");
    assert_eq!(transport.dispatches(), 4);
    assert_eq!(auth.refresh_count(), 1);
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.auth_refreshes, 1);
}

#[tokio::test]
async fn retries_spent_before_a_refresh_are_not_reset() {
    let transport = ScriptedTransport::new([
        reply(503, &[], "busy"),
        reply(401, &[], "expired"),
        reply(503, &[], "busy again"),
        reply(200, &[], "unreachable"),
    ]);
    let auth = refreshing_auth();
    let client = client_with(transport.clone())
        .auth(auth.clone())
        .retry_policy(fast_retries(1))
        .build()
        .expect("client builds");

    let error = client.get("/me").send().await.expect_err("budget spent");
    assert_eq!(error.code(), ErrorCode::ServerError);
    assert_eq!(transport.dispatches(), 3);
    assert_eq!(auth.refresh_count(), 1);
    assert_eq!(client.metrics_snapshot().retries, 1);
    assert_eq!(
        transport.seen()[2].headers.get(AUTHORIZATION),
        Some(&HeaderValue::from_static("Bearer fresh"))
    );
}

#[tokio::test]
async fn auth_can_be_skipped_per_request() {
    let transport = ScriptedTransport::new([reply(200, &[], "public")]);
    let client = client_with(transport.clone())
        .auth(AuthCoordinator::bearer(Credentials::new("secret")))
        .build()
        .expect("client builds");

    client
        .get("/public")
        .auth_required(false)
        .send()
        .await
        .expect("public call");
    assert!(transport.seen()[0].headers.get(AUTHORIZATION).is_none());
}

#[derive(Default)]
struct Recorder {
    authorization: Mutex<Vec<String>>,
    successes: AtomicUsize,
    retries: AtomicUsize,
    failures: AtomicUsize,
}

impl Plugin for Recorder {
    fn on_request(&self, context: &RequestContext) -> Result<(), BoxError> {
        if let Some(value) = context.header("Authorization") {
            self.authorization
                .lock()
                .expect("recorder lock")
                .push(value.to_owned());
        }
        Ok(())
    }

    fn on_retry_scheduled(
        &self,
        _context: &RequestContext,
        _error: &Error,
        _delay: Duration,
    ) -> Result<(), BoxError> {
        self.retries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_success(&self, _context: &RequestContext, _response: &Response) -> Result<(), BoxError> {
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_failure(
        &self,
        _context: &callflow::FailureContext,
        _error: &Error,
    ) -> Result<(), BoxError> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Broken;

impl Plugin for Broken {
    fn on_request(&self, _context: &RequestContext) -> Result<(), BoxError> {
        Err("on_request exploded".into())
    }

    fn on_success(&self, _context: &RequestContext, _response: &Response) -> Result<(), BoxError> {
        Err("on_success exploded".into())
    }
}

#[tokio::test]
async fn plugins_see_masked_headers_and_failures_are_swallowed() {
    let transport = ScriptedTransport::new([reply(503, &[], ""), reply(200, &[], "ok")]);
    let recorder = Arc::new(Recorder::default());
    let client = client_with(transport.clone())
        .auth(AuthCoordinator::bearer(Credentials::new("top-secret")))
        .retry_policy(fast_retries(1))
        .plugin(Broken)
        .plugin_arc(recorder.clone())
        .build()
        .expect("client builds");

    let text = client.get("/guarded").send_text().await.expect("plugins do not fail calls");
    assert_eq!(text, "ok");

    let seen = recorder.authorization.lock().expect("recorder lock").clone();
    assert_eq!(seen, vec![REDACTED.to_owned(), REDACTED.to_owned()]);
    assert_eq!(recorder.retries.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.successes.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failure_hook_runs_once_per_failed_call() {
    let transport = ScriptedTransport::new([reply(400, &[], "bad")]);
    let recorder = Arc::new(Recorder::default());
    let client = client_with(transport)
        .plugin_arc(recorder.clone())
        .build()
        .expect("client builds");

    let error = client.get("/bad").send().await.expect_err("bad request");
    assert_eq!(error.code(), ErrorCode::BadRequest);
    assert_eq!(recorder.failures.load(Ordering::SeqCst), 1);
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.requests_failed, 1);
    assert_eq!(metrics.error_counts.get("bad_request"), Some(&1));
}

#[tokio::test]
async fn client_modifiers_run_after_request_modifiers() {
    let transport = ScriptedTransport::new([reply(200, &[], "")]);
    let client = client_with(transport.clone())
        .modifier(|descriptor: callflow::RequestDescriptor| -> callflow::Result<_> {
            Ok(descriptor
                .with_header(
                    http::header::HeaderName::from_static("x-order"),
                    HeaderValue::from_static("client"),
                )
                .with_query_pair("tenant", "acme"))
        })
        .build()
        .expect("client builds");

    client
        .get("/ordered")
        .modifier(|descriptor: callflow::RequestDescriptor| -> callflow::Result<_> {
            Ok(descriptor.with_header(
                http::header::HeaderName::from_static("x-order"),
                HeaderValue::from_static("request"),
            ))
        })
        .send()
        .await
        .expect("sent");

    let seen = transport.seen();
    let order: Vec<_> = seen[0]
        .headers
        .get_all("x-order")
        .iter()
        .map(|value| value.to_str().expect("ascii").to_owned())
        .collect();
    assert_eq!(order, vec!["client".to_owned()]);
    assert_eq!(seen[0].uri.query(), Some("tenant=acme"));
}

#[tokio::test]
async fn status_headers_survive_on_errors() {
    let transport = ScriptedTransport::new([Step::Reply(RawResponse::new(
        403,
        HeaderMap::from_iter([(VARY, HeaderValue::from_static("x-probe"))]),
        Bytes::from_static(b"denied"),
    ))]);
    let client = client_with(transport).build().expect("client builds");

    let error = client.get("/admin").send().await.expect_err("forbidden");
    match &error {
        Error::Forbidden { body, headers } => {
            assert_eq!(body, &Bytes::from_static(b"denied"));
            assert!(headers.contains_key(VARY));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
