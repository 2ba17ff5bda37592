use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use apiclient::{
    ApiClient, ApiError, BearerAuthorizer, CancellationToken, ClientOptions, HeaderLimiter,
    LimiterConfig, Observer, QueryAuthorizer, RateLimitError, RateLimitState, RateLimiter,
    Request, RetrySignal, StatusCause, RECOVERABLE_STATUSES,
};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
    Router,
};
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    content_type: &'static str,
    body: String,
    headers: Vec<(&'static str, String)>,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    fn text(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_owned(),
            headers: Vec::new(),
        }
    }

    fn status(status: StatusCode) -> Self {
        Self::text(status, "")
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

#[derive(Clone, Debug)]
struct SeenRequest {
    uri: Uri,
    headers: HeaderMap,
    body: String,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    repeat: Option<MockResponse>,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

async fn mock_handler(
    State(state): State<MockState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .seen
        .lock()
        .expect("seen mutex must not be poisoned")
        .push(SeenRequest { uri, headers, body });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue
            .pop_front()
            .or_else(|| state.repeat.clone())
            .unwrap_or_else(|| MockResponse::json(StatusCode::OK, json!({"ok": true})))
    };

    let mut builder = Response::builder()
        .status(response.status)
        .header(header::CONTENT_TYPE, response.content_type);
    for (name, value) in response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(response.body))
        .expect("mock response must build")
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> SeenRequest {
        self.seen
            .lock()
            .expect("seen mutex must not be poisoned")
            .last()
            .cloned()
            .expect("server must have seen a request")
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    spawn_server_with(responses, None).await
}

async fn spawn_server_with(
    responses: Vec<MockResponse>,
    repeat: Option<MockResponse>,
) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        repeat,
        hits: Arc::new(AtomicUsize::new(0)),
        seen: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .fallback(mock_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}/"),
        hits: state.hits,
        seen: state.seen,
        task,
    }
}

fn retrying_client(server: &TestServer, delay: Duration) -> ApiClient {
    ApiClient::with_config(
        ClientOptions::default()
            .with_base_url(&server.base_url)
            .with_retry_status(RECOVERABLE_STATUSES)
            .with_retry_delay(delay),
    )
    .expect("client must build")
}

/// Forces a fixed number of rate-limit retries, then accepts every response.
struct ScriptedLimiter {
    forced: AtomicUsize,
    wait: Duration,
}

impl ScriptedLimiter {
    fn new(forced: usize) -> Self {
        Self::waiting(forced, Duration::from_millis(5))
    }

    fn waiting(forced: usize, wait: Duration) -> Self {
        Self {
            forced: AtomicUsize::new(forced),
            wait,
        }
    }
}

impl RateLimiter for ScriptedLimiter {
    fn state(&self, now: Instant) -> RateLimitState {
        RateLimitState {
            limit: 1,
            remaining: 1,
            reset: now,
        }
    }

    fn next(&self, now: Instant, _request: &reqwest::Request) -> Result<Instant, RateLimitError> {
        Ok(now)
    }

    fn update(&self, _start: Instant, _response: &reqwest::Response) -> Result<(), RateLimitError> {
        let left = self.forced.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(());
        }
        self.forced.store(left - 1, Ordering::SeqCst);
        Err(RateLimitError::Retry(RetrySignal {
            retry_after: Instant::now() + self.wait,
        }))
    }
}

/// Holds every request at the gate for a long time.
struct ClosedGate;

impl RateLimiter for ClosedGate {
    fn state(&self, now: Instant) -> RateLimitState {
        RateLimitState {
            limit: 1,
            remaining: 0,
            reset: now + Duration::from_secs(30),
        }
    }

    fn next(&self, now: Instant, _request: &reqwest::Request) -> Result<Instant, RateLimitError> {
        Ok(now + Duration::from_secs(30))
    }

    fn update(&self, _start: Instant, _response: &reqwest::Response) -> Result<(), RateLimitError> {
        Ok(())
    }
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

#[derive(Default)]
struct FailureCounter {
    failures: AtomicUsize,
}

impl Observer for FailureCounter {
    fn request_failed(&self, _request: &reqwest::Request, _error: &ApiError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn recoverable_status_is_retried_until_success() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::INTERNAL_SERVER_ERROR),
        MockResponse::status(StatusCode::BAD_GATEWAY),
        MockResponse::json(StatusCode::OK, json!({"id": 1, "name": "gear"})),
    ])
    .await;
    let client = retrying_client(&server, Duration::from_millis(10));

    let value: JsonValue = client.get("things/1").await.expect("must succeed");

    assert_eq!(value, json!({"id": 1, "name": "gear"}));
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn retry_budget_is_exhausted_after_three_retries() {
    let server = spawn_server_with(
        Vec::new(),
        Some(MockResponse::text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "still broken",
        )),
    )
    .await;
    let client = retrying_client(&server, Duration::from_millis(5));

    let err = client
        .execute(Request::get("things"))
        .await
        .expect_err("must give up");

    assert_eq!(server.hits(), 4);
    assert_eq!(err.cause(), Some(StatusCause::InternalServerError));
    let entity = err
        .status_error()
        .and_then(|status| status.entity.clone())
        .expect("body must be captured");
    assert_eq!(entity.data, b"still broken");
}

#[tokio::test]
async fn backoff_grows_with_each_attempt() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
    ])
    .await;
    let client = retrying_client(&server, Duration::from_millis(20));

    let started = Instant::now();
    client
        .execute(Request::get("things"))
        .await
        .expect("fourth attempt must succeed");

    // 20ms + 40ms + 60ms
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(server.hits(), 4);
}

#[tokio::test]
async fn unlisted_status_is_not_retried() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::CONFLICT)]).await;
    let client = retrying_client(&server, Duration::from_millis(5));

    let err = client
        .execute(Request::get("things"))
        .await
        .expect_err("must fail");

    assert_eq!(server.hits(), 1);
    assert_eq!(err.status(), Some(StatusCode::CONFLICT));
    assert_eq!(err.cause(), None);
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let server = spawn_server_with(
        Vec::new(),
        Some(MockResponse::status(StatusCode::INTERNAL_SERVER_ERROR)),
    )
    .await;
    let client = retrying_client(&server, Duration::from_secs(30));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = client
        .execute_with_cancel(Request::get("things"), &cancel)
        .await
        .expect_err("must be canceled");

    assert!(err.is_canceled(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn rate_limit_and_status_retries_share_one_budget() {
    let server = spawn_server_with(
        Vec::new(),
        Some(MockResponse::status(StatusCode::INTERNAL_SERVER_ERROR)),
    )
    .await;
    let client = retrying_client(&server, Duration::from_millis(5))
        .with_rate_limiter(Arc::new(ScriptedLimiter::new(2)));

    let err = client
        .execute(Request::get("things"))
        .await
        .expect_err("must give up");

    // two forced retries plus one status retry spend the budget
    assert_eq!(server.hits(), 4);
    assert_eq!(err.cause(), Some(StatusCause::InternalServerError));
}

#[tokio::test]
async fn endless_rate_limit_retries_become_an_error() {
    let server = spawn_server(Vec::new()).await;
    let client = retrying_client(&server, Duration::from_millis(5))
        .with_rate_limiter(Arc::new(ScriptedLimiter::new(usize::MAX)));

    let err = client
        .execute(Request::get("things"))
        .await
        .expect_err("must give up");

    assert_eq!(server.hits(), 4);
    assert!(matches!(
        err,
        ApiError::RateLimit {
            source: RateLimitError::Retry(_),
            ..
        }
    ));
}

#[tokio::test]
async fn cancellation_interrupts_the_rate_limit_gate() {
    let server = spawn_server(Vec::new()).await;
    let client = retrying_client(&server, Duration::from_millis(5))
        .with_rate_limiter(Arc::new(ClosedGate));
    let cancel = cancel_after(Duration::from_millis(50));

    let started = Instant::now();
    let err = client
        .execute_with_cancel(Request::get("things"), &cancel)
        .await
        .expect_err("must be canceled");

    assert!(err.is_canceled(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn cancellation_interrupts_a_rate_limit_retry_wait() {
    let server = spawn_server(Vec::new()).await;
    let client = retrying_client(&server, Duration::from_millis(5))
        .with_rate_limiter(Arc::new(ScriptedLimiter::waiting(1, Duration::from_secs(30))));
    let cancel = cancel_after(Duration::from_millis(50));

    let started = Instant::now();
    let err = client
        .execute_with_cancel(Request::get("things"), &cancel)
        .await
        .expect_err("must be canceled");

    assert!(err.is_canceled(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn limiter_errors_fail_otherwise_successful_responses() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({"ok": true}))
            .with_header("x-ratelimit-remaining", "lots"),
    ])
    .await;
    let client = retrying_client(&server, Duration::from_millis(5))
        .with_rate_limiter(Arc::new(HeaderLimiter::new(LimiterConfig::default())));

    let err = client
        .execute(Request::get("things"))
        .await
        .expect_err("must report the limiter error");

    assert_eq!(server.hits(), 1);
    match err {
        ApiError::RateLimit {
            source: RateLimitError::InvalidHeader { name, value },
            ..
        } => {
            assert_eq!(name, "x-ratelimit-remaining");
            assert_eq!(value, "lots");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn huge_retry_after_is_an_invalid_header() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({"ok": true}))
            .with_header("retry-after", u64::MAX.to_string()),
    ])
    .await;
    let client = retrying_client(&server, Duration::from_millis(5))
        .with_rate_limiter(Arc::new(HeaderLimiter::new(LimiterConfig::default())));

    let err = client
        .execute(Request::get("things"))
        .await
        .expect_err("must report the limiter error");

    assert_eq!(server.hits(), 1);
    assert!(
        matches!(
            err,
            ApiError::RateLimit {
                source: RateLimitError::InvalidHeader { .. },
                ..
            }
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn burst_limiter_waits_for_the_next_window() {
    let server = spawn_server(Vec::new()).await;
    let started = Instant::now();
    let limiter = HeaderLimiter::new(LimiterConfig {
        events: 10,
        window: Duration::from_millis(100),
        start: Some(started),
        ..LimiterConfig::default()
    });
    let client = retrying_client(&server, Duration::from_millis(5)).with_rate_limiter(Arc::new(limiter));

    for _ in 0..11 {
        client
            .execute(Request::get("things"))
            .await
            .expect("must succeed");
    }

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(server.hits(), 11);
}

#[tokio::test]
async fn retry_after_header_delays_the_resend() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::TOO_MANY_REQUESTS).with_header("retry-after", "300")
    ])
    .await;
    let limiter = HeaderLimiter::new(LimiterConfig {
        units: apiclient::ratelimit::Units::Milliseconds,
        ..LimiterConfig::default()
    });
    let client = retrying_client(&server, Duration::from_millis(5)).with_rate_limiter(Arc::new(limiter));

    let started = Instant::now();
    client
        .execute(Request::get("things"))
        .await
        .expect("second attempt must succeed");

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn not_found_is_classified_with_body() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::NOT_FOUND, "no such thing")]).await;
    let client = retrying_client(&server, Duration::from_millis(5));

    let err = client
        .execute(Request::get("things/9"))
        .await
        .expect_err("must fail");

    assert_eq!(err.cause(), Some(StatusCause::NotFound));
    let status = err.status_error().expect("must be a status error");
    assert!(status.url.ends_with("/things/9"));
    assert_eq!(
        status.entity.as_ref().map(|entity| entity.data.as_slice()),
        Some(&b"no such thing"[..])
    );
    assert!(err.to_string().contains("unexpected status code: 404 Not Found"));
}

#[tokio::test]
async fn transport_errors_are_not_retried() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("must bind");
    let address = listener.local_addr().expect("must have local addr");
    drop(listener);

    let observer = Arc::new(FailureCounter::default());
    let client = ApiClient::with_config(
        ClientOptions::default()
            .with_base_url(format!("http://{address}/"))
            .with_retry_status(RECOVERABLE_STATUSES)
            .with_retry_delay(Duration::from_secs(30)),
    )
    .expect("client must build")
    .with_observer(observer.clone());

    let started = Instant::now();
    let err = client
        .execute(Request::get("things"))
        .await
        .expect_err("must fail");

    assert!(matches!(err, ApiError::Transport(_)), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(observer.failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn explicit_headers_win_over_client_defaults() {
    let server = spawn_server(Vec::new()).await;
    let client = ApiClient::with_config(
        ClientOptions::default()
            .with_base_url(&server.base_url)
            .with_header(header::ACCEPT, "application/json".parse().expect("valid"))
            .with_header(
                header::HeaderName::from_static("x-client"),
                "apiclient-tests".parse().expect("valid"),
            ),
    )
    .expect("client must build");

    client
        .execute(
            Request::get("things")
                .try_header("Accept", "text/plain")
                .expect("valid header"),
        )
        .await
        .expect("must succeed");

    let seen = server.last_request();
    assert_eq!(seen.headers[header::ACCEPT], "text/plain");
    assert_eq!(seen.headers["x-client"], "apiclient-tests");
}

#[tokio::test]
async fn authorizers_decorate_the_request() {
    let server = spawn_server(Vec::new()).await;
    let base = retrying_client(&server, Duration::from_millis(5));

    base.with_authorizer(BearerAuthorizer::new("token-123"))
        .execute(Request::get("things"))
        .await
        .expect("must succeed");
    assert_eq!(
        server.last_request().headers[header::AUTHORIZATION],
        "Bearer token-123"
    );

    base.with_authorizer(QueryAuthorizer::new([("api_key", "k")]))
        .execute(Request::get("things?page=2"))
        .await
        .expect("must succeed");
    let seen = server.last_request();
    assert_eq!(seen.uri.query(), Some("page=2&api_key=k"));
    assert!(!seen.headers.contains_key(header::AUTHORIZATION));
}

#[tokio::test]
async fn post_marshals_body_and_no_content_decodes_empty() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::NO_CONTENT)]).await;
    let client = retrying_client(&server, Duration::from_millis(5));

    let result: Option<JsonValue> = client
        .post("things", &json!({"name": "gear"}))
        .await
        .expect("must succeed");

    assert_eq!(result, None);
    let seen = server.last_request();
    assert_eq!(seen.headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(seen.body, r#"{"name":"gear"}"#);
}

#[tokio::test]
async fn undecodable_body_is_a_status_error() {
    let server = spawn_server(vec![
        MockResponse::text(StatusCode::OK, "not a number"),
        MockResponse::text(StatusCode::OK, "still not a number"),
    ])
    .await;
    let client = retrying_client(&server, Duration::from_millis(5));

    let first = client
        .get::<u64>("things/count")
        .await
        .expect_err("must fail to decode");
    let second = client
        .get::<u64>("things/count")
        .await
        .expect_err("must fail to decode");

    let status = first.status_error().expect("must be a status error");
    assert_eq!(status.status, StatusCode::OK);
    assert!(status.message.starts_with("could not unmarshal response"));
    let other = second.status_error().expect("must be a status error");
    assert_ne!(status.request_id, 0);
    assert_ne!(status.request_id, other.request_id);
}

#[tokio::test]
async fn observers_can_veto_a_request() {
    struct Veto;

    impl Observer for Veto {
        fn will_send_request(&self, _request: &reqwest::Request) -> apiclient::Result<()> {
            Err(ApiError::Observer("maintenance window".to_owned()))
        }
    }

    let server = spawn_server(Vec::new()).await;
    let client = retrying_client(&server, Duration::from_millis(5)).with_observer(Veto);

    let err = client
        .execute(Request::get("things"))
        .await
        .expect_err("must be vetoed");

    assert!(matches!(err, ApiError::Observer(_)));
    assert_eq!(server.hits(), 0);
}
