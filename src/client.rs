use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use reqwest::{header::HeaderMap, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    debug,
    entity::{self, human_bytes},
    events::{Observer, Observers},
    options::DebugOptions,
    ratelimit::{RateLimitError, RateLimiter},
    ApiError, Authorizer, ClientOptions, Entity, Request, Result, StatusError,
};

/// Retries allowed per logical request, shared by rate-limit retries and
/// status-driven retries.
pub const MAX_RETRIES: usize = 3;

const SHARED_TIMEOUT: Duration = Duration::from_secs(60);

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> u64 {
    REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

fn shared_transport() -> reqwest::Client {
    static SHARED: OnceLock<reqwest::Client> = OnceLock::new();
    SHARED
        .get_or_init(|| {
            reqwest::Client::builder()
                .timeout(SHARED_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new())
        })
        .clone()
}

/// HTTP API client.
///
/// A client is immutable once built and cheap to clone. All per-request state
/// lives in the call, so one client can serve any number of concurrent
/// requests. The `with_*` methods return modified copies.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Option<Url>,
    authorizer: Option<Arc<dyn Authorizer>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    observers: Observers,
    retry_status: Arc<HashSet<StatusCode>>,
    backoff: Duration,
    headers: HeaderMap,
    content_type: String,
    debug: DebugOptions,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_ref().map(Url::as_str))
            .field("authorizer", &self.authorizer.as_ref().map(|_| "<redacted>"))
            .field("rate_limited", &self.limiter.is_some())
            .field("retry_status", &self.retry_status)
            .field("backoff", &self.backoff)
            .field("headers", &debug::sanitize_headers(&self.headers))
            .field("content_type", &self.content_type)
            .field("debug", &self.debug)
            .finish()
    }
}

impl ApiClient {
    /// Creates a client with default options and the debug environment
    /// overlay applied.
    pub fn new() -> Result<Self> {
        Self::with_config(ClientOptions::default())
    }

    /// Creates a client from options.
    ///
    /// Fails when the base URL does not parse or `DEBUG_API_CLIENT_FILTER`
    /// is not a valid regex.
    pub fn with_config(options: ClientOptions) -> Result<Self> {
        let base = match options.base_url.as_deref() {
            Some(base) if !base.trim().is_empty() => {
                Some(Url::parse(base).map_err(|err| ApiError::InvalidUrl {
                    url: base.to_owned(),
                    reason: err.to_string(),
                })?)
            }
            _ => None,
        };

        let http = match options.timeout {
            Some(timeout) => reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| ApiError::Config(format!("could not build transport: {err}")))?,
            None => shared_transport(),
        };

        Ok(Self {
            http,
            base,
            authorizer: None,
            limiter: None,
            observers: Observers::default(),
            retry_status: Arc::new(options.retry_status.iter().copied().collect()),
            backoff: options.effective_retry_delay(),
            headers: options.headers.clone(),
            content_type: options.content_type.clone(),
            debug: options.debug.with_env()?,
        })
    }

    pub fn base(&self) -> Option<&Url> {
        self.base.as_ref()
    }

    /// Returns a copy of this client resolving relative targets against
    /// `base`.
    pub fn with_base(&self, base: Url) -> Self {
        Self {
            base: Some(base),
            ..self.clone()
        }
    }

    pub fn authorizer(&self) -> Option<&Arc<dyn Authorizer>> {
        self.authorizer.as_ref()
    }

    /// Returns a copy of this client that authorizes with `authorizer`.
    pub fn with_authorizer(&self, authorizer: impl Authorizer + 'static) -> Self {
        Self {
            authorizer: Some(Arc::new(authorizer)),
            ..self.clone()
        }
    }

    /// Returns a copy of this client paced by `limiter`. The limiter is
    /// shared by every copy made from the returned client.
    pub fn with_rate_limiter(&self, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter: Some(limiter),
            ..self.clone()
        }
    }

    /// Returns a copy of this client that also notifies `observer`.
    pub fn with_observer(&self, observer: impl Observer + 'static) -> Self {
        let mut observers = self.observers.clone();
        observers.add(Arc::new(observer));
        Self {
            observers,
            ..self.clone()
        }
    }

    /// Returns a copy of this client sending through `http`.
    pub fn with_transport(&self, http: reqwest::Client) -> Self {
        Self {
            http,
            ..self.clone()
        }
    }

    /// `GET` `target` and unmarshal the response.
    pub async fn get<T>(&self, target: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.exec(Request::get(target)).await
    }

    /// `POST` `input` marshaled with the client's content type.
    pub async fn post<B, T>(&self, target: &str, input: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = Request::post(target).entity(&self.content_type, input)?;
        self.exec(request).await
    }

    pub async fn put<B, T>(&self, target: &str, input: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = Request::put(target).entity(&self.content_type, input)?;
        self.exec(request).await
    }

    pub async fn delete<B, T>(&self, target: &str, input: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = Request::delete(target);
        if let Some(input) = input {
            request = request.entity(&self.content_type, input)?;
        }
        self.exec(request).await
    }

    /// Executes `request` and unmarshals the response body into `T` by its
    /// content type.
    pub async fn exec<T>(&self, request: Request) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let request_id = next_request_id();
        let method = request.method().clone();
        let response = self
            .pipeline(request_id, request, &CancellationToken::new())
            .await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return entity::from_response(response).await;
        }

        let url = response.url().clone();
        let body = Entity::capture(response)
            .await
            .map_err(ApiError::Transport)?;
        entity::unmarshal(&body.content_type, &body.data).map_err(|err| {
            let snapshot = self.debug.is_debug(&url) || self.debug.is_verbose(&url);
            StatusError {
                request_id,
                status,
                method,
                url: url.to_string(),
                entity: snapshot.then_some(body),
                message: format!("could not unmarshal response: {err}"),
                cause: None,
            }
            .into()
        })
    }

    /// Executes `request` through the pipeline. Only 2xx responses are
    /// returned; anything else becomes an [`ApiError`].
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`ApiClient::execute`], aborting with [`ApiError::Canceled`] as
    /// soon as `cancel` fires, including while waiting on rate limits or
    /// retry backoff.
    pub async fn execute_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.pipeline(next_request_id(), request, cancel).await
    }

    async fn pipeline(
        &self,
        request_id: u64,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let start = Instant::now();
        let mut request = request.resolve(self.base.as_ref())?;
        let verbose = self.debug.is_verbose(request.url());
        let debug = self.debug.is_debug(request.url());

        if let Some(authorizer) = &self.authorizer {
            authorizer
                .authorize(&mut request)
                .await
                .map_err(ApiError::Authorization)?;
        }
        merge_default_headers(&self.headers, request.headers_mut());

        if let Some(limiter) = &self.limiter {
            self.await_rate_limit(limiter.as_ref(), request_id, &request, start, verbose, cancel)
                .await?;
        }

        self.observers.will_send_request(&request)?;
        if verbose || debug {
            tracing::debug!(
                req_id = request_id,
                "{} {}",
                request.method(),
                request.url()
            );
        }
        if debug {
            debug::dump_request(request_id, &request, verbose);
        }

        let response = match self
            .send_with_retry(request_id, &request, start, verbose, cancel)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.observers.request_failed(&request, &err);
                return Err(err);
            }
        };

        if verbose || debug {
            let size = response
                .content_length()
                .map_or_else(|| "<unknown>".to_owned(), human_bytes);
            tracing::debug!(
                req_id = request_id,
                elapsed = ?start.elapsed(),
                "{} {} -> {} ({})",
                request.method(),
                request.url(),
                response.status(),
                size
            );
        }
        let response = if debug {
            debug::dump_response(request_id, response, verbose).await?
        } else {
            response
        };

        self.observers.did_receive_response(&request, &response)?;
        Ok(response)
    }

    async fn await_rate_limit(
        &self,
        limiter: &dyn RateLimiter,
        request_id: u64,
        request: &reqwest::Request,
        start: Instant,
        verbose: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if verbose {
            let state = limiter.state(start);
            tracing::debug!(
                req_id = request_id,
                "{} {}: rate limit state: limit={}, remaining={}, reset in {:?}",
                request.method(),
                request.url(),
                state.limit,
                state.remaining,
                state.reset.saturating_duration_since(start)
            );
        }

        let next = limiter
            .next(start, request)
            .map_err(|source| rate_limit_error(request_id, request, source))?;
        let delay = next.saturating_duration_since(Instant::now());
        if delay.is_zero() {
            return Ok(());
        }
        if verbose {
            tracing::debug!(
                req_id = request_id,
                "{} {}: delaying {:?} for rate limits",
                request.method(),
                request.url(),
                delay
            );
        }
        suspend(delay, cancel).await
    }

    /// Sends `request` until it succeeds, fails terminally or the shared
    /// retry budget is spent.
    async fn send_with_retry(
        &self,
        request_id: u64,
        request: &reqwest::Request,
        start: Instant,
        verbose: bool,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let mut attempt = 0usize;
        loop {
            let outgoing = request
                .try_clone()
                .ok_or_else(|| ApiError::Request("request body cannot be replayed".to_owned()))?;

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Canceled),
                response = self.http.execute(outgoing) => response.map_err(ApiError::Transport)?,
            };

            // The limiter sees every response, including failures, before
            // anything else looks at it.
            let mut limiter_error = None;
            if let Some(limiter) = &self.limiter {
                match limiter.update(start, &response) {
                    Ok(()) => {}
                    Err(RateLimitError::Retry(signal)) => {
                        if attempt >= MAX_RETRIES {
                            return Err(rate_limit_error(
                                request_id,
                                request,
                                RateLimitError::Retry(signal),
                            ));
                        }
                        let delay = signal.retry_after.saturating_duration_since(Instant::now());
                        if verbose {
                            tracing::debug!(
                                req_id = request_id,
                                "{} {}: retrying after {:?} due to rate limits",
                                request.method(),
                                request.url(),
                                delay
                            );
                        }
                        drop(response);
                        suspend(delay, cancel).await?;
                        attempt += 1;
                        continue;
                    }
                    Err(err) => limiter_error = Some(err),
                }
            }

            let status = response.status();
            if attempt < MAX_RETRIES && !status.is_success() && self.retry_status.contains(&status)
            {
                let delay = self.backoff.saturating_mul(attempt as u32 + 1);
                if verbose {
                    tracing::debug!(
                        req_id = request_id,
                        "{} {}: retrying after {:?} due to recoverable failure: {}",
                        request.method(),
                        request.url(),
                        delay,
                        status
                    );
                }
                drop(response);
                suspend(delay, cancel).await?;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                return Err(classify(request_id, request, response).await);
            }
            if let Some(source) = limiter_error {
                return Err(rate_limit_error(request_id, request, source));
            }
            return Ok(response);
        }
    }
}

/// Applies client-level headers the request has not set itself.
fn merge_default_headers(defaults: &HeaderMap, target: &mut HeaderMap) {
    for name in defaults.keys() {
        if target.contains_key(name) {
            continue;
        }
        for value in defaults.get_all(name) {
            target.append(name.clone(), value.clone());
        }
    }
}

/// Waits for `delay` unless `cancel` fires first.
async fn suspend(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApiError::Canceled),
        _ = sleep(delay) => Ok(()),
    }
}

/// Converts a non-success response into a status error, capturing its body.
async fn classify(request_id: u64, request: &reqwest::Request, response: Response) -> ApiError {
    let status = response.status();
    let entity = Entity::capture(response).await.ok();
    StatusError::unexpected(
        request_id,
        request.method().clone(),
        request.url().as_str(),
        status,
        entity,
    )
    .into()
}

fn rate_limit_error(
    request_id: u64,
    request: &reqwest::Request,
    source: RateLimitError,
) -> ApiError {
    ApiError::RateLimit {
        request_id,
        method: request.method().clone(),
        url: request.url().to_string(),
        source,
    }
}
