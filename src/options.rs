use std::time::Duration;

use regex::Regex;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    StatusCode, Url,
};

use crate::{entity, ApiError, Result};

/// Statuses that usually indicate a transient server-side failure.
pub const RECOVERABLE_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Base delay for status-driven retries when none is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(180);

/// Configures a client: base URL, transport timeout, retry behavior, default
/// headers, preferred content type and tracing verbosity.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Base that relative request targets are resolved against.
    pub base_url: Option<String>,
    /// Transport timeout. Without one, a shared transport with a 60 second
    /// timeout is used.
    pub timeout: Option<Duration>,
    /// Statuses eligible for backoff retries.
    pub retry_status: Vec<StatusCode>,
    /// Base backoff delay; attempt `n` waits `delay * (n + 1)`.
    pub retry_delay: Option<Duration>,
    /// Headers applied to requests that do not set them explicitly.
    pub headers: HeaderMap,
    /// Content type used to marshal request entities.
    pub content_type: String,
    pub debug: DebugOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: None,
            retry_status: Vec::new(),
            retry_delay: None,
            headers: HeaderMap::new(),
            content_type: entity::JSON.to_owned(),
            debug: DebugOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_status(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.retry_status = statuses.into_iter().collect();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets one default header, replacing earlier values for that name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Merges default headers; names in `headers` replace existing ones.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for name in headers.keys() {
            self.headers.remove(name);
            for value in headers.get_all(name) {
                self.headers.append(name.clone(), value.clone());
            }
        }
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Enables both debug dumps and verbose tracing.
    pub fn with_debug(mut self, on: bool) -> Self {
        self.debug.debug = on;
        self.debug.verbose = on;
        self
    }

    pub fn with_verbose(mut self, on: bool) -> Self {
        self.debug.verbose = on;
        self
    }

    pub(crate) fn effective_retry_delay(&self) -> Duration {
        match self.retry_delay {
            Some(delay) if !delay.is_zero() => delay,
            _ => DEFAULT_RETRY_DELAY,
        }
    }
}

/// Controls request tracing.
///
/// `verbose` traces each lifecycle step of a request; `debug` also dumps
/// headers, and with `verbose` bodies too. Both apply only to requests whose
/// URL path matches `filter`, when set.
#[derive(Clone, Debug, Default)]
pub struct DebugOptions {
    pub debug: bool,
    pub verbose: bool,
    pub filter: Option<Regex>,
}

impl DebugOptions {
    /// Overlays the `DEBUG_API_CLIENT`, `VERBOSE_API_CLIENT` and
    /// `DEBUG_API_CLIENT_FILTER` environment variables.
    pub fn with_env(self) -> Result<Self> {
        let debug = self.debug || env_flag("DEBUG_API_CLIENT");
        let verbose = debug || self.verbose || env_flag("VERBOSE_API_CLIENT");
        let filter = match std::env::var("DEBUG_API_CLIENT_FILTER") {
            Ok(pattern) if !pattern.is_empty() => Some(Regex::new(&pattern).map_err(|err| {
                ApiError::Config(format!("invalid DEBUG_API_CLIENT_FILTER: {err}"))
            })?),
            _ => self.filter,
        };
        Ok(Self {
            debug,
            verbose,
            filter,
        })
    }

    pub fn matches(&self, url: &Url) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.is_match(url.path()))
    }

    pub(crate) fn is_verbose(&self, url: &Url) -> bool {
        self.verbose && self.matches(url)
    }

    pub(crate) fn is_debug(&self, url: &Url) -> bool {
        self.debug && self.matches(url)
    }
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|value| !value.is_empty())
}
