//! Rate limiting capability and a header-driven limiter.
//!
//! The pipeline consults a [`RateLimiter`] before every logical request and
//! reports every response back to it, including failed ones.

use std::{
    sync::Mutex,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use reqwest::{
    header::{HeaderMap, HeaderValue, RETRY_AFTER},
    StatusCode,
};

/// A point-in-time view of a limiter's window, used for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitState {
    pub limit: u64,
    pub remaining: u64,
    pub reset: Instant,
}

/// A forced retry directive: resend the same request at `retry_after`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrySignal {
    pub retry_after: Instant,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// The server asked for the request to be retried later.
    #[error("retry requested in {:?}", .0.retry_after.saturating_duration_since(Instant::now()))]
    Retry(RetrySignal),
    /// A rate limit header could not be parsed.
    #[error("invalid '{name}' header value '{value}'")]
    InvalidHeader { name: String, value: String },
    #[error("{0}")]
    Other(String),
}

/// Paces requests. Implementations are shared by every concurrent request of
/// a client and must synchronize their own state.
pub trait RateLimiter: Send + Sync {
    /// Current window state.
    fn state(&self, now: Instant) -> RateLimitState;

    /// The earliest time the request may be sent.
    fn next(&self, now: Instant, request: &reqwest::Request) -> Result<Instant, RateLimitError>;

    /// Accounts for a received response. `start` is when the logical request
    /// began. A [`RateLimitError::Retry`] asks the caller to resend.
    fn update(&self, start: Instant, response: &reqwest::Response) -> Result<(), RateLimitError>;
}

/// How sends are distributed within a window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Send immediately until the window is used up, then wait for reset.
    #[default]
    Burst,
    /// Space sends evenly across the window.
    Meter,
}

/// Units of the reset timestamp and numeric `Retry-After` values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Units {
    #[default]
    Seconds,
    Milliseconds,
}

impl Units {
    pub fn duration(self, value: u64) -> Duration {
        match self {
            Self::Seconds => Duration::from_secs(value),
            Self::Milliseconds => Duration::from_millis(value),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Requests allowed per window until headers say otherwise.
    pub events: u64,
    pub window: Duration,
    pub mode: Mode,
    pub units: Units,
    /// Upper bound on any single pacing delay.
    pub max_delay: Option<Duration>,
    /// Anchor of the first window; defaults to construction time.
    pub start: Option<Instant>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            events: 60,
            window: Duration::from_secs(60),
            mode: Mode::Burst,
            units: Units::Seconds,
            max_delay: None,
            start: None,
        }
    }
}

#[derive(Debug)]
struct Window {
    limit: u64,
    remaining: u64,
    reset: Instant,
    last: Option<Instant>,
}

impl Window {
    fn roll(&mut self, now: Instant, window: Duration) {
        if now < self.reset || window.is_zero() {
            return;
        }
        let behind = now.duration_since(self.reset).as_nanos();
        let periods = behind / window.as_nanos() + 1;
        let advance = window.as_nanos().saturating_mul(periods);
        let advance = Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX));
        self.reset = self.reset.checked_add(advance).unwrap_or(now + window);
        self.remaining = self.limit;
    }
}

/// A limiter driven by its configured quota and refined by the
/// `X-RateLimit-*` and `Retry-After` headers of responses.
#[derive(Debug)]
pub struct HeaderLimiter {
    config: LimiterConfig,
    window: Mutex<Window>,
}

impl HeaderLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let start = config.start.unwrap_or_else(Instant::now);
        let limit = config.events.max(1);
        Self {
            window: Mutex::new(Window {
                limit,
                remaining: limit,
                reset: start + config.window,
                last: None,
            }),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn cap(&self, now: Instant, at: Instant) -> Instant {
        match self.config.max_delay.and_then(|max| now.checked_add(max)) {
            Some(limit) => at.min(limit),
            None => at,
        }
    }

    /// Converts an epoch timestamp in the configured units. `None` when the
    /// value does not fit a clock.
    fn epoch_to_instant(&self, value: u64) -> Option<Instant> {
        let target = UNIX_EPOCH.checked_add(self.config.units.duration(value))?;
        let wait = target
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        Instant::now().checked_add(wait)
    }

    fn retry_after(&self, value: &HeaderValue) -> Result<Duration, RateLimitError> {
        let invalid = || RateLimitError::InvalidHeader {
            name: RETRY_AFTER.to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        };
        let text = value.to_str().map_err(|_| invalid())?.trim();
        if let Ok(amount) = text.parse::<u64>() {
            return Ok(self.config.units.duration(amount));
        }
        httpdate::parse_http_date(text)
            .map(|at| at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
            .map_err(|_| invalid())
    }
}

impl RateLimiter for HeaderLimiter {
    fn state(&self, now: Instant) -> RateLimitState {
        let mut window = self.lock();
        window.roll(now, self.config.window);
        RateLimitState {
            limit: window.limit,
            remaining: window.remaining,
            reset: window.reset,
        }
    }

    fn next(&self, now: Instant, _request: &reqwest::Request) -> Result<Instant, RateLimitError> {
        if self.config.window.is_zero() {
            return Ok(now);
        }
        let mut window = self.lock();
        window.roll(now, self.config.window);

        let at = match self.config.mode {
            Mode::Burst => {
                if window.remaining > 0 {
                    window.remaining -= 1;
                    now
                } else {
                    // this send opens the next window
                    let at = window.reset;
                    window.reset = at.checked_add(self.config.window).unwrap_or(at);
                    window.remaining = window.limit.saturating_sub(1);
                    at
                }
            }
            Mode::Meter => {
                let divisor = u32::try_from(window.limit.max(1)).unwrap_or(u32::MAX);
                let spacing = self.config.window / divisor;
                let at = match window.last {
                    Some(last) => now.max(last + spacing),
                    None => now,
                };
                window.remaining = window.remaining.saturating_sub(1);
                at
            }
        };

        let at = self.cap(now, at);
        window.last = Some(at);
        Ok(at)
    }

    fn update(&self, _start: Instant, response: &reqwest::Response) -> Result<(), RateLimitError> {
        let headers = response.headers();
        {
            let mut window = self.lock();
            if let Some(limit) = header_number(headers, LIMIT_HEADERS)? {
                window.limit = limit.max(1);
            }
            if let Some(remaining) = header_number(headers, REMAINING_HEADERS)? {
                window.remaining = remaining;
            }
            if let Some(reset) = header_number(headers, RESET_HEADERS)? {
                window.reset = self.epoch_to_instant(reset).ok_or_else(|| {
                    RateLimitError::InvalidHeader {
                        name: "x-ratelimit-reset".to_owned(),
                        value: reset.to_string(),
                    }
                })?;
            }
        }

        if let Some(value) = headers.get(RETRY_AFTER) {
            let delay = self.retry_after(value)?;
            let now = Instant::now();
            let at = now
                .checked_add(delay)
                .ok_or_else(|| RateLimitError::InvalidHeader {
                    name: RETRY_AFTER.to_string(),
                    value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
                })?;
            return Err(RateLimitError::Retry(RetrySignal {
                retry_after: self.cap(now, at),
            }));
        }
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let now = Instant::now();
            let mut window = self.lock();
            window.roll(now, self.config.window);
            let at = window.reset.max(now);
            return Err(RateLimitError::Retry(RetrySignal {
                retry_after: self.cap(now, at),
            }));
        }
        Ok(())
    }
}

const LIMIT_HEADERS: &[&str] = &["x-ratelimit-limit", "x-rate-limit-limit", "ratelimit-limit"];
const REMAINING_HEADERS: &[&str] = &[
    "x-ratelimit-remaining",
    "x-rate-limit-remaining",
    "ratelimit-remaining",
];
const RESET_HEADERS: &[&str] = &["x-ratelimit-reset", "x-rate-limit-reset", "ratelimit-reset"];

/// First numeric value among `names`. Blank values are treated as absent.
fn header_number(headers: &HeaderMap, names: &[&str]) -> Result<Option<u64>, RateLimitError> {
    for name in names {
        let Some(value) = headers.get(*name) else {
            continue;
        };
        let text = String::from_utf8_lossy(value.as_bytes());
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        return text
            .parse::<u64>()
            .map(Some)
            .map_err(|_| RateLimitError::InvalidHeader {
                name: (*name).to_owned(),
                value: text.to_owned(),
            });
    }
    Ok(None)
}
