//! `apiclient` is an async HTTP API client with a resilience pipeline and a
//! request multiplexer.
//!
//! Every request sent through [`ApiClient::execute`] passes the same steps:
//! - authorization by a pluggable [`Authorizer`]
//! - pacing by a pluggable [`RateLimiter`]
//! - bounded retries of rate-limited and recoverable failures
//! - classification of non-success statuses into [`StatusError`]
//!
//! [`multiplex::Mux`] fans batches of requests out over a worker pool and
//! hands results back through a cancelable iterator.

mod client;
mod debug;
mod error;
mod events;
mod options;
mod request;

pub mod auth;
pub mod entity;
pub mod multiplex;
pub mod ratelimit;

pub use auth::{
    Authorizer, BasicAuthorizer, BearerAuthorizer, HeaderAuthorizer, OAuthAuthorizer,
    QueryAuthorizer, StaticTokenSource, Token, TokenSource,
};
pub use client::{ApiClient, MAX_RETRIES};
pub use entity::Entity;
pub use error::{ApiError, RedactedError, StatusCause, StatusError};
pub use events::{Observer, Observers};
pub use options::{ClientOptions, DebugOptions, DEFAULT_RETRY_DELAY, RECOVERABLE_STATUSES};
pub use ratelimit::{
    HeaderLimiter, LimiterConfig, RateLimitError, RateLimitState, RateLimiter, RetrySignal,
};
pub use request::{url_with_params, Request};
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, ApiError>;
