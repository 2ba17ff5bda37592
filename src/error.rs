use std::fmt;

use reqwest::{Method, StatusCode};
use serde::Serialize;

use crate::{auth::AuthError, ratelimit::RateLimitError, Entity};

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request target could not be resolved to an absolute URL.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    /// The outgoing request could not be built or replayed.
    #[error("invalid request: {0}")]
    Request(String),
    /// The configured authorizer failed. Credential values are never part of
    /// this error.
    #[error("could not authorize request: {0}")]
    Authorization(#[source] AuthError),
    /// Network or request execution error from `reqwest`. Never retried.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    /// Non-success HTTP status that was not retried away.
    #[error(transparent)]
    Status(Box<StatusError>),
    /// The rate limiter failed or the retry budget ran out while it kept
    /// asking for retries.
    #[error("[{request_id:06}] {method} {url}: rate limit error: {source}")]
    RateLimit {
        request_id: u64,
        method: Method,
        url: String,
        #[source]
        source: RateLimitError,
    },
    /// The caller's cancellation token fired.
    #[error("request canceled")]
    Canceled,
    /// An entity could not be encoded for the requested content type.
    #[error("could not marshal entity: {0}")]
    Marshal(String),
    /// A response body could not be decoded.
    #[error("could not unmarshal entity: {0}")]
    Unmarshal(String),
    /// No codec exists for the content type.
    #[error("unsupported content type '{0}'")]
    UnsupportedMimetype(String),
    /// A request observer rejected the request before it was sent.
    #[error("request rejected by observer: {0}")]
    Observer(String),
    /// A request producer failed while building a multiplexed request.
    #[error("could not produce request {index}: {source}")]
    Producer {
        index: usize,
        #[source]
        source: Box<ApiError>,
    },
    /// A multiplexed request failed and no error handler recovered it.
    #[error("could not multiplex request {index}: {source}")]
    Multiplex {
        index: usize,
        #[source]
        source: Box<ApiError>,
    },
    /// A multiplexer worker panicked while running a request.
    #[error("request worker panicked: {0}")]
    Panicked(String),
    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// Returns the sentinel cause for status errors, looking through
    /// multiplexer and producer wrapping.
    pub fn cause(&self) -> Option<StatusCause> {
        self.status_error().and_then(|err| err.cause)
    }

    /// Returns the HTTP status for status errors.
    pub fn status(&self) -> Option<StatusCode> {
        self.status_error().map(|err| err.status)
    }

    /// Returns the classified status error, if this is one.
    pub fn status_error(&self) -> Option<&StatusError> {
        match self {
            Self::Status(err) => Some(err),
            Self::Multiplex { source, .. } | Self::Producer { source, .. } => {
                source.status_error()
            }
            _ => None,
        }
    }

    /// True when the error was caused by cancellation.
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Canceled => true,
            Self::Multiplex { source, .. } | Self::Producer { source, .. } => {
                source.is_canceled()
            }
            _ => false,
        }
    }
}

impl From<StatusError> for ApiError {
    fn from(err: StatusError) -> Self {
        Self::Status(Box::new(err))
    }
}

/// Sentinel causes for common status codes, usable for matching without
/// inspecting message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum StatusCause {
    #[error("bad request")]
    BadRequest,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("unprocessable entity")]
    UnprocessableEntity,
    #[error("internal server error")]
    InternalServerError,
}

impl StatusCause {
    pub fn from_status(status: StatusCode) -> Option<Self> {
        match status {
            StatusCode::BAD_REQUEST => Some(Self::BadRequest),
            StatusCode::UNAUTHORIZED => Some(Self::Unauthorized),
            StatusCode::FORBIDDEN => Some(Self::Forbidden),
            StatusCode::NOT_FOUND => Some(Self::NotFound),
            StatusCode::UNPROCESSABLE_ENTITY => Some(Self::UnprocessableEntity),
            StatusCode::INTERNAL_SERVER_ERROR => Some(Self::InternalServerError),
            _ => None,
        }
    }
}

/// A non-success response converted into an error.
#[derive(Clone, Debug)]
pub struct StatusError {
    /// Pipeline request id, for correlating with log lines.
    pub request_id: u64,
    pub status: StatusCode,
    pub method: Method,
    pub url: String,
    /// Response body captured before anything else read it.
    pub entity: Option<Entity>,
    pub message: String,
    pub cause: Option<StatusCause>,
}

impl StatusError {
    /// Classifies an unexpected status code.
    pub fn unexpected(
        request_id: u64,
        method: Method,
        url: impl Into<String>,
        status: StatusCode,
        entity: Option<Entity>,
    ) -> Self {
        Self {
            request_id,
            status,
            method,
            url: url.into(),
            entity,
            message: format!(
                "unexpected status code: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_owned(),
            cause: StatusCause::from_status(status),
        }
    }

    /// Returns a form of this error that is safe to serialize into logs or
    /// responses: no entity, no cause chain.
    pub fn redacted(&self) -> RedactedError {
        RedactedError {
            request: format!("{} {}", self.method, self.url),
            message: self.message.clone(),
        }
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.method, self.url, self.message)?;
        if let Some(cause) = self.cause {
            write!(f, "; because: {cause}")?;
        }
        if let Some(entity) = &self.entity {
            write!(f, "\n{entity}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Serializable, entity-free view of a [`StatusError`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{request}: {message}")]
pub struct RedactedError {
    pub request: String,
    pub message: String,
}
