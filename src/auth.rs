//! Request authorization strategies.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use headers::{Authorization, HeaderMapExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

/// Authorization failure. Variants never carry credential values.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// A header name or value could not be used.
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    /// Credentials could not be encoded into a header.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The token source could not provide a token.
    #[error("token source failed: {0}")]
    TokenSource(String),
}

/// Adds credentials to an outgoing request.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &mut reqwest::Request) -> Result<(), AuthError>;
}

#[async_trait]
impl<A> Authorizer for Arc<A>
where
    A: Authorizer + ?Sized,
{
    async fn authorize(&self, request: &mut reqwest::Request) -> Result<(), AuthError> {
        (**self).authorize(request).await
    }
}

/// Sets a fixed set of headers, replacing any value already present.
#[derive(Clone)]
pub struct HeaderAuthorizer {
    headers: HeaderMap,
}

impl HeaderAuthorizer {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// Builds an authorizer for a single `name: value` header.
    pub fn single(name: &str, value: &str) -> Result<Self, AuthError> {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| AuthError::InvalidHeader(name.to_owned()))?;
        let mut value =
            HeaderValue::from_str(value).map_err(|_| AuthError::InvalidHeader(name.to_owned()))?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(header, value);
        Ok(Self::new(headers))
    }
}

impl fmt::Debug for HeaderAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderAuthorizer")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Authorizer for HeaderAuthorizer {
    async fn authorize(&self, request: &mut reqwest::Request) -> Result<(), AuthError> {
        for name in self.headers.keys() {
            if let Some(value) = self.headers.get(name) {
                request.headers_mut().insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Appends credentials as query parameters.
#[derive(Clone)]
pub struct QueryAuthorizer {
    params: Vec<(String, String)>,
}

impl QueryAuthorizer {
    pub fn new<I, K, V>(params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            params: params
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

impl fmt::Debug for QueryAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryAuthorizer")
            .field(
                "params",
                &self.params.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
impl Authorizer for QueryAuthorizer {
    async fn authorize(&self, request: &mut reqwest::Request) -> Result<(), AuthError> {
        request
            .url_mut()
            .query_pairs_mut()
            .extend_pairs(self.params.iter());
        Ok(())
    }
}

/// HTTP basic authentication.
#[derive(Clone)]
pub struct BasicAuthorizer {
    username: String,
    password: String,
}

impl BasicAuthorizer {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BasicAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthorizer")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl Authorizer for BasicAuthorizer {
    async fn authorize(&self, request: &mut reqwest::Request) -> Result<(), AuthError> {
        request
            .headers_mut()
            .typed_insert(Authorization::basic(&self.username, &self.password));
        Ok(())
    }
}

/// `Authorization: Bearer <token>`.
#[derive(Clone)]
pub struct BearerAuthorizer {
    token: String,
}

impl BearerAuthorizer {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for BearerAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerAuthorizer")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl Authorizer for BearerAuthorizer {
    async fn authorize(&self, request: &mut reqwest::Request) -> Result<(), AuthError> {
        let bearer =
            Authorization::bearer(&self.token).map_err(|_| AuthError::InvalidCredentials)?;
        request.headers_mut().typed_insert(bearer);
        Ok(())
    }
}

/// An OAuth access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    /// Token type as issued, e.g. `bearer`. Defaults to `Bearer` when absent.
    pub token_type: Option<String>,
}

impl Token {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: None,
        }
    }

    /// The scheme used in the `Authorization` header.
    pub fn scheme(&self) -> String {
        match self.token_type.as_deref() {
            None | Some("") => "Bearer".to_owned(),
            Some(kind) if kind.eq_ignore_ascii_case("bearer") => "Bearer".to_owned(),
            Some(kind) if kind.eq_ignore_ascii_case("mac") => "MAC".to_owned(),
            Some(kind) if kind.eq_ignore_ascii_case("basic") => "Basic".to_owned(),
            Some(kind) => kind.to_owned(),
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Supplies OAuth tokens, refreshing them as needed.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<Token, AuthError>;
}

/// A token source that always returns the same token.
#[derive(Clone, Debug)]
pub struct StaticTokenSource(pub Token);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<Token, AuthError> {
        Ok(self.0.clone())
    }
}

/// Authorizes with a token obtained from a [`TokenSource`] on every request.
#[derive(Clone)]
pub struct OAuthAuthorizer {
    source: Arc<dyn TokenSource>,
}

impl OAuthAuthorizer {
    pub fn new(source: impl TokenSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    pub async fn token(&self) -> Result<Token, AuthError> {
        self.source.token().await
    }
}

impl fmt::Debug for OAuthAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthAuthorizer").finish_non_exhaustive()
    }
}

#[async_trait]
impl Authorizer for OAuthAuthorizer {
    async fn authorize(&self, request: &mut reqwest::Request) -> Result<(), AuthError> {
        let token = self.source.token().await?;
        let mut value = HeaderValue::from_str(&format!("{} {}", token.scheme(), token.access_token))
            .map_err(|_| AuthError::InvalidCredentials)?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}
