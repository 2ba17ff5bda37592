use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method, Url,
};
use serde::Serialize;

use crate::{entity, ApiError, Result};

/// An outgoing request.
///
/// The target may be an absolute URL or a reference relative to the
/// client's base URL. The body is held in memory so the request can be
/// replayed on retries.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    target: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    /// Sets a header, replacing any earlier value.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Like [`Request::header`], parsing both parts.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ApiError::Request(format!("invalid header name '{name}': {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| ApiError::Request(format!("invalid value for header '{name}': {err}")))?;
        Ok(self.header(header, value))
    }

    /// Sets a raw body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Marshals `entity` as `content_type` and sets the `Content-Type` header
    /// unless one is already present.
    pub fn entity<T>(mut self, content_type: &str, entity: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.body = Some(entity::marshal(content_type, entity)?);
        if !self.headers.contains_key(CONTENT_TYPE) {
            let value = HeaderValue::from_str(content_type).map_err(|err| {
                ApiError::Request(format!("invalid content type '{content_type}': {err}"))
            })?;
            self.headers.insert(CONTENT_TYPE, value);
        }
        Ok(self)
    }

    pub fn json<T>(self, entity: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.entity(entity::JSON, entity)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Resolves the target against `base` and builds the transport request.
    pub(crate) fn resolve(self, base: Option<&Url>) -> Result<reqwest::Request> {
        let url = resolve_url(base, &self.target)?;
        let mut request = reqwest::Request::new(self.method, url);
        *request.headers_mut() = self.headers;
        if let Some(body) = self.body {
            *request.body_mut() = Some(body.into());
        }
        Ok(request)
    }
}

fn resolve_url(base: Option<&Url>, target: &str) -> Result<Url> {
    let invalid = |reason: String| ApiError::InvalidUrl {
        url: target.to_owned(),
        reason,
    };
    match Url::parse(target) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => base.join(target).map_err(|err| invalid(err.to_string())),
            None => Err(invalid("relative url without a base url".to_owned())),
        },
        Err(err) => Err(invalid(err.to_string())),
    }
}

/// Replaces the query of `url` with `params` encoded as a form.
pub fn url_with_params<P>(url: &str, params: &P) -> Result<String>
where
    P: Serialize + ?Sized,
{
    let mut parsed = Url::parse(url).map_err(|err| ApiError::InvalidUrl {
        url: url.to_owned(),
        reason: err.to_string(),
    })?;
    let query =
        serde_urlencoded::to_string(params).map_err(|err| ApiError::Marshal(err.to_string()))?;
    parsed.set_query((!query.is_empty()).then_some(query.as_str()));
    Ok(parsed.into())
}
