use reqwest::Method;

use crate::{Request, Result};

/// Supplies the requests of a multiplexed run.
///
/// The multiplexer asks for indices `0, 1, 2, ...` in order and stops at the
/// first `Ok(None)`. An error ends the run and is reported by the result
/// iterator.
pub trait RequestProducer: Send {
    fn request(&mut self, index: usize) -> Result<Option<Request>>;
}

impl<F> RequestProducer for F
where
    F: FnMut(usize) -> Result<Option<Request>> + Send,
{
    fn request(&mut self, index: usize) -> Result<Option<Request>> {
        self(index)
    }
}

impl RequestProducer for Vec<Request> {
    fn request(&mut self, index: usize) -> Result<Option<Request>> {
        Ok(self.get(index).cloned())
    }
}

/// Produces one bodyless request per URL.
#[derive(Clone, Debug)]
pub struct UrlRequestProducer {
    method: Method,
    urls: Vec<String>,
}

impl UrlRequestProducer {
    pub fn new(method: Method, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            method,
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }

    pub fn get(urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(Method::GET, urls)
    }

    pub fn delete(urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(Method::DELETE, urls)
    }
}

impl RequestProducer for UrlRequestProducer {
    fn request(&mut self, index: usize) -> Result<Option<Request>> {
        Ok(self
            .urls
            .get(index)
            .map(|url| Request::new(self.method.clone(), url.clone())))
    }
}
