//! Central observation of client activity, e.g. for uniform logging of
//! failures across every request a client makes.

use std::{fmt, sync::Arc};

use crate::{ApiError, Result};

/// Hooks invoked by the request pipeline. Every method has a no-op default.
pub trait Observer: Send + Sync {
    /// Called once per logical request, before the first send. An error
    /// aborts the request.
    fn will_send_request(&self, _request: &reqwest::Request) -> Result<()> {
        Ok(())
    }

    /// Called with the final successful response.
    fn did_receive_response(
        &self,
        _request: &reqwest::Request,
        _response: &reqwest::Response,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a request that reached the transport ends in an error.
    fn request_failed(&self, _request: &reqwest::Request, _error: &ApiError) {}
}

impl<O> Observer for Arc<O>
where
    O: Observer + ?Sized,
{
    fn will_send_request(&self, request: &reqwest::Request) -> Result<()> {
        (**self).will_send_request(request)
    }

    fn did_receive_response(
        &self,
        request: &reqwest::Request,
        response: &reqwest::Response,
    ) -> Result<()> {
        (**self).did_receive_response(request, response)
    }

    fn request_failed(&self, request: &reqwest::Request, error: &ApiError) {
        (**self).request_failed(request, error)
    }
}

#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn Observer>>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.observers.len())
            .finish()
    }
}

impl Observers {
    pub fn add(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) fn will_send_request(&self, request: &reqwest::Request) -> Result<()> {
        self.observers
            .iter()
            .try_for_each(|observer| observer.will_send_request(request))
    }

    pub(crate) fn did_receive_response(
        &self,
        request: &reqwest::Request,
        response: &reqwest::Response,
    ) -> Result<()> {
        self.observers
            .iter()
            .try_for_each(|observer| observer.did_receive_response(request, response))
    }

    pub(crate) fn request_failed(&self, request: &reqwest::Request, error: &ApiError) {
        for observer in &self.observers {
            observer.request_failed(request, error);
        }
    }
}
