//! Bounded-concurrency fan-out of many requests through one [`ApiClient`].
//!
//! A [`Mux`] drives a [`RequestProducer`] through a worker pool and delivers
//! responses through a [`ResultIterator`] as they complete. The first
//! unrecovered failure cancels the whole run.
//!
//! ```no_run
//! # async fn demo(client: apiclient::ApiClient) -> apiclient::Result<()> {
//! use apiclient::{
//!     multiplex::{self, Mux, MuxOptions, UrlRequestProducer},
//!     CancellationToken,
//! };
//!
//! let mux = Mux::new(client, 8);
//! let urls = (0..100).map(|i| format!("items/{i}"));
//! let iter = mux.run(
//!     &CancellationToken::new(),
//!     UrlRequestProducer::get(urls),
//!     MuxOptions::default(),
//! );
//! let items: Vec<serde_json::Value> = multiplex::unmarshal(iter).await?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod iter;
mod producer;

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Response,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{entity, options::env_flag, ApiClient, ApiError, Request, Result};

use dispatch::Dispatcher;
use iter::ResultWriter;

pub use iter::ResultIterator;
pub use producer::{RequestProducer, UrlRequestProducer};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
}

/// Gets the first chance to recover a failed multiplexed request.
///
/// Return `Ok(Some(response))` to substitute a response, `Ok(None)` to drop
/// the result for that index, or an error to fail the run.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, err: ApiError) -> Result<Option<Response>>;
}

impl<F> ErrorHandler for F
where
    F: Fn(ApiError) -> Result<Option<Response>> + Send + Sync,
{
    fn handle(&self, err: ApiError) -> Result<Option<Response>> {
        self(err)
    }
}

/// Per-run settings.
#[derive(Clone, Default)]
pub struct MuxOptions {
    /// Takes precedence over the handler configured on the [`Mux`].
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    /// Set on every produced request, replacing values it already has.
    pub headers: HeaderMap,
}

impl fmt::Debug for MuxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxOptions")
            .field("error_handler", &self.error_handler.is_some())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MuxOptions {
    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    fn configure(&self, request: &mut Request) {
        let target = request.headers_mut();
        for name in self.headers.keys() {
            target.remove(name);
            for value in self.headers.get_all(name) {
                target.append(name.clone(), value.clone());
            }
        }
    }
}

/// A completed multiplexed request and the producer index it came from.
#[derive(Debug)]
pub struct Outcome {
    pub index: usize,
    pub response: Response,
}

/// Runs batches of requests through a client with at most `concurrency`
/// requests in flight.
///
/// `VERBOSE_API_MUX` and `DEBUG_API_MUX` enable per-request tracing.
#[derive(Clone)]
pub struct Mux {
    client: ApiClient,
    concurrency: usize,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    verbose: bool,
    debug: bool,
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("client", &self.client)
            .field("concurrency", &self.concurrency)
            .field("error_handler", &self.error_handler.is_some())
            .field("verbose", &self.verbose)
            .field("debug", &self.debug)
            .finish()
    }
}

impl Mux {
    /// Creates a multiplexer; `concurrency` is raised to at least 1.
    pub fn new(client: ApiClient, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
            error_handler: None,
            verbose: env_flag("VERBOSE_API_MUX"),
            debug: env_flag("DEBUG_API_MUX"),
        }
    }

    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_tracing(mut self, verbose: bool, debug: bool) -> Self {
        self.verbose = verbose;
        self.debug = debug;
        self
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Starts executing the requests of `producer` and returns the iterator
    /// their responses are delivered through.
    ///
    /// Production stops when the producer is exhausted, when `cancel` fires,
    /// when the iterator is canceled or dropped, or after the first
    /// unrecovered failure, which then becomes the iterator's error. Must be
    /// called within a Tokio runtime.
    pub fn run<P>(
        &self,
        cancel: &CancellationToken,
        producer: P,
        options: MuxOptions,
    ) -> ResultIterator<Outcome>
    where
        P: RequestProducer + 'static,
    {
        let (writer, iter) = iter::channel(self.concurrency);
        let run = Run {
            mux: self.clone(),
            handler: options
                .error_handler
                .clone()
                .or_else(|| self.error_handler.clone()),
            options,
            cancel: cancel.clone(),
        };
        tokio::spawn(run.produce(producer, writer));
        iter
    }
}

struct Run {
    mux: Mux,
    options: MuxOptions,
    handler: Option<Arc<dyn ErrorHandler>>,
    cancel: CancellationToken,
}

impl Run {
    async fn produce<P>(self, mut producer: P, writer: ResultWriter<Outcome>)
    where
        P: RequestProducer,
    {
        let failing = writer.clone();
        let dispatcher = Dispatcher::new(self.mux.concurrency, &self.cancel, move |err| {
            failing.cancel(err);
        });

        for index in 0.. {
            if self.cancel.is_cancelled() || writer.is_canceled() {
                break;
            }
            let mut request = match producer.request(index) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(err) => {
                    writer.cancel(ApiError::Producer {
                        index,
                        source: Box::new(err),
                    });
                    break;
                }
            };
            self.options.configure(&mut request);

            let unit = self.unit(index, request, writer.clone());
            if dispatcher.exec(unit).await.is_err() {
                // stopped by a failed unit or the caller
                break;
            }
        }

        // a failed unit has already canceled the writer with its error
        dispatcher.wait().await;
        if !dispatcher.failed() && self.cancel.is_cancelled() {
            writer.cancel(ApiError::Canceled);
        }
    }

    fn unit(
        &self,
        index: usize,
        request: Request,
        writer: ResultWriter<Outcome>,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        let client = self.mux.client.clone();
        let handler = self.handler.clone();
        let cancel = self.cancel.clone();
        let (verbose, debug) = (self.mux.verbose, self.mux.debug);

        async move {
            let id = next_sequence();
            let start = Instant::now();
            let method = request.method().clone();
            let target = request.target().to_owned();
            if debug && verbose {
                tracing::debug!(mux_id = id, index, ">>> {} {}", method, target);
            }

            let response = match client.execute_with_cancel(request, &cancel).await {
                Ok(response) => Some(response),
                Err(err) => match &handler {
                    Some(handler) => handler.handle(err).map_err(|source| ApiError::Multiplex {
                        index,
                        source: Box::new(source),
                    })?,
                    None => {
                        return Err(ApiError::Multiplex {
                            index,
                            source: Box::new(err),
                        })
                    }
                },
            };
            let Some(response) = response else {
                return Ok(());
            };

            if debug {
                tracing::debug!(
                    mux_id = id,
                    index,
                    elapsed = ?start.elapsed(),
                    "<<< {} {}: {}",
                    method,
                    target,
                    response.status()
                );
            }
            writer.write(Outcome { index, response }).await
        }
    }
}

/// Drains `iter` and returns the responses in producer order.
pub async fn collect(mut iter: ResultIterator<Outcome>) -> Result<Vec<Response>> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = iter.next().await? {
        outcomes.push(outcome);
    }
    outcomes.sort_by_key(|outcome| outcome.index);
    Ok(outcomes
        .into_iter()
        .map(|outcome| outcome.response)
        .collect())
}

/// Like [`collect`], decoding each response body into `E` by content type.
pub async fn unmarshal<E>(iter: ResultIterator<Outcome>) -> Result<Vec<E>>
where
    E: DeserializeOwned,
{
    let responses = collect(iter).await?;
    let mut entities = Vec::with_capacity(responses.len());
    for response in responses {
        entities.push(entity::from_response(response).await?);
    }
    Ok(entities)
}
