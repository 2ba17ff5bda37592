use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ApiError, Result};

struct Shared {
    token: CancellationToken,
    cause: Mutex<Option<ApiError>>,
}

impl Shared {
    fn cancel(&self, cause: ApiError) {
        let mut slot = self.cause.lock().unwrap_or_else(PoisonError::into_inner);
        if self.token.is_cancelled() {
            return;
        }
        *slot = Some(cause);
        self.token.cancel();
    }

    fn take_cause(&self) -> ApiError {
        self.cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or(ApiError::Canceled)
    }
}

/// Creates a result channel buffering up to `capacity` undelivered results.
pub(crate) fn channel<T>(capacity: usize) -> (ResultWriter<T>, ResultIterator<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        token: CancellationToken::new(),
        cause: Mutex::new(None),
    });
    (
        ResultWriter {
            tx,
            shared: shared.clone(),
        },
        ResultIterator { rx, shared },
    )
}

/// Producer side of a result channel.
pub(crate) struct ResultWriter<T> {
    tx: mpsc::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for ResultWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> ResultWriter<T> {
    /// Delivers one result, waiting for buffer space. Fails once the
    /// iterator is canceled or dropped.
    pub(crate) async fn write(&self, item: T) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => Err(ApiError::Canceled),
            sent = self.tx.send(item) => sent.map_err(|_| ApiError::Canceled),
        }
    }

    /// Terminates iteration with `cause`. Only the first cause is kept.
    pub(crate) fn cancel(&self, cause: ApiError) {
        self.shared.cancel(cause);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.shared.token.is_cancelled() || self.tx.is_closed()
    }
}

/// Asynchronous, cancelable sequence of results.
///
/// Results arrive in completion order. Iteration ends with `Ok(None)` once
/// every result was delivered, or with an error when the sequence was
/// canceled: the cancellation cause is returned once, and
/// [`ApiError::Canceled`] on every later call.
pub struct ResultIterator<T> {
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> std::fmt::Debug for ResultIterator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultIterator")
            .field("canceled", &self.shared.token.is_cancelled())
            .finish()
    }
}

impl<T> ResultIterator<T> {
    /// Waits for the next result.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.shared.token.is_cancelled() {
            return Err(self.shared.take_cause());
        }
        tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => Err(self.shared.take_cause()),
            item = self.rx.recv() => match item {
                Some(item) => Ok(Some(item)),
                // the writer may cancel right before closing
                None if self.shared.token.is_cancelled() => Err(self.shared.take_cause()),
                None => Ok(None),
            },
        }
    }

    /// Stops iteration. Producers observe the cancellation and stop
    /// submitting work; buffered results are discarded.
    pub fn cancel(&self, cause: ApiError) {
        self.shared.cancel(cause);
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Adapts the iterator into a [`Stream`] that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            match iter.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(iter))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl<T> Drop for ResultIterator<T> {
    fn drop(&mut self) {
        self.shared.cancel(ApiError::Canceled);
    }
}
