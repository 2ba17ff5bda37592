use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{ApiError, Result};

type FailureHook = Arc<dyn Fn(ApiError) + Send + Sync>;

/// Runs units of work on at most `workers` concurrent tasks.
///
/// The first unit that fails or panics cancels the dispatcher: its error goes
/// to the failure hook right away, units already running finish, and nothing
/// new is accepted.
pub(crate) struct Dispatcher {
    workers: u32,
    permits: Arc<Semaphore>,
    token: CancellationToken,
    failed: Arc<AtomicBool>,
    on_failure: FailureHook,
}

impl Dispatcher {
    pub(crate) fn new<H>(workers: usize, parent: &CancellationToken, on_failure: H) -> Self
    where
        H: Fn(ApiError) + Send + Sync + 'static,
    {
        let workers = u32::try_from(workers.max(1)).unwrap_or(u32::MAX);
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers as usize)),
            token: parent.child_token(),
            failed: Arc::new(AtomicBool::new(false)),
            on_failure: Arc::new(on_failure),
        }
    }

    /// Submits `unit`, waiting for a free worker.
    pub(crate) async fn exec<F>(&self, unit: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(ApiError::Canceled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ApiError::Canceled)?
            }
        };

        let token = self.token.clone();
        let failed = self.failed.clone();
        let on_failure = self.on_failure.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(ApiError::Panicked(panic_message(payload.as_ref()))),
            };
            if let Err(err) = outcome {
                if !failed.swap(true, Ordering::SeqCst) {
                    tracing::debug!(error = %err, "dispatcher stopped by failed unit");
                    on_failure(err);
                }
                token.cancel();
            }
            drop(permit);
        });
        Ok(())
    }

    /// Waits until every submitted unit has finished.
    pub(crate) async fn wait(&self) {
        // Holding all permits means no unit is running.
        if let Ok(all) = self.permits.acquire_many(self.workers).await {
            drop(all);
        }
    }

    /// True once a unit has failed.
    pub(crate) fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
