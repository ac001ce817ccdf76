//! Request completions
//!
//! Remote protocols run as spawned tasks. The caller holds a [`Completion`]
//! and suspends on it until the request finishes. Dropping the completion does
//! not cancel the request: it keeps running to success or failure.

use blockimg_common::{Error, Result};
use std::future::Future;
use tokio::sync::oneshot;

/// Handle to the result of a spawned request
#[must_use = "a completion does nothing unless waited on"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> Completion<T> {
    /// Spawn `request` on the runtime and return its completion
    pub fn spawn<F>(request: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            // The waiter may have gone away; the request still ran.
            let _ = tx.send(request.await);
        });
        Self { rx }
    }

    /// Wait for the request to finish
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| Error::internal("request task terminated without completing"))?
    }
}
