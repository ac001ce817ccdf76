//! Compensating rollback
//!
//! Multi-step remote protocols commit every step independently. Each step
//! that succeeds pushes the action that undoes it; a terminal failure unwinds
//! the stack in reverse order, a success commits it. Nothing runs on drop.

use blockimg_common::Result;
use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Stack of compensating actions
#[derive(Default)]
pub struct RollbackStack {
    actions: Vec<(String, Compensation)>,
}

impl RollbackStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the action undoing the step that just succeeded
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.actions
            .push((label.into(), Box::new(move || Box::pin(action()))));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Discard every pending action
    pub fn commit(mut self) {
        self.actions.clear();
    }

    /// Run every pending action, most recent first. Failures are logged and
    /// do not stop the remaining actions.
    pub async fn unwind(mut self) {
        let actions = std::mem::take(&mut self.actions);
        for (label, action) in actions.into_iter().rev() {
            debug!("Rolling back: {}", label);
            if let Err(e) = action().await {
                warn!(step = %label, error = %e, "Rollback step failed");
            }
        }
    }
}

impl Drop for RollbackStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(
                pending = self.actions.len(),
                "Rollback stack dropped without commit or unwind"
            );
        }
    }
}
