//! Progress reporting for long-running operations

/// Receives `(processed, total)` updates
pub trait Progress: Send + Sync {
    fn update_progress(&self, processed: u64, total: u64);
}

/// Progress sink that ignores every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProgress;

impl Progress for NoOpProgress {
    fn update_progress(&self, _processed: u64, _total: u64) {}
}
