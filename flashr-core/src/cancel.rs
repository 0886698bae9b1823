use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shared flag for cooperative cancellation.
///
/// Clones share the same flag. Long-running loops check it at every chunk
/// boundary; setting it never interrupts a blocking call on its own.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears a previous request so the token can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
