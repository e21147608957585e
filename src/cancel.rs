use crate::ResolveError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A cloneable cancellation flag.
///
/// The walker checks the token before every cursor call; once cancelled,
/// the current read view is abandoned and no partial results are surfaced.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the active state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. All clones observe the flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Returns `true` if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns [`ResolveError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<(), ResolveError> {
        if self.is_cancelled() {
            return Err(ResolveError::Cancelled)
        }
        Ok(())
    }
}
