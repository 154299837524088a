use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Session-wide cooperative cancellation signal.
///
/// The session checks the token at every `require`; once cancelled, no task
/// output produced afterwards is committed.
#[derive(Debug, Clone, Default)]
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
}
