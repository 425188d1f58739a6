//! Cooperative cancellation, passed explicitly to every operation that can
//! suspend or block.

use crate::signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default, Debug)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    /// Whether a SIGINT also counts as cancellation.
    follows_sigint: bool,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    /// A token that also trips when the process receives SIGINT.
    pub fn with_sigint() -> Self {
        signal::register_sigint();
        CancellationToken {
            flag: Arc::default(),
            follows_sigint: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.follows_sigint && signal::was_interrupted())
    }

    /// Convenience for `?`-style checks at suspension points.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;
