//! Cooperative cancellation for verification and install operations

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

struct Flag {
    cancelled: AtomicBool,
    parent: Option<Arc<Flag>>,
}

impl Flag {
    fn is_set(&self) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_set(),
            None => false,
        }
    }
}

/// Simple cancellation token implementation
///
/// Cloned tokens share one flag. A [`child`](Self::child) token observes its
/// parent's cancellation but can be cancelled on its own without affecting
/// the parent, which is how the scheduler tears down in-flight workers
/// without cancelling the caller's token.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<Flag>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a new cancellation token
    pub fn new() -> Self {
        Self {
            flag: Arc::new(Flag {
                cancelled: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Derive a token that is cancelled when either it or `self` is cancelled
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(Flag {
                cancelled: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.flag)),
            }),
        }
    }

    /// Cancel the operation
    pub fn cancel(&self) {
        self.flag.cancelled.store(true, Ordering::Relaxed);
    }

    /// Check if the operation has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.flag.is_set()
    }

    /// Return [`Error::Cancelled`] if the token has been cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until the operation is cancelled
    pub async fn cancelled(&self) {
        // Simple polling approach - check every 10ms
        while !self.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
