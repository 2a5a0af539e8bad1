//! Progress and corruption event callbacks
//!
//! Callers observe the installer through an optional capability set rather
//! than a listener trait; each callback can be set independently.

use crate::index::VerifyOutcome;

type ProgressFn = dyn Fn(usize, u64, u64) + Send + Sync;
type CorruptionFn = dyn Fn(usize, usize, VerifyOutcome) + Send + Sync;

/// Optional event callbacks emitted during verification and install
///
/// Progress callbacks receive `(current_index, bytes_done, bytes_total)`
/// where the first value is the target index for verification and the
/// source-patch index for installs. The corruption callback receives
/// `(target_index, part_index, outcome)` for every part that failed
/// verification.
#[derive(Default)]
pub struct InstallerEvents {
    on_verify_progress: Option<Box<ProgressFn>>,
    on_install_progress: Option<Box<ProgressFn>>,
    on_corruption_found: Option<Box<CorruptionFn>>,
}

impl InstallerEvents {
    /// Create an event set with no callbacks registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a verification progress callback
    pub fn on_verify_progress(
        mut self,
        callback: impl Fn(usize, u64, u64) + Send + Sync + 'static,
    ) -> Self {
        self.on_verify_progress = Some(Box::new(callback));
        self
    }

    /// Register an install progress callback
    pub fn on_install_progress(
        mut self,
        callback: impl Fn(usize, u64, u64) + Send + Sync + 'static,
    ) -> Self {
        self.on_install_progress = Some(Box::new(callback));
        self
    }

    /// Register a corruption callback
    pub fn on_corruption_found(
        mut self,
        callback: impl Fn(usize, usize, VerifyOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.on_corruption_found = Some(Box::new(callback));
        self
    }

    pub(crate) fn emit_verify_progress(&self, target_index: usize, done: u64, total: u64) {
        if let Some(callback) = &self.on_verify_progress {
            callback(target_index, done, total);
        }
    }

    pub(crate) fn emit_install_progress(&self, source_index: usize, done: u64, total: u64) {
        if let Some(callback) = &self.on_install_progress {
            callback(source_index, done, total);
        }
    }

    pub(crate) fn emit_corruption(&self, target_index: usize, part_index: usize, outcome: VerifyOutcome) {
        if let Some(callback) = &self.on_corruption_found {
            callback(target_index, part_index, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::Arc;

    #[test]
    fn unset_callbacks_are_silent() {
        let events = InstallerEvents::new();
        events.emit_verify_progress(0, 0, 0);
        events.emit_install_progress(0, 0, 0);
        events.emit_corruption(0, 0, VerifyOutcome::BadData);
    }

    #[test]
    fn registered_callback_is_invoked() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let events = InstallerEvents::new()
            .on_corruption_found(move |target, part, _| sink.lock().unwrap().push((target, part)));

        events.emit_corruption(3, 7, VerifyOutcome::NotEnoughData);
        assert_eq!(*seen.lock().unwrap(), vec![(3, 7)]);
    }
}
