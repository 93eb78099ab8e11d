//! Shared flash progress, published to pollers as a snapshot.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::FlashError;

pub const INITIAL_MESSAGE: &str = "Initializing flash";
pub const COMPLETE_MESSAGE: &str = "Firmware flash completed successfully";

/// Point-in-time view of the running (or last) operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashProgress {
    pub percentage: u8,
    pub message: String,
    pub complete: bool,
    pub error: bool,
    pub error_message: String,
}

impl Default for FlashProgress {
    fn default() -> Self {
        FlashProgress {
            percentage: 0,
            message: INITIAL_MESSAGE.to_string(),
            complete: false,
            error: false,
            error_message: String::new(),
        }
    }
}

/// Cloneable handle to the process-wide progress state.
///
/// Readers only ever get copies; writes go through a [`FlashSession`], of which
/// at most one exists at a time.
#[derive(Clone, Default)]
pub struct ProgressHandle {
    state: Arc<Mutex<FlashProgress>>,
    busy: Arc<AtomicBool>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> FlashProgress {
        self.state.lock().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claims the single operation slot and resets the published state.
    pub fn begin(&self) -> Result<FlashSession, FlashError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FlashError::Busy);
        }
        *self.state.lock() = FlashProgress::default();
        Ok(FlashSession {
            handle: self.clone(),
        })
    }
}

/// Write access to the progress state for the duration of one operation.
pub struct FlashSession {
    handle: ProgressHandle,
}

impl FlashSession {
    /// Percentage never moves backwards within a session.
    pub fn update(&self, percentage: u8, message: &str) {
        let mut state = self.handle.state.lock();
        state.percentage = percentage.min(100).max(state.percentage);
        state.message = message.to_string();
        state.complete = false;
        state.error = false;
    }

    pub fn complete(&self) {
        self.complete_with(COMPLETE_MESSAGE);
    }

    pub fn complete_with(&self, message: &str) {
        let mut state = self.handle.state.lock();
        state.percentage = 100;
        state.message = message.to_string();
        state.complete = true;
        state.error = false;
    }

    pub fn fail(&self, error_message: &str) {
        let mut state = self.handle.state.lock();
        state.error = true;
        state.complete = false;
        state.error_message = error_message.to_string();
        state.message = error_message.to_string();
    }

    /// Records `error_message` unless a more specific error is already set.
    pub fn fail_if_unset(&self, error_message: &str) {
        if !self.handle.state.lock().error {
            self.fail(error_message);
        }
    }

    pub fn snapshot(&self) -> FlashProgress {
        self.handle.snapshot()
    }
}

impl Drop for FlashSession {
    fn drop(&mut self) {
        self.handle.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_session_is_refused_until_first_ends() {
        let progress = ProgressHandle::new();
        let session = progress.begin().unwrap();
        assert!(matches!(progress.begin(), Err(FlashError::Busy)));
        drop(session);
        assert!(progress.begin().is_ok());
    }

    #[test]
    fn begin_resets_previous_outcome() {
        let progress = ProgressHandle::new();
        {
            let session = progress.begin().unwrap();
            session.update(40, "Writing to flash...");
            session.fail("Failed to write block");
        }
        let _session = progress.begin().unwrap();
        assert_eq!(progress.snapshot(), FlashProgress::default());
    }

    #[test]
    fn percentage_does_not_regress() {
        let progress = ProgressHandle::new();
        let session = progress.begin().unwrap();
        session.update(60, "a");
        session.update(30, "b");
        let snap = progress.snapshot();
        assert_eq!(snap.percentage, 60);
        assert_eq!(snap.message, "b");
    }

    #[test]
    fn fail_if_unset_keeps_specific_message() {
        let progress = ProgressHandle::new();
        let session = progress.begin().unwrap();
        session.fail("Failed to write block");
        session.fail_if_unset("Firmware flash operation failed");
        assert_eq!(progress.snapshot().error_message, "Failed to write block");
    }

    #[test]
    fn complete_sets_full_percentage() {
        let progress = ProgressHandle::new();
        let session = progress.begin().unwrap();
        session.complete();
        let snap = session.snapshot();
        assert!(snap.complete && !snap.error);
        assert_eq!(snap.percentage, 100);
    }
}
