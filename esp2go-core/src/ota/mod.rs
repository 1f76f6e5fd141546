// Firmware update: tracker, single-slot scheduler and the flashing pipeline.
//
// Update flow:
// 1. Accept a request (stored image path, or an upload stream)
// 2. Quiesce other capabilities (stored images only)
// 3. Write the image into the inactive partition
// 4. Verify, mark bootable
// 5. Restart

pub mod pipeline;
pub mod scheduler;

pub use pipeline::{UpdateError, UpdatePipeline, CHUNK_SIZE};
pub use scheduler::{UpdateRequest, UpdateScheduler};

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    StoredImage,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Pending { path: String },
    InProgress { source: UpdateSource },
    Verifying,
    Succeeded,
    Failed(String),
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Pending { .. } => "pending",
            UpdateState::InProgress { .. } => "in_progress",
            UpdateState::Verifying => "verifying",
            UpdateState::Succeeded => "succeeded",
            UpdateState::Failed(_) => "failed",
        }
    }

    /// A request is accepted or running; a second one must be refused.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            UpdateState::Pending { .. } | UpdateState::InProgress { .. } | UpdateState::Verifying
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSnapshot {
    pub state: UpdateState,
    pub progress: u8,
    pub bytes_written: usize,
    pub total_bytes: Option<usize>,
    pub last_error: Option<String>,
}

impl UpdateSnapshot {
    pub fn update_in_progress(&self) -> bool {
        matches!(
            self.state,
            UpdateState::InProgress { .. } | UpdateState::Verifying
        )
    }
}

#[derive(Debug)]
struct TrackerInner {
    state: UpdateState,
    bytes_written: usize,
    total_bytes: Option<usize>,
    last_error: Option<String>,
}

/// Shared update state. HTTP handlers and the main loop both touch it, so
/// every transition happens under one lock.
#[derive(Debug)]
pub struct UpdateTracker {
    inner: Mutex<TrackerInner>,
}

impl Default for UpdateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                state: UpdateState::Idle,
                bytes_written: 0,
                total_bytes: None,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> UpdateState {
        self.lock().state.clone()
    }

    pub fn snapshot(&self) -> UpdateSnapshot {
        let inner = self.lock();
        let progress = match (&inner.state, inner.total_bytes) {
            (UpdateState::Succeeded, _) | (UpdateState::Verifying, _) => 100,
            (_, Some(total)) if total > 0 => {
                ((inner.bytes_written.min(total) * 100) / total) as u8
            }
            _ => 0,
        };
        UpdateSnapshot {
            state: inner.state.clone(),
            progress,
            bytes_written: inner.bytes_written,
            total_bytes: inner.total_bytes,
            last_error: inner.last_error.clone(),
        }
    }

    /// Idle (or a finished attempt) to Pending. Fails while another request
    /// is accepted or running.
    pub fn claim_pending(&self, path: &str) -> Result<(), UpdateError> {
        let mut inner = self.lock();
        if inner.state.is_busy() {
            return Err(UpdateError::Busy);
        }
        inner.state = UpdateState::Pending {
            path: path.to_string(),
        };
        inner.bytes_written = 0;
        inner.total_bytes = None;
        Ok(())
    }

    /// Straight to InProgress for an upload, which skips scheduling.
    pub fn claim_stream(&self, total: Option<usize>) -> Result<(), UpdateError> {
        let mut inner = self.lock();
        if inner.state.is_busy() {
            return Err(UpdateError::Busy);
        }
        inner.state = UpdateState::InProgress {
            source: UpdateSource::Upload,
        };
        inner.bytes_written = 0;
        inner.total_bytes = total;
        inner.last_error = None;
        Ok(())
    }

    pub fn start_deferred(&self, total: usize) {
        let mut inner = self.lock();
        inner.state = UpdateState::InProgress {
            source: UpdateSource::StoredImage,
        };
        inner.bytes_written = 0;
        inner.total_bytes = Some(total);
        inner.last_error = None;
    }

    pub fn record_progress(&self, bytes_written: usize) {
        self.lock().bytes_written = bytes_written;
    }

    pub fn verifying(&self) {
        self.lock().state = UpdateState::Verifying;
    }

    pub fn succeeded(&self) {
        let mut inner = self.lock();
        inner.state = UpdateState::Succeeded;
        inner.last_error = None;
    }

    /// Terminal failure; the next request may claim the tracker again.
    pub fn failed(&self, reason: &str) {
        let mut inner = self.lock();
        inner.state = UpdateState::Failed(reason.to_string());
        inner.last_error = Some(reason.to_string());
    }

    /// Failure before anything destructive happened: back to Idle, keeping
    /// the reason for the status endpoint.
    pub fn rejected(&self, reason: &str) {
        let mut inner = self.lock();
        inner.state = UpdateState::Idle;
        inner.last_error = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_without_state_change() {
        let tracker = UpdateTracker::new();
        tracker.claim_pending("/a.bin").unwrap();
        assert!(matches!(tracker.claim_pending("/b.bin"), Err(UpdateError::Busy)));
        assert!(matches!(tracker.claim_stream(None), Err(UpdateError::Busy)));
        assert_eq!(
            tracker.state(),
            UpdateState::Pending {
                path: "/a.bin".into()
            }
        );
    }

    #[test]
    fn progress_follows_bytes_written() {
        let tracker = UpdateTracker::new();
        tracker.claim_stream(Some(400)).unwrap();
        tracker.record_progress(100);
        let snap = tracker.snapshot();
        assert_eq!(snap.progress, 25);
        assert!(snap.update_in_progress());
        tracker.verifying();
        assert_eq!(tracker.snapshot().progress, 100);
    }

    #[test]
    fn failure_frees_the_tracker() {
        let tracker = UpdateTracker::new();
        tracker.claim_stream(None).unwrap();
        tracker.failed("write failed");
        let snap = tracker.snapshot();
        assert_eq!(snap.last_error.as_deref(), Some("write failed"));
        assert!(!snap.update_in_progress());
        tracker.claim_stream(None).unwrap();
    }

    #[test]
    fn rejection_returns_to_idle() {
        let tracker = UpdateTracker::new();
        tracker.claim_pending("/a.bin").unwrap();
        tracker.rejected("image too large");
        assert_eq!(tracker.state(), UpdateState::Idle);
        assert_eq!(tracker.snapshot().last_error.as_deref(), Some("image too large"));
    }
}
