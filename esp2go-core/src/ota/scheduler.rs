use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub path: String,
    /// Expected image digest, lowercase hex.
    pub sha256: Option<String>,
}

impl UpdateRequest {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            sha256: None,
        }
    }
}

/// Single-slot mailbox between HTTP handlers and the main loop.
///
/// The producer overwrites any unconsumed request; the consumer takes and
/// clears the slot under the same lock.
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    slot: Mutex<Option<UpdateRequest>>,
}

impl UpdateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<UpdateRequest>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the request this one replaced, if any.
    pub fn schedule(&self, request: UpdateRequest) -> Option<UpdateRequest> {
        log::info!("OTA update scheduled: {}", request.path);
        self.slot().replace(request)
    }

    pub fn is_pending(&self) -> bool {
        self.slot().is_some()
    }

    pub fn take(&self) -> Option<UpdateRequest> {
        self.slot().take()
    }

    pub fn peek(&self) -> Option<UpdateRequest> {
        self.slot().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn last_scheduled_request_wins() {
        let scheduler = UpdateScheduler::new();
        assert!(scheduler.schedule(UpdateRequest::new("/a.bin")).is_none());
        let replaced = scheduler.schedule(UpdateRequest::new("/b.bin"));
        assert_eq!(replaced.map(|r| r.path), Some("/a.bin".to_string()));
        assert_eq!(scheduler.take().map(|r| r.path), Some("/b.bin".to_string()));
        assert!(!scheduler.is_pending());
        assert!(scheduler.take().is_none());
    }

    #[test]
    fn handoff_across_threads() {
        let scheduler = Arc::new(UpdateScheduler::new());
        let producer = Arc::clone(&scheduler);
        std::thread::spawn(move || {
            producer.schedule(UpdateRequest::new("/fw.bin"));
        })
        .join()
        .unwrap();
        assert!(scheduler.is_pending());
        assert_eq!(scheduler.take(), Some(UpdateRequest::new("/fw.bin")));
    }
}
