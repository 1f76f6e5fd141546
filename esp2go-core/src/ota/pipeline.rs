use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{UpdateRequest, UpdateScheduler, UpdateTracker};
use crate::api::ErrorCode;
use crate::hal::{BlockStore, FirmwareTarget, FlashError, ImageWriter, ReadHandle, System};
use crate::validators;

pub const CHUNK_SIZE: usize = 512;
pub const PROGRESS_LOG_STEP: usize = 100 * 1024;

#[derive(Debug)]
pub enum UpdateError {
    Busy,
    InvalidRequest(String),
    ImageNotFound(String),
    EmptyImage,
    TooLarge { size: usize, capacity: usize },
    Read(String),
    Flash(FlashError),
    ShortWrite { offset: usize, expected: usize, accepted: usize },
    SizeMismatch { expected: usize, written: usize },
    DigestMismatch { expected: String, actual: String },
}

impl UpdateError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            UpdateError::Busy => ErrorCode::Conflict,
            UpdateError::InvalidRequest(_) | UpdateError::EmptyImage => ErrorCode::BadRequest,
            UpdateError::ImageNotFound(_) => ErrorCode::NotFound,
            UpdateError::TooLarge { .. } => ErrorCode::PayloadTooLarge,
            UpdateError::Read(_)
            | UpdateError::SizeMismatch { .. }
            | UpdateError::DigestMismatch { .. } => ErrorCode::BadRequest,
            UpdateError::Flash(FlashError::RegionBusy) => ErrorCode::Conflict,
            UpdateError::Flash(FlashError::InsufficientSpace { .. }) => {
                ErrorCode::InsufficientStorage
            }
            UpdateError::Flash(_) | UpdateError::ShortWrite { .. } => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Busy => write!(f, "Update in progress"),
            UpdateError::InvalidRequest(e) => write!(f, "{e}"),
            UpdateError::ImageNotFound(path) => write!(f, "Firmware file not found: {path}"),
            UpdateError::EmptyImage => write!(f, "Firmware image is empty"),
            UpdateError::TooLarge { size, capacity } => write!(
                f,
                "Firmware image of {size} bytes exceeds the {capacity} byte update partition"
            ),
            UpdateError::Read(e) => write!(f, "Reading firmware failed: {e}"),
            UpdateError::Flash(e) => write!(f, "{e}"),
            UpdateError::ShortWrite {
                offset,
                expected,
                accepted,
            } => write!(
                f,
                "OTA write failed at {offset} bytes ({accepted} of {expected} accepted)"
            ),
            UpdateError::SizeMismatch { expected, written } => write!(
                f,
                "Update write failed (written: {written}, expected: {expected})"
            ),
            UpdateError::DigestMismatch { expected, actual } => {
                write!(f, "sha256 mismatch (expected {expected}, got {actual})")
            }
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<FlashError> for UpdateError {
    fn from(e: FlashError) -> Self {
        UpdateError::Flash(e)
    }
}

pub type QuiesceHook = Box<dyn Fn() + Send + Sync>;

/// Moves an image from the store or an upload into the inactive partition.
pub struct UpdatePipeline {
    store: Arc<dyn BlockStore>,
    target: Arc<dyn FirmwareTarget>,
    system: Arc<dyn System>,
    tracker: Arc<UpdateTracker>,
    scheduler: Arc<UpdateScheduler>,
    quiesce: Mutex<Vec<(&'static str, QuiesceHook)>>,
    restart_grace: Duration,
}

impl UpdatePipeline {
    pub fn new(
        store: Arc<dyn BlockStore>,
        target: Arc<dyn FirmwareTarget>,
        system: Arc<dyn System>,
        restart_grace: Duration,
    ) -> Self {
        Self {
            store,
            target,
            system,
            tracker: Arc::new(UpdateTracker::new()),
            scheduler: Arc::new(UpdateScheduler::new()),
            quiesce: Mutex::new(Vec::new()),
            restart_grace,
        }
    }

    pub fn tracker(&self) -> &UpdateTracker {
        &self.tracker
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn capacity(&self) -> usize {
        self.target.capacity()
    }

    fn hooks(&self) -> MutexGuard<'_, Vec<(&'static str, QuiesceHook)>> {
        self.quiesce.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hooks run in registration order right before a stored image is flashed.
    pub fn add_quiesce_hook<F>(&self, name: &'static str, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks().push((name, Box::new(hook)));
    }

    /// Validates and records a stored-image update for the main loop.
    pub fn schedule(&self, request: UpdateRequest) -> Result<(), UpdateError> {
        validators::validate_path(&request.path)
            .map_err(|e| UpdateError::InvalidRequest(e.to_string()))?;
        if let Some(digest) = &request.sha256 {
            validators::validate_sha256_hex(digest)
                .map_err(|e| UpdateError::InvalidRequest(e.to_string()))?;
        }
        if !self.store.exists(&request.path) {
            log::error!("Firmware file not found: {}", request.path);
            return Err(UpdateError::ImageNotFound(request.path));
        }
        self.tracker.claim_pending(&request.path)?;
        if let Some(replaced) = self.scheduler.schedule(request) {
            log::warn!("Replaced unconsumed update request for {}", replaced.path);
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.scheduler.is_pending()
    }

    /// Runs a scheduled update, if any. Returns `None` when nothing was
    /// pending. On hardware a started update ends in a restart either way.
    pub fn run_pending(&self) -> Option<Result<(), UpdateError>> {
        let request = self.scheduler.take()?;
        Some(self.run_deferred(&request))
    }

    fn run_deferred(&self, request: &UpdateRequest) -> Result<(), UpdateError> {
        log::info!("Starting OTA update from storage: {}", request.path);

        // Nothing is torn down yet, so these failures leave the device as is.
        let (file, size) = match self.preflight(&request.path) {
            Ok(found) => found,
            Err(e) => {
                log::error!("OTA update rejected: {}", e);
                self.tracker.rejected(&e.to_string());
                return Err(e);
            }
        };
        log::info!("Firmware file size: {} bytes ({} KB)", size, size / 1024);

        self.tracker.start_deferred(size);
        self.quiesce_all();

        match self.flash_stored(file, size, request.sha256.as_deref()) {
            Ok(()) => {
                self.tracker.succeeded();
                log::info!("OTA UPDATE SUCCESSFUL, restarting with new firmware");
                self.system.restart_after(self.restart_grace);
                Ok(())
            }
            Err(e) => {
                log::error!("OTA update failed: {}", e);
                log::error!("Restarting into current firmware");
                self.tracker.failed(&e.to_string());
                self.system.restart();
                Err(e)
            }
        }
    }

    fn preflight(&self, path: &str) -> Result<(Box<dyn ReadHandle>, usize), UpdateError> {
        let file = self.store.open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => UpdateError::ImageNotFound(path.to_string()),
            _ => UpdateError::Read(e.to_string()),
        })?;
        let size = file.size() as usize;
        if size == 0 {
            return Err(UpdateError::EmptyImage);
        }
        let capacity = self.target.capacity();
        if size > capacity {
            return Err(UpdateError::TooLarge { size, capacity });
        }
        Ok((file, size))
    }

    fn quiesce_all(&self) {
        log::info!("PERFORMING OTA UPDATE - STOPPING ALL SERVICES");
        log::info!("Free heap before cleanup: {} bytes", self.system.free_heap());
        for (name, hook) in self.hooks().iter() {
            log::info!("Stopping {}", name);
            hook();
        }
        self.system.delay_ms(500);
        log::info!("Free heap after cleanup: {} bytes", self.system.free_heap());
    }

    fn flash_stored(
        &self,
        mut file: Box<dyn ReadHandle>,
        size: usize,
        expected_digest: Option<&str>,
    ) -> Result<(), UpdateError> {
        let mut writer = self.target.begin(Some(size))?;
        log::info!("OTA: Update partition ready, reading from storage...");

        let mut hasher = Sha256::new();
        let checked = self
            .pump(&mut file, writer.as_mut(), Some(size), &mut hasher)
            .and_then(|written| {
                if written != size {
                    return Err(UpdateError::SizeMismatch {
                        expected: size,
                        written,
                    });
                }
                let actual = format!("{:x}", hasher.finalize());
                match expected_digest {
                    Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
                        Err(UpdateError::DigestMismatch {
                            expected: expected.to_string(),
                            actual,
                        })
                    }
                    _ => {
                        log::info!("OTA: All data written ({} bytes), sha256 {}", written, actual);
                        Ok(())
                    }
                }
            });
        if let Err(e) = checked {
            writer.abort();
            return Err(e);
        }

        self.tracker.verifying();
        writer.finalize()?;
        Ok(())
    }

    /// Writes an uploaded image as it arrives. `expected_len` is the exact
    /// image size when known; `progress_total` only scales progress.
    pub fn stream_upload<R: Read + ?Sized>(
        &self,
        source: &mut R,
        expected_len: Option<usize>,
        progress_total: Option<usize>,
    ) -> Result<usize, UpdateError> {
        let capacity = self.target.capacity();
        if let Some(size) = expected_len {
            if size > capacity {
                return Err(UpdateError::TooLarge { size, capacity });
            }
        }
        self.tracker.claim_stream(progress_total.or(expected_len))?;
        log::info!("OTA upload started ({:?} bytes declared)", expected_len);

        let mut writer = match self.target.begin(None) {
            Ok(writer) => writer,
            Err(e) => {
                log::error!("OTA begin failed: {}", e);
                self.tracker.failed(&e.to_string());
                return Err(e.into());
            }
        };

        let mut hasher = Sha256::new();
        let checked = self
            .pump(source, writer.as_mut(), expected_len, &mut hasher)
            .and_then(|written| match expected_len {
                _ if written == 0 => Err(UpdateError::EmptyImage),
                Some(expected) if written != expected => {
                    Err(UpdateError::SizeMismatch { expected, written })
                }
                _ => Ok(written),
            });
        let written = match checked {
            Ok(written) => written,
            Err(e) => {
                writer.abort();
                log::error!("OTA upload aborted: {}", e);
                self.tracker.failed(&e.to_string());
                return Err(e);
            }
        };

        self.tracker.verifying();
        if let Err(e) = writer.finalize() {
            log::error!("OTA end failed: {}", e);
            self.tracker.failed(&e.to_string());
            return Err(e.into());
        }
        self.tracker.succeeded();
        log::info!(
            "OTA upload completed: {} bytes, sha256 {:x}",
            written,
            hasher.finalize()
        );
        self.system.restart_after(self.restart_grace);
        Ok(written)
    }

    fn pump<R: Read + ?Sized>(
        &self,
        source: &mut R,
        writer: &mut dyn ImageWriter,
        total: Option<usize>,
        hasher: &mut Sha256,
    ) -> Result<usize, UpdateError> {
        let mut buf = [0u8; CHUNK_SIZE];
        let mut written = 0usize;
        let mut next_log = PROGRESS_LOG_STEP;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(UpdateError::Read(e.to_string())),
            };
            let accepted = writer.write(&buf[..n])?;
            if accepted != n {
                return Err(UpdateError::ShortWrite {
                    offset: written,
                    expected: n,
                    accepted,
                });
            }
            hasher.update(&buf[..n]);
            written += n;
            self.tracker.record_progress(written);
            if written >= next_log {
                match total {
                    Some(total) => {
                        log::info!("OTA: Flashed {} KB / {} KB", written / 1024, total / 1024)
                    }
                    None => log::info!("OTA: Flashed {} KB", written / 1024),
                }
                next_log += PROGRESS_LOG_STEP;
            }
        }
        Ok(written)
    }
}
