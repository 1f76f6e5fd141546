use anyhow::Result;
use serde_json::json;
use std::fmt;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::{ApiResponse, ApiScope, ErrorCode, ErrorResponse, Method};
use crate::config::DIR_RECORDINGS;
use crate::hal::{AudioInput, BlockStore, System, WriteHandle};
use crate::module::{Module, StatusMap};

pub const SAMPLES_PER_TICK: usize = 512;
pub const MAX_RECORDING: Duration = Duration::from_secs(60);
pub const MAX_RECORDING_BYTES: u64 = 4 * 1024 * 1024;
pub const WAV_HEADER_LEN: usize = 44;

#[derive(Debug)]
pub enum MicError {
    NoInput,
    AlreadyRecording,
    NotRecording,
    Io(io::Error),
}

impl MicError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MicError::NoInput => ErrorCode::Unavailable,
            MicError::AlreadyRecording => ErrorCode::Conflict,
            MicError::NotRecording => ErrorCode::BadRequest,
            MicError::Io(_) => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for MicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MicError::NoInput => write!(f, "No microphone attached"),
            MicError::AlreadyRecording => write!(f, "Already recording"),
            MicError::NotRecording => write!(f, "Not recording"),
            MicError::Io(e) => write!(f, "Recording file error: {e}"),
        }
    }
}

impl std::error::Error for MicError {}

impl From<io::Error> for MicError {
    fn from(e: io::Error) -> Self {
        MicError::Io(e)
    }
}

impl From<MicError> for ApiResponse {
    fn from(e: MicError) -> Self {
        ErrorResponse::new(e.error_code(), e.to_string()).into()
    }
}

/// Canonical 44-byte PCM header for 16-bit mono audio.
pub fn wav_header(sample_rate: u32, data_len: u32) -> [u8; WAV_HEADER_LEN] {
    let byte_rate = sample_rate * 2;
    let mut h = [0u8; WAV_HEADER_LEN];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes());
    h[22..24].copy_from_slice(&1u16.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    h[32..34].copy_from_slice(&2u16.to_le_bytes());
    h[34..36].copy_from_slice(&16u16.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

struct Recording {
    path: String,
    file: Box<dyn WriteHandle>,
    started: Duration,
    data_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: String,
    pub duration_secs: u64,
    pub data_bytes: u64,
}

pub struct MicrophoneModule {
    audio: Option<Arc<dyn AudioInput>>,
    store: Arc<dyn BlockStore>,
    system: Arc<dyn System>,
    recording: Mutex<Option<Recording>>,
    ready: AtomicBool,
}

impl MicrophoneModule {
    pub fn new(
        audio: Option<Arc<dyn AudioInput>>,
        store: Arc<dyn BlockStore>,
        system: Arc<dyn System>,
    ) -> Self {
        Self {
            audio,
            store,
            system,
            recording: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    fn recording(&self) -> MutexGuard<'_, Option<Recording>> {
        self.recording.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn input(&self) -> Result<&Arc<dyn AudioInput>, MicError> {
        self.audio.as_ref().ok_or(MicError::NoInput)
    }

    pub fn is_recording(&self) -> bool {
        self.recording().is_some()
    }

    pub fn start_recording(&self) -> Result<String, MicError> {
        let rate = self.input()?.sample_rate();
        let mut slot = self.recording();
        if slot.is_some() {
            log::warn!("[microphone] Already recording");
            return Err(MicError::AlreadyRecording);
        }
        let started = self.system.uptime();
        let path = format!("{}/rec_{}.wav", DIR_RECORDINGS, started.as_millis());
        self.store.mkdir(DIR_RECORDINGS)?;
        let mut file = self.store.create(&path)?;
        file.write_all(&wav_header(rate, 0))?;
        log::info!("[microphone] Recording started: {}", path);
        *slot = Some(Recording {
            path: path.clone(),
            file,
            started,
            data_bytes: 0,
        });
        Ok(path)
    }

    pub fn stop_recording(&self) -> Result<RecordingSummary, MicError> {
        let rate = self.input()?.sample_rate();
        let Some(rec) = self.recording().take() else {
            log::warn!("[microphone] Not recording");
            return Err(MicError::NotRecording);
        };
        self.finish(rec, rate)
    }

    /// Closes any open recording. Used before the radio and flash are torn down.
    pub fn stop_if_recording(&self) {
        if !self.is_recording() {
            return;
        }
        match self.stop_recording() {
            Ok(summary) => log::info!("[microphone] Recording {} closed", summary.path),
            Err(MicError::NotRecording) => {}
            Err(e) => log::error!("[microphone] {}", e),
        }
    }

    fn finish(&self, mut rec: Recording, rate: u32) -> Result<RecordingSummary, MicError> {
        let duration_secs = self.system.uptime().saturating_sub(rec.started).as_secs();
        rec.file.seek(SeekFrom::Start(0))?;
        rec.file.write_all(&wav_header(rate, rec.data_bytes as u32))?;
        rec.file.flush()?;
        log::info!(
            "[microphone] Recording stopped (duration: {} seconds, {} bytes)",
            duration_secs,
            rec.data_bytes
        );
        Ok(RecordingSummary {
            path: rec.path,
            duration_secs,
            data_bytes: rec.data_bytes,
        })
    }

    fn capture_batch(&self, audio: &dyn AudioInput, rec: &mut Recording) -> io::Result<()> {
        let mut samples = [0i16; SAMPLES_PER_TICK];
        let n = audio.read_samples(&mut samples);
        if n == 0 {
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(n * 2);
        for s in &samples[..n] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        rec.file.write_all(&bytes)?;
        rec.data_bytes += bytes.len() as u64;
        Ok(())
    }
}

impl Module for MicrophoneModule {
    fn name(&self) -> &'static str {
        "microphone"
    }

    fn description(&self) -> &'static str {
        "Audio level and WAV recording"
    }

    fn init(&self) -> bool {
        let Some(audio) = &self.audio else {
            log::error!("[microphone] No audio input attached");
            return false;
        };
        log::info!("[microphone] Input ready at {} Hz", audio.sample_rate());
        self.ready.store(true, Ordering::Release);
        true
    }

    fn update(&self) {
        let Some(audio) = &self.audio else {
            return;
        };
        let mut slot = self.recording();
        let Some(rec) = slot.as_mut() else {
            return;
        };
        if let Err(e) = self.capture_batch(audio.as_ref(), rec) {
            log::error!("[microphone] Write failed, stopping: {}", e);
        } else {
            let elapsed = self.system.uptime().saturating_sub(rec.started);
            if elapsed < MAX_RECORDING && rec.data_bytes < MAX_RECORDING_BYTES {
                return;
            }
            log::warn!("[microphone] Recording stopped: limit reached");
        }
        let finished = slot.take();
        drop(slot);
        if let Some(rec) = finished {
            if let Err(e) = self.finish(rec, audio.sample_rate()) {
                log::error!("[microphone] {}", e);
            }
        }
    }

    fn register_api(self: Arc<Self>, scope: &mut ApiScope<'_>) -> Result<()> {
        let this = Arc::clone(&self);
        scope.on("level", Method::Get, move |_req| match this.input() {
            Ok(audio) => ApiResponse::ok(json!({
                "level": audio.level(),
                "timestamp": this.system.uptime().as_millis() as u64,
            })),
            Err(e) => e.into(),
        })?;

        let this = Arc::clone(&self);
        scope.on("record/start", Method::Post, move |_req| match this.start_recording() {
            Ok(path) => ApiResponse::ok(json!({ "status": "recording", "path": path })),
            Err(e) => e.into(),
        })?;

        let this = Arc::clone(&self);
        scope.on("record/stop", Method::Post, move |_req| match this.stop_recording() {
            Ok(s) => ApiResponse::ok(json!({
                "status": "stopped",
                "duration": s.duration_secs,
                "path": s.path,
                "bytes": s.data_bytes,
            })),
            Err(e) => e.into(),
        })?;

        let this = self;
        scope.on("record/status", Method::Get, move |_req| {
            let now = this.system.uptime();
            match this.recording().as_ref() {
                Some(rec) => ApiResponse::ok(json!({
                    "recording": true,
                    "duration": now.saturating_sub(rec.started).as_secs(),
                    "path": rec.path,
                })),
                None => ApiResponse::ok(json!({ "recording": false })),
            }
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn status(&self, out: &mut StatusMap) {
        if let Some(audio) = &self.audio {
            out.insert("level".into(), audio.level().into());
        }
        let now = self.system.uptime();
        let slot = self.recording();
        out.insert("recording".into(), slot.is_some().into());
        if let Some(rec) = slot.as_ref() {
            out.insert(
                "recording_duration".into(),
                now.saturating_sub(rec.started).as_secs().into(),
            );
        }
    }

    fn shutdown(&self) {
        self.stop_if_recording();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RouteTable;
    use crate::sim::{MemStore, SimAudio, SimSystem};

    fn mic(store: &MemStore, system: &SimSystem) -> Arc<MicrophoneModule> {
        let module = Arc::new(MicrophoneModule::new(
            Some(Arc::new(SimAudio::new(16_000))),
            Arc::new(store.clone()),
            Arc::new(system.clone()),
        ));
        assert!(module.init());
        module
    }

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    #[test]
    fn missing_input_fails_init() {
        let module = MicrophoneModule::new(
            None,
            Arc::new(MemStore::new()),
            Arc::new(SimSystem::new()),
        );
        assert!(!module.init());
        assert!(!module.is_ready());
    }

    #[test]
    fn stop_patches_header_with_data_length() {
        let store = MemStore::new();
        let system = SimSystem::new();
        let module = mic(&store, &system);
        system.advance(Duration::from_millis(1234));
        let path = module.start_recording().unwrap();
        assert_eq!(path, "/recordings/rec_1234.wav");
        for _ in 0..3 {
            module.update();
        }
        system.advance(Duration::from_secs(2));
        let summary = module.stop_recording().unwrap();
        assert_eq!(summary.duration_secs, 2);

        let wav = store.contents(&path).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[36..40], b"data");
        let data_len = u32_at(&wav, 40) as usize;
        assert_eq!(data_len as u64, summary.data_bytes);
        assert_eq!(wav.len(), WAV_HEADER_LEN + data_len);
        assert_eq!(u32_at(&wav, 24), 16_000);
        assert!(data_len > 0);
    }

    #[test]
    fn second_start_conflicts_and_stop_without_start_is_400() {
        let store = MemStore::new();
        let system = SimSystem::new();
        let module = mic(&store, &system);
        let mut table = RouteTable::new();
        Arc::clone(&module)
            .register_api(&mut ApiScope::new(&mut table, "microphone"))
            .unwrap();

        let stop = table.call(Method::Post, "/_api/microphone/record/stop", &[], b"");
        assert_eq!(stop.status, 400);
        let start = table.call(Method::Post, "/_api/microphone/record/start", &[], b"");
        assert_eq!(start.status, 200);
        let again = table.call(Method::Post, "/_api/microphone/record/start", &[], b"");
        assert_eq!(again.status, 409);
        let status = table.call(Method::Get, "/_api/microphone/record/status", &[], b"");
        assert_eq!(status.body["recording"], true);
    }

    #[test]
    fn recording_auto_stops_at_max_duration() {
        let store = MemStore::new();
        let system = SimSystem::new();
        let module = mic(&store, &system);
        let path = module.start_recording().unwrap();
        module.update();
        assert!(module.is_recording());
        system.advance(MAX_RECORDING);
        module.update();
        assert!(!module.is_recording());
        let wav = store.contents(&path).unwrap();
        assert_eq!(u32_at(&wav, 40) as usize, wav.len() - WAV_HEADER_LEN);
    }

    #[test]
    fn quiesce_closes_open_recording() {
        let store = MemStore::new();
        let system = SimSystem::new();
        let module = mic(&store, &system);
        module.start_recording().unwrap();
        module.stop_if_recording();
        assert!(!module.is_recording());
        module.stop_if_recording();
    }
}
