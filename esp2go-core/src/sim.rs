//! In-memory hardware for host runs and tests.
//!
//! Every fake is deterministic: [`SimSystem::delay_ms`] advances a virtual
//! clock instead of sleeping, and restarts are recorded rather than performed.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::hal::{
    AudioInput, BlockStore, DirEntry, FirmwareTarget, FlashError, ImageWriter, LinkInfo, Radio,
    RadioMode, ReadHandle, ScanResult, StoreUsage, System, WriteHandle,
};

/// First byte of every ESP application image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// A plausible firmware image of `len` bytes.
pub fn firmware_image(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i == 0 { IMAGE_MAGIC } else { (i % 251) as u8 })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Block store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    read_faults: HashMap<String, usize>,
    capacity: u64,
    writable: bool,
}

fn parent_dirs(path: &str) -> impl Iterator<Item = String> + '_ {
    path.match_indices('/')
        .filter(|(i, _)| *i > 0)
        .map(move |(i, _)| path[..i].to_string())
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Hierarchical store held in memory.
#[derive(Clone)]
pub struct MemStore {
    fs: Arc<Mutex<MemFs>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            fs: Arc::new(Mutex::new(MemFs {
                capacity: 16 * 1024 * 1024,
                writable: true,
                ..MemFs::default()
            })),
        }
    }

    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.put(path, contents);
        self
    }

    pub fn put(&self, path: &str, contents: &[u8]) {
        let path = normalize(path);
        let mut fs = lock(&self.fs);
        for dir in parent_dirs(&path) {
            fs.dirs.insert(dir);
        }
        fs.files.insert(path, contents.to_vec());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.fs).files.get(&normalize(path)).cloned()
    }

    /// Reads of `path` fail once `after` bytes have been returned.
    pub fn fail_reads(&self, path: &str, after: usize) {
        lock(&self.fs).read_faults.insert(normalize(path), after);
    }

    pub fn set_writable(&self, writable: bool) {
        lock(&self.fs).writable = writable;
    }
}

struct MemReader {
    data: io::Cursor<Vec<u8>>,
    fail_after: Option<usize>,
}

impl Read for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(limit) = self.fail_after {
            let pos = self.data.position() as usize;
            if pos >= limit {
                return Err(io::Error::new(io::ErrorKind::Other, "simulated read fault"));
            }
            let room = (limit - pos).min(buf.len());
            return self.data.read(&mut buf[..room]);
        }
        self.data.read(buf)
    }
}

impl ReadHandle for MemReader {
    fn size(&self) -> u64 {
        self.data.get_ref().len() as u64
    }
}

struct MemWriter {
    fs: Arc<Mutex<MemFs>>,
    path: String,
    pos: u64,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut fs = lock(&self.fs);
        let used: u64 = fs.files.values().map(|f| f.len() as u64).sum();
        let capacity = fs.capacity;
        let file = fs
            .files
            .get_mut(&self.path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file removed while open"))?;
        let start = self.pos as usize;
        let end = start + buf.len();
        let growth = end.saturating_sub(file.len()) as u64;
        if used + growth > capacity {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on store"));
        }
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = lock(&self.fs)
            .files
            .get(&self.path)
            .map(|f| f.len() as i64)
            .unwrap_or(0);
        let next = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(d) => len + d,
            SeekFrom::Current(d) => self.pos as i64 + d,
        };
        if next < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}

impl BlockStore for MemStore {
    fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        let fs = lock(&self.fs);
        path == "/" || fs.files.contains_key(&path) || fs.dirs.contains(&path)
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn ReadHandle>> {
        let path = normalize(path);
        let fs = lock(&self.fs);
        let data = fs
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{path} not found")))?;
        Ok(Box::new(MemReader {
            data: io::Cursor::new(data),
            fail_after: fs.read_faults.get(&path).copied(),
        }))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn WriteHandle>> {
        let path = normalize(path);
        let mut fs = lock(&self.fs);
        if !fs.writable {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "store is read-only"));
        }
        if fs.dirs.contains(&path) {
            return Err(io::Error::new(io::ErrorKind::Other, format!("{path} is a directory")));
        }
        for dir in parent_dirs(&path) {
            fs.dirs.insert(dir);
        }
        fs.files.insert(path.clone(), Vec::new());
        Ok(Box::new(MemWriter {
            fs: Arc::clone(&self.fs),
            path,
            pos: 0,
        }))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        let mut fs = lock(&self.fs);
        if fs.files.remove(&path).is_some() {
            return Ok(());
        }
        let prefix = format!("{path}/");
        let occupied = fs.files.keys().any(|k| k.starts_with(&prefix))
            || fs.dirs.iter().any(|d| d.starts_with(&prefix));
        if occupied {
            return Err(io::Error::new(io::ErrorKind::Other, "directory not empty"));
        }
        if fs.dirs.remove(&path) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, format!("{path} not found")))
        }
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let (from, to) = (normalize(from), normalize(to));
        let mut fs = lock(&self.fs);
        let data = fs
            .files
            .remove(&from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{from} not found")))?;
        for dir in parent_dirs(&to) {
            fs.dirs.insert(dir);
        }
        fs.files.insert(to, data);
        Ok(())
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        let mut fs = lock(&self.fs);
        if !fs.writable {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "store is read-only"));
        }
        for dir in parent_dirs(&path) {
            fs.dirs.insert(dir);
        }
        fs.dirs.insert(path);
        Ok(())
    }

    fn list(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let path = normalize(path);
        let fs = lock(&self.fs);
        if path != "/" && !fs.dirs.contains(&path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{path} not found")));
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let direct = |full: &str| -> Option<String> {
            let rest = full.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };
        let mut entries: Vec<DirEntry> = fs
            .dirs
            .iter()
            .filter_map(|d| direct(d))
            .map(|name| DirEntry {
                name,
                is_dir: true,
                size: 0,
            })
            .collect();
        entries.extend(fs.files.iter().filter_map(|(k, v)| {
            direct(k).map(|name| DirEntry {
                name,
                is_dir: false,
                size: v.len() as u64,
            })
        }));
        Ok(entries)
    }

    fn usage(&self) -> io::Result<StoreUsage> {
        let fs = lock(&self.fs);
        Ok(StoreUsage {
            total_bytes: fs.capacity,
            used_bytes: fs.files.values().map(|f| f.len() as u64).sum(),
        })
    }
}

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RadioState {
    mode: Option<RadioMode>,
    reachable: HashMap<String, String>,
    /// Polls of `is_connected` before an association completes.
    link_delay_polls: u32,
    pending: Option<(String, u32)>,
    connected_to: Option<String>,
    attempts: Vec<String>,
    ap: Option<String>,
    ap_fails: bool,
    hostnames: Vec<String>,
    reconnects: u32,
    auto_reconnect: bool,
}

#[derive(Clone, Default)]
pub struct SimRadio {
    state: Arc<Mutex<RadioState>>,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `ssid` joinable with `secret`.
    pub fn with_network(self, ssid: &str, secret: &str) -> Self {
        lock(&self.state)
            .reachable
            .insert(ssid.to_string(), secret.to_string());
        self
    }

    pub fn with_link_delay(self, polls: u32) -> Self {
        lock(&self.state).link_delay_polls = polls;
        self
    }

    pub fn failing_access_point(self) -> Self {
        lock(&self.state).ap_fails = true;
        self
    }

    /// SSIDs passed to `begin`, in order.
    pub fn attempts(&self) -> Vec<String> {
        lock(&self.state).attempts.clone()
    }

    pub fn access_point(&self) -> Option<String> {
        lock(&self.state).ap.clone()
    }

    pub fn hostnames(&self) -> Vec<String> {
        lock(&self.state).hostnames.clone()
    }

    pub fn reconnects(&self) -> u32 {
        lock(&self.state).reconnects
    }

    /// Drops the current association, as a lost access point would.
    pub fn drop_link(&self) {
        let mut s = lock(&self.state);
        if let Some(ssid) = s.connected_to.take() {
            s.pending = Some((ssid, u32::MAX));
        }
    }
}

impl Radio for SimRadio {
    fn mode(&self) -> RadioMode {
        lock(&self.state).mode.unwrap_or(RadioMode::Off)
    }

    fn set_station_mode(&self) -> Result<()> {
        let mut s = lock(&self.state);
        s.mode = Some(RadioMode::Station);
        s.connected_to = None;
        s.pending = None;
        s.ap = None;
        Ok(())
    }

    fn set_auto_reconnect(&self, enabled: bool) {
        lock(&self.state).auto_reconnect = enabled;
    }

    fn begin(&self, ssid: &str, secret: &str) -> Result<()> {
        let mut s = lock(&self.state);
        if s.mode != Some(RadioMode::Station) {
            return Err(anyhow!("radio is not in station mode"));
        }
        s.attempts.push(ssid.to_string());
        s.connected_to = None;
        let joinable = s.reachable.get(ssid).map(|p| p == secret).unwrap_or(false);
        let delay = if joinable { s.link_delay_polls } else { u32::MAX };
        s.pending = Some((ssid.to_string(), delay));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let mut s = lock(&self.state);
        if s.connected_to.is_some() {
            return true;
        }
        match s.pending.take() {
            Some((ssid, 0)) => {
                s.connected_to = Some(ssid);
                true
            }
            Some((ssid, u32::MAX)) => {
                s.pending = Some((ssid, u32::MAX));
                false
            }
            Some((ssid, n)) => {
                s.pending = Some((ssid, n - 1));
                false
            }
            None => false,
        }
    }

    fn reconnect(&self) -> Result<()> {
        let mut s = lock(&self.state);
        s.reconnects += 1;
        if let Some((ssid, _)) = s.pending.take() {
            if s.reachable.contains_key(&ssid) {
                s.connected_to = Some(ssid);
            } else {
                s.pending = Some((ssid, u32::MAX));
            }
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let mut s = lock(&self.state);
        s.connected_to = None;
        s.pending = None;
        Ok(())
    }

    fn start_access_point(&self, ssid: &str, _secret: &str) -> Result<()> {
        let mut s = lock(&self.state);
        if s.ap_fails {
            return Err(anyhow!("soft-AP start failed"));
        }
        s.mode = Some(RadioMode::AccessPoint);
        s.connected_to = None;
        s.pending = None;
        s.ap = Some(ssid.to_string());
        Ok(())
    }

    fn link_info(&self) -> LinkInfo {
        let s = lock(&self.state);
        let mac = "02:00:00:00:00:01".to_string();
        if let Some(ssid) = &s.connected_to {
            LinkInfo {
                ssid: ssid.clone(),
                ip: "192.168.1.50".into(),
                rssi: -55,
                mac,
            }
        } else if let Some(ssid) = &s.ap {
            LinkInfo {
                ssid: ssid.clone(),
                ip: "192.168.4.1".into(),
                rssi: 0,
                mac,
            }
        } else {
            LinkInfo {
                mac,
                ..LinkInfo::default()
            }
        }
    }

    fn scan(&self) -> Result<Vec<ScanResult>> {
        let s = lock(&self.state);
        Ok(s.reachable
            .iter()
            .enumerate()
            .map(|(i, (ssid, secret))| ScanResult {
                ssid: ssid.clone(),
                rssi: -40 - (i as i8) * 5,
                channel: 1 + (i as u8 % 11),
                secured: !secret.is_empty(),
            })
            .collect())
    }

    fn advertise_hostname(&self, hostname: &str) -> Result<()> {
        lock(&self.state).hostnames.push(hostname.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Program partition
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FlashState {
    boot_image: Option<Vec<u8>>,
    aborted: usize,
    fail_write_at: Option<usize>,
    short_write_at: Option<usize>,
}

struct FlashShared {
    capacity: usize,
    open: AtomicBool,
    state: Mutex<FlashState>,
}

/// Inactive partition that records what ends up marked bootable.
#[derive(Clone)]
pub struct SimFlash {
    shared: Arc<FlashShared>,
}

impl SimFlash {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(FlashShared {
                capacity,
                open: AtomicBool::new(false),
                state: Mutex::new(FlashState::default()),
            }),
        }
    }

    /// Writes fail once the region holds `offset` bytes.
    pub fn fail_write_at(&self, offset: usize) {
        lock(&self.shared.state).fail_write_at = Some(offset);
    }

    /// The write crossing `offset` is accepted only up to it.
    pub fn short_write_at(&self, offset: usize) {
        lock(&self.shared.state).short_write_at = Some(offset);
    }

    /// Image marked bootable by a successful finalize.
    pub fn boot_image(&self) -> Option<Vec<u8>> {
        lock(&self.shared.state).boot_image.clone()
    }

    pub fn aborted(&self) -> usize {
        lock(&self.shared.state).aborted
    }

    pub fn region_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }
}

impl FirmwareTarget for SimFlash {
    fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn begin(&self, size: Option<usize>) -> Result<Box<dyn ImageWriter>, FlashError> {
        if let Some(requested) = size {
            if requested > self.shared.capacity {
                return Err(FlashError::InsufficientSpace {
                    requested,
                    capacity: self.shared.capacity,
                });
            }
        }
        if self.shared.open.swap(true, Ordering::AcqRel) {
            return Err(FlashError::RegionBusy);
        }
        Ok(Box::new(SimWriter {
            shared: Arc::clone(&self.shared),
            data: Vec::new(),
            done: false,
        }))
    }
}

struct SimWriter {
    shared: Arc<FlashShared>,
    data: Vec<u8>,
    done: bool,
}

impl SimWriter {
    fn close(&mut self, aborted: bool) {
        if self.done {
            return;
        }
        self.done = true;
        if aborted {
            lock(&self.shared.state).aborted += 1;
        }
        self.shared.open.store(false, Ordering::Release);
    }
}

impl ImageWriter for SimWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<usize, FlashError> {
        let (fail_at, short_at) = {
            let s = lock(&self.shared.state);
            (s.fail_write_at, s.short_write_at)
        };
        let start = self.data.len();
        if matches!(fail_at, Some(at) if start >= at) {
            return Err(FlashError::WriteFailed("simulated flash fault".into()));
        }
        let mut accept = chunk.len().min(self.shared.capacity.saturating_sub(start));
        if let Some(at) = short_at {
            if start < at && start + chunk.len() > at {
                accept = accept.min(at - start);
            }
        }
        self.data.extend_from_slice(&chunk[..accept]);
        Ok(accept)
    }

    fn bytes_written(&self) -> usize {
        self.data.len()
    }

    fn finalize(mut self: Box<Self>) -> Result<(), FlashError> {
        if self.data.first() != Some(&IMAGE_MAGIC) {
            self.close(true);
            return Err(FlashError::ValidationFailed("invalid image magic byte".into()));
        }
        lock(&self.shared.state).boot_image = Some(std::mem::take(&mut self.data));
        self.close(false);
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.close(true);
    }
}

impl Drop for SimWriter {
    fn drop(&mut self) {
        self.close(true);
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    Immediate,
    After(Duration),
}

#[derive(Clone)]
pub struct SimSystem {
    clock_ms: Arc<AtomicUsize>,
    free_heap: Arc<AtomicU32>,
    restarts: Arc<Mutex<Vec<Restart>>>,
}

impl Default for SimSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSystem {
    pub fn new() -> Self {
        Self {
            clock_ms: Arc::new(AtomicUsize::new(0)),
            free_heap: Arc::new(AtomicU32::new(180_000)),
            restarts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock_ms
            .fetch_add(by.as_millis() as usize, Ordering::Relaxed);
    }

    pub fn set_free_heap(&self, bytes: u32) {
        self.free_heap.store(bytes, Ordering::Relaxed);
    }

    pub fn restarts(&self) -> Vec<Restart> {
        lock(&self.restarts).clone()
    }
}

impl System for SimSystem {
    fn restart(&self) {
        lock(&self.restarts).push(Restart::Immediate);
    }

    fn restart_after(&self, grace: Duration) {
        lock(&self.restarts).push(Restart::After(grace));
    }

    fn delay_ms(&self, ms: u32) {
        self.clock_ms.fetch_add(ms as usize, Ordering::Relaxed);
    }

    fn uptime(&self) -> Duration {
        Duration::from_millis(self.clock_ms.load(Ordering::Relaxed) as u64)
    }

    fn free_heap(&self) -> u32 {
        self.free_heap.load(Ordering::Relaxed)
    }

    fn min_free_heap(&self) -> u32 {
        self.free_heap.load(Ordering::Relaxed).saturating_sub(12_000)
    }

    fn reset_reason(&self) -> &'static str {
        "Power On"
    }

    fn chip(&self) -> String {
        "host-sim".to_string()
    }
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Microphone producing a fixed-amplitude square wave.
pub struct SimAudio {
    sample_rate: u32,
    amplitude: i16,
    per_read: usize,
    phase: AtomicUsize,
}

impl SimAudio {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            amplitude: 8_000,
            per_read: 256,
            phase: AtomicUsize::new(0),
        }
    }
}

impl AudioInput for SimAudio {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn level(&self) -> u8 {
        ((self.amplitude as u32 * 100) / i16::MAX as u32) as u8
    }

    fn read_samples(&self, buf: &mut [i16]) -> usize {
        let n = buf.len().min(self.per_read);
        let start = self.phase.fetch_add(n, Ordering::Relaxed);
        for (i, sample) in buf[..n].iter_mut().enumerate() {
            *sample = if (start + i) % 32 < 16 {
                self.amplitude
            } else {
                -self.amplitude
            };
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_lists_direct_children() {
        let store = MemStore::new()
            .with_file("/a.bin", b"12")
            .with_file("/os/wifi_config.json", b"{}");
        let root = store.list("/").unwrap();
        assert!(root.iter().any(|e| e.name == "os" && e.is_dir));
        assert!(root.iter().any(|e| e.name == "a.bin" && e.size == 2));
        assert_eq!(store.list("/os").unwrap().len(), 1);
    }

    #[test]
    fn mem_store_write_handle_seeks() {
        let store = MemStore::new();
        let mut w = store.create("/r/x.wav").unwrap();
        w.write_all(b"....data").unwrap();
        w.seek(SeekFrom::Start(0)).unwrap();
        w.write_all(b"HEAD").unwrap();
        drop(w);
        assert_eq!(store.contents("/r/x.wav").unwrap(), b"HEADdata");
        assert!(store.exists("/r"));
    }

    #[test]
    fn flash_allows_one_region_and_aborts_on_drop() {
        let flash = SimFlash::new(1024);
        let writer = flash.begin(Some(10)).unwrap();
        assert!(matches!(flash.begin(None), Err(FlashError::RegionBusy)));
        drop(writer);
        assert_eq!(flash.aborted(), 1);
        assert!(!flash.region_open());
        assert!(flash.boot_image().is_none());
    }

    #[test]
    fn radio_connects_after_link_delay() {
        let radio = SimRadio::new().with_network("home", "pw").with_link_delay(2);
        radio.set_station_mode().unwrap();
        radio.begin("home", "pw").unwrap();
        assert!(!radio.is_connected());
        assert!(!radio.is_connected());
        assert!(radio.is_connected());
        assert_eq!(radio.link_info().ssid, "home");
    }
}
