use anyhow::Result;
use serde_json::json;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use super::io_error_response;
use crate::api::multipart::{boundary_from_content_type, is_multipart, MultipartFile};
use crate::api::{ApiRequest, ApiResponse, ApiScope, ErrorCode, ErrorResponse, Method};
use crate::hal::{BlockStore, StoreUsage, System};
use crate::module::{Module, StatusMap};
use crate::validators::{normalize_path, validate_path};

const USAGE_REFRESH: Duration = Duration::from_secs(30);
const COPY_CHUNK: usize = 4096;
const UPLOAD_LOG_STEP: u64 = 100 * 1024;
const MB: u64 = 1024 * 1024;

struct UsageCache {
    /// `None` when the store cannot report its capacity.
    usage: Option<StoreUsage>,
    refreshed_at: Duration,
}

/// File management on the block store under `/_api/files/`.
pub struct StorageModule {
    store: Arc<dyn BlockStore>,
    system: Arc<dyn System>,
    usage: Mutex<UsageCache>,
    /// Held for the lifetime of one upload.
    uploading: Mutex<()>,
    ready: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn path_param(req: &ApiRequest<'_>, key: &str) -> Result<String, ErrorResponse> {
    let raw = req
        .query(key)
        .ok_or_else(|| ErrorResponse::bad_request(format!("Missing {key}")).with_field(key))?;
    let path = normalize_path(raw);
    validate_path(&path).map_err(|e| ErrorResponse::bad_request(e.to_string()).with_field(key))?;
    Ok(path)
}

fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

impl StorageModule {
    pub fn new(store: Arc<dyn BlockStore>, system: Arc<dyn System>) -> Self {
        Self {
            store,
            system,
            usage: Mutex::new(UsageCache {
                usage: None,
                refreshed_at: Duration::ZERO,
            }),
            uploading: Mutex::new(()),
            ready: AtomicBool::new(false),
        }
    }

    fn refresh_usage(&self) -> io::Result<Option<StoreUsage>> {
        let usage = match self.store.usage() {
            Ok(usage) => Some(usage),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => None,
            Err(e) => return Err(e),
        };
        *lock(&self.usage) = UsageCache {
            usage,
            refreshed_at: self.system.uptime(),
        };
        Ok(usage)
    }

    fn cached_usage(&self) -> Option<StoreUsage> {
        lock(&self.usage).usage
    }

    fn info(&self) -> ApiResponse {
        let usage = match self.refresh_usage() {
            Ok(Some(usage)) => usage,
            Ok(None) => {
                return ApiResponse::ok(json!({
                    "total": null,
                    "used": null,
                    "free": null,
                    "capacity": "unknown",
                }))
            }
            Err(e) => return io_error_response("Reading storage usage failed", &e),
        };
        ApiResponse::ok(json!({
            "total": usage.total_bytes,
            "used": usage.used_bytes,
            "free": usage.free_bytes(),
            "total_mb": usage.total_bytes / MB,
            "used_mb": usage.used_bytes / MB,
            "free_mb": usage.free_bytes() / MB,
        }))
    }

    fn list(&self, req: &ApiRequest<'_>) -> ApiResponse {
        let path = if req.query("path").is_some() {
            match path_param(req, "path") {
                Ok(path) => path,
                Err(e) => return e.into(),
            }
        } else {
            "/".to_string()
        };
        if !self.store.exists(&path) {
            return ErrorResponse::not_found("Path not found").with_field("path").into();
        }
        match self.store.list(&path) {
            Ok(entries) => {
                let files: Vec<_> = entries
                    .iter()
                    .map(|e| json!({ "name": e.name, "size": e.size, "isDir": e.is_dir }))
                    .collect();
                ApiResponse::ok(json!({ "path": path, "count": files.len(), "files": files }))
            }
            Err(e) => io_error_response("Listing failed", &e),
        }
    }

    fn delete(&self, req: &ApiRequest<'_>) -> ApiResponse {
        let path = match path_param(req, "path") {
            Ok(path) => path,
            Err(e) => return e.into(),
        };
        if path == "/" {
            return ErrorResponse::new(ErrorCode::Forbidden, "Cannot delete protected path").into();
        }
        if !self.store.exists(&path) {
            return ErrorResponse::not_found("File not found").with_field("path").into();
        }
        match self.store.remove(&path) {
            Ok(()) => {
                log::info!("[storage] Deleted: {}", path);
                ApiResponse::ok(json!({ "status": "deleted", "path": path }))
            }
            Err(e) => io_error_response("Failed to delete", &e),
        }
    }

    fn rename(&self, req: &ApiRequest<'_>) -> ApiResponse {
        let (from, to) = match (path_param(req, "from"), path_param(req, "to")) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(e), _) | (_, Err(e)) => return e.into(),
        };
        if from == "/" {
            return ErrorResponse::new(ErrorCode::Forbidden, "Cannot move protected path").into();
        }
        if !self.store.exists(&from) {
            return ErrorResponse::not_found("Source not found").with_field("from").into();
        }
        if self.store.exists(&to) {
            return ErrorResponse::conflict("Destination already exists")
                .with_field("to")
                .into();
        }
        match self.store.rename(&from, &to) {
            Ok(()) => {
                log::info!("[storage] Moved: {} -> {}", from, to);
                ApiResponse::ok(json!({ "status": "moved", "from": from, "to": to }))
            }
            Err(e) => io_error_response("Move failed", &e),
        }
    }

    fn upload(&self, req: &mut ApiRequest<'_>) -> ApiResponse {
        let _guard = match self.uploading.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return ErrorResponse::conflict("Another upload is in progress").into()
            }
        };

        let target = match path_param(req, "path") {
            Ok(path) => path,
            Err(e) => return e.into(),
        };
        let content_type = req.content_type().unwrap_or_default().to_string();
        let content_length = req.content_length();

        if let Some(len) = content_length {
            let free = match self.refresh_usage() {
                Ok(Some(usage)) => usage.free_bytes(),
                Ok(None) => u64::MAX,
                Err(e) => {
                    log::warn!("[storage] Skipping free space check: {}", e);
                    u64::MAX
                }
            };
            if len as u64 > free {
                return ErrorResponse::new(
                    ErrorCode::InsufficientStorage,
                    format!("Upload of {len} bytes exceeds {free} free bytes"),
                )
                .into();
            }
        }

        let result = if is_multipart(&content_type) {
            let Some(boundary) = boundary_from_content_type(&content_type) else {
                return ErrorResponse::bad_request("multipart body without boundary").into();
            };
            let mut file = MultipartFile::new(&mut *req.body, &boundary);
            if let Err(e) = file.start() {
                return ErrorResponse::bad_request(format!("Malformed upload: {e}")).into();
            }
            // `path` names a directory when the form carries a filename.
            let dest = match file.filename() {
                Some(name) if !name.is_empty() => join(&target, name),
                _ => target,
            };
            if let Err(e) = validate_path(&dest) {
                return ErrorResponse::bad_request(e.to_string()).with_field("path").into();
            }
            self.receive(&mut file, &dest).map(|n| (dest, n))
        } else {
            self.receive(&mut *req.body, &target).map(|n| (target, n))
        };

        match result {
            Ok((path, written)) => {
                let on_disk = self.store.open(&path).map(|f| f.size()).unwrap_or(0);
                if let Err(e) = self.refresh_usage() {
                    log::warn!("[storage] Usage refresh after upload failed: {}", e);
                }
                let mut body = json!({
                    "status": "uploaded",
                    "path": path,
                    "bytes_written": written,
                    "file_size": on_disk,
                    "success": on_disk == written,
                });
                if on_disk != written {
                    log::warn!("[storage] Size mismatch: written {}, on disk {}", written, on_disk);
                    body["warning"] = "File size mismatch detected".into();
                }
                ApiResponse::ok(body)
            }
            Err(e) => io_error_response("Upload failed", &e),
        }
    }

    /// Copies `source` into `path`, removing the partial file on any error.
    fn receive<R: Read + ?Sized>(&self, source: &mut R, path: &str) -> io::Result<u64> {
        log::info!("[storage] Upload start: {}", path);
        let mut file = self.store.create(path)?;
        let copied = copy_logged(source, &mut file, path).and_then(|n| file.flush().map(|_| n));
        drop(file);
        match copied {
            Ok(n) => {
                log::info!("[storage] Upload complete: {} ({} bytes)", path, n);
                Ok(n)
            }
            Err(e) => {
                log::error!("[storage] Upload of {} failed: {}", path, e);
                if let Err(rm) = self.store.remove(path) {
                    log::warn!("[storage] Could not remove partial file {}: {}", path, rm);
                }
                Err(e)
            }
        }
    }
}

fn copy_logged<R: Read + ?Sized, W: Write + ?Sized>(
    source: &mut R,
    sink: &mut W,
    path: &str,
) -> io::Result<u64> {
    let mut buf = [0u8; COPY_CHUNK];
    let mut total = 0u64;
    let mut next_log = UPLOAD_LOG_STEP;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sink.write_all(&buf[..n])?;
        total += n as u64;
        if total >= next_log {
            log::info!("[storage] {}: received {} KB", path, total / 1024);
            next_log += UPLOAD_LOG_STEP;
        }
    }
}

impl Module for StorageModule {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn namespace(&self) -> &'static str {
        "files"
    }

    fn description(&self) -> &'static str {
        "Block store browsing, upload and housekeeping"
    }

    fn init(&self) -> bool {
        match self.refresh_usage() {
            Ok(Some(usage)) => {
                log::info!(
                    "[storage] Data partition: {} MB total, {} MB used, {} MB free",
                    usage.total_bytes / MB,
                    usage.used_bytes / MB,
                    usage.free_bytes() / MB
                );
                self.ready.store(true, Ordering::Release);
                true
            }
            // Capacity unknown: ready as long as the root is reachable
            Ok(None) => match self.store.list("/") {
                Ok(_) => {
                    log::warn!("[storage] Data partition capacity unknown");
                    self.ready.store(true, Ordering::Release);
                    true
                }
                Err(e) => {
                    log::error!("[storage] Data partition unavailable: {}", e);
                    false
                }
            },
            Err(e) => {
                log::error!("[storage] Data partition unavailable: {}", e);
                false
            }
        }
    }

    fn update(&self) {
        let due = {
            let cache = lock(&self.usage);
            self.system.uptime().saturating_sub(cache.refreshed_at) >= USAGE_REFRESH
        };
        if due {
            if let Err(e) = self.refresh_usage() {
                log::warn!("[storage] Usage refresh failed: {}", e);
            }
        }
    }

    fn register_api(self: Arc<Self>, scope: &mut ApiScope<'_>) -> Result<()> {
        let this = Arc::clone(&self);
        scope.on("info", Method::Get, move |_req| this.info())?;
        let this = Arc::clone(&self);
        scope.on("list", Method::Get, move |req| this.list(req))?;
        let this = Arc::clone(&self);
        scope.on("upload", Method::Post, move |req| this.upload(req))?;
        let this = Arc::clone(&self);
        scope.on("delete", Method::Post, move |req| this.delete(req))?;
        let this = self;
        scope.on("rename", Method::Post, move |req| this.rename(req))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn status(&self, out: &mut StatusMap) {
        let Some(usage) = self.cached_usage() else {
            out.insert("capacity".into(), "unknown".into());
            return;
        };
        out.insert("total_bytes".into(), usage.total_bytes.into());
        out.insert("used_bytes".into(), usage.used_bytes.into());
        out.insert("free_bytes".into(), usage.free_bytes().into());
        out.insert("total_mb".into(), (usage.total_bytes / MB).into());
        out.insert("used_mb".into(), (usage.used_bytes / MB).into());
        out.insert("free_mb".into(), (usage.free_bytes() / MB).into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RouteTable;
    use crate::hal::FsStore;
    use crate::sim::{MemStore, SimSystem};
    use std::sync::atomic::AtomicUsize;

    fn mounted(store: &MemStore, system: &SimSystem) -> (Arc<StorageModule>, RouteTable) {
        let module = Arc::new(StorageModule::new(
            Arc::new(store.clone()),
            Arc::new(system.clone()),
        ));
        assert!(module.init());
        let mut table = RouteTable::new();
        Arc::clone(&module)
            .register_api(&mut ApiScope::new(&mut table, "files"))
            .unwrap();
        (module, table)
    }

    fn multipart(boundary: &str, filename: &str, data: &[u8], closed: bool) -> Vec<u8> {
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        if closed {
            body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        }
        body
    }

    #[test]
    fn list_reports_entries() {
        let store = MemStore::new()
            .with_file("/www/index.html", b"<html>")
            .with_file("/firmware.bin", &[1, 2, 3]);
        let (_m, table) = mounted(&store, &SimSystem::new());
        let body = table.call(Method::Get, "/_api/files/list", &[], b"").body;
        assert_eq!(body["path"], "/");
        assert_eq!(body["count"], 2);

        let missing = table.call(Method::Get, "/_api/files/list?path=/nope", &[], b"");
        assert_eq!(missing.status, 404);
    }

    #[test]
    fn traversal_is_rejected() {
        let store = MemStore::new();
        let (_m, table) = mounted(&store, &SimSystem::new());
        let resp = table.call(Method::Post, "/_api/files/delete?path=/a/../b", &[], b"");
        assert_eq!(resp.status, 400);
        assert_eq!(resp.body["error"]["field"], "path");
        let resp = table.call(Method::Get, "/_api/files/list?path=/a%01", &[], b"");
        assert_eq!(resp.status, 400);
    }

    #[test]
    fn multipart_upload_lands_in_directory() {
        let store = MemStore::new();
        let (_m, table) = mounted(&store, &SimSystem::new());
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 256) as u8).collect();
        let body = multipart("xyz", "song.wav", &data, true);
        let headers = [("Content-Type", "multipart/form-data; boundary=xyz")];
        let resp = table.call(Method::Post, "/_api/files/upload?path=/music", &headers, &body);
        assert_eq!(resp.status, 200, "{}", resp.body);
        assert_eq!(resp.body["path"], "/music/song.wav");
        assert_eq!(resp.body["success"], true);
        assert_eq!(store.contents("/music/song.wav"), Some(data));
    }

    #[test]
    fn truncated_upload_leaves_no_partial_file() {
        let store = MemStore::new();
        let (_m, table) = mounted(&store, &SimSystem::new());
        let body = multipart("xyz", "cut.bin", &[7u8; 5000], false);
        let headers = [("Content-Type", "multipart/form-data; boundary=xyz")];
        let resp = table.call(Method::Post, "/_api/files/upload?path=/", &headers, &body);
        assert!(!resp.is_success());
        assert!(!store.exists("/cut.bin"));
    }

    #[test]
    fn declared_size_beyond_free_space_is_507() {
        let store = MemStore::new();
        let (_m, table) = mounted(&store, &SimSystem::new());
        let headers = [
            ("Content-Type", "application/octet-stream"),
            ("Content-Length", "999999999"),
        ];
        let resp = table.call(Method::Post, "/_api/files/upload?path=/big.bin", &headers, b"");
        assert_eq!(resp.status, 507);
        assert!(!store.exists("/big.bin"));
    }

    #[test]
    fn rename_refuses_to_clobber() {
        let store = MemStore::new().with_file("/a.txt", b"a").with_file("/b.txt", b"b");
        let (_m, table) = mounted(&store, &SimSystem::new());
        let clash = table.call(Method::Post, "/_api/files/rename?from=/a.txt&to=/b.txt", &[], b"");
        assert_eq!(clash.status, 409);
        let ok = table.call(Method::Post, "/_api/files/rename?from=/a.txt&to=/c.txt", &[], b"");
        assert_eq!(ok.status, 200);
        assert_eq!(store.contents("/c.txt"), Some(b"a".to_vec()));
        assert!(!store.exists("/a.txt"));
    }

    #[test]
    fn root_cannot_be_deleted() {
        let store = MemStore::new();
        let (_m, table) = mounted(&store, &SimSystem::new());
        let resp = table.call(Method::Post, "/_api/files/delete?path=/", &[], b"");
        assert_eq!(resp.status, 403);
    }

    #[test]
    fn usage_refreshes_on_period() {
        let store = MemStore::new();
        let system = SimSystem::new();
        let (module, _table) = mounted(&store, &system);
        store.put("/blob", &[0u8; 2048]);

        module.update();
        assert_eq!(module.cached_usage().map(|u| u.used_bytes), Some(0));
        system.advance(USAGE_REFRESH);
        module.update();
        assert_eq!(module.cached_usage().map(|u| u.used_bytes), Some(2048));
    }

    fn mounted_fs(store: FsStore) -> (Arc<StorageModule>, RouteTable) {
        let module = Arc::new(StorageModule::new(Arc::new(store), Arc::new(SimSystem::new())));
        let ready = module.init();
        let mut table = RouteTable::new();
        Arc::clone(&module)
            .register_api(&mut ApiScope::new(&mut table, "files"))
            .unwrap();
        assert_eq!(module.is_ready(), ready);
        (module, table)
    }

    #[test]
    fn unknown_capacity_still_accepts_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let (module, table) = mounted_fs(FsStore::new(dir.path()));
        assert!(module.is_ready());

        let info = table.call(Method::Get, "/_api/files/info", &[], b"");
        assert_eq!(info.status, 200);
        assert_eq!(info.body["capacity"], "unknown");
        assert!(info.body["total"].is_null());

        let headers = [
            ("Content-Type", "application/octet-stream"),
            ("Content-Length", "5"),
        ];
        let resp = table.call(Method::Post, "/_api/files/upload?path=/a.bin", &headers, b"hello");
        assert_eq!(resp.status, 200, "{}", resp.body);
        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"hello");

        let mut status = StatusMap::new();
        module.status(&mut status);
        assert_eq!(status["capacity"], "unknown");
    }

    #[test]
    fn missing_root_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (module, _table) = mounted_fs(FsStore::new(dir.path().join("unmounted")));
        assert!(!module.is_ready());
    }

    #[test]
    fn upload_survives_failed_usage_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let store = FsStore::new(dir.path()).with_usage_probe(move || {
            // Healthy for init and the free-space check, broken afterwards
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(StoreUsage {
                    total_bytes: MB,
                    used_bytes: 0,
                })
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "FAT driver busy"))
            }
        });
        let (_module, table) = mounted_fs(store);
        let headers = [
            ("Content-Type", "application/octet-stream"),
            ("Content-Length", "3"),
        ];
        let resp = table.call(Method::Post, "/_api/files/upload?path=/x.bin", &headers, b"abc");
        assert_eq!(resp.status, 200, "{}", resp.body);
        assert_eq!(resp.body["success"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
