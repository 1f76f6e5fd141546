use anyhow::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::multipart::{boundary_from_content_type, is_multipart, MultipartFile};
use crate::api::{ApiRequest, ApiResponse, ApiScope, ErrorCode, ErrorResponse, Method};
use crate::config::DEFAULT_FIRMWARE_PATH;
use crate::module::{Module, StatusMap};
use crate::ota::{UpdateError, UpdatePipeline, UpdateRequest};
use crate::validators::normalize_path;

pub const OTA_PASSWORD_HEADER: &str = "X-OTA-Password";

/// Room for multipart framing on top of the image itself.
const MULTIPART_ALLOWANCE: usize = 4096;

pub struct OtaModule {
    pipeline: Arc<UpdatePipeline>,
    password: Option<String>,
    ready: AtomicBool,
}

impl OtaModule {
    pub fn new(pipeline: Arc<UpdatePipeline>, password: Option<&str>) -> Self {
        Self {
            pipeline,
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
            ready: AtomicBool::new(false),
        }
    }

    fn authorize(&self, req: &ApiRequest<'_>) -> Result<(), ErrorResponse> {
        let Some(expected) = &self.password else {
            return Ok(());
        };
        match req.header(OTA_PASSWORD_HEADER) {
            None => Err(ErrorResponse::new(
                ErrorCode::Unauthorized,
                "Missing X-OTA-Password header",
            )),
            Some(given) if given == expected => Ok(()),
            Some(_) => Err(ErrorResponse::new(ErrorCode::Forbidden, "Invalid OTA password")),
        }
    }

    fn status_json(&self) -> Value {
        let snap = self.pipeline.tracker().snapshot();
        let mut body = json!({
            "update_in_progress": snap.update_in_progress(),
            "pending": self.pipeline.has_pending(),
            "progress": snap.progress,
            "state": snap.state.as_str(),
            "bytes_written": snap.bytes_written,
            "total_bytes": snap.total_bytes,
        });
        if let Some(error) = snap.last_error {
            body["error"] = error.into();
        }
        body
    }

    fn handle_update(&self, req: &mut ApiRequest<'_>) -> ApiResponse {
        if let Err(denied) = self.authorize(req) {
            log::warn!("[ota] Update refused: {}", denied.error.message);
            return denied.into();
        }
        let content_type = req.content_type().unwrap_or_default().to_string();
        let content_length = req.content_length();

        let outcome = if is_multipart(&content_type) {
            self.receive_multipart(req, &content_type, content_length)
        } else if content_type
            .to_ascii_lowercase()
            .starts_with("application/octet-stream")
        {
            log::info!("[ota] Raw firmware upload started");
            self.pipeline
                .stream_upload(&mut *req.body, content_length, content_length)
        } else {
            return self.schedule_stored(req);
        };

        match outcome {
            Ok(written) => ApiResponse::ok(json!({
                "status": "success",
                "bytes": written,
                "message": "Update completed, restarting...",
            })),
            Err(e) => update_error_response(&e),
        }
    }

    fn receive_multipart(
        &self,
        req: &mut ApiRequest<'_>,
        content_type: &str,
        content_length: Option<usize>,
    ) -> Result<usize, UpdateError> {
        let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
            UpdateError::InvalidRequest("multipart body without boundary".to_string())
        })?;
        let capacity = self.pipeline.capacity();
        if let Some(len) = content_length {
            if len > capacity + MULTIPART_ALLOWANCE {
                return Err(UpdateError::TooLarge {
                    size: len,
                    capacity,
                });
            }
        }
        let mut file = MultipartFile::new(&mut *req.body, &boundary);
        file.start()
            .map_err(|e| UpdateError::InvalidRequest(format!("Malformed upload: {e}")))?;
        log::info!(
            "[ota] OTA upload started: {}",
            file.filename().unwrap_or("<unnamed>")
        );
        self.pipeline.stream_upload(&mut file, None, content_length)
    }

    fn schedule_stored(&self, req: &ApiRequest<'_>) -> ApiResponse {
        let path = req
            .query("path")
            .or_else(|| req.query("file"))
            .filter(|p| !p.trim().is_empty())
            .map(normalize_path)
            .unwrap_or_else(|| DEFAULT_FIRMWARE_PATH.to_string());
        let mut request = UpdateRequest::new(&path);
        request.sha256 = req.query("sha256").map(|d| d.to_ascii_lowercase());

        log::info!("[ota] OTA update requested for: {}", path);
        match self.pipeline.schedule(request) {
            Ok(()) => ApiResponse::ok(json!({
                "status": "ok",
                "message": "Update scheduled",
                "path": path,
            })),
            Err(e) => update_error_response(&e),
        }
    }
}

fn update_error_response(e: &UpdateError) -> ApiResponse {
    let mut err = ErrorResponse::new(e.error_code(), e.to_string());
    if matches!(e, UpdateError::ImageNotFound(_) | UpdateError::InvalidRequest(_)) {
        err = err.with_field("path");
    }
    err.into()
}

impl Module for OtaModule {
    fn name(&self) -> &'static str {
        "ota"
    }

    fn description(&self) -> &'static str {
        "Firmware updates from storage or HTTP upload"
    }

    fn init(&self) -> bool {
        let capacity = self.pipeline.capacity();
        if capacity == 0 {
            log::error!("[ota] No update partition available");
            return false;
        }
        if self.password.is_some() {
            log::info!("[ota] OTA Updates: ENABLED (password protected)");
        } else {
            log::info!("[ota] OTA Updates: ENABLED (no password)");
        }
        log::info!("[ota] Update partition holds {} KB", capacity / 1024);
        self.ready.store(true, Ordering::Release);
        true
    }

    fn register_api(self: Arc<Self>, scope: &mut ApiScope<'_>) -> Result<()> {
        let this = Arc::clone(&self);
        scope.on("status", Method::Get, move |_req| ApiResponse::ok(this.status_json()))?;
        let this = self;
        scope.on("update", Method::Post, move |req| this.handle_update(req))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn status(&self, out: &mut StatusMap) {
        let snap = self.pipeline.tracker().snapshot();
        out.insert("update_in_progress".into(), snap.update_in_progress().into());
        out.insert("progress".into(), snap.progress.into());
        out.insert("state".into(), snap.state.as_str().into());
        if let Some(error) = snap.last_error {
            out.insert("error".into(), error.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RouteTable;
    use crate::sim::{firmware_image, MemStore, SimFlash, SimSystem};
    use std::time::Duration;

    struct Rig {
        store: MemStore,
        flash: SimFlash,
        system: SimSystem,
        pipeline: Arc<UpdatePipeline>,
        table: RouteTable,
    }

    fn rig(password: Option<&str>) -> Rig {
        let store = MemStore::new();
        let flash = SimFlash::new(256 * 1024);
        let system = SimSystem::new();
        let pipeline = Arc::new(UpdatePipeline::new(
            Arc::new(store.clone()),
            Arc::new(flash.clone()),
            Arc::new(system.clone()),
            Duration::from_millis(1000),
        ));
        let module = Arc::new(OtaModule::new(Arc::clone(&pipeline), password));
        assert!(module.init());
        let mut table = RouteTable::new();
        module
            .register_api(&mut ApiScope::new(&mut table, "ota"))
            .unwrap();
        Rig {
            store,
            flash,
            system,
            pipeline,
            table,
        }
    }

    #[test]
    fn password_header_is_enforced() {
        let rig = rig(Some("s3cret"));
        rig.store.put("/firmware.bin", &firmware_image(64));
        let url = "/_api/ota/update?path=/firmware.bin";
        assert_eq!(rig.table.call(Method::Post, url, &[], b"").status, 401);
        let wrong = [(OTA_PASSWORD_HEADER, "nope")];
        assert_eq!(rig.table.call(Method::Post, url, &wrong, b"").status, 403);
        assert!(!rig.pipeline.has_pending());
        let right = [(OTA_PASSWORD_HEADER, "s3cret")];
        assert_eq!(rig.table.call(Method::Post, url, &right, b"").status, 200);
        assert!(rig.pipeline.has_pending());
    }

    #[test]
    fn file_parameter_gets_leading_slash() {
        let rig = rig(None);
        rig.store.put("/fw/next.bin", &firmware_image(64));
        let resp = rig
            .table
            .call(Method::Post, "/_api/ota/update?file=fw/next.bin", &[], b"");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["path"], "/fw/next.bin");
    }

    #[test]
    fn default_path_when_none_given() {
        let rig = rig(None);
        let resp = rig.table.call(Method::Post, "/_api/ota/update", &[], b"");
        assert_eq!(resp.status, 404);
        assert!(resp.body["error"]["message"]
            .as_str()
            .unwrap()
            .contains(DEFAULT_FIRMWARE_PATH));
    }

    #[test]
    fn second_request_conflicts() {
        let rig = rig(None);
        rig.store.put("/firmware.bin", &firmware_image(64));
        let url = "/_api/ota/update?path=/firmware.bin";
        assert_eq!(rig.table.call(Method::Post, url, &[], b"").status, 200);
        let again = rig.table.call(Method::Post, url, &[], b"");
        assert_eq!(again.status, 409);
        assert_eq!(again.body["error"]["code"], "CONFLICT");
    }

    #[test]
    fn multipart_upload_flashes_and_reports_status() {
        let rig = rig(None);
        let image = firmware_image(20_000);
        let mut body = Vec::new();
        body.extend_from_slice(
            b"--B0UND\r\nContent-Disposition: form-data; name=\"firmware\"; filename=\"fw.bin\"\r\n\r\n",
        );
        body.extend_from_slice(&image);
        body.extend_from_slice(b"\r\n--B0UND--\r\n");
        let len = body.len().to_string();
        let headers = [
            ("Content-Type", "multipart/form-data; boundary=B0UND"),
            ("Content-Length", len.as_str()),
        ];

        let resp = rig.table.call(Method::Post, "/_api/ota/update", &headers, &body);
        assert_eq!(resp.status, 200, "{}", resp.body);
        assert_eq!(resp.body["bytes"], 20_000);
        assert_eq!(rig.flash.boot_image(), Some(image));
        assert_eq!(rig.system.restarts().len(), 1);

        let status = rig.table.call(Method::Get, "/_api/ota/status", &[], b"").body;
        assert_eq!(status["state"], "succeeded");
        assert_eq!(status["progress"], 100);
    }

    #[test]
    fn truncated_raw_upload_fails_without_restart() {
        let rig = rig(None);
        let image = firmware_image(8000);
        let headers = [
            ("Content-Type", "application/octet-stream"),
            ("Content-Length", "9000"),
        ];
        let resp = rig
            .table
            .call(Method::Post, "/_api/ota/update", &headers, &image);
        assert_eq!(resp.status, 400);
        assert!(rig.flash.boot_image().is_none());
        assert!(rig.system.restarts().is_empty());
        let status = rig.table.call(Method::Get, "/_api/ota/status", &[], b"").body;
        assert_eq!(status["update_in_progress"], false);
        assert!(status["error"].as_str().is_some());
    }

    #[test]
    fn oversized_upload_is_413() {
        let rig = rig(None);
        let headers = [
            ("Content-Type", "application/octet-stream"),
            ("Content-Length", "10000000"),
        ];
        let resp = rig.table.call(Method::Post, "/_api/ota/update", &headers, b"");
        assert_eq!(resp.status, 413);
    }
}
