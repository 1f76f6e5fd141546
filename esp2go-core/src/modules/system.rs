use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{ApiResponse, ApiScope, Method};
use crate::hal::System;
use crate::module::{Module, StatusMap};

pub struct SystemModule {
    system: Arc<dyn System>,
    firmware_version: &'static str,
    restart_grace: Duration,
}

impl SystemModule {
    pub fn new(system: Arc<dyn System>, firmware_version: &'static str, restart_grace: Duration) -> Self {
        Self {
            system,
            firmware_version,
            restart_grace,
        }
    }

    fn info(&self) -> serde_json::Value {
        json!({
            "chip": self.system.chip(),
            "firmware_version": self.firmware_version,
            "free_heap": self.system.free_heap(),
            "min_free_heap": self.system.min_free_heap(),
            "uptime": self.system.uptime().as_secs(),
            "reset_reason": self.system.reset_reason(),
        })
    }
}

impl Module for SystemModule {
    fn name(&self) -> &'static str {
        "system"
    }

    fn description(&self) -> &'static str {
        "Chip information and restart control"
    }

    fn init(&self) -> bool {
        log::info!(
            "[system] {} running firmware {}, reset reason: {}",
            self.system.chip(),
            self.firmware_version,
            self.system.reset_reason()
        );
        true
    }

    fn register_api(self: Arc<Self>, scope: &mut ApiScope<'_>) -> Result<()> {
        let this = Arc::clone(&self);
        scope.on("info", Method::Get, move |_req| ApiResponse::ok(this.info()))?;

        let this = self;
        scope.on("restart", Method::Post, move |_req| {
            log::warn!("[system] Restart requested over HTTP");
            this.system.restart_after(this.restart_grace);
            ApiResponse::ok(json!({"status": "restarting"}))
        })
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn status(&self, out: &mut StatusMap) {
        out.insert("free_heap".into(), self.system.free_heap().into());
        out.insert("uptime".into(), self.system.uptime().as_secs().into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RouteTable;
    use crate::sim::{Restart, SimSystem};

    #[test]
    fn restart_route_defers_reboot() {
        let system = SimSystem::new();
        let module = Arc::new(SystemModule::new(
            Arc::new(system.clone()),
            "0.1.0",
            Duration::from_millis(500),
        ));
        let mut table = RouteTable::new();
        module
            .register_api(&mut ApiScope::new(&mut table, "system"))
            .unwrap();

        let info = table.call(Method::Get, "/_api/system/info", &[], b"");
        assert_eq!(info.body["firmware_version"], "0.1.0");
        assert_eq!(info.body["chip"], "host-sim");

        let resp = table.call(Method::Post, "/_api/system/restart", &[], b"");
        assert_eq!(resp.status, 200);
        assert_eq!(
            system.restarts(),
            vec![Restart::After(Duration::from_millis(500))]
        );
    }
}
