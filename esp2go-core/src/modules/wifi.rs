use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::{ApiRequest, ApiResponse, ApiScope, ErrorCode, ErrorResponse, Method};
use crate::config::{DeviceConfig, MAX_WIFI_NETWORKS};
use crate::hal::{BlockStore, Radio, RadioMode, System};
use crate::module::{Module, StatusMap};
use crate::network::{
    Bootstrap, Credential, CredentialError, CredentialPrompt, CredentialStore, LinkMonitor,
    NetworkState,
};

const MAX_BODY_BYTES: usize = 1024;

#[derive(Debug, Deserialize)]
struct AddNetwork {
    ssid: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    priority: u32,
}

/// Owns the saved credentials, the bootstrap and the link monitor.
pub struct WifiModule {
    radio: Arc<dyn Radio>,
    system: Arc<dyn System>,
    store: Arc<dyn BlockStore>,
    config: DeviceConfig,
    creds: Mutex<CredentialStore>,
    monitor: Mutex<LinkMonitor>,
    network: Mutex<NetworkState>,
    ready: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl WifiModule {
    pub fn new(
        radio: Arc<dyn Radio>,
        system: Arc<dyn System>,
        store: Arc<dyn BlockStore>,
        config: DeviceConfig,
    ) -> Self {
        let monitor = LinkMonitor::new(
            std::time::Duration::from_secs(config.monitor_period_secs),
            system.uptime(),
        );
        let creds = CredentialStore::new(&config.default_ap_ssid, &config.default_ap_password);
        Self {
            radio,
            system,
            store,
            config,
            creds: Mutex::new(creds),
            monitor: Mutex::new(monitor),
            network: Mutex::new(NetworkState::Disconnected),
            ready: AtomicBool::new(false),
        }
    }

    /// Runs the connection bootstrap and restarts the monitor period.
    pub fn connect(&self, prompt: Option<&mut dyn CredentialPrompt>) -> NetworkState {
        let state = {
            let mut creds = lock(&self.creds);
            let mut bootstrap = Bootstrap::new(self.radio.as_ref(), self.system.as_ref(), &self.config);
            match prompt {
                Some(prompt) => bootstrap
                    .with_prompt(prompt)
                    .run(&mut creds, self.store.as_ref()),
                None => bootstrap.run(&mut creds, self.store.as_ref()),
            }
        };
        *lock(&self.monitor) = LinkMonitor::new(
            std::time::Duration::from_secs(self.config.monitor_period_secs),
            self.system.uptime(),
        );
        *lock(&self.network) = state.clone();
        state
    }

    pub fn network_state(&self) -> NetworkState {
        lock(&self.network).clone()
    }

    fn status_json(&self) -> serde_json::Value {
        let link = self.radio.link_info();
        json!({
            "connected": self.radio.is_connected(),
            "ssid": link.ssid,
            "ip": link.ip,
            "rssi": link.rssi,
            "mac": link.mac,
            "mode": self.radio.mode().as_str(),
        })
    }

    fn scan(&self) -> ApiResponse {
        match self.radio.scan() {
            Ok(networks) => ApiResponse::ok(json!({ "count": networks.len(), "networks": networks })),
            Err(e) => ErrorResponse::internal(format!("Scan failed: {e:#}")).into(),
        }
    }

    fn saved_networks(&self) -> ApiResponse {
        let creds = lock(&self.creds);
        let networks: Vec<_> = creds
            .networks()
            .iter()
            .map(|c| json!({ "ssid": c.ssid, "priority": c.priority }))
            .collect();
        ApiResponse::ok(json!({
            "count": networks.len(),
            "max": MAX_WIFI_NETWORKS,
            "networks": networks,
        }))
    }

    fn add_network(&self, req: &mut ApiRequest<'_>) -> ApiResponse {
        let body = match req.read_body(MAX_BODY_BYTES) {
            Ok(body) => body,
            Err(e) => return ErrorResponse::bad_request(e.to_string()).into(),
        };
        let add: AddNetwork = match serde_json::from_slice(&body) {
            Ok(add) => add,
            Err(e) => return ErrorResponse::bad_request(format!("Invalid JSON: {e}")).into(),
        };

        let mut creds = lock(&self.creds);
        let cred = Credential::new(&add.ssid, &add.password, add.priority);
        match creds.add(cred) {
            Ok(()) => {}
            Err(CredentialError::Full) => {
                return ErrorResponse::new(
                    ErrorCode::InsufficientStorage,
                    CredentialError::Full.to_string(),
                )
                .into()
            }
            Err(CredentialError::Invalid(e)) => {
                return ErrorResponse::bad_request(e).with_field("ssid").into()
            }
        }
        if let Err(e) = creds.save(self.store.as_ref()) {
            log::error!("[wifi] {:#}", e);
            return ErrorResponse::internal(format!("{e:#}")).into();
        }
        log::info!("[wifi] Saved network {}", add.ssid);
        ApiResponse::ok(json!({ "status": "ok", "count": creds.len() }))
    }
}

impl Module for WifiModule {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn description(&self) -> &'static str {
        "WiFi credentials, connection status and scanning"
    }

    fn init(&self) -> bool {
        let (ap_ssid, ap_password) = (&self.config.default_ap_ssid, &self.config.default_ap_password);
        if let Err(e) = CredentialStore::ensure_file(self.store.as_ref(), ap_ssid, ap_password) {
            log::warn!("[wifi] Cannot init WiFi config: {:#}", e);
        }
        *lock(&self.creds) = CredentialStore::load(self.store.as_ref(), ap_ssid, ap_password);
        self.ready.store(true, Ordering::Release);
        true
    }

    fn update(&self) {
        let now = self.system.uptime();
        lock(&self.monitor).poll(self.radio.as_ref(), now);
    }

    fn register_api(self: Arc<Self>, scope: &mut ApiScope<'_>) -> Result<()> {
        let this = Arc::clone(&self);
        scope.on("status", Method::Get, move |_req| ApiResponse::ok(this.status_json()))?;
        let this = Arc::clone(&self);
        scope.on("scan", Method::Get, move |_req| this.scan())?;
        let this = Arc::clone(&self);
        scope.on("networks", Method::Get, move |_req| this.saved_networks())?;
        let this = self;
        scope.on("networks", Method::Post, move |req| this.add_network(req))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn status(&self, out: &mut StatusMap) {
        out.insert("connected".into(), self.radio.is_connected().into());
        out.insert("mode".into(), self.radio.mode().as_str().into());
        out.insert("ssid".into(), self.radio.link_info().ssid.into());
        out.insert("saved_networks".into(), lock(&self.creds).len().into());
    }

    fn shutdown(&self) {
        if self.radio.mode() == RadioMode::Station {
            if let Err(e) = self.radio.disconnect() {
                log::warn!("[wifi] Disconnect on shutdown failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RouteTable;
    use crate::sim::{MemStore, SimRadio, SimSystem};

    fn module(radio: &SimRadio, store: &MemStore) -> Arc<WifiModule> {
        Arc::new(WifiModule::new(
            Arc::new(radio.clone()),
            Arc::new(SimSystem::new()),
            Arc::new(store.clone()),
            DeviceConfig::default(),
        ))
    }

    #[test]
    fn status_reports_link() {
        let radio = SimRadio::new().with_network("home", "password1");
        let store = MemStore::new();
        store
            .write_string(
                crate::config::PATH_WIFI_CONFIG,
                r#"{"networks":[{"ssid":"home","password":"password1","priority":1}]}"#,
            )
            .unwrap();
        let wifi = module(&radio, &store);
        assert!(wifi.init());
        assert!(matches!(wifi.connect(None), NetworkState::Connected { .. }));

        let mut table = RouteTable::new();
        Arc::clone(&wifi)
            .register_api(&mut ApiScope::new(&mut table, "wifi"))
            .unwrap();
        let body = table.call(Method::Get, "/_api/wifi/status", &[], b"").body;
        assert_eq!(body["connected"], true);
        assert_eq!(body["ssid"], "home");
        assert_eq!(body["mode"], "STA");
        assert!(body["ip"].as_str().is_some());
    }

    #[test]
    fn add_network_validates_and_persists() {
        let radio = SimRadio::new();
        let store = MemStore::new();
        let wifi = module(&radio, &store);
        wifi.init();
        let mut table = RouteTable::new();
        Arc::clone(&wifi)
            .register_api(&mut ApiScope::new(&mut table, "wifi"))
            .unwrap();

        let bad = table.call(Method::Post, "/_api/wifi/networks", &[], br#"{"ssid":""}"#);
        assert_eq!(bad.status, 400);
        assert_eq!(bad.body["error"]["field"], "ssid");

        let ok = table.call(
            Method::Post,
            "/_api/wifi/networks",
            &[],
            br#"{"ssid":"lab","password":"password1"}"#,
        );
        assert_eq!(ok.status, 200);
        assert_eq!(CredentialStore::load(&store, "a", "b").len(), 1);

        let listed = table.call(Method::Get, "/_api/wifi/networks", &[], b"").body;
        assert_eq!(listed["networks"][0]["ssid"], "lab");
        assert!(listed["networks"][0].get("password").is_none());
    }

    #[test]
    fn eleventh_network_is_insufficient_storage() {
        let radio = SimRadio::new();
        let store = MemStore::new();
        let wifi = module(&radio, &store);
        wifi.init();
        let mut table = RouteTable::new();
        Arc::clone(&wifi)
            .register_api(&mut ApiScope::new(&mut table, "wifi"))
            .unwrap();
        for i in 0..MAX_WIFI_NETWORKS {
            let body = format!(r#"{{"ssid":"n{i}"}}"#);
            let resp = table.call(Method::Post, "/_api/wifi/networks", &[], body.as_bytes());
            assert_eq!(resp.status, 200);
        }
        let resp = table.call(Method::Post, "/_api/wifi/networks", &[], br#"{"ssid":"x"}"#);
        assert_eq!(resp.status, 507);
    }
}
