use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hal::BlockStore;

pub const PATH_CONFIG: &str = "/config.json";
pub const PATH_WIFI_CONFIG: &str = "/os/wifi_config.json";
pub const DIR_OS: &str = "/os";
pub const DIR_RECORDINGS: &str = "/recordings";
pub const DEFAULT_FIRMWARE_PATH: &str = "/firmware.bin";

pub const DEFAULT_AP_SSID: &str = "ESP2GO";
pub const DEFAULT_AP_PASSWORD: &str = "12345678";
pub const MDNS_HOSTNAME: &str = "esp2go";

pub const MAX_WIFI_NETWORKS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub default_wifi_ssid: String,
    pub default_wifi_password: String,
    pub default_ap_ssid: String,
    pub default_ap_password: String,
    pub mdns_hostname: String,
    /// When set, update requests must carry a matching `X-OTA-Password`.
    pub ota_password: Option<String>,
    pub http_port: u16,
    pub loop_period_ms: u32,
    pub monitor_period_secs: u64,
    /// Wait before rebooting so the HTTP response can flush.
    pub restart_grace_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default_wifi_ssid: String::new(),
            default_wifi_password: String::new(),
            default_ap_ssid: DEFAULT_AP_SSID.to_string(),
            default_ap_password: DEFAULT_AP_PASSWORD.to_string(),
            mdns_hostname: MDNS_HOSTNAME.to_string(),
            ota_password: None,
            http_port: 80,
            loop_period_ms: 10,
            monitor_period_secs: 30,
            restart_grace_ms: 1000,
        }
    }
}

impl DeviceConfig {
    /// Applies the overrides in `/config.json`. Returns whether the file was
    /// read; a missing or broken file leaves the current values in place.
    pub fn overlay_from_store(&mut self, store: &dyn BlockStore) -> bool {
        if !store.exists(PATH_CONFIG) {
            log::info!("Config file not found at {}, using defaults", PATH_CONFIG);
            return false;
        }
        let text = match store.read_to_string(PATH_CONFIG) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to open config file {}: {}", PATH_CONFIG, e);
                return false;
            }
        };
        let doc: Value = match serde_json::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("Failed to parse config file: {}", e);
                return false;
            }
        };

        log::info!("Loading configuration from {}", PATH_CONFIG);
        let overlay = |key: &str, target: &mut String, secret: bool| {
            if let Some(value) = doc.get(key).and_then(Value::as_str) {
                *target = value.to_string();
                if secret {
                    log::info!("{}: [hidden]", key);
                } else {
                    log::info!("{}: {}", key, value);
                }
            }
        };
        overlay("DEFAULT_WIFI_SSID", &mut self.default_wifi_ssid, false);
        overlay("DEFAULT_WIFI_PASSWORD", &mut self.default_wifi_password, true);
        overlay("DEFAULT_AP_SSID", &mut self.default_ap_ssid, false);
        overlay("DEFAULT_AP_PASSWORD", &mut self.default_ap_password, true);
        overlay("MDNS_HOSTNAME", &mut self.mdns_hostname, false);
        true
    }

    pub fn ota_password(&self) -> Option<&str> {
        self.ota_password.as_deref().filter(|p| !p.is_empty())
    }
}

/// Defaults, then `/config.json`. Never fails.
pub fn load_or_default(base: DeviceConfig, store: &dyn BlockStore) -> DeviceConfig {
    let mut config = base;
    config.overlay_from_store(store);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemStore;

    #[test]
    fn missing_file_keeps_defaults() {
        let store = MemStore::new();
        let config = load_or_default(DeviceConfig::default(), &store);
        assert_eq!(config, DeviceConfig::default());
    }

    #[test]
    fn overlay_replaces_known_keys_only() {
        let store = MemStore::new();
        store
            .write_string(
                PATH_CONFIG,
                r#"{"DEFAULT_AP_SSID":"Lab","MDNS_HOSTNAME":"bench","USB_HID_ENABLED":true}"#,
            )
            .unwrap();
        let config = load_or_default(DeviceConfig::default(), &store);
        assert_eq!(config.default_ap_ssid, "Lab");
        assert_eq!(config.mdns_hostname, "bench");
        assert_eq!(config.default_ap_password, DEFAULT_AP_PASSWORD);
    }

    #[test]
    fn unparseable_file_is_not_fatal() {
        let store = MemStore::new();
        store.write_string(PATH_CONFIG, "{not json").unwrap();
        let mut config = DeviceConfig::default();
        assert!(!config.overlay_from_store(&store));
        assert_eq!(config, DeviceConfig::default());
    }

    #[test]
    fn empty_ota_password_means_unprotected() {
        let config = DeviceConfig {
            ota_password: Some(String::new()),
            ..DeviceConfig::default()
        };
        assert_eq!(config.ota_password(), None);
    }
}
