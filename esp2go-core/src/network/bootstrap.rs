//! Connection bootstrap: saved networks, then the default credential, then
//! a self-hosted access point.

use serde::Serialize;

use super::credentials::{Credential, CredentialStore};
use crate::config::DeviceConfig;
use crate::hal::{BlockStore, Radio, System};

pub const CONNECT_POLL_ATTEMPTS: u32 = 20;
pub const CONNECT_POLL_INTERVAL_MS: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Saved { priority: u32 },
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NetworkState {
    Disconnected,
    Connected { ssid: String, source: CredentialSource },
    AccessPoint { ssid: String },
    /// The access point could not be started either.
    Unreachable,
}

impl NetworkState {
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            NetworkState::Connected { .. } | NetworkState::AccessPoint { .. }
        )
    }
}

/// Out-of-band channel for capturing a first credential when none is saved
/// (serial console on the original hardware).
pub trait CredentialPrompt {
    fn capture(&mut self, radio: &dyn Radio) -> Option<Credential>;
}

pub struct Bootstrap<'a, 'p> {
    radio: &'a dyn Radio,
    system: &'a dyn System,
    config: &'a DeviceConfig,
    prompt: Option<&'p mut dyn CredentialPrompt>,
}

impl<'a> Bootstrap<'a, 'static> {
    pub fn new(radio: &'a dyn Radio, system: &'a dyn System, config: &'a DeviceConfig) -> Self {
        Self {
            radio,
            system,
            config,
            prompt: None,
        }
    }
}

impl<'a, 'p> Bootstrap<'a, 'p> {
    pub fn with_prompt<'q>(self, prompt: &'q mut dyn CredentialPrompt) -> Bootstrap<'a, 'q> {
        Bootstrap {
            radio: self.radio,
            system: self.system,
            config: self.config,
            prompt: Some(prompt),
        }
    }

    pub fn run(&mut self, creds: &mut CredentialStore, store: &dyn BlockStore) -> NetworkState {
        log::info!("Starting WiFi setup...");
        if let Err(e) = self.radio.set_station_mode() {
            log::error!("Failed to enter station mode: {:#}", e);
        }
        self.system.delay_ms(100);

        if creds.is_empty() {
            self.prompt_for_credential(creds, store);
        }

        let state = self.connect_saved(creds).or_else(|| self.connect_default());
        let state = match state {
            Some(state) => state,
            None => self.start_access_point(creds),
        };

        if state.is_reachable() {
            let hostname = &self.config.mdns_hostname;
            match self.radio.advertise_hostname(hostname) {
                Ok(()) => log::info!("mDNS responder started: http://{}.local", hostname),
                Err(e) => log::warn!("Failed to start mDNS responder: {:#}", e),
            }
        }
        state
    }

    fn prompt_for_credential(&mut self, creds: &mut CredentialStore, store: &dyn BlockStore) {
        let Some(prompt) = self.prompt.as_mut() else {
            return;
        };
        log::warn!("No saved WiFi networks, waiting for interactive setup");
        let Some(cred) = prompt.capture(self.radio) else {
            return;
        };
        match creds.add(cred) {
            Ok(()) => {
                if let Err(e) = creds.save(store) {
                    log::warn!("Failed to save new network: {:#}", e);
                }
            }
            Err(e) => log::warn!("Rejected network from setup: {}", e),
        }
    }

    fn connect_saved(&self, creds: &CredentialStore) -> Option<NetworkState> {
        for cred in creds.attempt_order() {
            log::info!(
                "Attempting to connect to: {} (priority {})",
                cred.ssid,
                cred.priority
            );
            if self.try_connect(&cred.ssid, &cred.password) {
                return Some(NetworkState::Connected {
                    ssid: cred.ssid.clone(),
                    source: CredentialSource::Saved {
                        priority: cred.priority,
                    },
                });
            }
            log::warn!("Failed to connect to: {}", cred.ssid);
        }
        None
    }

    fn connect_default(&self) -> Option<NetworkState> {
        let ssid = &self.config.default_wifi_ssid;
        if ssid.is_empty() {
            log::info!("No default network configured");
            return None;
        }
        log::info!("Fallback: trying default network {}", ssid);
        if self.try_connect(ssid, &self.config.default_wifi_password) {
            return Some(NetworkState::Connected {
                ssid: ssid.clone(),
                source: CredentialSource::Default,
            });
        }
        None
    }

    fn start_access_point(&self, creds: &CredentialStore) -> NetworkState {
        log::warn!("All WiFi connection attempts failed");
        log::info!("Starting Access Point mode...");
        if let Err(e) = self.radio.disconnect() {
            log::warn!("Disconnect before AP start failed: {:#}", e);
        }
        self.system.delay_ms(100);
        match self
            .radio
            .start_access_point(creds.ap_ssid(), creds.ap_password())
        {
            Ok(()) => {
                let link = self.radio.link_info();
                log::info!("AP Mode Started Successfully");
                log::info!("AP SSID: {}", creds.ap_ssid());
                log::info!("AP IP Address: {}", link.ip);
                NetworkState::AccessPoint {
                    ssid: creds.ap_ssid().to_string(),
                }
            }
            Err(e) => {
                log::error!("Failed to start AP mode, device is unreachable: {:#}", e);
                NetworkState::Unreachable
            }
        }
    }

    /// Begins association and polls for the link with a bounded budget.
    fn try_connect(&self, ssid: &str, secret: &str) -> bool {
        self.radio.set_auto_reconnect(true);
        if let Err(e) = self.radio.begin(ssid, secret) {
            log::warn!("Association with {} failed to start: {:#}", ssid, e);
            return false;
        }
        for _ in 0..CONNECT_POLL_ATTEMPTS {
            if self.radio.is_connected() {
                break;
            }
            self.system.delay_ms(CONNECT_POLL_INTERVAL_MS);
        }
        if !self.radio.is_connected() {
            return false;
        }
        let link = self.radio.link_info();
        log::info!("WiFi Connected Successfully!");
        log::info!("SSID: {}", ssid);
        log::info!("IP Address: {}", link.ip);
        log::info!("Signal Strength: {} dBm", link.rssi);
        log::info!("MAC Address: {}", link.mac);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemStore, SimRadio, SimSystem};
    use std::time::Duration;

    fn creds(list: &[(&str, u32)]) -> CredentialStore {
        let mut creds = CredentialStore::new("ESP2GO", "12345678");
        for (ssid, prio) in list {
            creds.add(Credential::new(ssid, "", *prio)).unwrap();
        }
        creds
    }

    #[test]
    fn first_success_at_lowest_priority_wins() {
        let radio = SimRadio::new().with_network("C", "").with_network("A", "");
        let system = SimSystem::new();
        let config = DeviceConfig::default();
        let mut creds = creds(&[("A", 2), ("B", 1), ("C", 1)]);
        let state = Bootstrap::new(&radio, &system, &config).run(&mut creds, &MemStore::new());

        assert_eq!(radio.attempts(), vec!["B", "C"]);
        assert_eq!(
            state,
            NetworkState::Connected {
                ssid: "C".into(),
                source: CredentialSource::Saved { priority: 1 }
            }
        );
        assert_eq!(radio.hostnames(), vec!["esp2go"]);
    }

    #[test]
    fn each_failed_attempt_costs_ten_seconds() {
        let radio = SimRadio::new();
        let system = SimSystem::new();
        let config = DeviceConfig::default();
        let mut creds = creds(&[("A", 1)]);
        Bootstrap::new(&radio, &system, &config).run(&mut creds, &MemStore::new());
        // 100 ms settle, 20 x 500 ms polling, 100 ms before AP start.
        assert_eq!(system.uptime(), Duration::from_millis(10_200));
    }

    #[test]
    fn default_then_access_point() {
        let radio = SimRadio::new();
        let system = SimSystem::new();
        let config = DeviceConfig {
            default_wifi_ssid: "fallback".into(),
            ..DeviceConfig::default()
        };
        let mut creds = creds(&[("A", 1)]);
        let state = Bootstrap::new(&radio, &system, &config).run(&mut creds, &MemStore::new());
        assert_eq!(radio.attempts(), vec!["A", "fallback"]);
        assert_eq!(state, NetworkState::AccessPoint { ssid: "ESP2GO".into() });
        assert_eq!(radio.access_point().as_deref(), Some("ESP2GO"));
    }

    #[test]
    fn default_network_after_saved_ones_fail() {
        let radio = SimRadio::new().with_network("office", "hunter22");
        let system = SimSystem::new();
        let config = DeviceConfig {
            default_wifi_ssid: "office".into(),
            default_wifi_password: "hunter22".into(),
            ..DeviceConfig::default()
        };
        let mut creds = creds(&[("home", 3), ("cafe", 1), ("lab", 2)]);
        let state = Bootstrap::new(&radio, &system, &config).run(&mut creds, &MemStore::new());

        assert_eq!(radio.attempts(), vec!["cafe", "lab", "home", "office"]);
        assert_eq!(
            state,
            NetworkState::Connected {
                ssid: "office".into(),
                source: CredentialSource::Default
            }
        );
        assert_eq!(radio.access_point(), None);
    }

    #[test]
    fn failed_access_point_is_not_fatal() {
        let radio = SimRadio::new().failing_access_point();
        let system = SimSystem::new();
        let config = DeviceConfig::default();
        let mut creds = creds(&[]);
        let state = Bootstrap::new(&radio, &system, &config).run(&mut creds, &MemStore::new());
        assert_eq!(state, NetworkState::Unreachable);
        assert!(radio.hostnames().is_empty());
    }

    struct Scripted(Option<Credential>);

    impl CredentialPrompt for Scripted {
        fn capture(&mut self, _radio: &dyn Radio) -> Option<Credential> {
            self.0.take()
        }
    }

    #[test]
    fn prompt_fills_empty_list_and_persists() {
        let radio = SimRadio::new().with_network("lab", "password1");
        let system = SimSystem::new();
        let config = DeviceConfig::default();
        let store = MemStore::new();
        let mut creds = creds(&[]);
        let mut prompt = Scripted(Some(Credential::new("lab", "password1", 0)));
        let state = Bootstrap::new(&radio, &system, &config)
            .with_prompt(&mut prompt)
            .run(&mut creds, &store);
        assert!(matches!(state, NetworkState::Connected { .. }));
        assert_eq!(CredentialStore::load(&store, "a", "b").len(), 1);
    }
}
