use anyhow::{anyhow, Result};
use esp2go_core::hal::{LinkInfo, Radio, RadioMode, ScanResult};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    mdns::EspMdns,
    nvs::EspDefaultNvsPartition,
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// [`Radio`] over the ESP-IDF WiFi driver.
///
/// `EspWifi` is used directly rather than `BlockingWifi` so that `begin`
/// returns immediately; the bootstrap polls `is_connected` with its own
/// bounded budget.
pub struct EspRadio {
    wifi: Mutex<EspWifi<'static>>,
    mdns: Mutex<Option<EspMdns>>,
    mode: Mutex<RadioMode>,
    auto_reconnect: AtomicBool,
}

fn auth_for(secret: &str) -> AuthMethod {
    if secret.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    }
}

fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

impl EspRadio {
    pub fn new(modem: Modem, sys_loop: EspSystemEventLoop, nvs: EspDefaultNvsPartition) -> Result<Self> {
        let wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;
        log::info!("WiFi driver initialized");
        Ok(Self {
            wifi: Mutex::new(wifi),
            mdns: Mutex::new(None),
            mode: Mutex::new(RadioMode::Off),
            auto_reconnect: AtomicBool::new(true),
        })
    }

    fn wifi(&self) -> MutexGuard<'_, EspWifi<'static>> {
        self.wifi.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_mode(&self, mode: RadioMode) {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    fn rssi() -> i8 {
        let mut info: esp_idf_sys::wifi_ap_record_t = Default::default();
        let result = unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut info) };
        if result == esp_idf_sys::ESP_OK as i32 {
            info.rssi
        } else {
            -100
        }
    }
}

impl Radio for EspRadio {
    fn mode(&self) -> RadioMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_station_mode(&self) -> Result<()> {
        let mut wifi = self.wifi();
        if wifi.is_started()? {
            let _ = wifi.disconnect();
        }
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        if !wifi.is_started()? {
            wifi.start()?;
        }
        // Disable power save; modem sleep drops links under HTTP load
        unsafe {
            esp_idf_sys::esp_wifi_set_ps(esp_idf_sys::wifi_ps_type_t_WIFI_PS_NONE);
        }
        self.set_mode(RadioMode::Station);
        Ok(())
    }

    fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::Relaxed);
    }

    fn begin(&self, ssid: &str, secret: &str) -> Result<()> {
        let cfg = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow!("Invalid SSID format: {}", ssid))?,
            password: secret
                .try_into()
                .map_err(|_| anyhow!("Invalid password format"))?,
            auth_method: auth_for(secret),
            ..Default::default()
        });
        let mut wifi = self.wifi();
        wifi.set_configuration(&cfg)?;
        wifi.connect()?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.wifi().is_up().unwrap_or(false)
    }

    fn reconnect(&self) -> Result<()> {
        if !self.auto_reconnect.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.wifi().connect()?;
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.wifi().disconnect()?;
        Ok(())
    }

    fn start_access_point(&self, ssid: &str, secret: &str) -> Result<()> {
        let cfg = Configuration::AccessPoint(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow!("Invalid AP SSID: {}", ssid))?,
            password: secret
                .try_into()
                .map_err(|_| anyhow!("Invalid AP password"))?,
            auth_method: auth_for(secret),
            channel: 1,
            ..Default::default()
        });
        let mut wifi = self.wifi();
        if wifi.is_started()? {
            wifi.stop()?;
        }
        wifi.set_configuration(&cfg)?;
        wifi.start()?;
        self.set_mode(RadioMode::AccessPoint);
        Ok(())
    }

    fn link_info(&self) -> LinkInfo {
        let wifi = self.wifi();
        match self.mode() {
            RadioMode::AccessPoint => {
                let netif = wifi.ap_netif();
                let ssid = match wifi.get_configuration() {
                    Ok(Configuration::AccessPoint(ap)) => ap.ssid.to_string(),
                    _ => String::new(),
                };
                LinkInfo {
                    ssid,
                    ip: netif.get_ip_info().map(|i| i.ip.to_string()).unwrap_or_default(),
                    rssi: 0,
                    mac: netif.get_mac().map(format_mac).unwrap_or_default(),
                }
            }
            _ => {
                let netif = wifi.sta_netif();
                let ssid = match wifi.get_configuration() {
                    Ok(Configuration::Client(client)) => client.ssid.to_string(),
                    _ => String::new(),
                };
                let up = wifi.is_up().unwrap_or(false);
                LinkInfo {
                    ssid,
                    ip: if up {
                        netif.get_ip_info().map(|i| i.ip.to_string()).unwrap_or_default()
                    } else {
                        String::new()
                    },
                    rssi: if up { Self::rssi() } else { -100 },
                    mac: netif.get_mac().map(format_mac).unwrap_or_default(),
                }
            }
        }
    }

    fn scan(&self) -> Result<Vec<ScanResult>> {
        let found = self.wifi().scan()?;
        Ok(found
            .into_iter()
            .map(|ap| ScanResult {
                ssid: ap.ssid.to_string(),
                rssi: ap.signal_strength,
                channel: ap.channel,
                secured: !matches!(ap.auth_method, None | Some(AuthMethod::None)),
            })
            .collect())
    }

    fn advertise_hostname(&self, hostname: &str) -> Result<()> {
        let mut slot = self.mdns.lock().unwrap_or_else(|e| e.into_inner());
        let mdns = match slot.as_mut() {
            Some(mdns) => mdns,
            None => slot.insert(EspMdns::take()?),
        };
        mdns.set_hostname(hostname)?;
        mdns.add_service(None, "_http", "_tcp", 80, &[("path", "/")])?;
        Ok(())
    }
}
