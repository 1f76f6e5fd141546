use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioMode {
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "STA")]
    Station,
    #[serde(rename = "AP")]
    AccessPoint,
    #[serde(rename = "AP_STA")]
    Mixed,
}

impl RadioMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioMode::Off => "OFF",
            RadioMode::Station => "STA",
            RadioMode::AccessPoint => "AP",
            RadioMode::Mixed => "AP_STA",
        }
    }
}

/// Snapshot of the current link, whichever mode the radio is in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkInfo {
    pub ssid: String,
    pub ip: String,
    pub rssi: i8,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub ssid: String,
    pub rssi: i8,
    pub channel: u8,
    pub secured: bool,
}

/// WiFi radio. All calls return promptly; association progress is observed
/// by polling [`Radio::is_connected`].
pub trait Radio: Send + Sync {
    fn mode(&self) -> RadioMode;

    /// Switches to client mode and drops any current association.
    fn set_station_mode(&self) -> Result<()>;

    fn set_auto_reconnect(&self, enabled: bool);

    /// Starts associating with `ssid`. Does not wait for the link.
    fn begin(&self, ssid: &str, secret: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn reconnect(&self) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    fn start_access_point(&self, ssid: &str, secret: &str) -> Result<()>;

    fn link_info(&self) -> LinkInfo;

    fn scan(&self) -> Result<Vec<ScanResult>>;

    /// Registers `<hostname>.local` with the name responder.
    fn advertise_hostname(&self, hostname: &str) -> Result<()>;
}
