use esp2go_core::config::DeviceConfig;

/// Defaults with the credentials compiled in from wifi_config.h.
///
/// The runtime `/config.json` overlay is applied later, once the store is
/// mounted; see [`esp2go_core::config::load_or_default`].
pub fn build_time_defaults() -> DeviceConfig {
    let mut config = DeviceConfig::default();

    // Set by build.rs; absent when wifi_config.h was missing
    if let Some(ssid) = option_env!("DEFAULT_WIFI_SSID") {
        config.default_wifi_ssid = ssid.to_string();
    }
    if let Some(password) = option_env!("DEFAULT_WIFI_PASSWORD") {
        config.default_wifi_password = password.to_string();
    }
    config.ota_password = option_env!("OTA_PASSWORD")
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    log::info!(
        "Config default: SSID='{}', Password={}, OTA password {}",
        config.default_wifi_ssid,
        if config.default_wifi_password.is_empty() { "<empty>" } else { "<set>" },
        if config.ota_password.is_some() { "<set>" } else { "<none>" }
    );
    config
}
