use std::fs;
use std::path::Path;

/// `#define` names in wifi_config.h and the env vars they become.
const BUILD_DEFINES: &[(&str, &str)] = &[
    ("WIFI_SSID", "DEFAULT_WIFI_SSID"),
    ("WIFI_PASSWORD", "DEFAULT_WIFI_PASSWORD"),
    ("OTA_PASSWORD", "OTA_PASSWORD"),
];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; host builds skip the toolchain setup
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
        // Add crash log helper for better panic diagnostics
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    let wifi_config_path = "wifi_config.h";
    println!("cargo:rerun-if-changed={}", wifi_config_path);
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;
        for (define, env) in BUILD_DEFINES {
            let pattern = format!("#define {} ", define);
            let value = contents
                .lines()
                .find(|l| l.trim_start().starts_with(&pattern))
                .and_then(|l| l.split('"').nth(1));
            if let Some(value) = value {
                println!("cargo:rustc-env={}={}", env, value);
            }
        }
    } else {
        println!("cargo:warning=wifi_config.h not found, building without a default network or OTA password");
    }

    Ok(())
}
