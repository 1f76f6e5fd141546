// Centralized version information

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Reported by /_api/system/info and the boot banner
pub const FIRMWARE_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"), "-rust");

// Version info string for logging
pub fn version_info() -> String {
    format!("Firmware: {}, Core: {}", FIRMWARE_VERSION, CARGO_VERSION)
}
