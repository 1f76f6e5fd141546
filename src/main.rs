use anyhow::Result;
use log::info;

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod logging;
#[cfg(target_os = "espidf")]
mod network;
#[cfg(target_os = "espidf")]
mod ota;
#[cfg(target_os = "espidf")]
mod system;
mod version;

fn apply_build_log_level() {
    if let Some(level) = option_env!("ESP2GO_LOG_LEVEL") {
        if !logging::set_max_level_from_str(level) {
            log::warn!("Ignoring unknown ESP2GO_LOG_LEVEL '{}'", level);
        }
    }
}

#[cfg(target_os = "espidf")]
fn configure_watchdog() {
    unsafe {
        let _ = esp_idf_sys::esp_task_wdt_deinit();
        let wdt_config = esp_idf_sys::esp_task_wdt_config_t {
            timeout_ms: 5000,
            idle_core_mask: 0,
            trigger_panic: false,
        };
        let result = esp_idf_sys::esp_task_wdt_init(&wdt_config as *const _);
        if result == esp_idf_sys::ESP_OK as i32 {
            info!("Watchdog timeout set to 5 seconds");
            if esp_idf_sys::esp_task_wdt_add(std::ptr::null_mut()) != esp_idf_sys::ESP_OK as i32 {
                log::warn!("Failed to add main task to watchdog");
            }
        } else {
            log::warn!("Watchdog reconfiguration failed: {:?}", result);
        }
    }
}

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use esp2go_core::{Device, Hardware};
    use esp_idf_hal::{delay::FreeRtos, peripherals::Peripherals};
    use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
    use std::sync::Arc;

    esp_idf_svc::sys::link_patches();
    if let Err(e) = logging::init_logger() {
        println!("Logger initialization failed: {}", e);
    }
    apply_build_log_level();
    info!("{}", version::version_info());

    configure_watchdog();

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let store = match system::mount_data_partition() {
        Ok(store) => store,
        Err(e) => {
            // Nothing to list at the bare mount point, so storage reports not ready
            log::error!("Data partition mount failed: {:#}", e);
            esp2go_core::hal::FsStore::new(system::storage::MOUNT_POINT)
        }
    };

    let audio: Option<Arc<dyn esp2go_core::hal::AudioInput>> = match system::PdmMicrophone::new(
        peripherals.i2s0,
        peripherals.pins.gpio38,
        peripherals.pins.gpio39,
    ) {
        Ok(mic) => Some(Arc::new(mic)),
        Err(e) => {
            log::warn!("Microphone unavailable: {:#}", e);
            None
        }
    };

    let hw = Hardware {
        store: Arc::new(store),
        radio: Arc::new(network::EspRadio::new(peripherals.modem, sys_loop, nvs)?),
        flash: Arc::new(ota::EspFirmwareTarget::new()),
        system: Arc::new(system::EspSystem::new()),
        audio,
    };

    let defaults = config::build_time_defaults();
    let mut server = network::EspApiServer::new(defaults.http_port)?;
    let mut device = Device::boot(
        defaults,
        hw,
        version::FIRMWARE_VERSION,
        &mut server,
    )?;
    server.mount_fallbacks()?;
    info!("{} HTTP routes mounted", server.route_count());

    let period_ms = device.loop_period().as_millis() as u32;
    loop {
        if let Some(Err(e)) = device.tick() {
            log::error!("Scheduled update failed: {}", e);
        }
        unsafe {
            esp_idf_sys::esp_task_wdt_reset();
        }
        FreeRtos::delay_ms(period_ms);
    }
}

/// Host run: boots the device over the in-memory simulators and lists the
/// published modules.
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use esp2go_core::api::{Method, RouteTable};
    use esp2go_core::registry::MODULES_LIST_PATH;
    use esp2go_core::sim::{MemStore, SimAudio, SimFlash, SimRadio, SimSystem};
    use esp2go_core::{Device, Hardware};
    use std::sync::Arc;

    logging::init_logger()?;
    apply_build_log_level();
    info!("{}", version::version_info());

    let config = config::build_time_defaults();
    let radio = SimRadio::new().with_network(&config.default_wifi_ssid, &config.default_wifi_password);
    let hw = Hardware {
        store: Arc::new(MemStore::new()),
        radio: Arc::new(radio),
        flash: Arc::new(SimFlash::new(1536 * 1024)),
        system: Arc::new(SimSystem::new()),
        audio: Some(Arc::new(SimAudio::new(16_000))),
    };

    let mut routes = RouteTable::new();
    let mut device = Device::boot(config, hw, version::FIRMWARE_VERSION, &mut routes)?;
    device.tick();

    let listing = routes.call(Method::Get, MODULES_LIST_PATH, &[], &[]);
    info!("{} {}", listing.status, listing.to_json_string());

    device.shutdown();
    Ok(())
}
