use esp2go_core::hal::System;
use esp_idf_hal::delay::FreeRtos;
use std::time::Duration;

/// [`System`] over ESP-IDF chip services.
#[derive(Default)]
pub struct EspSystem;

impl EspSystem {
    pub fn new() -> Self {
        Self
    }
}

/// Get the last reset reason as a string
pub fn get_reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SDIO => "SDIO",
        _ => "Unknown",
    }
}

fn chip_model(model: esp_idf_sys::esp_chip_model_t) -> &'static str {
    match model {
        esp_idf_sys::esp_chip_model_t_CHIP_ESP32 => "ESP32",
        esp_idf_sys::esp_chip_model_t_CHIP_ESP32S2 => "ESP32-S2",
        esp_idf_sys::esp_chip_model_t_CHIP_ESP32S3 => "ESP32-S3",
        esp_idf_sys::esp_chip_model_t_CHIP_ESP32C3 => "ESP32-C3",
        _ => "ESP32-family",
    }
}

impl System for EspSystem {
    fn restart(&self) {
        log::logger().flush();
        unsafe {
            esp_idf_sys::esp_restart();
        }
    }

    fn restart_after(&self, grace: Duration) {
        log::info!("Restarting in {} ms", grace.as_millis());
        let spawned = std::thread::Builder::new()
            .name("restart".into())
            .stack_size(2048)
            .spawn(move || {
                std::thread::sleep(grace);
                log::logger().flush();
                unsafe {
                    esp_idf_sys::esp_restart();
                }
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn restart task ({}), restarting now", e);
            self.restart();
        }
    }

    fn delay_ms(&self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }

    fn uptime(&self) -> Duration {
        let micros = unsafe { esp_idf_sys::esp_timer_get_time() };
        Duration::from_micros(micros.max(0) as u64)
    }

    fn free_heap(&self) -> u32 {
        unsafe { esp_idf_sys::esp_get_free_heap_size() }
    }

    fn min_free_heap(&self) -> u32 {
        unsafe { esp_idf_sys::esp_get_minimum_free_heap_size() }
    }

    fn reset_reason(&self) -> &'static str {
        get_reset_reason()
    }

    fn chip(&self) -> String {
        let mut info = esp_idf_sys::esp_chip_info_t::default();
        unsafe {
            esp_idf_sys::esp_chip_info(&mut info);
        }
        format!(
            "{} rev {} ({} cores)",
            chip_model(info.model),
            info.revision,
            info.cores
        )
    }
}
