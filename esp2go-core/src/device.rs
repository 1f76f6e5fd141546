//! Boot sequence and main-loop tick shared by the firmware and host runs.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::api::ApiSurface;
use crate::config::{self, DeviceConfig};
use crate::hal::{AudioInput, BlockStore, FirmwareTarget, Radio, System};
use crate::modules::{MicrophoneModule, OtaModule, StorageModule, SystemModule, WifiModule};
use crate::network::{CredentialPrompt, NetworkState};
use crate::ota::{UpdateError, UpdatePipeline};
use crate::registry::ModuleRegistry;

pub const HEAP_CHECK_PERIOD: Duration = Duration::from_secs(90);
pub const LOW_HEAP_THRESHOLD: u32 = 10_000;

/// Board services handed to [`Device::boot`].
#[derive(Clone)]
pub struct Hardware {
    pub store: Arc<dyn BlockStore>,
    pub radio: Arc<dyn Radio>,
    pub flash: Arc<dyn FirmwareTarget>,
    pub system: Arc<dyn System>,
    pub audio: Option<Arc<dyn AudioInput>>,
}

pub struct Device {
    config: DeviceConfig,
    hw: Hardware,
    registry: ModuleRegistry,
    pipeline: Arc<UpdatePipeline>,
    wifi: Arc<WifiModule>,
    network: NetworkState,
    last_heap_check: Duration,
}

impl Device {
    pub fn boot(
        config: DeviceConfig,
        hw: Hardware,
        firmware_version: &'static str,
        surface: &mut dyn ApiSurface,
    ) -> Result<Self> {
        Self::boot_with_prompt(config, hw, firmware_version, surface, None)
    }

    /// Full bring-up: config, modules, network, then routes. Routes are
    /// published once, after every module has had its chance to come up.
    pub fn boot_with_prompt(
        base: DeviceConfig,
        hw: Hardware,
        firmware_version: &'static str,
        surface: &mut dyn ApiSurface,
        prompt: Option<&mut dyn CredentialPrompt>,
    ) -> Result<Self> {
        log::info!("ESP2GO firmware {} starting", firmware_version);
        log::info!("Chip: {}, reset reason: {}", hw.system.chip(), hw.system.reset_reason());

        let config = config::load_or_default(base, hw.store.as_ref());
        let restart_grace = Duration::from_millis(config.restart_grace_ms);

        let pipeline = Arc::new(UpdatePipeline::new(
            Arc::clone(&hw.store),
            Arc::clone(&hw.flash),
            Arc::clone(&hw.system),
            restart_grace,
        ));
        let wifi = Arc::new(WifiModule::new(
            Arc::clone(&hw.radio),
            Arc::clone(&hw.system),
            Arc::clone(&hw.store),
            config.clone(),
        ));
        let microphone = Arc::new(MicrophoneModule::new(
            hw.audio.clone(),
            Arc::clone(&hw.store),
            Arc::clone(&hw.system),
        ));

        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(SystemModule::new(
            Arc::clone(&hw.system),
            firmware_version,
            restart_grace,
        )))?;
        registry.register(wifi.clone())?;
        registry.register(Arc::new(StorageModule::new(
            Arc::clone(&hw.store),
            Arc::clone(&hw.system),
        )))?;
        registry.register(microphone.clone())?;
        registry.register(Arc::new(OtaModule::new(
            Arc::clone(&pipeline),
            config.ota_password(),
        )))?;

        let ready = registry.init_all();
        log::info!("{} of {} modules ready", ready, registry.len());

        pipeline.add_quiesce_hook("microphone", move || microphone.stop_if_recording());
        let radio = Arc::clone(&hw.radio);
        pipeline.add_quiesce_hook("wifi", move || {
            if let Err(e) = radio.disconnect() {
                log::warn!("WiFi disconnect failed: {:#}", e);
            }
        });

        let network = wifi.connect(prompt);
        match &network {
            NetworkState::Connected { ssid, .. } => log::info!("Network: connected to {}", ssid),
            NetworkState::AccessPoint { ssid } => log::info!("Network: access point {}", ssid),
            other => log::error!("Network: {:?}", other),
        }

        let published = registry.register_all_apis(surface);
        log::info!("APIs published for: {}", published.join(", "));
        log::info!("Free heap: {} bytes", hw.system.free_heap());
        log::info!("Boot complete");

        let last_heap_check = hw.system.uptime();
        Ok(Self {
            config,
            hw,
            registry,
            pipeline,
            wifi,
            network,
            last_heap_check,
        })
    }

    /// One main-loop pass. A scheduled update takes the whole tick; on
    /// hardware it never returns because the device restarts.
    pub fn tick(&mut self) -> Option<Result<(), UpdateError>> {
        if let Some(outcome) = self.pipeline.run_pending() {
            return Some(outcome);
        }
        self.registry.update_all();
        self.watch_heap();
        None
    }

    fn watch_heap(&mut self) {
        let now = self.hw.system.uptime();
        if now.saturating_sub(self.last_heap_check) < HEAP_CHECK_PERIOD {
            return;
        }
        self.last_heap_check = now;
        let free = self.hw.system.free_heap();
        if free < LOW_HEAP_THRESHOLD {
            log::error!("Low memory warning: {} bytes free", free);
        } else {
            log::debug!("Free heap: {} bytes", free);
        }
    }

    pub fn shutdown(&mut self) {
        self.registry.shutdown_all();
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<UpdatePipeline> {
        &self.pipeline
    }

    pub fn network(&self) -> &NetworkState {
        &self.network
    }

    /// Reruns the network bootstrap, e.g. after credentials change.
    pub fn reconnect(&mut self) -> &NetworkState {
        self.network = self.wifi.connect(None);
        &self.network
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_millis(self.config.loop_period_ms as u64)
    }

    pub fn system(&self) -> &Arc<dyn System> {
        &self.hw.system
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Method, RouteTable};
    use crate::sim::{MemStore, SimFlash, SimRadio, SimSystem};

    fn hardware(store: &MemStore, radio: &SimRadio, system: &SimSystem) -> Hardware {
        Hardware {
            store: Arc::new(store.clone()),
            radio: Arc::new(radio.clone()),
            flash: Arc::new(SimFlash::new(1024 * 1024)),
            system: Arc::new(system.clone()),
            audio: None,
        }
    }

    #[test]
    fn boot_publishes_ready_modules_only() {
        let (store, radio, system) = (MemStore::new(), SimRadio::new(), SimSystem::new());
        let mut table = RouteTable::new();
        let device = Device::boot(
            DeviceConfig::default(),
            hardware(&store, &radio, &system),
            "test",
            &mut table,
        )
        .unwrap();

        assert!(table.contains("/_api/system/info", Method::Get));
        assert!(table.contains("/_api/files/list", Method::Get));
        assert!(table.paths_under("/_api/microphone/").is_empty());
        assert!(!device.registry().is_ready("microphone"));
        assert!(matches!(device.network(), NetworkState::AccessPoint { .. }));
        assert!(store.exists(config::PATH_WIFI_CONFIG));
    }

    #[test]
    fn low_heap_is_checked_on_period() {
        let (store, radio, system) = (MemStore::new(), SimRadio::new(), SimSystem::new());
        let mut table = RouteTable::new();
        let mut device = Device::boot(
            DeviceConfig::default(),
            hardware(&store, &radio, &system),
            "test",
            &mut table,
        )
        .unwrap();
        system.set_free_heap(5_000);
        let before = device.last_heap_check;
        assert!(device.tick().is_none());
        assert_eq!(device.last_heap_check, before);
        system.advance(HEAP_CHECK_PERIOD);
        device.tick();
        assert_eq!(device.last_heap_check, before + HEAP_CHECK_PERIOD);
    }
}
