//! Whole-device behavior over simulated hardware.

use std::sync::Arc;
use std::time::Duration;

use esp2go_core::api::{Method, RouteTable};
use esp2go_core::config::{DeviceConfig, PATH_WIFI_CONFIG};
use esp2go_core::hal::BlockStore;
use esp2go_core::network::{attempt_order, Credential, NetworkState};
use esp2go_core::ota::UpdateState;
use esp2go_core::registry::MODULES_LIST_PATH;
use esp2go_core::sim::{firmware_image, MemStore, Restart, SimAudio, SimFlash, SimRadio, SimSystem};
use esp2go_core::{Device, Hardware};
use proptest::prelude::*;

struct Bench {
    store: MemStore,
    radio: SimRadio,
    flash: SimFlash,
    system: SimSystem,
    table: RouteTable,
    device: Device,
}

fn boot(store: MemStore, radio: SimRadio, with_mic: bool) -> Bench {
    let flash = SimFlash::new(512 * 1024);
    let system = SimSystem::new();
    let hw = Hardware {
        store: Arc::new(store.clone()),
        radio: Arc::new(radio.clone()),
        flash: Arc::new(flash.clone()),
        system: Arc::new(system.clone()),
        audio: with_mic.then(|| Arc::new(SimAudio::new(16_000)) as Arc<dyn esp2go_core::hal::AudioInput>),
    };
    let mut table = RouteTable::new();
    let device = Device::boot(DeviceConfig::default(), hw, "1.2.3", &mut table).unwrap();
    Bench {
        store,
        radio,
        flash,
        system,
        table,
        device,
    }
}

fn saved_home() -> MemStore {
    let store = MemStore::new();
    store
        .write_string(
            PATH_WIFI_CONFIG,
            r#"{"networks":[{"ssid":"home","password":"password1","priority":1}]}"#,
        )
        .unwrap();
    store
}

#[test]
fn failed_init_never_exposes_routes() {
    let bench = boot(MemStore::new(), SimRadio::new(), false);
    assert!(bench.table.paths_under("/_api/microphone/").is_empty());

    let resp = bench
        .table
        .call(Method::Get, "/_api/microphone/level", &[], b"");
    assert_eq!(resp.status, 404);

    let list = bench.table.call(Method::Get, MODULES_LIST_PATH, &[], b"").body;
    let mic = list["modules"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == "microphone")
        .unwrap();
    assert_eq!(mic["ready"], false);
    assert_eq!(mic["enabled"], true);
}

#[test]
fn listing_is_stable_and_complete() {
    let bench = boot(saved_home(), SimRadio::new().with_network("home", "password1"), true);
    assert!(matches!(bench.device.network(), NetworkState::Connected { .. }));

    let first = bench.table.call(Method::Get, MODULES_LIST_PATH, &[], b"");
    let second = bench.table.call(Method::Get, MODULES_LIST_PATH, &[], b"");
    assert_eq!(first.status, 200);
    assert_eq!(first.body, second.body);
    assert_eq!(first.body["count"], 5);

    let names: Vec<_> = first.body["modules"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["system", "wifi", "storage", "microphone", "ota"]);
    for module in first.body["modules"].as_array().unwrap() {
        assert_eq!(module["ready"], true, "{}", module["name"]);
    }
}

#[test]
fn missing_image_is_reported_without_restart() {
    let mut bench = boot(MemStore::new(), SimRadio::new(), false);
    let resp = bench
        .table
        .call(Method::Post, "/_api/ota/update?path=/nope.bin", &[], b"");
    assert_eq!(resp.status, 404);
    assert_eq!(resp.body["error"]["code"], "NOT_FOUND");

    assert!(bench.device.tick().is_none());
    assert!(bench.system.restarts().is_empty());
    assert_eq!(bench.device.pipeline().tracker().state(), UpdateState::Idle);
}

#[test]
fn scheduled_update_runs_on_next_tick() {
    let store = MemStore::new().with_file("/firmware.bin", &firmware_image(300 * 1024));
    let mut bench = boot(store, SimRadio::new(), true);

    let start = bench
        .table
        .call(Method::Post, "/_api/microphone/record/start", &[], b"");
    assert_eq!(start.status, 200);

    let accepted = bench.table.call(Method::Post, "/_api/ota/update", &[], b"");
    assert_eq!(accepted.status, 200);
    let busy = bench.table.call(Method::Post, "/_api/ota/update", &[], b"");
    assert_eq!(busy.status, 409);

    let upload_headers = [("Content-Type", "application/octet-stream")];
    let refused = bench
        .table
        .call(Method::Post, "/_api/ota/update", &upload_headers, &firmware_image(64));
    assert_eq!(refused.status, 409);

    let outcome = bench.device.tick().expect("pending update consumed");
    assert!(outcome.is_ok());
    assert_eq!(
        bench.flash.boot_image().map(|img| img.len()),
        Some(300 * 1024)
    );
    assert_eq!(
        bench.system.restarts(),
        vec![Restart::After(Duration::from_millis(1000))]
    );

    // Quiesce closed the recording and dropped the link before flashing.
    let status = bench
        .table
        .call(Method::Get, "/_api/microphone/record/status", &[], b"");
    assert_eq!(status.body["recording"], false);
    assert!(bench.store.exists("/recordings"));
    assert!(bench.device.tick().is_none());
}

#[test]
fn corrupt_stored_image_restarts_into_current_firmware() {
    let store = MemStore::new().with_file("/firmware.bin", &firmware_image(4096));
    store.fail_reads("/firmware.bin", 2048);
    let mut bench = boot(store, SimRadio::new(), false);

    let accepted = bench.table.call(Method::Post, "/_api/ota/update", &[], b"");
    assert_eq!(accepted.status, 200);
    let outcome = bench.device.tick().expect("pending update consumed");
    assert!(outcome.is_err());
    assert!(bench.flash.boot_image().is_none());
    assert!(!bench.flash.region_open());
    assert_eq!(bench.system.restarts(), vec![Restart::Immediate]);
}

#[test]
fn link_monitor_reconnects_from_main_loop() {
    let mut bench = boot(saved_home(), SimRadio::new().with_network("home", "password1"), false);
    bench.radio.drop_link();
    bench.device.tick();
    assert_eq!(bench.radio.reconnects(), 0);

    bench.system.advance(Duration::from_secs(30));
    bench.device.tick();
    assert_eq!(bench.radio.reconnects(), 1);
    let status = bench.table.call(Method::Get, "/_api/wifi/status", &[], b"").body;
    assert_eq!(status["connected"], true);
}

#[test]
fn shutdown_releases_modules() {
    let mut bench = boot(MemStore::new(), SimRadio::new(), true);
    bench.device.shutdown();
    assert!(bench.device.registry().is_empty());
}

proptest! {
    #[test]
    fn attempt_order_sorts_by_priority_and_keeps_position(
        priorities in proptest::collection::vec(1u32..5, 0..10)
    ) {
        let creds: Vec<Credential> = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| Credential::new(&format!("net{i}"), "", *p))
            .collect();
        let order = attempt_order(&creds);
        prop_assert_eq!(order.len(), creds.len());
        for pair in order.windows(2) {
            prop_assert!(pair[0].priority <= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                let pos = |c: &Credential| creds.iter().position(|x| x.ssid == c.ssid);
                prop_assert!(pos(pair[0]) < pos(pair[1]));
            }
        }
    }
}
