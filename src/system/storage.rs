use anyhow::{anyhow, Result};
use esp2go_core::hal::{FsStore, StoreUsage};
use std::ffi::CString;
use std::io;

/// Mount point of the data partition.
pub const MOUNT_POINT: &str = "/store";
/// Label of the FAT partition in partitions.csv.
pub const PARTITION_LABEL: &str = "storage";

/// Mounts the wear-levelled FAT partition and returns a store rooted on it.
/// The partition is formatted on first boot.
pub fn mount_data_partition() -> Result<FsStore> {
    let base_path = CString::new(MOUNT_POINT)?;
    let label = CString::new(PARTITION_LABEL)?;
    let mount_config = esp_idf_sys::esp_vfs_fat_mount_config_t {
        format_if_mount_failed: true,
        max_files: 8,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut wl_handle: esp_idf_sys::wl_handle_t = esp_idf_sys::WL_INVALID_HANDLE as _;

    let result = unsafe {
        esp_idf_sys::esp_vfs_fat_spiflash_mount_rw_wl(
            base_path.as_ptr(),
            label.as_ptr(),
            &mount_config,
            &mut wl_handle,
        )
    };
    if result != esp_idf_sys::ESP_OK as i32 {
        return Err(anyhow!("FAT mount of '{}' failed: error {}", PARTITION_LABEL, result));
    }

    let store = FsStore::new(MOUNT_POINT).with_usage_probe(fat_usage);
    match fat_usage() {
        Ok(usage) => log::info!(
            "Storage mounted at {}: {} KB total, {} KB free",
            MOUNT_POINT,
            usage.total_bytes / 1024,
            usage.free_bytes() / 1024
        ),
        Err(e) => log::warn!("Storage mounted at {}, usage unavailable: {}", MOUNT_POINT, e),
    }
    Ok(store)
}

fn fat_usage() -> io::Result<StoreUsage> {
    let base_path = CString::new(MOUNT_POINT).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut total: u64 = 0;
    let mut free: u64 = 0;
    let result = unsafe { esp_idf_sys::esp_vfs_fat_info(base_path.as_ptr(), &mut total, &mut free) };
    if result != esp_idf_sys::ESP_OK as i32 {
        return Err(io::Error::other(format!("esp_vfs_fat_info error {}", result)));
    }
    Ok(StoreUsage {
        total_bytes: total,
        used_bytes: total.saturating_sub(free),
    })
}
