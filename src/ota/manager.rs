// OTA writer over the ESP-IDF esp_ota_* API

use core::ffi::c_void;
use esp2go_core::hal::{FirmwareTarget, FlashError, ImageWriter};
use esp_idf_sys::{
    esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t,
    ESP_ERR_OTA_VALIDATE_FAILED, ESP_OK, OTA_SIZE_UNKNOWN,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy)]
struct Partition(*const esp_partition_t);

// Partition table entries are static for the life of the program
unsafe impl Send for Partition {}
unsafe impl Sync for Partition {}

/// The inactive OTA slot. Only one [`EspImageWriter`] may be open at a time.
pub struct EspFirmwareTarget {
    partition: Option<Partition>,
    open: Arc<AtomicBool>,
}

impl EspFirmwareTarget {
    pub fn new() -> Self {
        let update_partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        let partition = if update_partition.is_null() {
            log::warn!("OTA: no update partition in the partition table");
            None
        } else {
            let size = unsafe { (*update_partition).size };
            log::info!("OTA: update partition holds {} KB", size / 1024);
            Some(Partition(update_partition))
        };
        Self {
            partition,
            open: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for EspFirmwareTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareTarget for EspFirmwareTarget {
    fn capacity(&self) -> usize {
        self.partition
            .map(|p| unsafe { (*p.0).size as usize })
            .unwrap_or(0)
    }

    fn begin(&self, size: Option<usize>) -> Result<Box<dyn ImageWriter>, FlashError> {
        let partition = self.partition.ok_or(FlashError::NoUpdatePartition)?;
        let capacity = self.capacity();
        if let Some(requested) = size {
            if requested > capacity {
                return Err(FlashError::InsufficientSpace { requested, capacity });
            }
        }
        if self.open.swap(true, Ordering::AcqRel) {
            return Err(FlashError::RegionBusy);
        }

        let image_size = size.unwrap_or(OTA_SIZE_UNKNOWN as usize);
        let mut handle: esp_ota_handle_t = 0;
        let result = unsafe { esp_ota_begin(partition.0, image_size as _, &mut handle) };
        if result != ESP_OK as i32 {
            self.open.store(false, Ordering::Release);
            return Err(FlashError::BeginFailed(format!("esp_ota_begin error {}", result)));
        }

        Ok(Box::new(EspImageWriter {
            partition,
            handle: Some(handle),
            bytes_written: 0,
            open: Arc::clone(&self.open),
        }))
    }
}

pub struct EspImageWriter {
    partition: Partition,
    handle: Option<esp_ota_handle_t>,
    bytes_written: usize,
    open: Arc<AtomicBool>,
}

impl EspImageWriter {
    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe {
                esp_ota_abort(handle);
            }
        }
        self.open.store(false, Ordering::Release);
    }
}

impl ImageWriter for EspImageWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<usize, FlashError> {
        let handle = self
            .handle
            .ok_or_else(|| FlashError::WriteFailed("region closed".to_string()))?;
        let result = unsafe { esp_ota_write(handle, chunk.as_ptr() as *const c_void, chunk.len() as _) };
        if result != ESP_OK as i32 {
            return Err(FlashError::WriteFailed(format!(
                "esp_ota_write error {} at offset {}",
                result, self.bytes_written
            )));
        }
        self.bytes_written += chunk.len();
        Ok(chunk.len())
    }

    fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    fn finalize(mut self: Box<Self>) -> Result<(), FlashError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| FlashError::ValidationFailed("region closed".to_string()))?;

        // esp_ota_end frees the handle whatever it returns
        let result = unsafe { esp_ota_end(handle) };
        self.open.store(false, Ordering::Release);
        if result == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
            return Err(FlashError::ValidationFailed("image header or checksum invalid".to_string()));
        } else if result != ESP_OK as i32 {
            return Err(FlashError::ValidationFailed(format!("esp_ota_end error {}", result)));
        }

        let result = unsafe { esp_ota_set_boot_partition(self.partition.0) };
        if result != ESP_OK as i32 {
            return Err(FlashError::BootPartitionFailed(format!(
                "esp_ota_set_boot_partition error {}",
                result
            )));
        }
        log::info!("OTA: {} bytes written, boot partition switched", self.bytes_written);
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        log::warn!("OTA: aborting after {} bytes", self.bytes_written);
        self.release();
    }
}

impl Drop for EspImageWriter {
    fn drop(&mut self) {
        // Clean up any unfinished region
        self.release();
    }
}
