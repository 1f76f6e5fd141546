use anyhow::Result;
use esp2go_core::hal::AudioInput;
use esp_idf_hal::gpio::{InputPin, OutputPin};
use esp_idf_hal::i2s::{
    config::{
        Config, DataBitWidth, PdmRxClkConfig, PdmRxConfig, PdmRxGpioConfig, PdmRxSlotConfig,
        SlotMode,
    },
    I2s, I2sDriver, I2sRx,
};
use esp_idf_hal::peripheral::Peripheral;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

pub const SAMPLE_RATE: u32 = 16_000;
const LEVEL_WINDOW: usize = 256;
// A reader within this window keeps the level fresh without an extra read
const LEVEL_STALE_US: u64 = 200_000;

fn now_us() -> u64 {
    unsafe { esp_idf_sys::esp_timer_get_time().max(0) as u64 }
}

/// Peak amplitude of `samples` scaled to 0..=100.
pub fn peak_level(samples: &[i16]) -> u8 {
    let peak = samples
        .iter()
        .map(|s| s.unsigned_abs() as u32)
        .max()
        .unwrap_or(0)
        .min(i16::MAX as u32);
    ((peak * 100) / i16::MAX as u32) as u8
}

/// PDM microphone on the I2S peripheral, 16-bit mono.
pub struct PdmMicrophone {
    driver: Mutex<I2sDriver<'static, I2sRx>>,
    level: AtomicU8,
    last_read_us: AtomicU64,
}

impl PdmMicrophone {
    pub fn new<I2S: I2s>(
        i2s: impl Peripheral<P = I2S> + 'static,
        clk: impl Peripheral<P = impl OutputPin> + 'static,
        din: impl Peripheral<P = impl InputPin> + 'static,
    ) -> Result<Self> {
        let config = PdmRxConfig::new(
            Config::default(),
            PdmRxClkConfig::from_sample_rate_hz(SAMPLE_RATE),
            PdmRxSlotConfig::from_bits_per_sample_and_slot_mode(DataBitWidth::Bits16, SlotMode::Mono),
            PdmRxGpioConfig::new(false),
        );
        let mut driver = I2sDriver::new_pdm_rx(i2s, &config, clk, din)?;
        driver.rx_enable()?;
        log::info!("PDM microphone running at {} Hz", SAMPLE_RATE);
        Ok(Self {
            driver: Mutex::new(driver),
            level: AtomicU8::new(0),
            last_read_us: AtomicU64::new(0),
        })
    }

    fn read_into(driver: &mut I2sDriver<'static, I2sRx>, buf: &mut [i16]) -> usize {
        let mut bytes = vec![0u8; buf.len() * 2];
        let read = match driver.read(&mut bytes, 0) {
            Ok(n) => n,
            Err(e) if e.code() == esp_idf_sys::ESP_ERR_TIMEOUT as i32 => 0,
            Err(e) => {
                log::warn!("I2S read failed: {}", e);
                0
            }
        };
        let samples = read / 2;
        for (sample, pair) in buf.iter_mut().zip(bytes[..samples * 2].chunks_exact(2)) {
            *sample = i16::from_le_bytes([pair[0], pair[1]]);
        }
        samples
    }
}

impl AudioInput for PdmMicrophone {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn level(&self) -> u8 {
        let stale = now_us().saturating_sub(self.last_read_us.load(Ordering::Relaxed)) > LEVEL_STALE_US;
        if stale {
            let mut window = [0i16; LEVEL_WINDOW];
            let _ = self.read_samples(&mut window);
        }
        self.level.load(Ordering::Relaxed)
    }

    fn read_samples(&self, buf: &mut [i16]) -> usize {
        let Ok(mut driver) = self.driver.try_lock() else {
            return 0;
        };
        let n = Self::read_into(&mut driver, buf);
        if n > 0 {
            self.level.store(peak_level(&buf[..n]), Ordering::Relaxed);
            self.last_read_us.store(now_us(), Ordering::Relaxed);
        }
        n
    }
}
