use std::time::Duration;

use crate::hal::{Radio, RadioMode};

pub const MONITOR_PERIOD: Duration = Duration::from_secs(30);

/// Periodic link check driven from the main loop.
///
/// Only client mode is watched; an access point has no upstream to lose.
#[derive(Debug)]
pub struct LinkMonitor {
    period: Duration,
    last_check: Duration,
    reconnect_attempts: u32,
}

impl LinkMonitor {
    /// `now` is uptime at construction; the first check is one period later.
    pub fn new(period: Duration, now: Duration) -> Self {
        Self {
            period,
            last_check: now,
            reconnect_attempts: 0,
        }
    }

    /// Returns true when a reconnect was triggered.
    pub fn poll(&mut self, radio: &dyn Radio, now: Duration) -> bool {
        if now.saturating_sub(self.last_check) < self.period {
            return false;
        }
        self.last_check = now;
        if radio.mode() != RadioMode::Station || radio.is_connected() {
            self.reconnect_attempts = 0;
            return false;
        }
        self.reconnect_attempts += 1;
        log::warn!(
            "WiFi disconnected, attempting reconnect (attempt {})",
            self.reconnect_attempts
        );
        if let Err(e) = radio.reconnect() {
            log::error!("Reconnect request failed: {:#}", e);
        }
        true
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }
}
