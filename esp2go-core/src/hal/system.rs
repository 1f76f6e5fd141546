use std::time::Duration;

/// Chip-level services.
pub trait System: Send + Sync {
    /// Reboots immediately. Does not return on hardware.
    fn restart(&self);

    /// Reboots after `grace` so an in-flight HTTP response can flush.
    fn restart_after(&self, grace: Duration);

    fn delay_ms(&self, ms: u32);

    fn uptime(&self) -> Duration;

    fn free_heap(&self) -> u32;

    fn min_free_heap(&self) -> u32;

    fn reset_reason(&self) -> &'static str;

    fn chip(&self) -> String;
}
