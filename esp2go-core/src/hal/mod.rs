//! Hardware seams.
//!
//! Everything the core needs from the board goes through one of these traits.
//! The firmware crate implements them over ESP-IDF; [`crate::sim`] implements
//! them in memory for host runs and tests.

pub mod audio;
pub mod flash;
pub mod radio;
pub mod store;
pub mod system;

pub use audio::AudioInput;
pub use flash::{FirmwareTarget, FlashError, ImageWriter};
pub use radio::{LinkInfo, Radio, RadioMode, ScanResult};
pub use store::{BlockStore, DirEntry, FsStore, ReadHandle, StoreUsage, WriteHandle};
pub use system::System;
