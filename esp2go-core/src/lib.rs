//! ESP2GO core - hardware-independent firmware logic
//!
//! Capability modules, their registry and HTTP surface, network bring-up and
//! the firmware update pipeline. Hardware is reached only through the traits
//! in [`hal`], so everything here runs and is tested on the host.

pub mod api;
pub mod config;
pub mod device;
pub mod hal;
pub mod module;
pub mod modules;
pub mod network;
pub mod ota;
pub mod registry;
pub mod sim;
pub mod validators;

pub use device::{Device, Hardware};
pub use module::Module;
pub use registry::ModuleRegistry;
