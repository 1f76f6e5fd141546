//! Network bring-up and upkeep.

pub mod bootstrap;
pub mod credentials;
pub mod monitor;

pub use bootstrap::{Bootstrap, CredentialPrompt, CredentialSource, NetworkState};
pub use credentials::{attempt_order, Credential, CredentialError, CredentialStore};
pub use monitor::{LinkMonitor, MONITOR_PERIOD};
