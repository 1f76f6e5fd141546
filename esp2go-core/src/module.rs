//! Capability module contract.

use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::api::ApiScope;

pub type StatusMap = Map<String, Value>;

/// A self-contained capability with a uniform lifecycle.
///
/// Modules are shared between the main loop and HTTP handlers, so every
/// method takes `&self` and mutable state lives behind the module's own
/// locks or atomics.
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn description(&self) -> &'static str;

    /// Route namespace under `/_api/`.
    fn namespace(&self) -> &'static str {
        self.name()
    }

    /// One-time setup. A `false` return leaves the module registered but
    /// not ready.
    fn init(&self) -> bool;

    /// Called once per main-loop tick while enabled and ready. Must return
    /// promptly.
    fn update(&self) {}

    /// Attaches this module's routes. Called once, after `init`, and only
    /// when the module is enabled and ready.
    fn register_api(self: Arc<Self>, scope: &mut ApiScope<'_>) -> Result<()>;

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_ready(&self) -> bool;

    /// Module-specific status fields. Must not change any state.
    fn status(&self, _out: &mut StatusMap) {}

    fn shutdown(&self) {}
}

/// Identity fields every listing carries, followed by the module's own.
pub fn status_document(module: &dyn Module, ready: bool) -> StatusMap {
    let mut out = StatusMap::new();
    out.insert("name".into(), module.name().into());
    out.insert("version".into(), module.version().into());
    out.insert("enabled".into(), module.is_enabled().into());
    out.insert("ready".into(), ready.into());
    out.insert("description".into(), module.description().into());
    module.status(&mut out);
    out
}
