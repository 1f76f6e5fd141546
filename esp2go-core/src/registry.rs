//! Module registry: ownership, lifecycle and the aggregate listing.

use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::{ApiResponse, ApiScope, ApiSurface, Method};
use crate::module::{status_document, Module};

pub const MODULES_LIST_PATH: &str = "/_api/modules/list";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName(String),
    EmptyIdentity,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateName(name) => {
                write!(f, "a module named '{name}' is already registered")
            }
            RegistryError::EmptyIdentity => write!(f, "module name and description must be set"),
        }
    }
}

impl std::error::Error for RegistryError {}

struct Slot {
    module: Arc<dyn Module>,
    init_ok: AtomicBool,
}

impl Slot {
    fn ready(&self) -> bool {
        self.init_ok.load(Ordering::Acquire) && self.module.is_ready()
    }

    fn active(&self) -> bool {
        self.module.is_enabled() && self.ready()
    }
}

/// Ordered collection of modules. Registration order is init order.
#[derive(Default)]
pub struct ModuleRegistry {
    slots: Vec<Arc<Slot>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        if module.name().is_empty() || module.description().is_empty() {
            return Err(RegistryError::EmptyIdentity);
        }
        if self.slots.iter().any(|s| s.module.name() == module.name()) {
            return Err(RegistryError::DuplicateName(module.name().to_string()));
        }
        log::info!(
            "Registered module: {} ({})",
            module.name(),
            module.description()
        );
        self.slots.push(Arc::new(Slot {
            module,
            init_ok: AtomicBool::new(false),
        }));
        Ok(())
    }

    /// Runs `init` on every enabled module. Returns how many came up ready.
    pub fn init_all(&self) -> usize {
        log::info!("Initializing {} modules", self.slots.len());
        let mut ready = 0;
        for slot in &self.slots {
            let name = slot.module.name();
            if !slot.module.is_enabled() {
                log::info!("[{}] Disabled, skipping", name);
                continue;
            }
            log::info!("[{}] Initializing...", name);
            let ok = slot.module.init();
            slot.init_ok.store(ok, Ordering::Release);
            if ok && slot.module.is_ready() {
                log::info!("[{}] Initialized successfully", name);
                ready += 1;
            } else if ok {
                log::warn!("[{}] Initialized but not ready", name);
            } else {
                log::error!("[{}] Initialization failed", name);
            }
        }
        ready
    }

    /// Publishes routes for enabled and ready modules, then the aggregate
    /// listing. Returns the names whose routes went up.
    pub fn register_all_apis(&self, surface: &mut dyn ApiSurface) -> Vec<&'static str> {
        log::info!("Registering module APIs...");
        let mut published = Vec::new();
        for slot in &self.slots {
            let name = slot.module.name();
            if !slot.active() {
                log::info!("[{}] Not ready, API not registered", name);
                continue;
            }
            let mut scope = ApiScope::new(&mut *surface, slot.module.namespace());
            match Arc::clone(&slot.module).register_api(&mut scope) {
                Ok(()) => {
                    log::info!("[{}] API registered ({} routes)", name, scope.registered());
                    published.push(name);
                }
                Err(e) => log::error!("[{}] API registration failed: {:#}", name, e),
            }
        }

        let slots = self.slots.clone();
        let listing = move |_req: &mut crate::api::ApiRequest<'_>| {
            ApiResponse::ok(listing_document(&slots))
        };
        if let Err(e) = surface.route(MODULES_LIST_PATH, Method::Get, Arc::new(listing)) {
            log::error!("Failed to register {}: {:#}", MODULES_LIST_PATH, e);
        }
        published
    }

    pub fn update_all(&self) {
        for slot in &self.slots {
            if slot.active() {
                slot.module.update();
            }
        }
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.slots
            .iter()
            .find(|s| s.module.name() == name)
            .map(|s| Arc::clone(&s.module))
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.slots
            .iter()
            .find(|s| s.module.name() == name)
            .map(|s| s.ready())
            .unwrap_or(false)
    }

    pub fn list(&self) -> Value {
        listing_document(&self.slots)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Calls `shutdown` on every module regardless of state and releases them.
    pub fn shutdown_all(&mut self) {
        log::info!("Shutting down modules...");
        for slot in &self.slots {
            slot.module.shutdown();
        }
        self.slots.clear();
        log::info!("All modules shut down");
    }
}

fn listing_document(slots: &[Arc<Slot>]) -> Value {
    let modules: Vec<Value> = slots
        .iter()
        .map(|s| Value::Object(status_document(s.module.as_ref(), s.ready())))
        .collect();
    json!({ "count": modules.len(), "modules": modules })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RouteTable;
    use crate::module::StatusMap;
    use anyhow::Result;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        name: &'static str,
        init_result: bool,
        enabled: bool,
        updates: AtomicUsize,
        shut: AtomicBool,
    }

    impl Probe {
        fn new(name: &'static str, init_result: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                init_result,
                enabled: true,
                updates: AtomicUsize::new(0),
                shut: AtomicBool::new(false),
            })
        }
    }

    impl Module for Probe {
        fn name(&self) -> &'static str {
            self.name
        }
        fn description(&self) -> &'static str {
            "probe"
        }
        fn init(&self) -> bool {
            self.init_result
        }
        fn update(&self) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
        fn register_api(self: Arc<Self>, scope: &mut ApiScope<'_>) -> Result<()> {
            scope.on("ping", Method::Get, |_req| ApiResponse::ok(json!({"pong": true})))
        }
        fn is_enabled(&self) -> bool {
            self.enabled
        }
        fn is_ready(&self) -> bool {
            true
        }
        fn status(&self, out: &mut StatusMap) {
            out.insert("updates".into(), self.updates.load(Ordering::Relaxed).into());
        }
        fn shutdown(&self) {
            self.shut.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut registry = ModuleRegistry::new();
        registry.register(Probe::new("gpio", true)).unwrap();
        assert_eq!(
            registry.register(Probe::new("gpio", true)),
            Err(RegistryError::DuplicateName("gpio".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failed_init_hides_routes_but_stays_listed() {
        let mut registry = ModuleRegistry::new();
        let bad = Probe::new("bad", false);
        registry.register(Probe::new("good", true)).unwrap();
        registry.register(bad.clone()).unwrap();
        assert_eq!(registry.init_all(), 1);

        let mut table = RouteTable::new();
        assert_eq!(registry.register_all_apis(&mut table), vec!["good"]);
        assert!(table.contains("/_api/good/ping", Method::Get));
        assert!(table.paths_under("/_api/bad/").is_empty());

        let listing = table.call(Method::Get, MODULES_LIST_PATH, &[], b"").body;
        assert_eq!(listing["count"], 2);
        assert_eq!(listing["modules"][1]["name"], "bad");
        assert_eq!(listing["modules"][1]["ready"], false);

        registry.update_all();
        assert_eq!(bad.updates.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn disabled_module_is_never_initialized() {
        let mut registry = ModuleRegistry::new();
        registry
            .register(Arc::new(Probe {
                enabled: false,
                ..Arc::try_unwrap(Probe::new("off", true)).ok().unwrap()
            }))
            .unwrap();
        assert_eq!(registry.init_all(), 0);
        assert!(!registry.is_ready("off"));
        assert_eq!(registry.list()["modules"][0]["enabled"], false);
    }

    #[test]
    fn shutdown_reaches_every_module() {
        let mut registry = ModuleRegistry::new();
        let a = Probe::new("a", true);
        let b = Probe::new("b", false);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        registry.init_all();
        registry.shutdown_all();
        assert!(a.shut.load(Ordering::Relaxed));
        assert!(b.shut.load(Ordering::Relaxed));
        assert!(registry.is_empty());
        assert!(registry.get_module("a").is_none());
    }
}
