use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{DIR_OS, MAX_WIFI_NETWORKS, PATH_WIFI_CONFIG};
use crate::hal::BlockStore;
use crate::validators;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    /// Lower is tried first. Zero means "unset" in stored files.
    #[serde(default)]
    pub priority: u32,
}

impl Credential {
    pub fn new(ssid: &str, password: &str, priority: u32) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            priority,
        }
    }
}

/// On-disk layout of `/os/wifi_config.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WifiConfigFile {
    #[serde(default)]
    networks: Vec<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ap_ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ap_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    Full,
    Invalid(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::Full => {
                write!(f, "maximum networks reached ({MAX_WIFI_NETWORKS})")
            }
            CredentialError::Invalid(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Saved networks plus the access-point identity used as last resort.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    networks: heapless::Vec<Credential, MAX_WIFI_NETWORKS>,
    ap_ssid: String,
    ap_password: String,
}

impl CredentialStore {
    pub fn new(ap_ssid: &str, ap_password: &str) -> Self {
        Self {
            networks: heapless::Vec::new(),
            ap_ssid: ap_ssid.to_string(),
            ap_password: ap_password.to_string(),
        }
    }

    /// Parses stored JSON. Entries without an SSID are dropped, a missing
    /// priority becomes the entry's 1-based position, and anything past the
    /// tenth entry is ignored.
    pub fn from_json(text: &str, ap_ssid: &str, ap_password: &str) -> Result<Self> {
        let file: WifiConfigFile =
            serde_json::from_str(text).context("Failed to parse WiFi config")?;
        let mut creds = Self::new(
            file.ap_ssid.as_deref().filter(|s| !s.is_empty()).unwrap_or(ap_ssid),
            file.ap_password.as_deref().unwrap_or(ap_password),
        );
        for (index, mut cred) in file.networks.into_iter().enumerate() {
            if cred.ssid.is_empty() {
                continue;
            }
            if cred.priority == 0 {
                cred.priority = index as u32 + 1;
            }
            if creds.networks.push(cred).is_err() {
                log::warn!("WiFi config holds more than {} networks, ignoring the rest", MAX_WIFI_NETWORKS);
                break;
            }
        }
        Ok(creds)
    }

    /// Loads the credential file. A missing or unreadable file yields an
    /// empty list with the given access-point defaults.
    pub fn load(store: &dyn BlockStore, ap_ssid: &str, ap_password: &str) -> Self {
        if !store.exists(PATH_WIFI_CONFIG) {
            log::info!("No WiFi config at {}", PATH_WIFI_CONFIG);
            return Self::new(ap_ssid, ap_password);
        }
        let parsed = store
            .read_to_string(PATH_WIFI_CONFIG)
            .context("Failed to read WiFi config")
            .and_then(|text| Self::from_json(&text, ap_ssid, ap_password));
        match parsed {
            Ok(creds) => {
                log::info!("Loaded {} saved WiFi networks", creds.len());
                creds
            }
            Err(e) => {
                log::warn!("{:#}, using defaults", e);
                Self::new(ap_ssid, ap_password)
            }
        }
    }

    /// Writes a template file with one blank entry when none exists.
    /// Returns whether a file was created.
    pub fn ensure_file(store: &dyn BlockStore, ap_ssid: &str, ap_password: &str) -> Result<bool> {
        if store.exists(PATH_WIFI_CONFIG) {
            return Ok(false);
        }
        log::info!("Creating default WiFi config file...");
        if !store.exists(DIR_OS) {
            store
                .mkdir(DIR_OS)
                .with_context(|| format!("Failed to create {DIR_OS} directory"))?;
        }
        let template = WifiConfigFile {
            networks: vec![Credential::new("", "", 1)],
            ap_ssid: Some(ap_ssid.to_string()),
            ap_password: Some(ap_password.to_string()),
        };
        let text = serde_json::to_string_pretty(&template)?;
        store
            .write_string(PATH_WIFI_CONFIG, &text)
            .context("Failed to create WiFi config file")?;
        log::info!("Created WiFi config file: {}", PATH_WIFI_CONFIG);
        Ok(true)
    }

    pub fn to_json(&self) -> Result<String> {
        let file = WifiConfigFile {
            networks: self.networks.iter().cloned().collect(),
            ap_ssid: Some(self.ap_ssid.clone()),
            ap_password: Some(self.ap_password.clone()),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn save(&self, store: &dyn BlockStore) -> Result<()> {
        if !store.exists(DIR_OS) {
            store.mkdir(DIR_OS)?;
        }
        store
            .write_string(PATH_WIFI_CONFIG, &self.to_json()?)
            .context("Failed to save WiFi config")
    }

    /// Appends a network. A zero priority is replaced with the next slot.
    pub fn add(&mut self, mut cred: Credential) -> Result<(), CredentialError> {
        validators::validate_ssid(&cred.ssid)
            .map_err(|e| CredentialError::Invalid(e.to_string()))?;
        validators::validate_password(&cred.password)
            .map_err(|e| CredentialError::Invalid(e.to_string()))?;
        if cred.priority == 0 {
            cred.priority = self.networks.len() as u32 + 1;
        }
        self.networks.push(cred).map_err(|_| CredentialError::Full)
    }

    pub fn networks(&self) -> &[Credential] {
        &self.networks
    }

    pub fn ap_ssid(&self) -> &str {
        &self.ap_ssid
    }

    pub fn ap_password(&self) -> &str {
        &self.ap_password
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn attempt_order(&self) -> Vec<&Credential> {
        attempt_order(&self.networks)
    }
}

/// Lowest priority value first; equal priorities keep list order.
pub fn attempt_order(networks: &[Credential]) -> Vec<&Credential> {
    let mut order: Vec<&Credential> = networks.iter().filter(|c| !c.ssid.is_empty()).collect();
    order.sort_by_key(|c| c.priority);
    order
}
