//! Runtime configuration.
//!
//! Defaults come from `Default`; `from_env` overlays `FAN_*` environment
//! variables. The whole structure is also serde-deserializable for callers
//! that keep configuration in a file.

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;
use crate::VersionOrder;

pub const ENV_SERVICE_NAME: &str = "FAN_SERVICE_NAME";
pub const ENV_REGISTRY_ROOT: &str = "FAN_REGISTRY_ROOT";
pub const ENV_PUBLISH_MIN_SUBSCRIBERS: &str = "FAN_PUBLISH_MIN_SUBSCRIBERS";
pub const ENV_VERSION_ORDER: &str = "FAN_VERSION_ORDER";
pub const ENV_REGISTRY_BARRIER: &str = "FAN_REGISTRY_BARRIER";

/// Layout and policy of the remote registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root node of the registry.
    pub root: String,
    /// Serialize registrations per (service, version) through a barrier.
    pub use_barrier: bool,
    pub version_order: VersionOrder,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: "/endpoints".to_string(),
            use_barrier: true,
            version_order: VersionOrder::Lexicographic,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Service name stamped on every span this process records.
    pub service_name: String,
    pub registry: RegistryConfig,
    /// Subscribers that must receive a channel publish for it to count.
    pub publish_min_subscribers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "fan".to_string(),
            registry: RegistryConfig::default(),
            publish_min_subscribers: 1,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with the `FAN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for the `FAN_*` keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = lookup(ENV_SERVICE_NAME) {
            config.service_name = name;
        }
        if let Some(root) = lookup(ENV_REGISTRY_ROOT) {
            if !root.starts_with('/') {
                return Err(Error::Config(format!("{} must be absolute, got {:?}", ENV_REGISTRY_ROOT, root)));
            }
            config.registry.root = root;
        }
        if let Some(raw) = lookup(ENV_PUBLISH_MIN_SUBSCRIBERS) {
            config.publish_min_subscribers = raw
                .parse()
                .map_err(|_| Error::Config(format!("{} must be a number, got {:?}", ENV_PUBLISH_MIN_SUBSCRIBERS, raw)))?;
        }
        if let Some(raw) = lookup(ENV_VERSION_ORDER) {
            config.registry.version_order = raw.parse().map_err(Error::Config)?;
        }
        if let Some(raw) = lookup(ENV_REGISTRY_BARRIER) {
            config.registry.use_barrier = parse_flag(&raw)
                .ok_or_else(|| Error::Config(format!("{} must be a boolean, got {:?}", ENV_REGISTRY_BARRIER, raw)))?;
        }
        Ok(config)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
