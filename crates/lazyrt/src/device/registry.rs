//! Runtime device registry for selecting devices by name.
//!
//! Backend crates contribute a factory per device kind (`CPU`, `CLANG`, `CUDA`, ...).
//! Devices are constructed lazily on first lookup and kept for the registry's lifetime.
//! Each name gets its own once-cell, so concurrent first lookups run the factory once.
//! Tests build isolated registries; [`DeviceRegistry::global`] is populated from
//! every function in [`DEVICE_REGISTRARS`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use once_cell::sync::OnceCell;

use super::{ArtifactCache, Device};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};

/// Builds a device given its canonical name, the registry config and shared artifact cache.
pub type DeviceFactory =
    Arc<dyn Fn(&str, &RuntimeConfig, Arc<ArtifactCache>) -> RuntimeResult<Device> + Send + Sync>;

#[linkme::distributed_slice]
pub static DEVICE_REGISTRARS: [fn(&DeviceRegistry)] = [..];

/// Preference order when no default device is configured.
const DEFAULT_ORDER: [&str; 3] = ["CUDA", "CLANG", "CPU"];

/// Uppercases the device kind and drops a `:0` ordinal, so `cuda:0` and `CUDA` match.
pub fn canonicalize(device: &str) -> String {
    let (kind, rest) = match device.split_once(':') {
        Some((kind, ordinal)) => (kind, Some(ordinal)),
        None => (device, None),
    };
    let kind = kind.to_ascii_uppercase();
    match rest {
        None | Some("0") => kind,
        Some(ordinal) => format!("{kind}:{ordinal}"),
    }
}

fn kind_of(canonical: &str) -> &str {
    canonical.split(':').next().unwrap_or(canonical)
}

pub struct DeviceRegistry {
    config: RuntimeConfig,
    artifacts: Arc<ArtifactCache>,
    factories: RwLock<BTreeMap<String, DeviceFactory>>,
    devices: Mutex<HashMap<String, Arc<DeviceSlot>>>,
}

type DeviceSlot = OnceCell<Arc<Device>>;

impl DeviceRegistry {
    pub fn new(config: RuntimeConfig) -> Self {
        let artifacts = Arc::new(ArtifactCache::from_config(&config));
        Self::with_artifacts(config, artifacts)
    }

    pub fn with_artifacts(config: RuntimeConfig, artifacts: Arc<ArtifactCache>) -> Self {
        Self {
            config,
            artifacts,
            factories: RwLock::new(BTreeMap::new()),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide registry built from [`RuntimeConfig::global`] and every linked registrar.
    pub fn global() -> &'static DeviceRegistry {
        static GLOBAL: OnceLock<DeviceRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let registry = DeviceRegistry::with_artifacts(
                RuntimeConfig::global().clone(),
                ArtifactCache::global(),
            );
            for registrar in DEVICE_REGISTRARS.iter() {
                registrar(&registry);
            }
            registry
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &Arc<ArtifactCache> {
        &self.artifacts
    }

    pub fn register_factory<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&str, &RuntimeConfig, Arc<ArtifactCache>) -> RuntimeResult<Device>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .write()
            .expect("device factory registry poisoned")
            .insert(kind.to_ascii_uppercase(), Arc::new(factory));
    }

    /// Registers an already constructed device under its canonical name.
    pub fn insert(&self, device: Arc<Device>) -> Arc<Device> {
        let name = canonicalize(device.name());
        self.devices
            .lock()
            .expect("device registry poisoned")
            .insert(name, Arc::new(OnceCell::with_value(Arc::clone(&device))));
        device
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.factories
            .read()
            .expect("device factory registry poisoned")
            .contains_key(&kind.to_ascii_uppercase())
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories
            .read()
            .expect("device factory registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Looks up (constructing on first use) the device named `name`.
    pub fn get(&self, name: &str) -> RuntimeResult<Arc<Device>> {
        let canonical = canonicalize(name);
        let slot = self
            .devices
            .lock()
            .expect("device registry poisoned")
            .get(&canonical)
            .cloned();
        if let Some(found) = slot.as_ref().and_then(|slot| slot.get()) {
            return Ok(Arc::clone(found));
        }

        let factory = self
            .factories
            .read()
            .expect("device factory registry poisoned")
            .get(kind_of(&canonical))
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownDevice(canonical.clone()))?;
        let slot = match slot {
            Some(slot) => slot,
            None => Arc::clone(
                self.devices
                    .lock()
                    .expect("device registry poisoned")
                    .entry(canonical.clone())
                    .or_default(),
            ),
        };
        // The map lock is released here; only callers of this name wait on the factory.
        let device = slot.get_or_try_init(|| {
            factory(&canonical, &self.config, Arc::clone(&self.artifacts)).map(Arc::new)
        })?;
        Ok(Arc::clone(device))
    }

    /// Configured default device, or the first constructible device in preference order.
    pub fn default_device(&self) -> RuntimeResult<String> {
        if let Some(name) = &self.config.default_device {
            return Ok(canonicalize(name));
        }
        for kind in DEFAULT_ORDER {
            if !self.has_kind(kind) {
                continue;
            }
            match self.get(kind) {
                Ok(device) => return Ok(device.name().to_string()),
                Err(err) => tracing::debug!(device = kind, %err, "default device candidate skipped"),
            }
        }
        self.kinds()
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::UnknownDevice("<default>".to_string()))
    }
}
