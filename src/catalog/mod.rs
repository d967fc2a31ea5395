//! Device catalog.
//!
//! Enumerates video sources from one or more local `DeviceRegistry`
//! implementations and keeps the ones that are video capture devices or
//! match the configured vendor. Enumeration is synchronous and never touches
//! the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

#[cfg(target_os = "linux")]
pub mod sysfs;

#[cfg(target_os = "linux")]
pub use sysfs::SysfsRegistry;

/// Expert Sleepers USB vendor id.
pub const DEFAULT_VENDOR_ID: u16 = 0x16C0;

/// Permission to open a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    /// An authorization request is outstanding; the answer arrives out of band.
    Pending,
    Denied,
}

/// Device class as reported by the platform registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    VideoCapture,
    Other(u8),
}

/// One entry as the platform registry sees it, before filtering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    pub class: DeviceClass,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

/// Snapshot of a device, re-queried on every enumeration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    /// 0 when the platform does not expose it.
    pub vendor_id: u16,
    pub product_id: u16,
    pub vendor_match: bool,
    pub permission: PermissionState,
}

/// Local device registry for one platform or backend.
pub trait DeviceRegistry: Send + Sync {
    /// Backend identifier, for logs.
    fn name(&self) -> &'static str;

    /// Current entries. Must not block on long I/O.
    fn entries(&self) -> Vec<RegistryEntry>;

    fn permission(&self, id: &str) -> PermissionState;

    /// Triggers an authorization request. Platforms with asynchronous grants
    /// return `Pending`; the outcome is never re-queried here.
    fn request_permission(&self, id: &str) -> PermissionState {
        self.permission(id)
    }
}

/// Inclusion and vendor-matching rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogFilter {
    pub vendor_id: u16,
    /// Case-insensitive display-name fragments that mark a device as
    /// vendor-matched when the platform does not report a vendor id.
    pub name_hints: Vec<String>,
}

impl Default for CatalogFilter {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            name_hints: vec!["disting".to_string()],
        }
    }
}

impl CatalogFilter {
    pub fn vendor_matches(&self, entry: &RegistryEntry) -> bool {
        match entry.vendor_id {
            Some(vendor) if vendor != 0 => vendor == self.vendor_id,
            _ => {
                let name = entry.name.to_lowercase();
                self.name_hints
                    .iter()
                    .filter(|hint| !hint.is_empty())
                    .any(|hint| name.contains(&hint.to_lowercase()))
            }
        }
    }

    pub fn includes(&self, entry: &RegistryEntry) -> bool {
        entry.class == DeviceClass::VideoCapture
            || entry.vendor_id.is_some_and(|vendor| vendor != 0 && vendor == self.vendor_id)
    }
}

pub struct DeviceCatalog {
    registries: Vec<Arc<dyn DeviceRegistry>>,
    filter: CatalogFilter,
}

impl DeviceCatalog {
    pub fn new(filter: CatalogFilter) -> Self {
        Self {
            registries: Vec::new(),
            filter,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn DeviceRegistry>) -> Self {
        self.registries.push(registry);
        self
    }

    pub fn add_registry(&mut self, registry: Arc<dyn DeviceRegistry>) {
        self.registries.push(registry);
    }

    pub fn filter(&self) -> &CatalogFilter {
        &self.filter
    }

    /// Lists devices that pass the filter, in registry order.
    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        let mut devices = Vec::new();
        for registry in &self.registries {
            for entry in registry.entries() {
                if !self.filter.includes(&entry) {
                    log::debug!(
                        "DeviceCatalog: skipping {} ({}) from {}",
                        entry.id,
                        entry.name,
                        registry.name()
                    );
                    continue;
                }
                devices.push(self.describe(registry.as_ref(), entry));
            }
        }
        devices
    }

    /// Resolves a device id to a fresh descriptor.
    pub fn find(&self, id: &str) -> Option<DeviceDescriptor> {
        self.enumerate().into_iter().find(|device| device.id == id)
    }

    /// Current permission without side effects.
    pub fn permission(&self, id: &str) -> Result<PermissionState> {
        let registry = self.registry_for(id)?;
        Ok(registry.permission(id))
    }

    /// Idempotent: a granted device returns `Granted` without touching the
    /// registry; otherwise an asynchronous request is triggered.
    pub fn request_permission(&self, id: &str) -> Result<PermissionState> {
        let registry = self.registry_for(id)?;
        match registry.permission(id) {
            PermissionState::Granted => Ok(PermissionState::Granted),
            _ => {
                let state = registry.request_permission(id);
                log::info!("DeviceCatalog: permission for {} is {:?}", id, state);
                Ok(state)
            }
        }
    }

    fn registry_for(&self, id: &str) -> Result<&Arc<dyn DeviceRegistry>> {
        self.registries
            .iter()
            .find(|registry| {
                registry
                    .entries()
                    .iter()
                    .any(|entry| entry.id == id && self.filter.includes(entry))
            })
            .ok_or_else(|| BridgeError::DeviceNotFound(id.to_string()))
    }

    fn describe(&self, registry: &dyn DeviceRegistry, entry: RegistryEntry) -> DeviceDescriptor {
        let vendor_match = self.filter.vendor_matches(&entry);
        let permission = registry.permission(&entry.id);
        DeviceDescriptor {
            vendor_id: entry.vendor_id.unwrap_or(0),
            product_id: entry.product_id.unwrap_or(0),
            vendor_match,
            permission,
            id: entry.id,
            name: entry.name,
        }
    }
}

// ----------------------------------------------------------------------------
// In-memory registry
// ----------------------------------------------------------------------------

/// Registry backed by an in-memory list.
///
/// Used for `stub://` test-pattern devices and for hosts whose permission
/// grants arrive out of band: `request_permission` records a pending request
/// and `resolve` delivers the answer later.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<MemoryRegistryInner>,
}

#[derive(Default)]
struct MemoryRegistryInner {
    entries: Vec<RegistryEntry>,
    permissions: HashMap<String, PermissionState>,
    requests: HashMap<String, u32>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: RegistryEntry, permission: PermissionState) {
        let mut inner = self.lock();
        inner.permissions.insert(entry.id.clone(), permission);
        inner.entries.retain(|existing| existing.id != entry.id);
        inner.entries.push(entry);
    }

    /// Adds a synthetic `stub://` video device.
    pub fn insert_stub(&self, id: &str, name: &str) {
        self.insert(
            RegistryEntry {
                id: id.to_string(),
                name: name.to_string(),
                class: DeviceClass::VideoCapture,
                vendor_id: None,
                product_id: None,
            },
            PermissionState::Granted,
        );
    }

    pub fn remove(&self, id: &str) {
        let mut inner = self.lock();
        inner.entries.retain(|entry| entry.id != id);
        inner.permissions.remove(id);
    }

    /// Delivers the out-of-band answer to a permission request.
    pub fn resolve(&self, id: &str, granted: bool) {
        let state = if granted {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        self.lock().permissions.insert(id.to_string(), state);
    }

    /// Number of authorization requests triggered for `id`.
    pub fn request_count(&self, id: &str) -> u32 {
        self.lock().requests.get(id).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn entries(&self) -> Vec<RegistryEntry> {
        self.lock().entries.clone()
    }

    fn permission(&self, id: &str) -> PermissionState {
        self.lock()
            .permissions
            .get(id)
            .copied()
            .unwrap_or(PermissionState::Denied)
    }

    fn request_permission(&self, id: &str) -> PermissionState {
        let mut inner = self.lock();
        *inner.requests.entry(id.to_string()).or_default() += 1;
        match inner.permissions.get(id).copied() {
            Some(PermissionState::Granted) => PermissionState::Granted,
            _ => {
                inner
                    .permissions
                    .insert(id.to_string(), PermissionState::Pending);
                PermissionState::Pending
            }
        }
    }
}
