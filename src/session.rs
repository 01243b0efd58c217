//! Shared session and identifier resolution.
//!
//! A [`BluezSession`] pairs a [`Bus`] with the process-wide
//! [`SignalMonitor`] and resolves logical identifiers (adapter names,
//! device addresses, GATT UUIDs) to bus object paths by walking the object
//! manager enumeration.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::bus::{AdapterOps, Bus, CharacteristicOps, InterfaceProps, SystemBus};
use crate::constants::{interface, property};
use crate::device::Device;
use crate::models::{CharacteristicFlags, Error};
use crate::monitor::SignalMonitor;
use crate::utils::{lock, path_tail, value_as_bool, value_as_str, value_as_str_array};

/// A handle over a Bluetooth adapter object.
pub struct Adapter {
    path: String,
    ops: Box<dyn AdapterOps>,
}

impl Adapter {
    /// The adapter's object path on the bus.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The adapter's own Bluetooth address.
    pub fn address(&self) -> Result<String> {
        self.ops.address()
    }

    pub(crate) fn ops(&self) -> &dyn AdapterOps {
        self.ops.as_ref()
    }
}

/// A resolved GATT characteristic.
pub struct Characteristic {
    path: String,
    uuid: Uuid,
    flags: CharacteristicFlags,
    ops: Box<dyn CharacteristicOps>,
}

impl Characteristic {
    /// The characteristic's object path on the bus.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The characteristic's UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Capability flags parsed from the enumeration snapshot.
    pub fn flags(&self) -> CharacteristicFlags {
        self.flags
    }

    pub(crate) fn ops(&self) -> &dyn CharacteristicOps {
        self.ops.as_ref()
    }
}

/// A bus connection plus the signal monitor that serves it.
///
/// Cloning is cheap; clones share the same bus and monitor.
#[derive(Clone)]
pub struct BluezSession {
    bus: Arc<dyn Bus>,
    monitor: Arc<SignalMonitor>,
}

impl BluezSession {
    /// Opens a session on the system bus, sharing the process-wide signal
    /// monitor. The monitor (and its dispatch thread) is created lazily on
    /// first use and never torn down.
    pub fn system() -> Result<Self> {
        static SHARED: Mutex<Option<Arc<SignalMonitor>>> = Mutex::new(None);

        let mut shared = lock(&SHARED);
        let monitor = match &*shared {
            Some(monitor) => monitor.clone(),
            None => {
                let bus: Arc<dyn Bus> = Arc::new(SystemBus::system()?);
                let monitor = SignalMonitor::new(bus)?;
                *shared = Some(monitor.clone());
                monitor
            }
        };
        Ok(Self {
            bus: monitor.bus().clone(),
            monitor,
        })
    }

    /// Opens a session over a custom transport with its own monitor.
    pub fn with_bus(bus: Arc<dyn Bus>) -> Result<Self> {
        let monitor = SignalMonitor::new(bus.clone())?;
        Ok(Self { bus, monitor })
    }

    /// The signal monitor serving this session.
    pub fn monitor(&self) -> &Arc<SignalMonitor> {
        &self.monitor
    }

    /// Resolves an adapter by name (the final path segment, e.g. `hci0`).
    pub fn find_adapter(&self, name: &str) -> Result<Adapter> {
        let objects = self.bus.managed_objects()?;
        for (path, interfaces) in &objects {
            if interfaces.contains_key(interface::ADAPTER) && path_tail(path) == name {
                return Ok(Adapter {
                    ops: self.bus.adapter(path)?,
                    path: path.clone(),
                });
            }
        }
        Err(Error::AdapterNotFound(name.to_string()))
    }

    /// Resolves a device by address (case-insensitive) under the named
    /// adapter.
    pub fn find_device(&self, address: &str, adapter: &str) -> Result<Device> {
        let prefix = self.find_adapter(adapter)?.path;
        let mut objects = self.bus.managed_objects()?;

        let path = objects.iter().find_map(|(path, interfaces)| {
            let device = interfaces.get(interface::DEVICE)?;
            let found = device.get(property::ADDRESS).and_then(value_as_str)?;
            (found.eq_ignore_ascii_case(address) && path.starts_with(&prefix))
                .then(|| path.clone())
        });
        let Some(path) = path else {
            return Err(Error::DeviceNotFound {
                address: address.to_string(),
                adapter: adapter.to_string(),
            });
        };

        debug!("resolved device {address} to {path}");
        let initial = objects
            .remove(&path)
            .and_then(|mut interfaces| interfaces.remove(interface::DEVICE))
            .unwrap_or_default();
        Device::new(
            path.clone(),
            initial,
            self.bus.device(&path)?,
            self.monitor.clone(),
        )
    }

    /// Returns the distinct UUIDs of GATT services under `path_prefix`
    /// whose `Primary` flag matches `primary`.
    pub fn find_gatt_services(&self, path_prefix: &str, primary: bool) -> Result<Vec<Uuid>> {
        let objects = self.bus.managed_objects()?;
        let child_prefix = format!("{path_prefix}/");

        let mut uuids = HashSet::new();
        for (path, interfaces) in &objects {
            if !path.starts_with(&child_prefix) {
                continue;
            }
            let Some(service) = interfaces.get(interface::GATT_SERVICE) else {
                continue;
            };
            if service.get(property::PRIMARY).and_then(value_as_bool) != Some(primary) {
                continue;
            }
            if let Some(uuid) = parse_uuid_prop(service, path) {
                uuids.insert(uuid);
            }
        }

        let mut uuids: Vec<Uuid> = uuids.into_iter().collect();
        uuids.sort();
        Ok(uuids)
    }

    /// Returns the distinct UUIDs of the characteristics belonging to the
    /// GATT service with `service_uuid` under `path_prefix`.
    pub fn find_gatt_characteristics(
        &self,
        path_prefix: &str,
        service_uuid: Uuid,
    ) -> Result<Vec<Uuid>> {
        let objects = self.bus.managed_objects()?;
        let child_prefix = format!("{path_prefix}/");

        let service_path = objects
            .iter()
            .find_map(|(path, interfaces)| {
                if !path.starts_with(&child_prefix) {
                    return None;
                }
                let service = interfaces.get(interface::GATT_SERVICE)?;
                (parse_uuid_prop(service, path)? == service_uuid).then(|| path.clone())
            })
            .ok_or(Error::ServiceNotFound(service_uuid))?;

        let mut uuids = HashSet::new();
        for (path, interfaces) in &objects {
            if !path.starts_with(&child_prefix) {
                continue;
            }
            let Some(characteristic) = interfaces.get(interface::GATT_CHARACTERISTIC) else {
                continue;
            };
            let parent = characteristic.get(property::SERVICE).and_then(value_as_str);
            if parent != Some(service_path.as_str()) {
                continue;
            }
            if let Some(uuid) = parse_uuid_prop(characteristic, path) {
                uuids.insert(uuid);
            }
        }

        let mut uuids: Vec<Uuid> = uuids.into_iter().collect();
        uuids.sort();
        Ok(uuids)
    }

    /// Resolves a characteristic by UUID under `path_prefix`.
    pub fn characteristic_by_uuid(&self, path_prefix: &str, uuid: Uuid) -> Result<Characteristic> {
        let objects = self.bus.managed_objects()?;
        let child_prefix = format!("{path_prefix}/");

        for (path, interfaces) in &objects {
            if !path.starts_with(&child_prefix) {
                continue;
            }
            let Some(characteristic) = interfaces.get(interface::GATT_CHARACTERISTIC) else {
                continue;
            };
            if parse_uuid_prop(characteristic, path) != Some(uuid) {
                continue;
            }

            let flags = characteristic
                .get(property::FLAGS)
                .and_then(value_as_str_array)
                .map(|names| CharacteristicFlags::from_names(&names))
                .unwrap_or_else(CharacteristicFlags::empty);
            return Ok(Characteristic {
                ops: self.bus.characteristic(path)?,
                path: path.clone(),
                uuid,
                flags,
            });
        }

        Err(Error::CharacteristicNotFound(uuid))
    }
}

/// Parses the `UUID` property of a GATT object. BlueZ emits canonical
/// UUIDs; a missing or malformed one is a peer bug, logged and skipped.
fn parse_uuid_prop(props: &InterfaceProps, path: &str) -> Option<Uuid> {
    let raw = props.get(property::UUID).and_then(value_as_str)?;
    match Uuid::parse_str(raw) {
        Ok(uuid) => Some(uuid),
        Err(e) => {
            warn!("skipping object {path} with malformed UUID '{raw}': {e}");
            None
        }
    }
}
