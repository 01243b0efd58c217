//! The bus facade: the boundary between this crate and the IPC transport.
//!
//! Everything the rest of the crate knows about D-Bus goes through the
//! [`Bus`] trait — object enumeration, per-kind capability handles and the
//! signal streams that feed the monitor. [`SystemBus`] is the production
//! implementation over the system bus; tests inject their own.

use std::collections::HashMap;
use std::pin::Pin;

use futures::stream::{Stream, StreamExt};
use futures::{future, stream};
use log::warn;
use zbus::fdo::{ObjectManagerProxy, PropertiesProxy};
use zvariant::{OwnedValue, Value};

use crate::Result;
use crate::constants::{BLUEZ_ROOT, BLUEZ_SERVICE};
use crate::models::{DiscoveryFilter, WriteMode};
use crate::proxies::{Adapter1ProxyBlocking, Device1ProxyBlocking, GattCharacteristic1ProxyBlocking};

/// Properties of a single interface: property name to variant value.
pub type InterfaceProps = HashMap<String, OwnedValue>;

/// Interfaces exposed by one object: interface name to its properties.
pub type InterfaceMap = HashMap<String, InterfaceProps>;

/// The object manager enumeration: object path to its interfaces.
pub type ManagedObjects = HashMap<String, InterfaceMap>;

/// A raw event delivered by the bus, before any routing.
#[derive(Debug)]
pub enum BusEvent {
    /// An object appeared (or gained interfaces).
    InterfacesAdded {
        /// Path of the object.
        path: String,
        /// The added interfaces with their initial properties.
        interfaces: InterfaceMap,
    },
    /// An object disappeared (or lost interfaces).
    InterfacesRemoved {
        /// Path of the object.
        path: String,
        /// Names of the removed interfaces.
        interfaces: Vec<String>,
    },
    /// Properties changed on a watched object.
    PropertiesChanged {
        /// Path of the object.
        path: String,
        /// Interface the properties belong to.
        interface: String,
        /// New values of the changed properties.
        changed: HashMap<String, OwnedValue>,
        /// Properties whose value was invalidated without a replacement.
        invalidated: Vec<String>,
    },
}

/// A stream of bus events.
pub type EventStream = Pin<Box<dyn Stream<Item = BusEvent> + Send>>;

/// Operations on an adapter object.
pub trait AdapterOps: Send + Sync {
    /// Starts scanning for remote devices.
    fn start_discovery(&self) -> Result<()>;
    /// Stops an ongoing scan.
    fn stop_discovery(&self) -> Result<()>;
    /// Restricts which advertisements the adapter reports.
    fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> Result<()>;
    /// The adapter's own Bluetooth address.
    fn address(&self) -> Result<String>;
}

/// Operations on a remote device object.
pub trait DeviceOps: Send + Sync {
    /// Establishes a connection. Blocks for the bus round-trip.
    fn connect(&self) -> Result<()>;
    /// Drops the connection.
    fn disconnect(&self) -> Result<()>;
    /// Initiates pairing. Requires a pairing agent on the system.
    fn pair(&self) -> Result<()>;
}

/// Operations on a GATT characteristic object.
pub trait CharacteristicOps: Send + Sync {
    /// Reads the characteristic value.
    fn read_value(&self) -> Result<Vec<u8>>;
    /// Writes the characteristic value with the given write semantics.
    fn write_value(&self, data: &[u8], mode: WriteMode) -> Result<()>;
    /// Enables value-change notifications.
    fn start_notify(&self) -> Result<()>;
    /// Disables value-change notifications.
    fn stop_notify(&self) -> Result<()>;
}

/// The transport boundary consumed by the rest of the crate.
///
/// One underlying bus subscription is created per `property_events` call;
/// keeping that subscription unique per path is the caller's (the
/// monitor's) responsibility.
pub trait Bus: Send + Sync {
    /// Enumerates all objects with their interfaces and properties.
    fn managed_objects(&self) -> Result<ManagedObjects>;

    /// Returns a capability handle for the adapter at `path`.
    fn adapter(&self, path: &str) -> Result<Box<dyn AdapterOps>>;

    /// Returns a capability handle for the device at `path`.
    fn device(&self, path: &str) -> Result<Box<dyn DeviceOps>>;

    /// Returns a capability handle for the characteristic at `path`.
    fn characteristic(&self, path: &str) -> Result<Box<dyn CharacteristicOps>>;

    /// A stream of object added/removed events, process-wide.
    fn object_events(&self) -> Result<EventStream>;

    /// A stream of property-change events for a single object path.
    fn property_events(&self, path: &str) -> Result<EventStream>;
}

/// The production [`Bus`] over the D-Bus system bus.
pub struct SystemBus {
    conn: zbus::blocking::Connection,
}

impl SystemBus {
    /// Connects to the system bus.
    pub fn system() -> Result<Self> {
        Ok(Self {
            conn: zbus::blocking::Connection::system()?,
        })
    }
}

impl Bus for SystemBus {
    fn managed_objects(&self) -> Result<ManagedObjects> {
        let manager = zbus::blocking::fdo::ObjectManagerProxy::builder(&self.conn)
            .destination(BLUEZ_SERVICE)?
            .path(BLUEZ_ROOT)?
            .build()?;
        let objects = manager.get_managed_objects().map_err(zbus::Error::from)?;

        Ok(objects
            .into_iter()
            .map(|(path, interfaces)| {
                let interfaces = interfaces
                    .into_iter()
                    .map(|(name, props)| (name.to_string(), props))
                    .collect();
                (path.to_string(), interfaces)
            })
            .collect())
    }

    fn adapter(&self, path: &str) -> Result<Box<dyn AdapterOps>> {
        let proxy = Adapter1ProxyBlocking::builder(&self.conn)
            .path(path.to_string())?
            .build()?;
        Ok(Box::new(ZbusAdapter { proxy }))
    }

    fn device(&self, path: &str) -> Result<Box<dyn DeviceOps>> {
        let proxy = Device1ProxyBlocking::builder(&self.conn)
            .path(path.to_string())?
            .build()?;
        Ok(Box::new(ZbusDevice { proxy }))
    }

    fn characteristic(&self, path: &str) -> Result<Box<dyn CharacteristicOps>> {
        let proxy = GattCharacteristic1ProxyBlocking::builder(&self.conn)
            .path(path.to_string())?
            .build()?;
        Ok(Box::new(ZbusCharacteristic { proxy }))
    }

    fn object_events(&self) -> Result<EventStream> {
        let conn = self.conn.inner().clone();

        futures::executor::block_on(async move {
            let manager = ObjectManagerProxy::builder(&conn)
                .destination(BLUEZ_SERVICE)?
                .path(BLUEZ_ROOT)?
                .build()
                .await?;

            let added = manager.receive_interfaces_added().await?;
            let removed = manager.receive_interfaces_removed().await?;

            let added = added.filter_map(|signal| {
                future::ready(match signal.args() {
                    Ok(args) => Some(BusEvent::InterfacesAdded {
                        path: args.object_path().to_string(),
                        interfaces: owned_interface_map(args.interfaces_and_properties()),
                    }),
                    Err(e) => {
                        warn!("failed to parse InterfacesAdded args: {e}");
                        None
                    }
                })
            });

            let removed = removed.filter_map(|signal| {
                future::ready(match signal.args() {
                    Ok(args) => Some(BusEvent::InterfacesRemoved {
                        path: args.object_path().to_string(),
                        interfaces: args.interfaces().iter().map(|i| i.to_string()).collect(),
                    }),
                    Err(e) => {
                        warn!("failed to parse InterfacesRemoved args: {e}");
                        None
                    }
                })
            });

            Ok(Box::pin(stream::select(added, removed)) as EventStream)
        })
    }

    fn property_events(&self, path: &str) -> Result<EventStream> {
        let conn = self.conn.inner().clone();
        let path = path.to_string();

        futures::executor::block_on(async move {
            let props = PropertiesProxy::builder(&conn)
                .destination(BLUEZ_SERVICE)?
                .path(path.clone())?
                .build()
                .await?;

            let changes = props.receive_properties_changed().await?;
            let events = changes.filter_map(move |signal| {
                future::ready(match signal.args() {
                    Ok(args) => Some(BusEvent::PropertiesChanged {
                        path: path.clone(),
                        interface: args.interface_name().to_string(),
                        changed: owned_prop_map(args.changed_properties()),
                        invalidated: args
                            .invalidated_properties()
                            .iter()
                            .map(|name| name.to_string())
                            .collect(),
                    }),
                    Err(e) => {
                        warn!("failed to parse PropertiesChanged args: {e}");
                        None
                    }
                })
            });

            Ok(Box::pin(events) as EventStream)
        })
    }
}

/// Converts a borrowed property map from signal args into owned values.
/// Values that cannot be converted (e.g. carrying file descriptors) are
/// skipped with a warning.
fn owned_prop_map<K: ToString>(props: &HashMap<K, Value<'_>>) -> HashMap<String, OwnedValue> {
    props
        .iter()
        .filter_map(|(name, value)| match value.try_to_owned() {
            Ok(value) => Some((name.to_string(), value)),
            Err(e) => {
                warn!("dropping unconvertible property value: {e}");
                None
            }
        })
        .collect()
}

fn owned_interface_map<K: ToString, P: ToString>(
    interfaces: &HashMap<K, HashMap<P, Value<'_>>>,
) -> InterfaceMap {
    interfaces
        .iter()
        .map(|(name, props)| (name.to_string(), owned_prop_map(props)))
        .collect()
}

struct ZbusAdapter {
    proxy: Adapter1ProxyBlocking<'static>,
}

impl AdapterOps for ZbusAdapter {
    fn start_discovery(&self) -> Result<()> {
        Ok(self.proxy.start_discovery()?)
    }

    fn stop_discovery(&self) -> Result<()> {
        Ok(self.proxy.stop_discovery()?)
    }

    fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> Result<()> {
        let mut options: HashMap<&str, Value<'_>> = HashMap::new();
        options.insert("Transport", Value::from(filter.transport.as_str()));
        if let Some(rssi) = filter.rssi {
            options.insert("RSSI", Value::from(rssi));
        }
        if !filter.uuids.is_empty() {
            let uuids: Vec<String> = filter.uuids.iter().map(ToString::to_string).collect();
            options.insert("UUIDs", Value::from(uuids));
        }
        Ok(self.proxy.set_discovery_filter(options)?)
    }

    fn address(&self) -> Result<String> {
        Ok(self.proxy.address()?)
    }
}

struct ZbusDevice {
    proxy: Device1ProxyBlocking<'static>,
}

impl DeviceOps for ZbusDevice {
    fn connect(&self) -> Result<()> {
        Ok(self.proxy.connect()?)
    }

    fn disconnect(&self) -> Result<()> {
        Ok(self.proxy.disconnect()?)
    }

    fn pair(&self) -> Result<()> {
        Ok(self.proxy.pair()?)
    }
}

struct ZbusCharacteristic {
    proxy: GattCharacteristic1ProxyBlocking<'static>,
}

impl CharacteristicOps for ZbusCharacteristic {
    fn read_value(&self) -> Result<Vec<u8>> {
        Ok(self.proxy.read_value(HashMap::new())?)
    }

    fn write_value(&self, data: &[u8], mode: WriteMode) -> Result<()> {
        let mut options: HashMap<&str, Value<'_>> = HashMap::new();
        options.insert("type", Value::from(mode.as_str()));
        Ok(self.proxy.write_value(data, options)?)
    }

    fn start_notify(&self) -> Result<()> {
        Ok(self.proxy.start_notify()?)
    }

    fn stop_notify(&self) -> Result<()> {
        Ok(self.proxy.stop_notify()?)
    }
}
