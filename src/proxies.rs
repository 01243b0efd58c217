//! D-Bus proxy traits for the BlueZ interfaces consumed by this crate.
//!
//! The `zbus::proxy` macro generates both async and blocking proxy
//! implementations; the blocking variants serve the synchronous call paths
//! while the async ones feed the signal monitor.
//!
//! # BlueZ D-Bus Structure
//!
//! - `/org/bluez/hciN` - Adapter objects
//! - `/org/bluez/hciN/dev_XX_XX_XX_XX_XX_XX` - Device objects
//! - `.../serviceNNNN` - GATT service objects
//! - `.../serviceNNNN/charNNNN` - GATT characteristic objects
//!
//! Object enumeration and property-change signals go through the standard
//! `org.freedesktop.DBus.ObjectManager` and `org.freedesktop.DBus.Properties`
//! interfaces, for which `zbus::fdo` already provides proxies.

use std::collections::HashMap;

use zbus::{Result, proxy};
use zvariant::Value;

/// Proxy for a Bluetooth adapter.
///
/// Controls device discovery on a single controller (e.g. `hci0`).
#[proxy(interface = "org.bluez.Adapter1", default_service = "org.bluez")]
pub trait Adapter1 {
    /// Starts scanning for remote devices.
    fn start_discovery(&self) -> Result<()>;

    /// Stops an ongoing scan.
    fn stop_discovery(&self) -> Result<()>;

    /// Restricts which advertisements the adapter reports.
    fn set_discovery_filter(&self, filter: HashMap<&str, Value<'_>>) -> Result<()>;

    /// The adapter's own Bluetooth address.
    #[zbus(property)]
    fn address(&self) -> Result<String>;
}

/// Proxy for a remote device.
///
/// The interesting properties (`Connected`, `Name`, `Address`) arrive via
/// the object manager enumeration and `PropertiesChanged` signals; only the
/// methods are called through this proxy.
#[proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
pub trait Device1 {
    /// Establishes a connection to the device.
    fn connect(&self) -> Result<()>;

    /// Drops the connection to the device.
    fn disconnect(&self) -> Result<()>;

    /// Initiates pairing. Requires a pairing agent on the system.
    fn pair(&self) -> Result<()>;

    /// Whether the device is currently connected.
    #[zbus(property)]
    fn connected(&self) -> Result<bool>;
}

/// Proxy for a GATT characteristic.
#[proxy(
    interface = "org.bluez.GattCharacteristic1",
    default_service = "org.bluez"
)]
pub trait GattCharacteristic1 {
    /// Reads the characteristic value.
    fn read_value(&self, options: HashMap<&str, Value<'_>>) -> Result<Vec<u8>>;

    /// Writes the characteristic value. The `type` option selects between
    /// acknowledged ("request") and unacknowledged ("command") writes.
    fn write_value(&self, value: &[u8], options: HashMap<&str, Value<'_>>) -> Result<()>;

    /// Enables value-change notifications; updates arrive as
    /// `PropertiesChanged` signals on the `Value` property.
    fn start_notify(&self) -> Result<()>;

    /// Disables value-change notifications.
    fn stop_notify(&self) -> Result<()>;
}
