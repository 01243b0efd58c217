//! A Rust library for Bluetooth LE GATT clients over D-Bus.
//!
//! This crate talks to the BlueZ daemon on the system bus and exposes a
//! synchronous-or-callback API for the common GATT client operations:
//!
//! - Scanning for nearby devices
//! - Connecting and disconnecting
//! - Reading and writing characteristic values
//! - Subscribing to value-change notifications
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use gattrs::{DiscoveryService, GattRequester};
//!
//! # fn example() -> gattrs::Result<()> {
//! // Scan for 4 seconds and list what was found.
//! let scanner = DiscoveryService::new("hci0")?;
//! let devices = scanner.discover(Some(Duration::from_secs(4)), None)?;
//! for (address, name) in devices.unwrap_or_default() {
//!     println!("{address} {name}");
//! }
//!
//! // Connect and read a characteristic.
//! let requester = GattRequester::new("aa:bb:cc:dd:ee:ff", "hci0")?;
//! let battery = uuid::Uuid::parse_str("00002a19-0000-1000-8000-00805f9b34fb").unwrap();
//! let value = requester.read_by_uuid(battery)?;
//! println!("battery: {value:?}");
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! All operations return `Result<T, Error>`. The error type provides
//! specific variants for identifier-resolution failures (adapter, device,
//! service, characteristic), capability mismatches and transport errors.
//!
//! # Signal-Based State Monitoring
//!
//! This crate uses D-Bus signals for state monitoring instead of polling.
//! One background thread drives the bus event loop and routes object
//! added/removed and property-change signals to registered observers.
//! Connection callbacks and notifications arrive from that thread (or
//! from a worker thread, for the async variants) — never assume they run
//! on the thread that started the operation.
//!
//! Observers are held through weak references: dropping the owning handle
//! is enough to stop receiving events.
//!
//! # Logging
//!
//! This crate uses the [`log`](https://docs.rs/log) facade. To see log
//! output, add a logging implementation like `env_logger`:
//!
//! ```no_run,ignore
//! env_logger::init();
//! // ...
//! ```

// Internal implementation modules
mod constants;
mod proxies;
mod utils;

// Public API modules
pub mod bus;
pub mod device;
pub mod models;
pub mod monitor;
pub mod requester;
pub mod scan;
pub mod session;

// Re-exported public API
pub use bus::{AdapterOps, Bus, BusEvent, CharacteristicOps, DeviceOps, EventStream, SystemBus};
pub use device::{Device, PropertyCache};
pub use models::{CharacteristicFlags, DiscoveryFilter, Error, Transport, WriteMode};
pub use monitor::{ObserverId, SignalCallback, SignalEvent, SignalKey, SignalMonitor};
pub use requester::{ConnectCallbacks, GattRequester, NotificationArgs};
pub use scan::{DiscoveredDevices, DiscoveryCallback, DiscoveryService};
pub use session::{Adapter, BluezSession, Characteristic};

/// A specialized `Result` type for GATT operations.
pub type Result<T> = std::result::Result<T, Error>;
