//! Public data types and the crate error taxonomy.

use std::fmt::{Display, Formatter};

use bitflags::bitflags;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by GATT operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No adapter with the requested name exists on the bus.
    #[error("adapter '{0}' not found")]
    AdapterNotFound(String),

    /// No device with the requested address exists under the adapter.
    #[error("device with address '{address}' not found (using adapter '{adapter}')")]
    DeviceNotFound {
        /// The address that failed to resolve.
        address: String,
        /// The adapter that was searched.
        adapter: String,
    },

    /// No GATT service with the requested UUID exists under the device.
    #[error("GATT service '{0}' not found")]
    ServiceNotFound(Uuid),

    /// No GATT characteristic with the requested UUID exists under the device.
    #[error("GATT characteristic '{0}' not found")]
    CharacteristicNotFound(Uuid),

    /// The characteristic does not support notifications or indications.
    #[error("characteristic '{0}' does not allow notifications")]
    NotifyUnsupported(Uuid),

    /// A discovery was started while another one is still running.
    #[error("discovery already running")]
    DiscoveryInProgress,

    /// A discovery was started with neither a timeout nor a callback.
    #[error("discovery needs a timeout or a callback")]
    DiscoveryArgs,

    /// The property was never delivered by the bus, so the local cache has
    /// no value for it.
    #[error("property '{0}' not populated in the local cache")]
    PropertyNotCached(String),

    /// A cached property exists but holds a value of an unexpected type.
    #[error("property '{0}' has an unexpected type")]
    PropertyType(String),

    /// A transport-level failure surfaced during a connect attempt.
    #[error("bluetooth I/O error: {0}")]
    BtIo(String),

    /// The signal monitor's dispatch thread is no longer running.
    #[error("signal monitor is not running")]
    MonitorStopped,

    /// A D-Bus communication error occurred.
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    /// A D-Bus value could not be converted.
    #[error("variant error: {0}")]
    Variant(#[from] zvariant::Error),

    /// An OS-level failure (e.g. spawning the dispatch thread).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Capability flags of a GATT characteristic.
    ///
    /// Parsed from the string list BlueZ exposes in the characteristic's
    /// `Flags` property.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CharacteristicFlags: u16 {
        const BROADCAST = 1 << 0;
        const READ = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const WRITE = 1 << 3;
        const NOTIFY = 1 << 4;
        const INDICATE = 1 << 5;
        const AUTHENTICATED_SIGNED_WRITES = 1 << 6;
        const EXTENDED_PROPERTIES = 1 << 7;
        const RELIABLE_WRITE = 1 << 8;
        const WRITABLE_AUXILIARIES = 1 << 9;
    }
}

impl CharacteristicFlags {
    /// Parses the BlueZ string form of the flag set. Unknown flag names
    /// (e.g. the `encrypt-*` permission variants) are skipped.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut flags = Self::empty();
        for name in names {
            let flag = match name.as_ref() {
                "broadcast" => Self::BROADCAST,
                "read" => Self::READ,
                "write-without-response" => Self::WRITE_WITHOUT_RESPONSE,
                "write" => Self::WRITE,
                "notify" => Self::NOTIFY,
                "indicate" => Self::INDICATE,
                "authenticated-signed-writes" => Self::AUTHENTICATED_SIGNED_WRITES,
                "extended-properties" => Self::EXTENDED_PROPERTIES,
                "reliable-write" => Self::RELIABLE_WRITE,
                "writable-auxiliaries" => Self::WRITABLE_AUXILIARIES,
                other => {
                    debug!("ignoring unknown characteristic flag '{other}'");
                    continue;
                }
            };
            flags |= flag;
        }
        flags
    }
}

/// Write semantics of a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Acknowledged write ("write request").
    Request,
    /// Unacknowledged write ("write command").
    Command,
}

impl WriteMode {
    /// The value BlueZ expects in the `type` option of `WriteValue`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Command => "command",
        }
    }
}

impl Display for WriteMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport restriction of a device discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// Low Energy only.
    #[default]
    Le,
    /// BR/EDR (classic) only.
    BrEdr,
    /// Whatever the adapter supports.
    Auto,
}

impl Transport {
    /// The value BlueZ expects in the `Transport` discovery filter option.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Le => "le",
            Self::BrEdr => "bredr",
            Self::Auto => "auto",
        }
    }
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options passed to the adapter before starting a discovery.
///
/// The default filter restricts discovery to LE devices and applies no
/// RSSI floor or service allowlist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    /// Transport restriction.
    pub transport: Transport,
    /// Minimum signal strength, in dBm, for a device to be reported.
    pub rssi: Option<i16>,
    /// Only report devices advertising one of these service UUIDs.
    pub uuids: Vec<Uuid>,
}
