//! Shared in-memory bus used by the integration tests.
//!
//! `MockBus` implements the crate's transport boundary: it serves a
//! caller-provided object enumeration, records every remote call, and lets
//! tests inject bus events into the streams the monitor consumes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::channel::mpsc::{self, UnboundedSender};
use zvariant::{ObjectPath, OwnedValue, Value};

use gattrs::bus::{
    AdapterOps, Bus, BusEvent, CharacteristicOps, DeviceOps, EventStream, InterfaceMap,
    ManagedObjects,
};
use gattrs::{BluezSession, DiscoveryFilter, Error, Result, WriteMode};

pub const ADAPTER_PATH: &str = "/org/bluez/hci0";
pub const DEVICE_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
pub const SERVICE_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c";
pub const BATTERY_CHAR_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000d";
pub const NAME_CHAR_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000f";

pub const BATTERY_SERVICE_UUID: &str = "0000180f-0000-1000-8000-00805f9b34fb";
pub const BATTERY_LEVEL_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";
pub const DEVICE_NAME_UUID: &str = "00002a00-0000-1000-8000-00805f9b34fb";

pub fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn sv(s: &str) -> OwnedValue {
    Value::from(s).try_to_owned().unwrap()
}

pub fn bv(b: bool) -> OwnedValue {
    Value::from(b).try_to_owned().unwrap()
}

pub fn path_value(path: &str) -> OwnedValue {
    Value::from(ObjectPath::try_from(path.to_string()).unwrap())
        .try_to_owned()
        .unwrap()
}

pub fn strings_value(items: &[&str]) -> OwnedValue {
    Value::from(items.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .try_to_owned()
        .unwrap()
}

pub fn bytes_value(bytes: &[u8]) -> OwnedValue {
    Value::from(bytes.to_vec()).try_to_owned().unwrap()
}

/// Interfaces of a freshly discovered device, for injected added events.
pub fn device_interfaces(name: Option<&str>, address: Option<&str>) -> InterfaceMap {
    let mut props = HashMap::new();
    if let Some(name) = name {
        props.insert("Name".to_string(), sv(name));
    }
    if let Some(address) = address {
        props.insert("Address".to_string(), sv(address));
    }
    let mut interfaces = HashMap::new();
    interfaces.insert("org.bluez.Device1".to_string(), props);
    interfaces
}

/// The standard enumeration: one adapter, one device with a battery
/// service carrying a notifiable characteristic and a read-only one.
pub fn standard_objects(connected: bool) -> ManagedObjects {
    let mut objects = ManagedObjects::new();

    let mut adapter = HashMap::new();
    adapter.insert("Address".to_string(), sv("00:11:22:33:44:55"));
    objects.insert(
        ADAPTER_PATH.to_string(),
        HashMap::from([("org.bluez.Adapter1".to_string(), adapter)]),
    );

    let mut device = HashMap::new();
    device.insert("Address".to_string(), sv("AA:BB:CC:DD:EE:FF"));
    device.insert("Name".to_string(), sv("Widget"));
    device.insert("Connected".to_string(), bv(connected));
    objects.insert(
        DEVICE_PATH.to_string(),
        HashMap::from([("org.bluez.Device1".to_string(), device)]),
    );

    let mut service = HashMap::new();
    service.insert("UUID".to_string(), sv(BATTERY_SERVICE_UUID));
    service.insert("Primary".to_string(), bv(true));
    objects.insert(
        SERVICE_PATH.to_string(),
        HashMap::from([("org.bluez.GattService1".to_string(), service)]),
    );

    let mut battery = HashMap::new();
    battery.insert("UUID".to_string(), sv(BATTERY_LEVEL_UUID));
    battery.insert("Service".to_string(), path_value(SERVICE_PATH));
    battery.insert("Flags".to_string(), strings_value(&["read", "notify"]));
    objects.insert(
        BATTERY_CHAR_PATH.to_string(),
        HashMap::from([("org.bluez.GattCharacteristic1".to_string(), battery)]),
    );

    let mut name_char = HashMap::new();
    name_char.insert("UUID".to_string(), sv(DEVICE_NAME_UUID));
    name_char.insert("Service".to_string(), path_value(SERVICE_PATH));
    name_char.insert("Flags".to_string(), strings_value(&["read"]));
    objects.insert(
        NAME_CHAR_PATH.to_string(),
        HashMap::from([("org.bluez.GattCharacteristic1".to_string(), name_char)]),
    );

    objects
}

/// Shared recording state: remote calls, injected event channels and
/// failure toggles.
#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<String>>,
    pub fail_connect: AtomicBool,
    pub property_subscriptions: Mutex<Vec<String>>,
    property_senders: Mutex<HashMap<String, UnboundedSender<BusEvent>>>,
    object_sender: Mutex<Option<UnboundedSender<BusEvent>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    /// Injects a property-change event into the stream for `path`.
    /// Panics if the monitor never subscribed to that path.
    pub fn send_props(&self, path: &str, changed: Vec<(&str, OwnedValue)>, invalidated: &[&str]) {
        let senders = lock(&self.property_senders);
        let sender = senders
            .get(path)
            .unwrap_or_else(|| panic!("no property subscription for {path}"));
        let event = BusEvent::PropertiesChanged {
            path: path.to_string(),
            interface: "org.bluez.Device1".to_string(),
            changed: changed
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
            invalidated: invalidated.iter().map(|s| s.to_string()).collect(),
        };
        sender.unbounded_send(event).expect("monitor loop gone");
    }

    /// Injects an object-added event.
    pub fn send_added(&self, path: &str, interfaces: InterfaceMap) {
        let sender = lock(&self.object_sender);
        let sender = sender.as_ref().expect("monitor never subscribed");
        sender
            .unbounded_send(BusEvent::InterfacesAdded {
                path: path.to_string(),
                interfaces,
            })
            .expect("monitor loop gone");
    }

    /// Injects an object-removed event.
    pub fn send_removed(&self, path: &str, interfaces: &[&str]) {
        let sender = lock(&self.object_sender);
        let sender = sender.as_ref().expect("monitor never subscribed");
        sender
            .unbounded_send(BusEvent::InterfacesRemoved {
                path: path.to_string(),
                interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            })
            .expect("monitor loop gone");
    }
}

type ObjectsFn = Box<dyn Fn() -> ManagedObjects + Send + Sync>;

pub struct MockBus {
    objects: ObjectsFn,
    rec: Arc<Recorder>,
}

impl Bus for MockBus {
    fn managed_objects(&self) -> Result<ManagedObjects> {
        Ok((self.objects)())
    }

    fn adapter(&self, path: &str) -> Result<Box<dyn AdapterOps>> {
        Ok(Box::new(MockAdapter {
            path: path.to_string(),
            rec: self.rec.clone(),
        }))
    }

    fn device(&self, path: &str) -> Result<Box<dyn DeviceOps>> {
        Ok(Box::new(MockDevice {
            path: path.to_string(),
            rec: self.rec.clone(),
        }))
    }

    fn characteristic(&self, path: &str) -> Result<Box<dyn CharacteristicOps>> {
        Ok(Box::new(MockCharacteristic {
            path: path.to_string(),
            rec: self.rec.clone(),
        }))
    }

    fn object_events(&self) -> Result<EventStream> {
        let (sender, receiver) = mpsc::unbounded();
        *lock(&self.rec.object_sender) = Some(sender);
        Ok(Box::pin(receiver))
    }

    fn property_events(&self, path: &str) -> Result<EventStream> {
        lock(&self.rec.property_subscriptions).push(path.to_string());
        let (sender, receiver) = mpsc::unbounded();
        lock(&self.rec.property_senders).insert(path.to_string(), sender);
        Ok(Box::pin(receiver))
    }
}

struct MockAdapter {
    path: String,
    rec: Arc<Recorder>,
}

impl AdapterOps for MockAdapter {
    fn start_discovery(&self) -> Result<()> {
        self.rec.record(format!("StartDiscovery {}", self.path));
        Ok(())
    }

    fn stop_discovery(&self) -> Result<()> {
        self.rec.record(format!("StopDiscovery {}", self.path));
        Ok(())
    }

    fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> Result<()> {
        self.rec.record(format!(
            "SetDiscoveryFilter {} transport={}",
            self.path,
            filter.transport.as_str()
        ));
        Ok(())
    }

    fn address(&self) -> Result<String> {
        Ok("00:11:22:33:44:55".to_string())
    }
}

struct MockDevice {
    path: String,
    rec: Arc<Recorder>,
}

impl DeviceOps for MockDevice {
    fn connect(&self) -> Result<()> {
        self.rec.record(format!("Connect {}", self.path));
        if self.rec.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Dbus(zbus::Error::Failure(
                "le-connection-abort-by-local".to_string(),
            )));
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.rec.record(format!("Disconnect {}", self.path));
        Ok(())
    }

    fn pair(&self) -> Result<()> {
        self.rec.record(format!("Pair {}", self.path));
        Ok(())
    }
}

struct MockCharacteristic {
    path: String,
    rec: Arc<Recorder>,
}

impl CharacteristicOps for MockCharacteristic {
    fn read_value(&self) -> Result<Vec<u8>> {
        self.rec.record(format!("ReadValue {}", self.path));
        Ok(vec![0x2a])
    }

    fn write_value(&self, data: &[u8], mode: WriteMode) -> Result<()> {
        self.rec
            .record(format!("WriteValue {} {} {:?}", self.path, mode, data));
        Ok(())
    }

    fn start_notify(&self) -> Result<()> {
        self.rec.record(format!("StartNotify {}", self.path));
        Ok(())
    }

    fn stop_notify(&self) -> Result<()> {
        self.rec.record(format!("StopNotify {}", self.path));
        Ok(())
    }
}

/// A session over a mock bus serving the standard enumeration.
pub fn mock_session(connected: bool) -> (Arc<Recorder>, BluezSession) {
    mock_session_with(Box::new(move || standard_objects(connected)))
}

/// A session over a mock bus with a custom enumeration.
pub fn mock_session_with(objects: ObjectsFn) -> (Arc<Recorder>, BluezSession) {
    let rec = Arc::new(Recorder::default());
    let bus = Arc::new(MockBus {
        objects,
        rec: rec.clone(),
    });
    let session = BluezSession::with_bus(bus).expect("session over mock bus");
    (rec, session)
}

/// Polls `condition` for up to two seconds.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
