//! The GATT client: connection lifecycle, reads, writes and notifications.
//!
//! A [`GattRequester`] owns a [`Device`] handle and turns `Connected`
//! property transitions plus explicit connect/disconnect calls into
//! `on_connect` / `on_connect_failed` / `on_disconnect` callbacks.
//! Callbacks may arrive on the monitor's dispatch thread or on a worker
//! thread; callers must not assume same-thread continuation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;

use log::warn;
use uuid::Uuid;
use zvariant::OwnedValue;

use crate::Result;
use crate::constants::property;
use crate::device::Device;
use crate::models::{CharacteristicFlags, Error, WriteMode};
use crate::monitor::{ObserverId, SignalCallback, SignalEvent, SignalKey};
use crate::session::{BluezSession, Characteristic};
use crate::utils::{lock, value_as_bool};

/// Arguments delivered to a notification callback: lower-cased property
/// names mapped to their new value, or `None` for invalidated properties.
pub type NotificationArgs = HashMap<String, Option<OwnedValue>>;

/// Connection lifecycle callbacks, stored by [`GattRequester::connect`].
#[derive(Default)]
pub struct ConnectCallbacks {
    /// Invoked once per successful connect, and on every external
    /// transition of `Connected` to `true`.
    pub on_connect: Option<Box<dyn Fn() + Send + Sync>>,
    /// Invoked with a failure message when the remote connect call fails.
    pub on_fail: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// Invoked on every transition of `Connected` to `false`.
    pub on_disconnect: Option<Box<dyn Fn() + Send + Sync>>,
}

struct NotifyEntry {
    id: ObserverId,
    path: String,
    // Keeps the observer registration alive; the monitor holds a weak ref.
    _callback: Arc<SignalCallback>,
}

/// The stored form of [`ConnectCallbacks`]: shared so they can be invoked
/// with the storage lock released, letting a callback call back into the
/// requester (e.g. reconnect from `on_disconnect`).
#[derive(Default)]
struct StoredCallbacks {
    on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    on_fail: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl From<ConnectCallbacks> for StoredCallbacks {
    fn from(callbacks: ConnectCallbacks) -> Self {
        Self {
            on_connect: callbacks.on_connect.map(Arc::from),
            on_fail: callbacks.on_fail.map(Arc::from),
            on_disconnect: callbacks.on_disconnect.map(Arc::from),
        }
    }
}

struct Inner {
    session: BluezSession,
    device: Device,
    callbacks: Mutex<StoredCallbacks>,
    notifications: Mutex<HashMap<Uuid, NotifyEntry>>,
}

impl Inner {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.session
            .characteristic_by_uuid(self.device.object_path(), uuid)
    }

    fn is_connected(&self) -> Result<bool> {
        self.device.prop_bool(property::CONNECTED)
    }

    /// The connect worker. The `Connected` property only fires a
    /// change event if it actually changed, so when the device was already
    /// connected before this call the `on_connect` callback is invoked
    /// here — the event-driven path stays silent.
    fn do_connect(&self) {
        let already_connected = match self.is_connected() {
            Ok(connected) => connected,
            Err(e) => {
                self.fire_fail(&e.to_string());
                return;
            }
        };

        if let Err(e) = self.device.ops().connect() {
            let remapped = Error::BtIo(e.to_string());
            self.fire_fail(&remapped.to_string());
            return;
        }

        if already_connected {
            self.fire_connect();
        }
    }

    fn fire_connect(&self) {
        let on_connect = lock(&self.callbacks).on_connect.clone();
        if let Some(on_connect) = on_connect {
            on_connect();
        }
    }

    fn fire_disconnect(&self) {
        let on_disconnect = lock(&self.callbacks).on_disconnect.clone();
        if let Some(on_disconnect) = on_disconnect {
            on_disconnect();
        }
    }

    fn fire_fail(&self, message: &str) {
        let on_fail = lock(&self.callbacks).on_fail.clone();
        match on_fail {
            Some(on_fail) => on_fail(message),
            None => warn!("connect failed, but no 'on_fail' callback set: {message}"),
        }
    }

    fn on_props_changed(&self, event: &SignalEvent) {
        let SignalEvent::PropertiesChanged { changed, .. } = event else {
            return;
        };
        // Only a change-set carrying "Connected" drives the state machine.
        let Some(connected) = changed.get(property::CONNECTED).and_then(value_as_bool) else {
            return;
        };
        if connected {
            self.fire_connect();
        } else {
            self.fire_disconnect();
        }
    }
}

/// A GATT client bound to one remote device.
pub struct GattRequester {
    inner: Arc<Inner>,
    relay_id: ObserverId,
    // Keeps the Connected-relay registration alive.
    _relay: Arc<SignalCallback>,
}

impl GattRequester {
    /// Resolves the device with `address` on the named adapter over the
    /// system bus.
    pub fn new(address: &str, adapter: &str) -> Result<Self> {
        Self::with_session(BluezSession::system()?, address, adapter)
    }

    /// Same as [`new`](Self::new), over an existing session.
    pub fn with_session(session: BluezSession, address: &str, adapter: &str) -> Result<Self> {
        let device = session.find_device(address, adapter)?;
        let device_path = device.object_path().to_string();

        let inner = Arc::new(Inner {
            session,
            device,
            callbacks: Mutex::new(StoredCallbacks::default()),
            notifications: Mutex::new(HashMap::new()),
        });

        let relay: Arc<SignalCallback> = {
            let inner = Arc::downgrade(&inner);
            Arc::new(move |event| {
                if let Some(inner) = inner.upgrade() {
                    inner.on_props_changed(event);
                }
            })
        };
        let relay_id = inner
            .session
            .monitor()
            .subscribe(SignalKey::Properties(device_path), &relay);

        Ok(Self {
            inner,
            relay_id,
            _relay: relay,
        })
    }

    /// The underlying device handle.
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Connects to the device, replacing any previously stored callbacks.
    ///
    /// With `wait` the remote call runs on the calling thread and this
    /// blocks until it returns; otherwise a detached worker performs it
    /// and the call returns immediately. Either way the outcome is
    /// reported through the callbacks: exactly one `on_connect` per
    /// successful call (even when the link was already open), or one
    /// `on_connect_failed` with the transport error message.
    pub fn connect(&self, wait: bool, callbacks: ConnectCallbacks) {
        *lock(&self.inner.callbacks) = callbacks.into();

        let inner = self.inner.clone();
        if wait {
            inner.do_connect();
        } else {
            thread::spawn(move || inner.do_connect());
        }
    }

    /// Whether the device is currently connected, per the live property
    /// cache.
    pub fn is_connected(&self) -> Result<bool> {
        self.inner.is_connected()
    }

    /// Issues the remote disconnect call. `on_disconnect` fires when the
    /// resulting `Connected` change event arrives, not synchronously.
    pub fn disconnect(&self) -> Result<()> {
        self.inner.device.ops().disconnect()
    }

    /// Initiates pairing.
    ///
    /// This will not work unless a pairing agent is available on the
    /// system; prefer the system's own agent where possible.
    pub fn pair(&self) -> Result<()> {
        self.inner.device.ops().pair()
    }

    /// The distinct UUIDs of the device's primary GATT services.
    pub fn discover_primary(&self) -> Result<Vec<Uuid>> {
        self.inner
            .session
            .find_gatt_services(self.inner.device.object_path(), true)
    }

    /// The distinct UUIDs of the characteristics under the given service.
    pub fn discover_characteristics(&self, service_uuid: Uuid) -> Result<Vec<Uuid>> {
        self.inner
            .session
            .find_gatt_characteristics(self.inner.device.object_path(), service_uuid)
    }

    /// Resolves a characteristic of this device by UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.inner.characteristic(uuid)
    }

    /// Reads a characteristic value, blocking for the bus round-trip.
    pub fn read_by_uuid(&self, uuid: Uuid) -> Result<Vec<u8>> {
        self.inner.characteristic(uuid)?.ops().read_value()
    }

    /// Reads a characteristic value on a detached worker thread and hands
    /// the outcome to `callback`.
    ///
    /// There is no cancellation: the worker always runs to completion, and
    /// the callback is the only completion signal.
    pub fn read_by_uuid_async<F>(&self, uuid: Uuid, callback: F)
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        let inner = self.inner.clone();
        thread::spawn(move || {
            let result = inner
                .characteristic(uuid)
                .and_then(|c| c.ops().read_value());
            callback(result);
        });
    }

    /// Writes a characteristic value as an acknowledged write request.
    pub fn write_by_uuid(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        self.inner
            .characteristic(uuid)?
            .ops()
            .write_value(data, WriteMode::Request)
    }

    /// Writes a characteristic value as an unacknowledged write command.
    pub fn write_cmd_by_uuid(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        self.inner
            .characteristic(uuid)?
            .ops()
            .write_value(data, WriteMode::Command)
    }

    /// Enables value-change notifications on a characteristic.
    ///
    /// `filter` restricts which changed properties reach the callback: with
    /// `None` every changed property is forwarded (invalidated ones as
    /// `None`); with a fixed key set only those keys are forwarded, and the
    /// callback is skipped entirely when none of them is present in the
    /// change-set. Property names are matched lower-cased.
    ///
    /// Re-enabling an already enabled UUID atomically replaces the previous
    /// registration. Fails with [`Error::NotifyUnsupported`] if the
    /// characteristic supports neither notifications nor indications.
    pub fn enable_notifications<F>(
        &self,
        uuid: Uuid,
        callback: F,
        filter: Option<&[&str]>,
    ) -> Result<()>
    where
        F: Fn(&NotificationArgs) + Send + Sync + 'static,
    {
        let characteristic = self.inner.characteristic(uuid)?;
        if !characteristic
            .flags()
            .intersects(CharacteristicFlags::NOTIFY | CharacteristicFlags::INDICATE)
        {
            return Err(Error::NotifyUnsupported(uuid));
        }
        let path = characteristic.path().to_string();

        // Re-enable: retire the previous registration first so repeated
        // enables do not accumulate observers.
        if let Some(previous) = lock(&self.inner.notifications).remove(&uuid) {
            self.inner.session.monitor().unsubscribe(previous.id);
        }

        let monitor = self.inner.session.monitor();
        monitor.listen_for_property_changes(&path)?;

        let filter: Option<Vec<String>> =
            filter.map(|keys| keys.iter().map(|k| k.to_string()).collect());
        let wrapped: Arc<SignalCallback> = Arc::new(move |event| {
            let SignalEvent::PropertiesChanged {
                changed,
                invalidated,
                ..
            } = event
            else {
                return;
            };
            filter_notification(changed, invalidated, filter.as_deref(), &callback);
        });
        let id = monitor.subscribe(SignalKey::Properties(path.clone()), &wrapped);
        lock(&self.inner.notifications).insert(
            uuid,
            NotifyEntry {
                id,
                path,
                _callback: wrapped,
            },
        );

        characteristic.ops().start_notify()
    }

    /// Disables notifications for a characteristic. No-op if the UUID was
    /// never enabled.
    pub fn disable_notifications(&self, uuid: Uuid) -> Result<()> {
        let Some(entry) = lock(&self.inner.notifications).remove(&uuid) else {
            return Ok(());
        };

        let monitor = self.inner.session.monitor();
        monitor.unsubscribe(entry.id);
        monitor.stop_listening_for_property_changes(&entry.path);
        self.inner.characteristic(uuid)?.ops().stop_notify()
    }
}

impl Drop for GattRequester {
    fn drop(&mut self) {
        let monitor = self.inner.session.monitor();
        monitor.unsubscribe(self.relay_id);
        for entry in lock(&self.inner.notifications).values() {
            monitor.unsubscribe(entry.id);
            monitor.stop_listening_for_property_changes(&entry.path);
        }
    }
}

/// Applies the notification key filter and invokes the callback with the
/// surviving arguments, if any.
fn filter_notification(
    changed: &HashMap<String, OwnedValue>,
    invalidated: &[String],
    filter: Option<&[String]>,
    callback: &dyn Fn(&NotificationArgs),
) {
    let mut args = NotificationArgs::new();

    match filter {
        None => {
            for (name, value) in changed {
                if let Ok(value) = value.try_clone() {
                    args.insert(name.to_lowercase(), Some(value));
                }
            }
            for name in invalidated {
                args.insert(name.to_lowercase(), None);
            }
        }
        Some(keys) => {
            let changed: HashMap<String, &OwnedValue> = changed
                .iter()
                .map(|(name, value)| (name.to_lowercase(), value))
                .collect();
            let invalidated: HashSet<String> =
                invalidated.iter().map(|name| name.to_lowercase()).collect();

            for key in keys {
                if invalidated.contains(key) {
                    args.insert(key.clone(), None);
                } else if let Some(value) = changed.get(key) {
                    if let Ok(value) = value.try_clone() {
                        args.insert(key.clone(), Some(value));
                    }
                }
            }
        }
    }

    if !args.is_empty() {
        callback(&args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zvariant::Value;

    fn changed_with(name: &str, value: Value<'_>) -> HashMap<String, OwnedValue> {
        let mut changed = HashMap::new();
        changed.insert(name.to_string(), value.try_to_owned().unwrap());
        changed
    }

    #[test]
    fn test_filter_forwards_matching_key_lowercased() {
        let changed = changed_with("Value", Value::from(vec![1u8]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let seen = seen.clone();
            move |args: &NotificationArgs| {
                lock(&seen).push(args.keys().cloned().collect::<Vec<_>>());
            }
        };

        let filter = vec!["value".to_string()];
        filter_notification(&changed, &[], Some(&filter), &callback);

        let seen = lock(&seen);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec!["value".to_string()]);
    }

    #[test]
    fn test_filter_suppresses_unmatched_events() {
        let changed = changed_with("Value", Value::from(vec![1u8]));
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = {
            let calls = calls.clone();
            move |_args: &NotificationArgs| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        };

        let filter = vec!["battery".to_string()];
        filter_notification(&changed, &[], Some(&filter), &callback);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_filter_forwards_everything() {
        let mut changed = changed_with("Value", Value::from(vec![1u8]));
        changed.insert(
            "Notifying".to_string(),
            Value::from(true).try_to_owned().unwrap(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let seen = seen.clone();
            move |args: &NotificationArgs| {
                let mut keys: Vec<_> = args
                    .iter()
                    .map(|(k, v)| (k.clone(), v.is_some()))
                    .collect();
                keys.sort();
                lock(&seen).push(keys);
            }
        };

        filter_notification(&changed, &["Stale".to_string()], None, &callback);

        let seen = lock(&seen);
        assert_eq!(
            seen[0],
            vec![
                ("notifying".to_string(), true),
                ("stale".to_string(), false),
                ("value".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_invalidated_key_in_filter_maps_to_none() {
        let changed = HashMap::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let seen = seen.clone();
            move |args: &NotificationArgs| {
                lock(&seen).push(args.get("value").map(Option::is_none));
            }
        };

        let filter = vec!["value".to_string()];
        filter_notification(&changed, &["Value".to_string()], Some(&filter), &callback);

        // The key is present and carries None.
        assert_eq!(*lock(&seen), vec![Some(true)]);
    }
}
