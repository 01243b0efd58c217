//! The signal monitor: the single place where bus events become in-process
//! callbacks.
//!
//! One background thread drives all signal streams and is the exclusive
//! source of every callback delivered by this crate. Observers register
//! with [`SignalMonitor::subscribe`]; registrations hold only a weak
//! reference to the callback, so dropping the owning `Arc` is enough to
//! stop receiving events — no explicit unsubscribe required.
//!
//! Per-path property subscriptions are reference-free and idempotent:
//! [`SignalMonitor::listen_for_property_changes`] establishes at most one
//! underlying bus subscription per object path, no matter how many logical
//! observers hang off the corresponding channel.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use futures::channel::mpsc;
use futures::stream::{AbortHandle, Abortable, SelectAll};
use futures::{StreamExt, executor, select};
use log::{debug, error, info, warn};
use zvariant::OwnedValue;

use crate::Result;
use crate::bus::{Bus, BusEvent, EventStream};
use crate::constants::{interface, property};
use crate::device::PropertyCache;
use crate::models::Error;
use crate::utils::{address_from_device_path, lock, value_as_str};

/// Token identifying one observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Identity of a signal channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignalKey {
    /// A device appeared during discovery.
    DeviceAdded,
    /// A device disappeared.
    DeviceRemoved,
    /// Properties changed on the object at this path.
    Properties(String),
}

impl Display for SignalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceAdded => f.write_str("DeviceAdded"),
            Self::DeviceRemoved => f.write_str("DeviceRemoved"),
            Self::Properties(path) => write!(f, "PropertiesChanged:{path}"),
        }
    }
}

/// An event delivered to observers.
#[derive(Debug)]
pub enum SignalEvent {
    /// A device with the given name and address appeared.
    DeviceAdded {
        /// Advertised device name, empty if none.
        name: String,
        /// Device MAC address, lower-cased.
        address: String,
    },
    /// The device with the given address disappeared.
    DeviceRemoved {
        /// Device MAC address, lower-cased, derived from the object path.
        address: String,
    },
    /// Properties changed on a watched object.
    PropertiesChanged {
        /// Interface the properties belong to.
        interface: String,
        /// New values of the changed properties.
        changed: HashMap<String, OwnedValue>,
        /// Properties invalidated without a replacement value.
        invalidated: Vec<String>,
    },
}

/// An observer callback. Subscribers keep the `Arc` alive; the monitor
/// holds only a weak reference.
pub type SignalCallback = dyn Fn(&SignalEvent) + Send + Sync;

struct Registration {
    id: ObserverId,
    callback: Weak<SignalCallback>,
}

struct TrackedPath {
    abort: AbortHandle,
    cache: Option<std::sync::Weak<PropertyCache>>,
}

struct MonitorState {
    next_id: u64,
    channels: HashMap<SignalKey, Vec<Registration>>,
    tracked: HashMap<String, TrackedPath>,
}

enum Command {
    Watch(EventStream),
}

/// Routes bus events to in-process observers.
///
/// Obtain one through [`crate::BluezSession`], or construct one directly
/// with a custom [`Bus`] implementation.
pub struct SignalMonitor {
    bus: Arc<dyn Bus>,
    state: Mutex<MonitorState>,
    ctl: mpsc::UnboundedSender<Command>,
}

impl SignalMonitor {
    /// Creates a monitor over the given bus and starts its dispatch thread.
    ///
    /// The thread is detached; it exits when the monitor is dropped, and
    /// may simply be abandoned at process exit.
    pub fn new(bus: Arc<dyn Bus>) -> Result<Arc<Self>> {
        let objects = bus.object_events()?;
        let (ctl, commands) = mpsc::unbounded();

        let monitor = Arc::new(Self {
            bus,
            state: Mutex::new(MonitorState {
                next_id: 0,
                channels: HashMap::new(),
                tracked: HashMap::new(),
            }),
            ctl,
        });

        let weak = Arc::downgrade(&monitor);
        thread::Builder::new()
            .name("gattrs-signal-monitor".into())
            .spawn(move || dispatch_loop(weak, objects, commands))?;

        info!("signal monitor initialized");
        Ok(monitor)
    }

    /// The bus this monitor listens on.
    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Registers `callback` on the given channel and returns a token for
    /// [`unsubscribe`](Self::unsubscribe).
    ///
    /// Only a weak reference is stored: once the caller drops its `Arc`,
    /// the registration is pruned on the next dispatch pass. For
    /// [`SignalKey::Properties`] channels the caller must also have called
    /// [`listen_for_property_changes`](Self::listen_for_property_changes),
    /// otherwise the channel never fires.
    pub fn subscribe(&self, key: SignalKey, callback: &Arc<SignalCallback>) -> ObserverId {
        let mut state = lock(&self.state);
        let id = ObserverId(state.next_id);
        state.next_id += 1;

        state.channels.entry(key.clone()).or_default().push(Registration {
            id,
            callback: Arc::downgrade(callback),
        });
        debug!("observer {id:?} subscribed to {key}");
        id
    }

    /// Removes a registration. No-op if the token is unknown or the
    /// receiver is already gone.
    pub fn unsubscribe(&self, id: ObserverId) {
        let mut state = lock(&self.state);
        for registrations in state.channels.values_mut() {
            registrations.retain(|r| r.id != id);
        }
        debug!("observer {id:?} unsubscribed");
    }

    /// Establishes the underlying bus subscription for property changes on
    /// `path`, wiring its events to the `PropertiesChanged:<path>` channel.
    ///
    /// Idempotent: at most one bus subscription exists per path.
    pub fn listen_for_property_changes(&self, path: &str) -> Result<()> {
        if lock(&self.state).tracked.contains_key(path) {
            return Ok(());
        }

        // Create the stream outside the lock; the bus call may block.
        let events = self.bus.property_events(path)?;
        let (abort, registration) = AbortHandle::new_pair();
        let events: EventStream = Box::pin(Abortable::new(events, registration));

        {
            let mut state = lock(&self.state);
            if state.tracked.contains_key(path) {
                // Lost a registration race; drop the redundant stream.
                abort.abort();
                return Ok(());
            }
            state
                .tracked
                .insert(path.to_string(), TrackedPath { abort, cache: None });
        }

        self.ctl
            .unbounded_send(Command::Watch(events))
            .map_err(|_| Error::MonitorStopped)?;
        debug!("tracking property changes of {path}");
        Ok(())
    }

    /// Tears down the bus subscription for `path`. No-op if not listening.
    pub fn stop_listening_for_property_changes(&self, path: &str) {
        let entry = lock(&self.state).tracked.remove(path);
        if let Some(entry) = entry {
            entry.abort.abort();
            debug!("stopped tracking property changes of {path}");
        }
    }

    /// Keeps `cache` in sync with property changes on `path`, establishing
    /// the bus subscription if needed. Only a weak reference to the cache
    /// is held.
    pub(crate) fn keep_synced(&self, path: &str, cache: &Arc<PropertyCache>) -> Result<()> {
        self.listen_for_property_changes(path)?;
        let mut state = lock(&self.state);
        if let Some(entry) = state.tracked.get_mut(path) {
            entry.cache = Some(Arc::downgrade(cache));
        }
        Ok(())
    }

    /// Stops syncing and listening for `path`.
    pub(crate) fn stop_syncing(&self, path: &str) {
        self.stop_listening_for_property_changes(path);
    }

    /// Delivers `event` to every live observer of `key`, in registration
    /// order.
    ///
    /// Dead registrations are pruned. A panicking callback is caught,
    /// logged and pruned as well, so one misbehaving observer never aborts
    /// delivery to the rest.
    pub fn notify(&self, key: &SignalKey, event: &SignalEvent) {
        let snapshot: Vec<(ObserverId, Weak<SignalCallback>)> = {
            let state = lock(&self.state);
            match state.channels.get(key) {
                Some(registrations) => registrations
                    .iter()
                    .map(|r| (r.id, r.callback.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (id, callback) in snapshot {
            let Some(callback) = callback.upgrade() else {
                dead.push(id);
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("observer {id:?} panicked, removed from channel {key}");
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut state = lock(&self.state);
            if let Some(registrations) = state.channels.get_mut(key) {
                registrations.retain(|r| !dead.contains(&r.id));
            }
        }
    }

    fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::InterfacesAdded { path, interfaces } => {
                debug!("new interfaces added at {path}");
                self.on_device_added(&interfaces);
            }
            BusEvent::InterfacesRemoved { path, interfaces } => {
                debug!("interfaces removed at {path}");
                if interfaces.iter().any(|i| i == interface::DEVICE) {
                    let address = address_from_device_path(&path);
                    self.notify(&SignalKey::DeviceRemoved, &SignalEvent::DeviceRemoved { address });
                }
            }
            BusEvent::PropertiesChanged {
                path,
                interface,
                changed,
                invalidated,
            } => {
                let event = SignalEvent::PropertiesChanged {
                    interface,
                    changed,
                    invalidated,
                };
                // Observers run before the cache merge so they can still
                // read the pre-change values.
                self.notify(&SignalKey::Properties(path.clone()), &event);
                if let SignalEvent::PropertiesChanged { changed, .. } = &event {
                    self.sync_cache(&path, changed);
                }
            }
        }
    }

    fn on_device_added(&self, interfaces: &crate::bus::InterfaceMap) {
        let Some(device) = interfaces.get(interface::DEVICE) else {
            return;
        };
        // A device without an address cannot be indexed; ignore it.
        let Some(address) = device.get(property::ADDRESS).and_then(value_as_str) else {
            return;
        };
        let name = device
            .get(property::NAME)
            .and_then(value_as_str)
            .unwrap_or_default();

        self.notify(
            &SignalKey::DeviceAdded,
            &SignalEvent::DeviceAdded {
                name: name.to_string(),
                address: address.to_string(),
            },
        );
    }

    fn sync_cache(&self, path: &str, changed: &HashMap<String, OwnedValue>) {
        let cache = {
            let state = lock(&self.state);
            state.tracked.get(path).and_then(|t| t.cache.clone())
        };
        if let Some(cache) = cache.and_then(|weak| weak.upgrade()) {
            cache.merge(changed);
        }
    }
}

/// The dispatch loop: drives the object-event stream, dynamically added
/// per-path property streams and the control channel on one thread.
fn dispatch_loop(
    monitor: Weak<SignalMonitor>,
    objects: EventStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    executor::block_on(async move {
        let mut streams: SelectAll<EventStream> = SelectAll::new();
        streams.push(objects);

        loop {
            select! {
                command = commands.next() => match command {
                    Some(Command::Watch(stream)) => streams.push(stream),
                    // All senders gone: the monitor was dropped.
                    None => break,
                },
                event = streams.next() => {
                    let Some(event) = event else { continue };
                    let Some(monitor) = monitor.upgrade() else { break };
                    monitor.handle_event(event);
                }
            }
        }
        warn!("signal monitor dispatch loop exited");
    });
}
