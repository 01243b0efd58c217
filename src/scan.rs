//! Time-boxed and callback-driven device discovery.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info};

use crate::Result;
use crate::models::{DiscoveryFilter, Error};
use crate::monitor::{ObserverId, SignalCallback, SignalEvent, SignalKey};
use crate::session::{Adapter, BluezSession};
use crate::utils::lock;

/// Devices found so far: address mapped to advertised name.
pub type DiscoveredDevices = HashMap<String, String>;

/// Callback invoked for each advertisement, with `(name, address)`.
pub type DiscoveryCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct ScanState {
    running: bool,
    added_id: Option<ObserverId>,
    removed_id: Option<ObserverId>,
    // Keep the observer registrations alive while a scan runs.
    observers: Vec<Arc<SignalCallback>>,
}

/// Scans for nearby devices through one adapter.
///
/// A discovery is single-flight: starting a new one while another is
/// running fails with [`Error::DiscoveryInProgress`].
pub struct DiscoveryService {
    session: BluezSession,
    adapter: Adapter,
    devices: Arc<Mutex<DiscoveredDevices>>,
    state: Mutex<ScanState>,
}

impl DiscoveryService {
    /// Opens a discovery service on the named adapter over the system bus,
    /// restricted to LE transports.
    pub fn new(adapter: &str) -> Result<Self> {
        Self::with_session(BluezSession::system()?, adapter)
    }

    /// Same as [`new`](Self::new), over an existing session.
    pub fn with_session(session: BluezSession, adapter: &str) -> Result<Self> {
        Self::with_filter(session, adapter, &DiscoveryFilter::default())
    }

    /// Opens a discovery service with a custom discovery filter.
    pub fn with_filter(
        session: BluezSession,
        adapter: &str,
        filter: &DiscoveryFilter,
    ) -> Result<Self> {
        let adapter = session.find_adapter(adapter)?;
        adapter.ops().set_discovery_filter(filter)?;

        Ok(Self {
            session,
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(ScanState::default()),
        })
    }

    /// Scans for devices.
    ///
    /// With a timeout, blocks for that duration, then stops the scan and
    /// returns the accumulated address-to-name table. Without one, returns
    /// `None` immediately and the caller drives its own loop — a callback
    /// is then mandatory, and the caller must invoke [`stop`](Self::stop)
    /// itself.
    ///
    /// The callback, if any, is invoked for every advertisement with the
    /// device's name and address. A panicking callback is logged and does
    /// not abort the scan.
    pub fn discover(
        &self,
        timeout: Option<Duration>,
        callback: Option<DiscoveryCallback>,
    ) -> Result<Option<DiscoveredDevices>> {
        {
            let mut state = lock(&self.state);
            if state.running {
                return Err(Error::DiscoveryInProgress);
            }
            if timeout.is_none() && callback.is_none() {
                return Err(Error::DiscoveryArgs);
            }
            state.running = true;
        }

        lock(&self.devices).clear();

        let on_added: Arc<SignalCallback> = {
            let devices = Arc::downgrade(&self.devices);
            Arc::new(move |event| {
                let SignalEvent::DeviceAdded { name, address } = event else {
                    return;
                };
                if let Some(devices) = devices.upgrade() {
                    lock(&devices).insert(address.clone(), name.clone());
                }
                if let Some(callback) = &callback {
                    // Isolate user panics here so the scan's own
                    // registration survives them.
                    if catch_unwind(AssertUnwindSafe(|| callback(name, address))).is_err() {
                        error!("discovery callback panicked");
                    }
                }
            })
        };
        let on_removed: Arc<SignalCallback> = {
            let devices = Arc::downgrade(&self.devices);
            Arc::new(move |event| {
                let SignalEvent::DeviceRemoved { address } = event else {
                    return;
                };
                if let Some(devices) = devices.upgrade() {
                    lock(&devices).remove(address);
                }
            })
        };

        let monitor = self.session.monitor();
        {
            let mut state = lock(&self.state);
            state.added_id = Some(monitor.subscribe(SignalKey::DeviceAdded, &on_added));
            state.removed_id = Some(monitor.subscribe(SignalKey::DeviceRemoved, &on_removed));
            state.observers = vec![on_added, on_removed];
        }

        if let Err(e) = self.adapter.ops().start_discovery() {
            self.teardown();
            return Err(e);
        }
        info!("discovery launched");

        match timeout {
            Some(timeout) => {
                thread::sleep(timeout);
                self.stop()?;
                Ok(Some(lock(&self.devices).clone()))
            }
            None => Ok(None),
        }
    }

    /// Devices found since the scan started.
    pub fn devices(&self) -> DiscoveredDevices {
        lock(&self.devices).clone()
    }

    /// Stops an ongoing scan.
    pub fn stop(&self) -> Result<()> {
        self.adapter.ops().stop_discovery()?;
        self.teardown();
        info!("discovery stopped");
        Ok(())
    }

    fn teardown(&self) {
        let monitor = self.session.monitor();
        let mut state = lock(&self.state);
        if let Some(id) = state.added_id.take() {
            monitor.unsubscribe(id);
        }
        if let Some(id) = state.removed_id.take() {
            monitor.unsubscribe(id);
        }
        state.observers.clear();
        state.running = false;
    }
}
