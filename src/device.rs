//! Device handles and their locally cached property snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::warn;
use zvariant::{OwnedValue, Value};

use crate::Result;
use crate::bus::DeviceOps;
use crate::models::Error;
use crate::monitor::SignalMonitor;
use crate::utils::{lock, value_as_bool, value_as_str};

/// A property snapshot kept in sync by the signal monitor.
///
/// Mutated only from the monitor's dispatch thread; read from arbitrary
/// threads. The contract only guarantees freshness for keys that appeared
/// in a change-set — invalidated keys retain their stale value.
pub struct PropertyCache {
    values: Mutex<HashMap<String, OwnedValue>>,
}

impl PropertyCache {
    /// Creates a cache from an initial bulk-enumeration snapshot.
    pub fn new(initial: HashMap<String, OwnedValue>) -> Self {
        Self {
            values: Mutex::new(initial),
        }
    }

    /// Returns a copy of the value for `name`, if populated.
    pub fn get(&self, name: &str) -> Option<OwnedValue> {
        let values = lock(&self.values);
        let value = values.get(name)?;
        match value.try_clone() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("cached property '{name}' cannot be copied: {e}");
                None
            }
        }
    }

    /// Merges a change-set into the cache. Called by the monitor after
    /// observer fan-out.
    pub(crate) fn merge(&self, changed: &HashMap<String, OwnedValue>) {
        let mut values = lock(&self.values);
        for (name, value) in changed {
            match value.try_clone() {
                Ok(value) => {
                    values.insert(name.clone(), value);
                }
                Err(e) => warn!("dropping update for property '{name}': {e}"),
            }
        }
    }
}

/// A handle over a remote device object.
///
/// Created by [`crate::BluezSession::find_device`]. Holds a property cache
/// that the monitor keeps current; dropping the handle unregisters the
/// underlying property subscription.
pub struct Device {
    path: String,
    cache: Arc<PropertyCache>,
    ops: Box<dyn DeviceOps>,
    monitor: Arc<SignalMonitor>,
}

impl Device {
    pub(crate) fn new(
        path: String,
        initial: HashMap<String, OwnedValue>,
        ops: Box<dyn DeviceOps>,
        monitor: Arc<SignalMonitor>,
    ) -> Result<Self> {
        let cache = Arc::new(PropertyCache::new(initial));
        monitor.keep_synced(&path, &cache)?;
        Ok(Self {
            path,
            cache,
            ops,
            monitor,
        })
    }

    /// The device's object path on the bus.
    pub fn object_path(&self) -> &str {
        &self.path
    }

    /// Reads a property from the local cache.
    ///
    /// `"ObjectPath"` resolves to the handle's own path. Any other key
    /// fails with [`Error::PropertyNotCached`] if the bulk enumeration and
    /// subsequent change events never populated it.
    pub fn prop(&self, name: &str) -> Result<OwnedValue> {
        if name == "ObjectPath" {
            return Ok(Value::from(self.path.as_str()).try_to_owned()?);
        }
        self.cache
            .get(name)
            .ok_or_else(|| Error::PropertyNotCached(name.to_string()))
    }

    /// Reads a boolean property from the local cache.
    pub fn prop_bool(&self, name: &str) -> Result<bool> {
        let value = self.prop(name)?;
        value_as_bool(&value).ok_or_else(|| Error::PropertyType(name.to_string()))
    }

    /// Reads a string property from the local cache.
    pub fn prop_str(&self, name: &str) -> Result<String> {
        let value = self.prop(name)?;
        value_as_str(&value)
            .map(str::to_owned)
            .ok_or_else(|| Error::PropertyType(name.to_string()))
    }

    pub(crate) fn ops(&self) -> &dyn DeviceOps {
        self.ops.as_ref()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.monitor.stop_syncing(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(name: &str, value: Value<'_>) -> PropertyCache {
        let mut initial = HashMap::new();
        initial.insert(name.to_string(), value.try_to_owned().unwrap());
        PropertyCache::new(initial)
    }

    #[test]
    fn test_cache_get_missing_key() {
        let cache = PropertyCache::new(HashMap::new());
        assert!(cache.get("Connected").is_none());
    }

    #[test]
    fn test_cache_merge_overwrites_changed_keys_only() {
        let cache = cache_with("Name", Value::from("Widget"));

        let mut changed = HashMap::new();
        changed.insert(
            "Connected".to_string(),
            Value::from(true).try_to_owned().unwrap(),
        );
        cache.merge(&changed);

        assert_eq!(
            cache.get("Name").as_ref().and_then(value_as_str),
            Some("Widget")
        );
        assert_eq!(
            cache.get("Connected").as_ref().and_then(value_as_bool),
            Some(true)
        );
    }
}
