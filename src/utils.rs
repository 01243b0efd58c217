//! Small conversion helpers shared across the crate.
//!
//! Provides the device-path to MAC-address codec used by BlueZ object paths
//! and a few `zvariant` value extractors.

use std::sync::{Mutex, MutexGuard, PoisonError};

use zvariant::{OwnedValue, Value};

/// Recovers a MAC address from a BlueZ device object path.
///
/// Device paths encode the address in their final segment as
/// `dev_XX_XX_XX_XX_XX_XX`. The inverse mapping strips the `dev_` prefix,
/// replaces underscores with colons and lower-cases the result, e.g.
/// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF` -> `aa:bb:cc:dd:ee:ff`.
pub(crate) fn address_from_device_path(path: &str) -> String {
    let segment = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    let segment = segment.strip_prefix("dev_").unwrap_or(&segment);
    segment.replace('_', ":")
}

/// Returns the final segment of an object path (e.g. `hci0`).
pub(crate) fn path_tail(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Extracts a string from a variant value, accepting both string and
/// object-path values (BlueZ uses the latter for parent links).
pub(crate) fn value_as_str(value: &OwnedValue) -> Option<&str> {
    match &**value {
        Value::Str(s) => Some(s.as_str()),
        Value::ObjectPath(p) => Some(p.as_str()),
        _ => None,
    }
}

/// Extracts a boolean from a variant value.
pub(crate) fn value_as_bool(value: &OwnedValue) -> Option<bool> {
    match &**value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

/// Extracts an array of strings from a variant value, skipping elements of
/// other types.
pub(crate) fn value_as_str_array(value: &OwnedValue) -> Option<Vec<String>> {
    match &**value {
        Value::Array(array) => Some(
            array
                .iter()
                .filter_map(|item| match item {
                    Value::Str(s) => Some(s.as_str().to_owned()),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
