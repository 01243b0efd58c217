//! Well-known BlueZ D-Bus names used throughout the crate.

/// The well-known bus name of the BlueZ daemon.
pub(crate) const BLUEZ_SERVICE: &str = "org.bluez";

/// Object path of the BlueZ object manager root.
pub(crate) const BLUEZ_ROOT: &str = "/";

/// BlueZ interface names, as exposed over the object manager.
pub(crate) mod interface {
    pub(crate) const ADAPTER: &str = "org.bluez.Adapter1";
    pub(crate) const DEVICE: &str = "org.bluez.Device1";
    pub(crate) const GATT_SERVICE: &str = "org.bluez.GattService1";
    pub(crate) const GATT_CHARACTERISTIC: &str = "org.bluez.GattCharacteristic1";
}

/// Property names read from BlueZ objects.
pub(crate) mod property {
    pub(crate) const ADDRESS: &str = "Address";
    pub(crate) const NAME: &str = "Name";
    pub(crate) const CONNECTED: &str = "Connected";
    pub(crate) const UUID: &str = "UUID";
    pub(crate) const PRIMARY: &str = "Primary";
    pub(crate) const SERVICE: &str = "Service";
    pub(crate) const FLAGS: &str = "Flags";
}
