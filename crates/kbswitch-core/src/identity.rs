// Kbswitch Device Identity
// Stable textual identifiers for physical keyboards

use std::fmt;

/// Raw attributes read off an input device.
///
/// Every field is optional; missing attributes render as `"unknown"` in the
/// derived identity, so two devices that expose nothing still produce a
/// well-formed (if ambiguous) identifier.
#[derive(Debug, Clone, Default)]
pub struct DeviceAttributes {
    /// Product name, e.g. "Keychron K2".
    pub product: Option<String>,
    /// USB vendor id.
    pub vendor_id: Option<u16>,
    /// USB product id.
    pub product_id: Option<u16>,
    /// Manufacturer string, when the backend exposes one.
    pub manufacturer: Option<String>,
    /// Serial number (evdev "uniq").
    pub serial: Option<String>,
    /// Physical port location (evdev "phys").
    pub location: Option<String>,
}

/// Derived identifier naming one physical keyboard.
///
/// Recomputed for every hardware event; never cached across devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyboardIdentity(String);

impl KeyboardIdentity {
    /// Derive the identity string from device attributes.
    ///
    /// With `use_location` the physical port becomes part of the identity:
    /// the same keyboard plugged into a different port is a new device, and
    /// the mapping stored for the old port is left behind.
    pub fn derive(attrs: &DeviceAttributes, use_location: bool) -> Self {
        let product = text_field(&attrs.product);
        let vendor = id_field(attrs.vendor_id);
        let product_id = id_field(attrs.product_id);
        let manufacturer = text_field(&attrs.manufacturer);
        let serial = text_field(&attrs.serial);

        let identity = if use_location {
            let location = text_field(&attrs.location);
            format!("{product}-[{vendor}-{product_id}-{manufacturer}-{serial}-{location}]")
        } else {
            format!("{product}-[{vendor}-{product_id}-{manufacturer}-{serial}]")
        };

        KeyboardIdentity(identity)
    }

    /// Wrap an identity string read back from the store or the CLI.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        KeyboardIdentity(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyboardIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyboardIdentity {
    fn from(raw: &str) -> Self {
        KeyboardIdentity(raw.to_string())
    }
}

fn text_field(value: &Option<String>) -> &str {
    match value.as_deref() {
        Some(s) if !s.is_empty() => s,
        _ => "unknown",
    }
}

fn id_field(value: Option<u16>) -> String {
    match value {
        Some(id) => format!("{id:04x}"),
        None => "unknown".to_string(),
    }
}
