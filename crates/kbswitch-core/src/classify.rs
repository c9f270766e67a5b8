// Kbswitch Device Classification
// Capability analysis deciding which input devices count as keyboards

use std::collections::HashSet;

/// Key capabilities extracted from an input device.
#[derive(Debug, Clone, Default)]
pub struct KeyCapabilities {
    /// Whether the device reports EV_KEY events at all.
    pub has_ev_key: bool,
    /// Supported key codes.
    pub key_codes: Vec<u16>,
}

impl KeyCapabilities {
    pub fn new(has_ev_key: bool, key_codes: Vec<u16>) -> Self {
        Self {
            has_ev_key,
            key_codes,
        }
    }

    fn key_set(&self) -> HashSet<u16> {
        self.key_codes.iter().copied().collect()
    }
}

// QWERTY row key codes: Q, W, E, R, T, Y
const QWERTY_CODES: &[u16] = &[16, 17, 18, 19, 20, 21];

// Representative A-Z and SPACE codes: SPACE, A, Z
const A_Z_SPACE_CODES: &[u16] = &[57, 30, 44];

// Main keyboard block: ESC (1) through KPDOT (83). Anything with a key in
// this range produces typing-relevant events; pure-button devices (mice,
// power switches) only report codes outside it.
const KEYBOARD_BLOCK: std::ops::RangeInclusive<u16> = 1..=83;

/// Whether a device is worth monitoring at all.
///
/// Deliberately loose: any key in the main keyboard block qualifies, so
/// macro pads and other partial keyboards still get their events observed.
pub fn emits_keyboard_keys(capabilities: &KeyCapabilities) -> bool {
    if !capabilities.has_ev_key {
        return false;
    }
    capabilities
        .key_codes
        .iter()
        .any(|code| KEYBOARD_BLOCK.contains(code))
}

/// Whether a device conforms to a full keyboard.
///
/// This is the strict classification that seeds a device's enabled flag on
/// first observation: all QWERTY row keys plus representative A-Z keys and
/// SPACE must be present.
pub fn conforms_to_keyboard(capabilities: &KeyCapabilities) -> bool {
    if !capabilities.has_ev_key {
        return false;
    }

    let key_set = capabilities.key_set();
    let qwerty_present = QWERTY_CODES.iter().all(|code| key_set.contains(code));
    let az_present = A_Z_SPACE_CODES.iter().all(|code| key_set.contains(code));

    qwerty_present && az_present
}
