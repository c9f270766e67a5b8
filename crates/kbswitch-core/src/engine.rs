// Kbswitch Switch Engine
// Per-keyboard input-source tracking, restoration and cross-instance sync

use std::os::unix::io::RawFd;

use parking_lot::Mutex;

use crate::directory::SourceDirectory;
use crate::identity::KeyboardIdentity;
use crate::notify::{SettingsBus, SuppressGuard};
use crate::source::{InputSourceHost, SourceId};
use crate::store::{EnabledFlags, KvStore, MappingStore, Mappings, StoreError};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the switch engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid device number: {0}")]
    InvalidOrdinal(usize),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct EngineState {
    directory: SourceDirectory,
    store: MappingStore,
    bus: Box<dyn SettingsBus>,
    mappings: Mappings,
    enabled: EnabledFlags,
    last_active: Option<KeyboardIdentity>,
}

/// The core: reacts to keyboard activity and input-source changes, keeps the
/// per-keyboard preference map, and drives the store and the settings bus.
///
/// Every read-modify-write runs under one mutex. Events normally arrive to
/// completion on a single loop, but the two callback sources are not
/// serialized by the platform — the lock, not the loop, is the correctness
/// boundary.
pub struct SwitchEngine {
    host: Box<dyn InputSourceHost>,
    state: Mutex<EngineState>,
}

impl SwitchEngine {
    /// Build an engine over an injected host, store backend and settings bus.
    ///
    /// An unreachable host is tolerated: the directory starts empty and the
    /// store-only operations (list, enable, disable, clear) keep working.
    pub fn new(
        host: Box<dyn InputSourceHost>,
        kv: Box<dyn KvStore>,
        bus: Box<dyn SettingsBus>,
    ) -> EngineResult<Self> {
        let mut directory = SourceDirectory::new();
        if let Err(e) = directory.refresh(host.as_ref()) {
            log::debug!("input-source host unavailable, starting with an empty directory: {e}");
        }

        let store = MappingStore::new(kv);
        let (mappings, enabled) = store.load(&directory)?;
        log::debug!(
            "loaded {} mappings and {} device flags",
            mappings.len(),
            enabled.len()
        );

        Ok(Self {
            host,
            state: Mutex::new(EngineState {
                directory,
                store,
                bus,
                mappings,
                enabled,
                last_active: None,
            }),
        })
    }

    /// Handle one qualifying hardware event from a physical keyboard.
    ///
    /// Repeated events from the same device are ignored. A disabled device
    /// still claims the last-active slot (without any switching), so that a
    /// manual layout change made while typing on it is attributed to it and
    /// cannot corrupt the previous keyboard's stored preference.
    pub fn on_keyboard_event(
        &self,
        identity: KeyboardIdentity,
        conforms_to_keyboard: Option<bool>,
    ) {
        let mut state = self.state.lock();

        if state.last_active.as_ref() == Some(&identity) {
            log::trace!("ignoring event from {identity}: active device unchanged");
            return;
        }

        log::debug!(
            "active keyboard changed from {} to {identity}",
            state
                .last_active
                .as_ref()
                .map(|kb| kb.as_str())
                .unwrap_or("none")
        );

        let enabled = state.enabled.get(&identity).copied().unwrap_or(true);
        if !enabled {
            log::trace!("{identity} is disabled, claiming last-active without switching");
            state.last_active = Some(identity);
            return;
        }

        if state.mappings.contains_key(&identity) {
            state.restore(self.host.as_ref(), &identity);
        } else {
            state.store_current(self.host.as_ref(), identity.clone(), conforms_to_keyboard);
        }

        state.last_active = Some(identity);
    }

    /// Handle the host's "selected input source changed" notification.
    ///
    /// Fires both for manual changes and for the engine's own activations;
    /// the two are indistinguishable, so the current source is re-stored
    /// unconditionally for the last-active keyboard. After the engine
    /// restores a preference this is a no-op value write; after a manual
    /// override it captures the override as the new preference.
    pub fn on_source_changed(&self) {
        let mut state = self.state.lock();

        // last_active is unset only between start and the first keypress.
        if let Some(identity) = state.last_active.clone() {
            state.store_current(self.host.as_ref(), identity, None);
        }
    }

    pub fn enable_device(&self, identity: KeyboardIdentity) {
        self.set_flag(identity, true);
    }

    pub fn disable_device(&self, identity: KeyboardIdentity) {
        self.set_flag(identity, false);
    }

    /// Enable the n-th known device, 1-based within the sorted identity list.
    pub fn enable_by_ordinal(&self, number: usize) -> EngineResult<KeyboardIdentity> {
        self.set_flag_by_ordinal(number, true)
    }

    /// Disable the n-th known device, 1-based within the sorted identity list.
    pub fn disable_by_ordinal(&self, number: usize) -> EngineResult<KeyboardIdentity> {
        self.set_flag_by_ordinal(number, false)
    }

    /// Wipe mappings, flags, the last-active slot and the persisted records,
    /// then signal other instances.
    pub fn clear_all(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.mappings.clear();
        state.enabled.clear();
        state.last_active = None;

        let state = &mut *state;
        let mut guard = SuppressGuard::new(state.bus.as_mut());
        state.store.clear()?;
        guard.publish();
        Ok(())
    }

    /// Human-readable roster of known devices.
    ///
    /// One line per device, numbered 1-based in ascending lexicographic
    /// order of identity — the same ordering the ordinal operations use.
    pub fn describe_devices(&self) -> String {
        let state = self.state.lock();
        state
            .sorted_devices()
            .iter()
            .enumerate()
            .map(|(index, identity)| {
                let status = if state.enabled.get(identity).copied().unwrap_or(true) {
                    "enabled"
                } else {
                    "disabled"
                };
                let layout = match state.mappings.get(identity) {
                    Some(source_id) => match state.directory.resolve(source_id) {
                        Some(source) => format!("{} ({})", source.name, source.id),
                        None => format!("unknown ({source_id})"),
                    },
                    None => "no layout stored".to_string(),
                };
                format!("{}. {identity}: {status} - {layout}", index + 1)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Replace in-memory state from the store.
    ///
    /// Called when another instance signals a settings change. Both maps
    /// coming back empty means that instance issued a clear-all, so the
    /// last-active slot is dropped too.
    pub fn reload(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        let (mappings, enabled) = state.store.load(&state.directory)?;
        state.mappings = mappings;
        state.enabled = enabled;
        if state.mappings.is_empty() && state.enabled.is_empty() {
            state.last_active = None;
        }
        log::trace!("reloaded mappings after settings change");
        Ok(())
    }

    /// Re-query the host's source list into the directory.
    pub fn refresh_sources(&self) {
        let mut state = self.state.lock();
        if let Err(e) = state.directory.refresh(self.host.as_ref()) {
            log::warn!("failed to refresh input sources: {e}");
        }
    }

    /// Drain the settings bus and reload if another instance published.
    pub fn poll_notifications(&self) {
        let foreign = self.state.lock().bus.drain();
        if foreign {
            log::debug!("settings changed in another instance, reloading");
            if let Err(e) = self.reload() {
                log::warn!("reload after settings change failed: {e}");
            }
        }
    }

    /// File descriptor to poll for settings-bus signals, when there is one.
    pub fn notifier_fd(&self) -> Option<RawFd> {
        self.state.lock().bus.poll_fd()
    }

    pub fn last_active(&self) -> Option<KeyboardIdentity> {
        self.state.lock().last_active.clone()
    }

    pub fn stored_source(&self, identity: &KeyboardIdentity) -> Option<SourceId> {
        self.state.lock().mappings.get(identity).cloned()
    }

    pub fn device_flag(&self, identity: &KeyboardIdentity) -> Option<bool> {
        self.state.lock().enabled.get(identity).copied()
    }

    fn set_flag(&self, identity: KeyboardIdentity, value: bool) {
        let mut state = self.state.lock();
        state.enabled.insert(identity, value);
        state.persist();
    }

    fn set_flag_by_ordinal(&self, number: usize, value: bool) -> EngineResult<KeyboardIdentity> {
        let mut state = self.state.lock();
        let devices = state.sorted_devices();
        if number == 0 || number > devices.len() {
            return Err(EngineError::InvalidOrdinal(number));
        }
        let identity = devices[number - 1].clone();
        state.enabled.insert(identity.clone(), value);
        state.persist();
        Ok(identity)
    }
}

impl EngineState {
    /// Known devices in ordinal order: the flag map's keys, sorted.
    fn sorted_devices(&self) -> Vec<KeyboardIdentity> {
        let mut devices: Vec<_> = self.enabled.keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Record the host's current source as this keyboard's preference.
    ///
    /// The classification hint seeds the enabled flag, but only when no
    /// explicit or earlier-hinted value exists.
    fn store_current(
        &mut self,
        host: &dyn InputSourceHost,
        identity: KeyboardIdentity,
        conforms_to_keyboard: Option<bool>,
    ) {
        let current = match host.current() {
            Ok(source) => source,
            Err(e) => {
                log::warn!("cannot read the current input source: {e}");
                return;
            }
        };

        log::debug!("storing input source {} for {identity}", current.id);
        self.mappings.insert(identity.clone(), current.id);

        if let Some(is_keyboard) = conforms_to_keyboard {
            if !self.enabled.contains_key(&identity) {
                log::debug!("seeding enabled={is_keyboard} for {identity} from classification");
                self.enabled.insert(identity, is_keyboard);
            }
        }

        self.persist();
    }

    /// Ask the host to activate this keyboard's stored preference.
    ///
    /// A preference whose source is no longer installed is skipped silently
    /// and the active source stays as it is.
    fn restore(&self, host: &dyn InputSourceHost, identity: &KeyboardIdentity) {
        let Some(source_id) = self.mappings.get(identity) else {
            return;
        };

        match self.directory.resolve(source_id) {
            Some(source) => {
                log::debug!("restoring input source {source_id} for {identity}");
                // Confirmation arrives later as a source-changed event.
                if let Err(e) = host.activate(source) {
                    log::warn!("failed to activate {source_id}: {e}");
                }
            }
            None => {
                log::trace!("source {source_id} for {identity} is not installed, keeping current");
            }
        }
    }

    /// Write both records and signal other instances, with our own
    /// subscription suppressed for the duration.
    fn persist(&mut self) {
        let mut guard = SuppressGuard::new(self.bus.as_mut());
        match self.store.save(&self.mappings, &self.enabled) {
            Ok(()) => guard.publish(),
            Err(e) => log::warn!("failed to persist mappings: {e}"),
        }
    }
}
