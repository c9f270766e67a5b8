// Kbswitch Engine Scenarios
//
// Multi-step and multi-instance flows over the in-memory backends: several
// engines sharing one store and one settings hub behave like several
// processes sharing the machine-wide store and notification channel.

use std::sync::Arc;

use parking_lot::Mutex;

use kbswitch_core::engine::SwitchEngine;
use kbswitch_core::identity::KeyboardIdentity;
use kbswitch_core::notify::{MemoryHub, SettingsBus};
use kbswitch_core::source::{HostError, HostResult, InputSource, InputSourceHost, SourceId};
use kbswitch_core::store::{MappingStore, Mappings, MemoryStore};

// =========================================================================
// Test Helpers
// =========================================================================

#[derive(Default)]
struct FakeHostInner {
    sources: Mutex<Vec<InputSource>>,
    current: Mutex<Option<InputSource>>,
    activations: Mutex<Vec<SourceId>>,
}

/// Scriptable input-source host shared between engines, standing in for
/// the one compositor every process talks to.
#[derive(Clone, Default)]
struct FakeHost {
    inner: Arc<FakeHostInner>,
}

impl FakeHost {
    fn new(ids: &[&str], current: &str) -> Self {
        let host = Self::default();
        *host.inner.sources.lock() = ids.iter().map(|id| source(id)).collect();
        host.set_current(current);
        host
    }

    fn set_current(&self, id: &str) {
        *self.inner.current.lock() = Some(source(id));
    }

    fn activations(&self) -> Vec<SourceId> {
        self.inner.activations.lock().clone()
    }
}

impl InputSourceHost for FakeHost {
    fn list_keyboard_sources(&self) -> HostResult<Vec<InputSource>> {
        Ok(self.inner.sources.lock().clone())
    }

    fn current(&self) -> HostResult<InputSource> {
        self.inner
            .current
            .lock()
            .clone()
            .ok_or_else(|| HostError::Unavailable("no current source".to_string()))
    }

    fn activate(&self, source: &InputSource) -> HostResult<()> {
        self.inner.activations.lock().push(source.id.clone());
        *self.inner.current.lock() = Some(source.clone());
        Ok(())
    }
}

fn source(id: &str) -> InputSource {
    InputSource {
        id: SourceId::new(id),
        name: id.to_uppercase(),
    }
}

fn kb(name: &str) -> KeyboardIdentity {
    KeyboardIdentity::from_raw(format!("{name}-[0001-0002-maker-serial]"))
}

/// One simulated process: an engine over the shared store and hub.
fn instance(host: &FakeHost, store: &MemoryStore, hub: &MemoryHub) -> SwitchEngine {
    SwitchEngine::new(
        Box::new(host.clone()),
        Box::new(store.clone()),
        Box::new(hub.bus()),
    )
    .unwrap()
}

// =========================================================================
// Scenarios
// =========================================================================

#[test]
fn mapping_learned_in_one_instance_reaches_the_other() {
    let host = FakeHost::new(&["en", "fr"], "en");
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let a = instance(&host, &store, &hub);
    let b = instance(&host, &store, &hub);

    a.on_keyboard_event(kb("K"), Some(true));
    assert_eq!(b.stored_source(&kb("K")), None);

    // B's daemon loop notices the signal and reloads.
    b.poll_notifications();
    assert_eq!(b.stored_source(&kb("K")), Some(SourceId::new("en")));
    assert_eq!(b.device_flag(&kb("K")), Some(true));
}

#[test]
fn disable_issued_by_one_instance_governs_the_other() {
    let host = FakeHost::new(&["en", "fr"], "en");
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let a = instance(&host, &store, &hub);
    let b = instance(&host, &store, &hub);

    a.on_keyboard_event(kb("K"), Some(true));
    b.poll_notifications();

    // Disabled by ordinal on B, observed by A.
    b.disable_by_ordinal(1).unwrap();
    a.poll_notifications();
    assert_eq!(a.device_flag(&kb("K")), Some(false));

    // A subsequent event on A no longer restores anything.
    host.set_current("fr");
    a.on_keyboard_event(kb("Other"), Some(true));
    a.on_keyboard_event(kb("K"), Some(true));
    assert!(host.activations().is_empty());
    assert_eq!(a.last_active(), Some(kb("K")));
}

#[test]
fn clear_in_one_instance_resets_the_other_completely() {
    let host = FakeHost::new(&["en", "fr"], "en");
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let a = instance(&host, &store, &hub);
    let b = instance(&host, &store, &hub);

    a.on_keyboard_event(kb("K"), Some(true));
    b.poll_notifications();
    b.on_keyboard_event(kb("K"), Some(true));
    assert_eq!(b.last_active(), Some(kb("K")));

    a.clear_all().unwrap();

    // Empty maps after reload are the clear-all signal: B drops its
    // last-active slot too.
    b.poll_notifications();
    assert_eq!(b.stored_source(&kb("K")), None);
    assert_eq!(b.device_flag(&kb("K")), None);
    assert_eq!(b.last_active(), None);

    // The next event on B behaves as for a first-ever-seen keyboard.
    host.set_current("fr");
    b.on_keyboard_event(kb("K"), Some(true));
    assert_eq!(b.stored_source(&kb("K")), Some(SourceId::new("fr")));
}

#[test]
fn own_saves_never_trigger_a_reload() {
    let host = FakeHost::new(&["en", "fr"], "en");
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let a = instance(&host, &store, &hub);

    a.on_keyboard_event(kb("K"), Some(true));

    // Rewrite the shared store behind A's back, without publishing.
    let mut raw = MappingStore::new(Box::new(store.clone()));
    let mut mappings = Mappings::new();
    mappings.insert(kb("K"), SourceId::new("fr"));
    raw.save(&mappings, &Default::default()).unwrap();

    // A's own earlier publish was suppressed for A, so there is nothing
    // to drain and the foreign store content stays unseen.
    a.poll_notifications();
    assert_eq!(a.stored_source(&kb("K")), Some(SourceId::new("en")));
}

#[test]
fn foreign_publish_triggers_a_reload() {
    let host = FakeHost::new(&["en", "fr"], "en");
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let a = instance(&host, &store, &hub);
    let mut probe = hub.bus();

    a.on_keyboard_event(kb("K"), Some(true));

    let mut raw = MappingStore::new(Box::new(store.clone()));
    let mut mappings = Mappings::new();
    mappings.insert(kb("K"), SourceId::new("fr"));
    raw.save(&mappings, &Default::default()).unwrap();

    probe.publish();
    a.poll_notifications();
    assert_eq!(a.stored_source(&kb("K")), Some(SourceId::new("fr")));
}

#[test]
fn switching_between_two_keyboards_restores_each_preference() {
    let host = FakeHost::new(&["en", "fr"], "en");
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let engine = instance(&host, &store, &hub);

    // First keyboard adopts "en", then the user switches to "fr" while the
    // second keyboard is active.
    engine.on_keyboard_event(kb("Desk"), Some(true));
    engine.on_keyboard_event(kb("Laptop"), Some(true));
    host.set_current("fr");
    engine.on_source_changed();
    assert_eq!(engine.stored_source(&kb("Laptop")), Some(SourceId::new("fr")));

    // Typing on each keyboard brings its own layout back, and each
    // activation's echo re-stores the unchanged value harmlessly.
    engine.on_keyboard_event(kb("Desk"), Some(true));
    engine.on_source_changed();
    assert_eq!(host.activations(), vec![SourceId::new("en")]);
    assert_eq!(engine.stored_source(&kb("Desk")), Some(SourceId::new("en")));

    engine.on_keyboard_event(kb("Laptop"), Some(true));
    engine.on_source_changed();
    assert_eq!(
        host.activations(),
        vec![SourceId::new("en"), SourceId::new("fr")]
    );
    assert_eq!(engine.stored_source(&kb("Laptop")), Some(SourceId::new("fr")));
}

#[test]
fn listing_is_stable_across_instances_and_restarts() {
    let host = FakeHost::new(&["en", "fr"], "en");
    let store = MemoryStore::new();
    let hub = MemoryHub::new();

    let a = instance(&host, &store, &hub);
    a.on_keyboard_event(kb("B"), Some(true));
    host.set_current("fr");
    a.on_keyboard_event(kb("A"), Some(true));
    a.disable_device(kb("C"));

    let expected = format!(
        "1. {}: enabled - FR (fr)\n2. {}: enabled - EN (en)\n3. {}: disabled - no layout stored",
        kb("A"),
        kb("B"),
        kb("C")
    );
    assert_eq!(a.describe_devices(), expected);

    // A freshly started instance over the same store sees the same roster.
    let restarted = instance(&host, &store, &hub);
    assert_eq!(restarted.describe_devices(), expected);
}
