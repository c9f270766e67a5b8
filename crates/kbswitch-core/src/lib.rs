// Kbswitch Core Library
// Per-keyboard input-source tracking and switching

pub mod classify;
pub mod directory;
pub mod engine;
pub mod identity;
pub mod monitor;
pub mod notify;
pub mod source;
pub mod statefile;
pub mod store;
pub mod sway;

pub use classify::{conforms_to_keyboard, emits_keyboard_keys, KeyCapabilities};
pub use directory::SourceDirectory;
pub use engine::{EngineError, EngineResult, SwitchEngine};
pub use identity::{DeviceAttributes, KeyboardIdentity};
pub use monitor::{DeviceMonitor, MonitorError, MonitorResult};
pub use notify::{FileBus, MemoryBus, MemoryHub, NotifyError, NotifyResult, SettingsBus, SuppressGuard};
pub use source::{
    HostError, HostResult, InputSource, InputSourceHost, OfflineHost, SourceEvent,
    SourceEventStream, SourceId,
};
pub use statefile::FileStore;
pub use store::{EnabledFlags, KvStore, MappingStore, Mappings, MemoryStore, StoreError, StoreResult};
pub use sway::{SwayEvents, SwayHost};
