// Kbswitch Input Sources
// Types and the host capability surface for layout listing and selection

use std::fmt;
use std::os::unix::io::RawFd;

/// Host-assigned stable identifier for a keyboard layout.
///
/// Opaque beyond equality and directory lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        SourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        SourceId(id.to_string())
    }
}

/// A selectable input source known to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    pub id: SourceId,
    /// Human-readable layout name.
    pub name: String,
}

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Errors from the platform input-source service
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("input-source host unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Narrow capability interface over the platform input-source service.
///
/// The engine has no native-API surface of its own; any backend satisfying
/// these three operations is substitutable, which is also what makes the
/// engine testable against a fake host.
pub trait InputSourceHost: Send + Sync {
    /// All selectable keyboard-category input sources.
    fn list_keyboard_sources(&self) -> HostResult<Vec<InputSource>>;

    /// The input source currently active.
    fn current(&self) -> HostResult<InputSource>;

    /// Ask the host to switch. Confirmation arrives later through the
    /// "source changed" event stream, never as a return value.
    fn activate(&self, source: &InputSource) -> HostResult<()>;
}

/// Host-side happenings relevant to the engine, beyond keystrokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    /// The active input source changed, whatever the cause.
    LayoutChanged,
    /// Devices or their source configuration changed; the directory should
    /// be refreshed and the device set rescanned.
    DevicesChanged,
}

/// Pollable stream of host events for the daemon loop.
pub trait SourceEventStream {
    /// File descriptor that becomes readable when events are pending.
    fn poll_fd(&self) -> RawFd;

    /// Consume all pending events.
    fn drain(&mut self) -> HostResult<Vec<SourceEvent>>;
}

/// Host stub for store-only operation.
///
/// CLI subcommands (`list`, `enable`, `disable`, `clear`) must keep working
/// without a compositor session; this backend reports every operation as
/// unavailable and leaves the directory empty.
pub struct OfflineHost;

impl InputSourceHost for OfflineHost {
    fn list_keyboard_sources(&self) -> HostResult<Vec<InputSource>> {
        Err(HostError::Unavailable("operating store-only".to_string()))
    }

    fn current(&self) -> HostResult<InputSource> {
        Err(HostError::Unavailable("operating store-only".to_string()))
    }

    fn activate(&self, _source: &InputSource) -> HostResult<()> {
        Err(HostError::Unavailable("operating store-only".to_string()))
    }
}
