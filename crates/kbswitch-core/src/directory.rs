// Kbswitch Source Directory
// Read-through cache of the host's selectable input sources

use std::collections::HashMap;

use crate::source::{HostResult, InputSource, InputSourceHost, SourceId};

/// Cache mapping source identifiers to their host handles.
///
/// Refreshed from the host at engine construction and whenever the host
/// signals that source availability may have changed — never per event.
#[derive(Debug, Default)]
pub struct SourceDirectory {
    by_id: HashMap<SourceId, InputSource>,
}

impl SourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from an already-known source list.
    pub fn from_sources(sources: Vec<InputSource>) -> Self {
        Self {
            by_id: sources.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    /// Re-query the host and replace the cache.
    pub fn refresh(&mut self, host: &dyn InputSourceHost) -> HostResult<()> {
        let sources = host.list_keyboard_sources()?;
        log::debug!("source directory refreshed: {} sources", sources.len());
        self.by_id = sources.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(())
    }

    /// Resolve an identifier to its handle.
    ///
    /// `None` means the source is not currently installed on the host (for
    /// instance a layout the user removed) — an expected, non-fatal
    /// condition callers tolerate by leaving the active source unchanged.
    pub fn resolve(&self, id: &SourceId) -> Option<&InputSource> {
        self.by_id.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
