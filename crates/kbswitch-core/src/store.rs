// Kbswitch Mapping Store
// Persisted keyboard → input-source associations and enabled flags

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::directory::SourceDirectory;
use crate::identity::KeyboardIdentity;
use crate::source::SourceId;

/// Record key for the keyboard → source mapping dictionary.
pub const MAPPINGS_KEY: &str = "mappings";
/// Record key for the per-device enabled flags dictionary.
pub const ENABLED_KEY: &str = "enabled";

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the persistence layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file error: {0}")]
    Format(String),

    #[error("no state directory available")]
    NoStateDir,
}

/// Namespace-scoped dictionary persistence, durable across restarts and
/// shared machine-wide.
///
/// There is no cross-process lock: concurrent writers race and the last
/// write wins. The settings bus reconciles the losers eventually.
pub trait KvStore: Send {
    fn get_str_map(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>>;
    fn get_bool_map(&self, key: &str) -> StoreResult<Option<HashMap<String, bool>>>;
    fn set_str_map(&mut self, key: &str, map: &HashMap<String, String>) -> StoreResult<()>;
    fn set_bool_map(&mut self, key: &str, map: &HashMap<String, bool>) -> StoreResult<()>;
    fn remove(&mut self, key: &str) -> StoreResult<()>;
}

pub type Mappings = HashMap<KeyboardIdentity, SourceId>;
pub type EnabledFlags = HashMap<KeyboardIdentity, bool>;

/// The two persisted records, typed.
///
/// Mapping values are plain input-source identifier strings keyed by
/// keyboard identity (see DESIGN.md for the encoding choice).
pub struct MappingStore {
    kv: Box<dyn KvStore>,
}

impl MappingStore {
    pub fn new(kv: Box<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Read both records.
    ///
    /// Malformed entries were already dropped by the backend; entries whose
    /// source id is no longer in the directory are dropped here — unless the
    /// directory is empty, which means the host was unreachable and nothing
    /// can be judged unresolvable.
    pub fn load(&self, directory: &SourceDirectory) -> StoreResult<(Mappings, EnabledFlags)> {
        let mut mappings = Mappings::new();
        if let Some(raw) = self.kv.get_str_map(MAPPINGS_KEY)? {
            for (keyboard, source) in raw {
                let source = SourceId::new(source);
                if !directory.is_empty() && directory.resolve(&source).is_none() {
                    log::debug!("dropping mapping for {keyboard}: source {source} is not installed");
                    continue;
                }
                mappings.insert(KeyboardIdentity::from_raw(keyboard), source);
            }
        }

        let mut enabled = EnabledFlags::new();
        if let Some(raw) = self.kv.get_bool_map(ENABLED_KEY)? {
            for (keyboard, flag) in raw {
                enabled.insert(KeyboardIdentity::from_raw(keyboard), flag);
            }
        }

        Ok((mappings, enabled))
    }

    /// Write both records.
    ///
    /// Two independent writes: a concurrent reader may observe one old and
    /// one new record. Acceptable, because reload is idempotent and driven
    /// by the settings bus, not by read-your-writes.
    pub fn save(&mut self, mappings: &Mappings, enabled: &EnabledFlags) -> StoreResult<()> {
        let raw_mappings: HashMap<String, String> = mappings
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.kv.set_str_map(MAPPINGS_KEY, &raw_mappings)?;

        let raw_enabled: HashMap<String, bool> = enabled
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        self.kv.set_bool_map(ENABLED_KEY, &raw_enabled)?;

        log::trace!(
            "saved {} mappings and {} device flags",
            mappings.len(),
            enabled.len()
        );
        Ok(())
    }

    /// Remove both records entirely.
    pub fn clear(&mut self) -> StoreResult<()> {
        self.kv.remove(MAPPINGS_KEY)?;
        self.kv.remove(ENABLED_KEY)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryTables {
    strs: HashMap<String, HashMap<String, String>>,
    bools: HashMap<String, HashMap<String, bool>>,
}

/// In-memory store backend.
///
/// Clones share one table set, so two `MappingStore`s built from clones of
/// the same `MemoryStore` behave like two processes over one machine-wide
/// store — which is exactly what the multi-instance tests need.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get_str_map(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>> {
        Ok(self.inner.lock().strs.get(key).cloned())
    }

    fn get_bool_map(&self, key: &str) -> StoreResult<Option<HashMap<String, bool>>> {
        Ok(self.inner.lock().bools.get(key).cloned())
    }

    fn set_str_map(&mut self, key: &str, map: &HashMap<String, String>) -> StoreResult<()> {
        self.inner.lock().strs.insert(key.to_string(), map.clone());
        Ok(())
    }

    fn set_bool_map(&mut self, key: &str, map: &HashMap<String, bool>) -> StoreResult<()> {
        self.inner.lock().bools.insert(key.to_string(), map.clone());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        let mut tables = self.inner.lock();
        tables.strs.remove(key);
        tables.bools.remove(key);
        Ok(())
    }
}
