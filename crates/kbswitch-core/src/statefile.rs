// Kbswitch State File
// TOML-backed key-value store in the XDG state directory

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use toml::value::Table;
use toml::Value;

use crate::store::{KvStore, StoreError, StoreResult};

/// `KvStore` over a single TOML document on disk.
///
/// The document is re-read on every access: the file is shared machine-wide
/// and another process may have written it since our last look. Writes go
/// through a temp file and rename, so a concurrent reader sees either the
/// old document or the new one, never a torn write.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open the store at the default location,
    /// `$XDG_STATE_HOME/kbswitch/state.toml`.
    pub fn open_default() -> StoreResult<Self> {
        Ok(Self::new(default_state_dir()?.join("state.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> StoreResult<Table> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(decode_document(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Table::new()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn write_document(&self, document: &Table) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = encode_document(document)?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Resolve the per-user state directory for kbswitch.
pub fn default_state_dir() -> StoreResult<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("kbswitch"))
        .ok_or(StoreError::NoStateDir)
}

/// Parse a state document.
///
/// An unparseable file is treated as empty with a warning: losing state is
/// recoverable (mappings repopulate on the next keystroke), refusing to
/// start is not.
pub fn decode_document(content: &str) -> Table {
    match content.parse::<Value>() {
        Ok(Value::Table(table)) => table,
        Ok(_) => {
            log::warn!("state file is not a TOML table, treating as empty");
            Table::new()
        }
        Err(e) => {
            log::warn!("unparseable state file, treating as empty: {e}");
            Table::new()
        }
    }
}

pub fn encode_document(document: &Table) -> StoreResult<String> {
    toml::to_string(&Value::Table(document.clone()))
        .map_err(|e| StoreError::Format(e.to_string()))
}

/// Extract a record's string entries; non-string values are dropped.
fn str_entries(document: &Table, key: &str) -> Option<HashMap<String, String>> {
    let table = record_table(document, key)?;
    Some(
        table
            .iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k.clone(), s.clone())),
                _ => {
                    log::debug!("dropping non-string entry {key}.{k}");
                    None
                }
            })
            .collect(),
    )
}

/// Extract a record's boolean entries; non-boolean values are dropped.
fn bool_entries(document: &Table, key: &str) -> Option<HashMap<String, bool>> {
    let table = record_table(document, key)?;
    Some(
        table
            .iter()
            .filter_map(|(k, v)| match v {
                Value::Boolean(b) => Some((k.clone(), *b)),
                _ => {
                    log::debug!("dropping non-boolean entry {key}.{k}");
                    None
                }
            })
            .collect(),
    )
}

fn record_table<'a>(document: &'a Table, key: &str) -> Option<&'a Table> {
    match document.get(key) {
        Some(Value::Table(table)) => Some(table),
        Some(_) => {
            log::debug!("dropping malformed record {key}");
            None
        }
        None => None,
    }
}

impl KvStore for FileStore {
    fn get_str_map(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>> {
        Ok(str_entries(&self.read_document()?, key))
    }

    fn get_bool_map(&self, key: &str) -> StoreResult<Option<HashMap<String, bool>>> {
        Ok(bool_entries(&self.read_document()?, key))
    }

    fn set_str_map(&mut self, key: &str, map: &HashMap<String, String>) -> StoreResult<()> {
        let mut document = self.read_document()?;
        let table: Table = map
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        document.insert(key.to_string(), Value::Table(table));
        self.write_document(&document)
    }

    fn set_bool_map(&mut self, key: &str, map: &HashMap<String, bool>) -> StoreResult<()> {
        let mut document = self.read_document()?;
        let table: Table = map
            .iter()
            .map(|(k, v)| (k.clone(), Value::Boolean(*v)))
            .collect();
        document.insert(key.to_string(), Value::Table(table));
        self.write_document(&document)
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        let mut document = self.read_document()?;
        if document.remove(key).is_some() {
            self.write_document(&document)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_well_formed_document() {
        let document = decode_document(
            r#"
[mappings]
"Keychron K2-[05ac-024f-Keychron-A0B1C2]" = "us"

[enabled]
"Keychron K2-[05ac-024f-Keychron-A0B1C2]" = true
"#,
        );

        let mappings = str_entries(&document, "mappings").unwrap();
        assert_eq!(
            mappings.get("Keychron K2-[05ac-024f-Keychron-A0B1C2]"),
            Some(&"us".to_string())
        );
        let enabled = bool_entries(&document, "enabled").unwrap();
        assert_eq!(
            enabled.get("Keychron K2-[05ac-024f-Keychron-A0B1C2]"),
            Some(&true)
        );
    }

    #[test]
    fn unparseable_document_treated_as_empty() {
        let document = decode_document("this is not toml [[[");
        assert!(document.is_empty());
    }

    #[test]
    fn wrong_typed_entries_dropped() {
        let document = decode_document(
            r#"
[mappings]
good = "us"
bad = 42

[enabled]
good = true
bad = "yes"
"#,
        );

        let mappings = str_entries(&document, "mappings").unwrap();
        assert_eq!(mappings.len(), 1);
        assert!(mappings.contains_key("good"));

        let enabled = bool_entries(&document, "enabled").unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled.get("good"), Some(&true));
    }

    #[test]
    fn wrong_typed_record_dropped() {
        let document = decode_document("mappings = \"not a table\"");
        assert!(str_entries(&document, "mappings").is_none());
    }

    #[test]
    fn missing_record_is_none() {
        let document = decode_document("");
        assert!(str_entries(&document, "mappings").is_none());
        assert!(bool_entries(&document, "enabled").is_none());
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut inner = Table::new();
        inner.insert("kb".to_string(), Value::String("us".to_string()));
        let mut document = Table::new();
        document.insert("mappings".to_string(), Value::Table(inner));

        let encoded = encode_document(&document).unwrap();
        let decoded = decode_document(&encoded);
        assert_eq!(document, decoded);
    }

    #[test]
    fn file_store_round_trips_on_disk() {
        let dir = std::env::temp_dir().join(format!("kbswitch-test-{}", std::process::id()));
        let mut store = FileStore::new(dir.join("state.toml"));

        let mut mappings = HashMap::new();
        mappings.insert("kb".to_string(), "us".to_string());
        store.set_str_map("mappings", &mappings).unwrap();

        let mut enabled = HashMap::new();
        enabled.insert("kb".to_string(), false);
        store.set_bool_map("enabled", &enabled).unwrap();

        // Both records survive independent writes.
        assert_eq!(store.get_str_map("mappings").unwrap(), Some(mappings));
        assert_eq!(store.get_bool_map("enabled").unwrap(), Some(enabled));

        store.remove("mappings").unwrap();
        assert_eq!(store.get_str_map("mappings").unwrap(), None);

        let _ = fs::remove_dir_all(dir);
    }
}
