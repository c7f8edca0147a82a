//! Persistent key/value settings used by the replication controller.
//!
//! Reads never fail: a missing or unreadable value yields the caller's
//! default. Writes report I/O failures.

use crate::error::SettingsResult;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A small persistent key/value store.
pub trait SettingsStore: Send + Sync {
    /// Reads a boolean, or `default` if absent or not a boolean.
    fn get_bool(&self, key: &str, default: bool) -> bool;

    /// Writes a boolean.
    fn put_bool(&self, key: &str, value: bool) -> SettingsResult<()>;

    /// Reads an integer, or `default` if absent or not an integer.
    fn get_i64(&self, key: &str, default: i64) -> i64;

    /// Writes an integer.
    fn put_i64(&self, key: &str, value: i64) -> SettingsResult<()>;
}

/// A value written to [`MemorySettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingValue {
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, SettingValue>,
    writes: Vec<(String, SettingValue)>,
}

/// In-memory settings that also record every write, in order.
#[derive(Default)]
pub struct MemorySettings {
    state: Mutex<MemoryState>,
}

impl MemorySettings {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write so far, oldest first.
    pub fn writes(&self) -> Vec<(String, SettingValue)> {
        self.state.lock().writes.clone()
    }

    /// Forgets the write history, keeping the values.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    fn put(&self, key: &str, value: SettingValue) {
        let mut state = self.state.lock();
        state.values.insert(key.to_string(), value);
        state.writes.push((key.to_string(), value));
    }

    fn get(&self, key: &str) -> Option<SettingValue> {
        self.state.lock().values.get(key).copied()
    }
}

impl SettingsStore for MemorySettings {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(SettingValue::Bool(value)) => value,
            _ => default,
        }
    }

    fn put_bool(&self, key: &str, value: bool) -> SettingsResult<()> {
        self.put(key, SettingValue::Bool(value));
        Ok(())
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(SettingValue::Int(value)) => value,
            _ => default,
        }
    }

    fn put_i64(&self, key: &str, value: i64) -> SettingsResult<()> {
        self.put(key, SettingValue::Int(value));
        Ok(())
    }
}

/// Settings kept in a JSON object on disk.
///
/// Every write rewrites the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new file.
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileSettings {
    /// Opens the settings file at `path`, creating parent directories.
    ///
    /// A missing file is treated as empty. A file that is not a JSON object
    /// is ignored with a warning and replaced on the next write.
    pub fn open(path: impl AsRef<Path>) -> SettingsResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let values = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                _ => {
                    warn!(path = %path.display(), "ignoring unreadable settings file");
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Location of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn put(&self, key: &str, value: Value) -> SettingsResult<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        let bytes = serde_json::to_vec_pretty(&*values)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        self.sync_directory()
    }

    // makes the rename itself durable
    #[cfg(unix)]
    fn sync_directory(&self) -> SettingsResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> SettingsResult<()> {
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .lock()
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    fn put_bool(&self, key: &str, value: bool) -> SettingsResult<()> {
        self.put(key, Value::Bool(value))
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .lock()
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    fn put_i64(&self, key: &str, value: i64) -> SettingsResult<()> {
        self.put(key, Value::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_settings_record_writes() {
        let settings = MemorySettings::new();
        assert!(!settings.get_bool("flag", false));
        assert_eq!(settings.get_i64("due", 0), 0);

        settings.put_i64("due", 5).unwrap();
        settings.put_bool("flag", true).unwrap();
        assert!(settings.get_bool("flag", false));
        // wrong type falls back to the default
        assert_eq!(settings.get_i64("flag", -1), -1);
        assert_eq!(
            settings.writes(),
            vec![
                ("due".to_string(), SettingValue::Int(5)),
                ("flag".to_string(), SettingValue::Bool(true)),
            ]
        );

        settings.clear_writes();
        assert!(settings.writes().is_empty());
        assert_eq!(settings.get_i64("due", 0), 5);
    }

    #[test]
    fn json_settings_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("settings.json");
        {
            let settings = JsonFileSettings::open(&path).unwrap();
            settings.put_bool("active", true).unwrap();
            settings.put_i64("due", 1_700_000_000_000).unwrap();
        }
        let settings = JsonFileSettings::open(&path).unwrap();
        assert!(settings.get_bool("active", false));
        assert_eq!(settings.get_i64("due", 0), 1_700_000_000_000);
    }

    #[test]
    fn garbled_json_settings_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{not json").unwrap();

        let settings = JsonFileSettings::open(&path).unwrap();
        assert!(!settings.get_bool("active", false));
        settings.put_bool("active", true).unwrap();
        assert!(JsonFileSettings::open(&path).unwrap().get_bool("active", false));
    }

    #[test]
    fn json_settings_leave_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = JsonFileSettings::open(&path).unwrap();
        settings.put_i64("due", 7).unwrap();
        settings.put_i64("due", 8).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("settings.json")]);
        assert_eq!(JsonFileSettings::open(&path).unwrap().get_i64("due", 0), 8);
    }
}
