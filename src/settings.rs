//! Key-value settings persistence.
//!
//! Hosts expose a flat string store; values are strings and structured data
//! is stored as JSON text under a single key.

use crate::error::GuardError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    /// Persist pending changes.
    fn save(&self) -> Result<(), GuardError>;
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
    }

    fn save(&self) -> Result<(), GuardError> {
        Ok(())
    }
}

/// Settings kept as a JSON object on disk.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileSettings {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GuardError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                GuardError::Configuration(format!(
                    "failed to read settings file {}: {e}",
                    path.display()
                ))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                GuardError::Configuration(format!(
                    "settings file {} is not a JSON object of strings: {e}",
                    path.display()
                ))
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
    }

    fn save(&self) -> Result<(), GuardError> {
        let json = {
            let values = self
                .values
                .lock()
                .map_err(|_| GuardError::Configuration("settings lock poisoned".to_string()))?;
            serde_json::to_string_pretty(&*values)
                .map_err(|e| GuardError::Configuration(format!("failed to encode settings: {e}")))?
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GuardError::Configuration(format!(
                        "failed to create settings directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        std::fs::write(&self.path, json).map_err(|e| {
            GuardError::Configuration(format!(
                "failed to write settings file {}: {e}",
                self.path.display()
            ))
        })?;
        log::debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}
