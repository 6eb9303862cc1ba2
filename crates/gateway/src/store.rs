//! Key/value store shared by services: filter rules, device keys and
//! status entries. Keys are slash separated paths.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use log::debug;

use lora_fwd_core::RuleStore;

use crate::config::ConfigError;

pub trait KvStore: Send + Sync {
    fn get(&self, path: &str) -> Option<String>;
    fn put(&self, path: &str, value: &str);
    fn delete(&self, path: &str);

    fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }
}

impl RuleStore for dyn KvStore {
    fn contains(&self, key: &str) -> bool {
        self.exists(key)
    }
}

pub fn family_key(family: &str, key: &str) -> String {
    format!("{}/{}", family, key)
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload from a flat JSON object of path -> value.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let entries: BTreeMap<String, String> = serde_json::from_str(&text)?;
        debug!("Loaded {} store entries", entries.len());
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Entries under `prefix`, in key order
    pub fn scan(&self, prefix: &str) -> Vec<(String, String)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, path: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(path).cloned()
    }

    fn put(&self, path: &str, value: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(path.to_string(), value.to_string());
    }

    fn delete(&self, path: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(path);
    }
}
