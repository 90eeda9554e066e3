//! Per-extension key/value storage (`storage.json`).
//!
//! Keys are opaque strings plus config-namespaced keys of the form
//! `__config__:<configKey>`. The literal key `__proto__` is stored under a
//! reserved alias so no JSON consumer can be tricked into touching an
//! object prototype. Empty per-extension records are pruned.

use crate::error::Result;
use crate::persist;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Reserved alias for the `__proto__` key. The leading control character
/// cannot appear in ordinary keys, so the alias never collides.
const PROTO_KEY_ALIAS: &str = "\u{1}__proto__";

/// Prefix for configuration values stored on behalf of `config.update`.
pub const CONFIG_KEY_PREFIX: &str = "__config__:";

fn alias_key(key: &str) -> Cow<'_, str> {
    if key == "__proto__" {
        Cow::Borrowed(PROTO_KEY_ALIAS)
    } else {
        Cow::Borrowed(key)
    }
}

fn unalias_key(key: &str) -> &str {
    if key == PROTO_KEY_ALIAS { "__proto__" } else { key }
}

/// Namespaced storage key for a configuration property.
#[must_use]
pub fn config_key(config_key: &str) -> String {
    format!("{CONFIG_KEY_PREFIX}{config_key}")
}

#[derive(Debug)]
pub struct StorageStore {
    path: PathBuf,
    state: Mutex<Option<BTreeMap<String, BTreeMap<String, Value>>>>,
}

impl StorageStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(None),
        }
    }

    pub fn get(&self, extension_id: &str, key: &str) -> Result<Option<Value>> {
        let mut guard = self.state.lock().expect("storage store poisoned");
        let records = Self::loaded(&self.path, &mut guard)?;
        Ok(records
            .get(extension_id)
            .and_then(|record| record.get(alias_key(key).as_ref()))
            .cloned())
    }

    pub fn set(&self, extension_id: &str, key: &str, value: Value) -> Result<()> {
        let mut guard = self.state.lock().expect("storage store poisoned");
        let records = Self::loaded(&self.path, &mut guard)?;
        records
            .entry(extension_id.to_string())
            .or_default()
            .insert(alias_key(key).into_owned(), value);
        Self::persist(&self.path, records)
    }

    /// Returns whether the key existed.
    pub fn delete(&self, extension_id: &str, key: &str) -> Result<bool> {
        let mut guard = self.state.lock().expect("storage store poisoned");
        let records = Self::loaded(&self.path, &mut guard)?;
        let Some(record) = records.get_mut(extension_id) else {
            return Ok(false);
        };
        let existed = record.remove(alias_key(key).as_ref()).is_some();
        if record.is_empty() {
            records.remove(extension_id);
        }
        if existed {
            Self::persist(&self.path, records)?;
        }
        Ok(existed)
    }

    /// The extension's keys, un-aliased.
    pub fn keys(&self, extension_id: &str) -> Result<Vec<String>> {
        let mut guard = self.state.lock().expect("storage store poisoned");
        let records = Self::loaded(&self.path, &mut guard)?;
        Ok(records
            .get(extension_id)
            .map(|record| {
                record
                    .keys()
                    .map(|key| unalias_key(key).to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Drop everything the extension stored.
    pub fn clear_extension(&self, extension_id: &str) -> Result<()> {
        let mut guard = self.state.lock().expect("storage store poisoned");
        let records = Self::loaded(&self.path, &mut guard)?;
        if records.remove(extension_id).is_some() {
            Self::persist(&self.path, records)?;
        }
        Ok(())
    }

    fn loaded<'a>(
        path: &PathBuf,
        guard: &'a mut Option<BTreeMap<String, BTreeMap<String, Value>>>,
    ) -> Result<&'a mut BTreeMap<String, BTreeMap<String, Value>>> {
        if guard.is_none() {
            let mut records: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
            if let Some(Value::Object(map)) = persist::load_json(path)? {
                for (extension_id, value) in map {
                    let Value::Object(entries) = value else { continue };
                    let record: BTreeMap<String, Value> = entries.into_iter().collect();
                    if !record.is_empty() {
                        records.insert(extension_id, record);
                    }
                }
            }
            *guard = Some(records);
        }
        Ok(guard.as_mut().expect("loaded above"))
    }

    fn persist(
        path: &PathBuf,
        records: &BTreeMap<String, BTreeMap<String, Value>>,
    ) -> Result<()> {
        let mut map = serde_json::Map::new();
        for (extension_id, record) in records {
            if record.is_empty() {
                continue;
            }
            let entries: serde_json::Map<String, Value> = record
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            map.insert(extension_id.clone(), Value::Object(entries));
        }
        persist::store_json(path, &Value::Object(map))
    }
}
