//! On-disk persistence of per-extension permission grants.
//!
//! File shape: `{extensionId -> {permKey: true, ..., network: {mode, hosts?}}}`.
//! A legacy record is a plain array of permission strings; the reader
//! migrates those transparently (`"network"` becomes `{mode: "full"}`).
//! Only non-empty records are persisted.

use crate::error::{Error, Result};
use crate::manifest::Permission;
use crate::persist;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Full,
    Deny,
    Allowlist,
}

/// Structured network grant. `hosts` is kept sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
}

impl NetworkPolicy {
    #[must_use]
    pub const fn full() -> Self {
        Self {
            mode: NetworkMode::Full,
            hosts: None,
        }
    }

    /// Add a host pattern, keeping the list sorted.
    pub fn insert_host(&mut self, host: &str) {
        let hosts = self.hosts.get_or_insert_with(Vec::new);
        if !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
            hosts.sort();
        }
    }
}

/// Everything granted to one extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantRecord {
    pub granted: BTreeSet<Permission>,
    pub network: Option<NetworkPolicy>,
}

impl GrantRecord {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.network.is_none()
    }

    fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for perm in &self.granted {
            map.insert(perm.as_str().to_string(), Value::Bool(true));
        }
        if let Some(policy) = &self.network {
            map.insert(
                "network".to_string(),
                serde_json::to_value(policy).unwrap_or(Value::Null),
            );
        }
        Value::Object(map)
    }

    fn from_value(value: &Value) -> Result<Self> {
        let mut record = Self::default();
        match value {
            // Legacy shape: ["cells.read", "network", ...]
            Value::Array(perms) => {
                for perm in perms {
                    let Some(perm) = perm.as_str() else { continue };
                    if perm == "network" {
                        record.network = Some(NetworkPolicy::full());
                    } else if let Ok(parsed) = Permission::parse(perm) {
                        record.granted.insert(parsed);
                    }
                }
            }
            Value::Object(map) => {
                for (key, entry) in map {
                    if key == "network" {
                        record.network = match entry {
                            Value::Object(_) => Some(serde_json::from_value(entry.clone())?),
                            // Legacy truthy network grant.
                            Value::Bool(true) | Value::String(_) => Some(NetworkPolicy::full()),
                            _ => None,
                        };
                    } else if entry.as_bool() == Some(true) {
                        if let Ok(parsed) = Permission::parse(key) {
                            record.granted.insert(parsed);
                        }
                    }
                }
            }
            other => {
                return Err(Error::io(format!(
                    "unexpected permission record shape: {other}"
                )));
            }
        }
        Ok(record)
    }
}

/// Lazily-loaded, atomically-persisted grant store.
#[derive(Debug)]
pub struct PermissionStore {
    path: PathBuf,
    state: Mutex<Option<BTreeMap<String, GrantRecord>>>,
}

impl PermissionStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(None),
        }
    }

    /// Current grants for one extension (empty record when absent).
    pub fn record(&self, extension_id: &str) -> Result<GrantRecord> {
        let mut guard = self.state.lock().expect("permission store poisoned");
        let records = Self::loaded(&self.path, &mut guard)?;
        Ok(records.get(extension_id).cloned().unwrap_or_default())
    }

    /// Mutate one extension's record and persist. Empty records are pruned.
    pub fn update(
        &self,
        extension_id: &str,
        mutate: impl FnOnce(&mut GrantRecord),
    ) -> Result<()> {
        let mut guard = self.state.lock().expect("permission store poisoned");
        let records = Self::loaded(&self.path, &mut guard)?;
        let mut record = records.remove(extension_id).unwrap_or_default();
        mutate(&mut record);
        if !record.is_empty() {
            records.insert(extension_id.to_string(), record);
        }
        Self::persist(&self.path, records)
    }

    /// Delete the named permission keys, or the whole record when
    /// `permissions` is empty.
    pub fn revoke(&self, extension_id: &str, permissions: &[Permission]) -> Result<()> {
        let mut guard = self.state.lock().expect("permission store poisoned");
        let records = Self::loaded(&self.path, &mut guard)?;
        if permissions.is_empty() {
            records.remove(extension_id);
        } else if let Some(record) = records.get_mut(extension_id) {
            for perm in permissions {
                if *perm == Permission::Network {
                    record.network = None;
                }
                record.granted.remove(perm);
            }
            if record.is_empty() {
                records.remove(extension_id);
            }
        }
        Self::persist(&self.path, records)
    }

    pub fn reset(&self, extension_id: &str) -> Result<()> {
        self.revoke(extension_id, &[])
    }

    pub fn reset_all(&self) -> Result<()> {
        let mut guard = self.state.lock().expect("permission store poisoned");
        *guard = Some(BTreeMap::new());
        Self::persist(&self.path, guard.as_mut().expect("just set"))
    }

    fn loaded<'a>(
        path: &PathBuf,
        guard: &'a mut Option<BTreeMap<String, GrantRecord>>,
    ) -> Result<&'a mut BTreeMap<String, GrantRecord>> {
        if guard.is_none() {
            let mut records = BTreeMap::new();
            if let Some(Value::Object(map)) = persist::load_json(path)? {
                for (extension_id, value) in map {
                    let record = GrantRecord::from_value(&value)?;
                    if !record.is_empty() {
                        records.insert(extension_id, record);
                    }
                }
            }
            *guard = Some(records);
        }
        Ok(guard.as_mut().expect("loaded above"))
    }

    fn persist(path: &PathBuf, records: &BTreeMap<String, GrantRecord>) -> Result<()> {
        let mut map = serde_json::Map::new();
        for (extension_id, record) in records {
            if !record.is_empty() {
                map.insert(extension_id.clone(), record.to_value());
            }
        }
        persist::store_json(path, &Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store_in(dir: &tempfile::TempDir) -> PermissionStore {
        PermissionStore::new(dir.path().join("permissions.json"))
    }

    #[test]
    fn grants_round_trip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update("t.x", |rec| {
                rec.granted.insert(Permission::CellsRead);
                rec.network = Some(NetworkPolicy {
                    mode: NetworkMode::Allowlist,
                    hosts: Some(vec!["allowed.example".to_string()]),
                });
            })
            .unwrap();

        let reread = store_in(&dir).record("t.x").unwrap();
        assert!(reread.granted.contains(&Permission::CellsRead));
        assert_eq!(
            reread.network.unwrap().hosts.unwrap(),
            vec!["allowed.example"]
        );
    }

    #[test]
    fn legacy_array_records_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        std::fs::write(
            &path,
            json!({"t.x": ["cells.read", "network", "ui.commands"]}).to_string(),
        )
        .unwrap();

        let store = PermissionStore::new(path);
        let record = store.record("t.x").unwrap();
        assert!(record.granted.contains(&Permission::CellsRead));
        assert!(record.granted.contains(&Permission::UiCommands));
        assert_eq!(record.network, Some(NetworkPolicy::full()));
    }

    #[test]
    fn legacy_truthy_network_value_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        std::fs::write(&path, json!({"t.x": {"network": true}}).to_string()).unwrap();

        let record = PermissionStore::new(path).record("t.x").unwrap();
        assert_eq!(record.network, Some(NetworkPolicy::full()));
    }

    #[test]
    fn empty_records_are_pruned_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update("t.x", |rec| {
                rec.granted.insert(Permission::Storage);
            })
            .unwrap();
        store.revoke("t.x", &[Permission::Storage]).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("permissions.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn revoke_with_empty_list_deletes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update("t.x", |rec| {
                rec.granted.insert(Permission::Storage);
                rec.granted.insert(Permission::Clipboard);
            })
            .unwrap();
        store.revoke("t.x", &[]).unwrap();
        assert!(store.record("t.x").unwrap().is_empty());
    }

    #[test]
    fn insert_host_keeps_sorted_unique() {
        let mut policy = NetworkPolicy {
            mode: NetworkMode::Allowlist,
            hosts: None,
        };
        policy.insert_host("zeta.example");
        policy.insert_host("alpha.example");
        policy.insert_host("zeta.example");
        assert_eq!(
            policy.hosts.unwrap(),
            vec!["alpha.example", "zeta.example"]
        );
    }
}
