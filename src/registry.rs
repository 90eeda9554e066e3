//! Process-wide contribution tables.
//!
//! Maps command ids, custom function names, data connector ids, panels, and
//! context menus to their owning extension. Manifest-declared entries live
//! until the extension is unloaded; runtime-registered entries are cleared
//! whenever the owning worker terminates.

use crate::error::{Error, Result};
use crate::manifest::{Manifest, MenuItem};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Manifest,
    Runtime,
}

#[derive(Debug, Clone)]
pub struct CommandOwner {
    pub extension_id: String,
    pub source: CommandSource,
}

/// A webview-style panel owned by an extension. `outgoing_messages` is the
/// queue the renderer drains; the host never interprets its contents.
#[derive(Debug, Clone)]
pub struct Panel {
    pub id: String,
    pub title: String,
    pub html: String,
    pub extension_id: String,
    pub outgoing_messages: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct ContextMenuRegistration {
    pub id: String,
    pub extension_id: String,
    pub menu_id: String,
    pub items: Vec<MenuItem>,
}

#[derive(Debug, Default)]
struct RegistryState {
    commands: HashMap<String, CommandOwner>,
    custom_functions: HashMap<String, String>,
    data_connectors: HashMap<String, ConnectorEntry>,
    panels: HashMap<String, Panel>,
    context_menus: HashMap<String, ContextMenuRegistration>,
}

#[derive(Debug, Clone)]
struct ConnectorEntry {
    extension_id: String,
    /// Set while the current worker has a live handler registered.
    runtime_registered: bool,
}

#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    state: Mutex<RegistryState>,
}

impl RuntimeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed manifest-declared contributions at load time. Duplicate
    /// ownership across extensions rejects; on rejection nothing from this
    /// manifest is left behind.
    pub fn seed_manifest(&self, extension_id: &str, manifest: &Manifest) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");

        let result = Self::seed_locked(&mut state, extension_id, manifest);
        if result.is_err() {
            Self::remove_extension_locked(&mut state, extension_id);
        }
        result
    }

    fn seed_locked(
        state: &mut RegistryState,
        extension_id: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        for command in &manifest.contributes.commands {
            if let Some(owner) = state.commands.get(&command.command) {
                return Err(Error::manifest(format!(
                    "command {} is already owned by {}",
                    command.command, owner.extension_id
                )));
            }
            state.commands.insert(
                command.command.clone(),
                CommandOwner {
                    extension_id: extension_id.to_string(),
                    source: CommandSource::Manifest,
                },
            );
        }

        for function in &manifest.contributes.custom_functions {
            if let Some(owner) = state.custom_functions.get(&function.name) {
                return Err(Error::manifest(format!(
                    "custom function {} is already owned by {owner}",
                    function.name
                )));
            }
            state
                .custom_functions
                .insert(function.name.clone(), extension_id.to_string());
        }

        for connector in &manifest.contributes.data_connectors {
            if let Some(entry) = state.data_connectors.get(&connector.id) {
                return Err(Error::manifest(format!(
                    "data connector {} is already owned by {}",
                    connector.id, entry.extension_id
                )));
            }
            state.data_connectors.insert(
                connector.id.clone(),
                ConnectorEntry {
                    extension_id: extension_id.to_string(),
                    runtime_registered: false,
                },
            );
        }

        Ok(())
    }

    /// Runtime `commands.registerCommand`. Re-registering a command the
    /// same extension already owns is a no-op; another extension's command
    /// id rejects.
    pub fn register_runtime_command(&self, extension_id: &str, command: &str) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        if let Some(owner) = state.commands.get(command) {
            if owner.extension_id == extension_id {
                return Ok(());
            }
            return Err(Error::validation(format!(
                "command {command} is already registered by {}",
                owner.extension_id
            )));
        }
        state.commands.insert(
            command.to_string(),
            CommandOwner {
                extension_id: extension_id.to_string(),
                source: CommandSource::Runtime,
            },
        );
        Ok(())
    }

    pub fn unregister_runtime_command(&self, extension_id: &str, command: &str) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        match state.commands.get(command) {
            Some(owner) if owner.extension_id == extension_id => {
                if owner.source == CommandSource::Manifest {
                    return Err(Error::validation(format!(
                        "command {command} is declared in the manifest and cannot be unregistered"
                    )));
                }
                state.commands.remove(command);
                Ok(())
            }
            Some(owner) => Err(Error::validation(format!(
                "command {command} is owned by {}",
                owner.extension_id
            ))),
            None => Err(Error::validation(format!("unknown command: {command}"))),
        }
    }

    #[must_use]
    pub fn command_owner(&self, command: &str) -> Option<CommandOwner> {
        self.state
            .lock()
            .expect("registry poisoned")
            .commands
            .get(command)
            .cloned()
    }

    #[must_use]
    pub fn custom_function_owner(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .expect("registry poisoned")
            .custom_functions
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn data_connector_owner(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .expect("registry poisoned")
            .data_connectors
            .get(id)
            .map(|entry| entry.extension_id.clone())
    }

    /// Runtime `dataConnectors.register`: only ids declared in the calling
    /// extension's manifest are accepted.
    pub fn mark_connector_registered(&self, extension_id: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        match state.data_connectors.get_mut(id) {
            Some(entry) if entry.extension_id == extension_id => {
                entry.runtime_registered = true;
                Ok(())
            }
            _ => Err(Error::validation(format!(
                "data connector {id} is not declared in contributes.dataConnectors"
            ))),
        }
    }

    pub fn create_panel(&self, extension_id: &str, id: &str, title: &str) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        if let Some(panel) = state.panels.get(id) {
            return Err(Error::validation(format!(
                "panel {id} already exists (owner {})",
                panel.extension_id
            )));
        }
        state.panels.insert(
            id.to_string(),
            Panel {
                id: id.to_string(),
                title: title.to_string(),
                html: String::new(),
                extension_id: extension_id.to_string(),
                outgoing_messages: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn set_panel_html(&self, extension_id: &str, id: &str, html: String) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        let panel = Self::owned_panel(&mut state, extension_id, id)?;
        panel.html = html;
        Ok(())
    }

    pub fn push_panel_message(&self, extension_id: &str, id: &str, message: Value) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        let panel = Self::owned_panel(&mut state, extension_id, id)?;
        panel.outgoing_messages.push(message);
        Ok(())
    }

    fn owned_panel<'a>(
        state: &'a mut RegistryState,
        extension_id: &str,
        id: &str,
    ) -> Result<&'a mut Panel> {
        match state.panels.get_mut(id) {
            Some(panel) if panel.extension_id == extension_id => Ok(panel),
            Some(panel) => Err(Error::validation(format!(
                "panel {id} is owned by {}",
                panel.extension_id
            ))),
            None => Err(Error::validation(format!("unknown panel: {id}"))),
        }
    }

    #[must_use]
    pub fn panel(&self, id: &str) -> Option<Panel> {
        self.state
            .lock()
            .expect("registry poisoned")
            .panels
            .get(id)
            .cloned()
    }

    /// Drain the renderer-bound message queue of a panel.
    #[must_use]
    pub fn drain_panel_messages(&self, id: &str) -> Vec<Value> {
        self.state
            .lock()
            .expect("registry poisoned")
            .panels
            .get_mut(id)
            .map(|panel| std::mem::take(&mut panel.outgoing_messages))
            .unwrap_or_default()
    }

    pub fn register_context_menu(
        &self,
        extension_id: &str,
        id: &str,
        menu_id: &str,
        items: Vec<MenuItem>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        if state.context_menus.contains_key(id) {
            return Err(Error::validation(format!(
                "context menu {id} is already registered"
            )));
        }
        state.context_menus.insert(
            id.to_string(),
            ContextMenuRegistration {
                id: id.to_string(),
                extension_id: extension_id.to_string(),
                menu_id: menu_id.to_string(),
                items,
            },
        );
        Ok(())
    }

    pub fn remove_context_menu(&self, extension_id: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        match state.context_menus.get(id) {
            Some(reg) if reg.extension_id == extension_id => {
                state.context_menus.remove(id);
                Ok(())
            }
            Some(reg) => Err(Error::validation(format!(
                "context menu {id} is owned by {}",
                reg.extension_id
            ))),
            None => Err(Error::validation(format!("unknown context menu: {id}"))),
        }
    }

    /// Clear everything the extension registered at runtime. Called on
    /// worker termination; manifest-declared commands survive.
    pub fn clear_runtime_artifacts(&self, extension_id: &str) {
        let mut state = self.state.lock().expect("registry poisoned");
        state.commands.retain(|_, owner| {
            owner.extension_id != extension_id || owner.source == CommandSource::Manifest
        });
        state.panels.retain(|_, panel| panel.extension_id != extension_id);
        state
            .context_menus
            .retain(|_, menu| menu.extension_id != extension_id);
        for entry in state.data_connectors.values_mut() {
            if entry.extension_id == extension_id {
                entry.runtime_registered = false;
            }
        }
    }

    /// Remove every trace of an extension (unload path).
    pub fn remove_extension(&self, extension_id: &str) {
        let mut state = self.state.lock().expect("registry poisoned");
        Self::remove_extension_locked(&mut state, extension_id);
    }

    fn remove_extension_locked(state: &mut RegistryState, extension_id: &str) {
        state
            .commands
            .retain(|_, owner| owner.extension_id != extension_id);
        state
            .custom_functions
            .retain(|_, owner| owner != extension_id);
        state
            .data_connectors
            .retain(|_, entry| entry.extension_id != extension_id);
        state.panels.retain(|_, panel| panel.extension_id != extension_id);
        state
            .context_menus
            .retain(|_, menu| menu.extension_id != extension_id);
    }

    /// Panels snapshot (for the renderer).
    #[must_use]
    pub fn panels(&self) -> Vec<Panel> {
        self.state
            .lock()
            .expect("registry poisoned")
            .panels
            .values()
            .cloned()
            .collect()
    }

    /// Context menu snapshot (for the renderer).
    #[must_use]
    pub fn context_menus(&self) -> Vec<ContextMenuRegistration> {
        self.state
            .lock()
            .expect("registry poisoned")
            .context_menus
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ValidateOptions, validate};
    use semver::Version;
    use serde_json::json;

    fn manifest(publisher: &str, name: &str, commands: &[&str]) -> Manifest {
        let raw = json!({
            "name": name,
            "version": "1.0.0",
            "publisher": publisher,
            "main": "./e.js",
            "engines": { "formula": "^1.0.0" },
            "contributes": {
                "commands": commands
                    .iter()
                    .map(|c| json!({ "command": c, "title": c }))
                    .collect::<Vec<_>>()
            }
        });
        let version = Version::new(1, 0, 0);
        validate(
            &raw,
            ValidateOptions {
                engine_version: &version,
                enforce_engine: true,
            },
        )
        .unwrap()
    }

    #[test]
    fn duplicate_manifest_command_across_extensions_rejects_and_rolls_back() {
        let registry = RuntimeRegistry::new();
        registry
            .seed_manifest("a.one", &manifest("a", "one", &["shared.cmd"]))
            .unwrap();

        let err = registry
            .seed_manifest("b.two", &manifest("b", "two", &["b.own", "shared.cmd"]))
            .unwrap_err();
        assert!(err.to_string().contains("shared.cmd"), "{err}");

        // Rollback: nothing from b.two is registered.
        assert!(registry.command_owner("b.own").is_none());
        assert_eq!(
            registry.command_owner("shared.cmd").unwrap().extension_id,
            "a.one"
        );
    }

    #[test]
    fn runtime_command_ownership_is_exclusive() {
        let registry = RuntimeRegistry::new();
        registry.register_runtime_command("a.one", "dyn.cmd").unwrap();
        registry.register_runtime_command("a.one", "dyn.cmd").unwrap();
        assert!(
            registry
                .register_runtime_command("b.two", "dyn.cmd")
                .is_err()
        );
    }

    #[test]
    fn termination_clears_runtime_but_not_manifest_commands() {
        let registry = RuntimeRegistry::new();
        registry
            .seed_manifest("a.one", &manifest("a", "one", &["a.manifest"]))
            .unwrap();
        registry.register_runtime_command("a.one", "a.dynamic").unwrap();
        registry.create_panel("a.one", "a.panel", "Panel").unwrap();

        registry.clear_runtime_artifacts("a.one");

        assert!(registry.command_owner("a.dynamic").is_none());
        assert!(registry.panel("a.panel").is_none());
        assert_eq!(
            registry.command_owner("a.manifest").unwrap().extension_id,
            "a.one"
        );
    }

    #[test]
    fn connector_registration_requires_declaration() {
        let registry = RuntimeRegistry::new();
        registry
            .seed_manifest("a.one", &manifest("a", "one", &[]))
            .unwrap();
        assert!(registry.mark_connector_registered("a.one", "csv").is_err());
    }

    #[test]
    fn panel_messages_queue_and_drain() {
        let registry = RuntimeRegistry::new();
        registry.create_panel("a.one", "p", "Panel").unwrap();
        registry
            .push_panel_message("a.one", "p", json!({"n": 1}))
            .unwrap();
        registry
            .push_panel_message("a.one", "p", json!({"n": 2}))
            .unwrap();

        assert_eq!(registry.drain_panel_messages("p").len(), 2);
        assert!(registry.drain_panel_messages("p").is_empty());
        assert!(
            registry
                .push_panel_message("b.two", "p", json!({}))
                .is_err()
        );
    }

    #[test]
    fn unload_removes_everything() {
        let registry = RuntimeRegistry::new();
        registry
            .seed_manifest("a.one", &manifest("a", "one", &["a.cmd"]))
            .unwrap();
        registry.remove_extension("a.one");
        assert!(registry.command_owner("a.cmd").is_none());
    }
}
