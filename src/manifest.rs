//! Extension manifest parsing, validation, and normalization.
//!
//! A manifest is the `package.json` at an extension's root. Validation
//! cross-checks activation events against contributions, verifies the
//! engine range, and produces a normalized [`Manifest`] whose `contributes`
//! fields are always present.

use crate::error::{Error, Result};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Coarse capabilities an extension may declare and be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "cells.read")]
    CellsRead,
    #[serde(rename = "cells.write")]
    CellsWrite,
    #[serde(rename = "sheets.manage")]
    SheetsManage,
    #[serde(rename = "workbook.manage")]
    WorkbookManage,
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "clipboard")]
    Clipboard,
    #[serde(rename = "storage")]
    Storage,
    #[serde(rename = "ui.panels")]
    UiPanels,
    #[serde(rename = "ui.commands")]
    UiCommands,
    #[serde(rename = "ui.menus")]
    UiMenus,
}

impl Permission {
    pub const ALL: [Self; 10] = [
        Self::CellsRead,
        Self::CellsWrite,
        Self::SheetsManage,
        Self::WorkbookManage,
        Self::Network,
        Self::Clipboard,
        Self::Storage,
        Self::UiPanels,
        Self::UiCommands,
        Self::UiMenus,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CellsRead => "cells.read",
            Self::CellsWrite => "cells.write",
            Self::SheetsManage => "sheets.manage",
            Self::WorkbookManage => "workbook.manage",
            Self::Network => "network",
            Self::Clipboard => "clipboard",
            Self::Storage => "storage",
            Self::UiPanels => "ui.panels",
            Self::UiCommands => "ui.commands",
            Self::UiMenus => "ui.menus",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == raw)
            .ok_or_else(|| Error::manifest(format!("unknown permission: {raw}")))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declarative trigger that causes the host to activate an extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivationEvent {
    StartupFinished,
    Command(String),
    View(String),
    CustomFunction(String),
    DataConnector(String),
}

impl ActivationEvent {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == "onStartupFinished" {
            return Ok(Self::StartupFinished);
        }
        for (prefix, make) in [
            ("onCommand:", Self::Command as fn(String) -> Self),
            ("onView:", Self::View),
            ("onCustomFunction:", Self::CustomFunction),
            ("onDataConnector:", Self::DataConnector),
        ] {
            if let Some(target) = raw.strip_prefix(prefix) {
                if target.is_empty() {
                    return Err(Error::manifest(format!("empty activation event target: {raw}")));
                }
                return Ok(make(target.to_string()));
            }
        }
        Err(Error::manifest(format!("unrecognized activation event: {raw}")))
    }
}

impl fmt::Display for ActivationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartupFinished => f.write_str("onStartupFinished"),
            Self::Command(id) => write!(f, "onCommand:{id}"),
            Self::View(id) => write!(f, "onView:{id}"),
            Self::CustomFunction(name) => write!(f, "onCustomFunction:{name}"),
            Self::DataConnector(id) => write!(f, "onDataConnector:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContribution {
    pub command: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelContribution {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keybinding {
    pub key: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSpec {
    #[serde(rename = "type")]
    pub result_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFunctionContribution {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub result: ResultSpec,
    pub parameters: Vec<ParameterSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConnectorContribution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigProperty {
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Everything an extension offers. Always fully populated after
/// validation, with empty collections where the manifest was silent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Contributes {
    pub commands: Vec<CommandContribution>,
    pub panels: Vec<PanelContribution>,
    pub keybindings: Vec<Keybinding>,
    pub menus: BTreeMap<String, Vec<MenuItem>>,
    pub custom_functions: Vec<CustomFunctionContribution>,
    pub data_connectors: Vec<DataConnectorContribution>,
    pub configuration: BTreeMap<String, ConfigProperty>,
}

/// A validated, normalized manifest. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    pub publisher: String,
    pub main: String,
    pub display_name: Option<String>,
    pub engine_range: VersionReq,
    pub activation_events: Vec<ActivationEvent>,
    pub permissions: BTreeSet<Permission>,
    pub contributes: Contributes,
}

impl Manifest {
    /// `"{publisher}.{name}"`, unique per host.
    #[must_use]
    pub fn extension_id(&self) -> String {
        format!("{}.{}", self.publisher, self.name)
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn declares(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    #[must_use]
    pub fn has_activation_event(&self, event: &ActivationEvent) -> bool {
        self.activation_events.contains(event)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions<'a> {
    pub engine_version: &'a Version,
    pub enforce_engine: bool,
}

// Raw (pre-validation) shapes. Field absence is checked by hand so every
// failure gets a precise message instead of a serde path.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    engines: Option<RawEngines>,
    #[serde(default)]
    activation_events: Vec<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    contributes: RawContributes,
}

#[derive(Debug, Deserialize)]
struct RawEngines {
    #[serde(default)]
    formula: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContributes {
    #[serde(default)]
    commands: Vec<CommandContribution>,
    #[serde(default)]
    panels: Vec<PanelContribution>,
    #[serde(default)]
    keybindings: Vec<Keybinding>,
    #[serde(default)]
    menus: BTreeMap<String, Vec<MenuItem>>,
    #[serde(default)]
    custom_functions: Vec<RawCustomFunction>,
    #[serde(default)]
    data_connectors: Vec<DataConnectorContribution>,
    #[serde(default)]
    configuration: RawConfiguration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCustomFunction {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<RawResultSpec>,
    #[serde(default)]
    parameters: Option<Vec<RawParameterSpec>>,
}

#[derive(Debug, Deserialize)]
struct RawResultSpec {
    #[serde(rename = "type", default)]
    result_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawParameterSpec {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    param_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfiguration {
    #[serde(default)]
    properties: BTreeMap<String, RawConfigProperty>,
}

#[derive(Debug, Deserialize)]
struct RawConfigProperty {
    #[serde(rename = "type", default)]
    value_type: Option<String>,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

/// Validate a raw `package.json` value and normalize it.
pub fn validate(raw: &Value, options: ValidateOptions<'_>) -> Result<Manifest> {
    let raw: RawManifest = serde_json::from_value(raw.clone())
        .map_err(|e| Error::manifest(format!("malformed manifest: {e}")))?;

    let name = required_string(raw.name, "name")?;
    let version_str = required_string(raw.version, "version")?;
    let publisher = required_string(raw.publisher, "publisher")?;
    let main = required_string(raw.main, "main")?;

    let version = Version::parse(&version_str)
        .map_err(|e| Error::manifest(format!("version {version_str:?} is not valid semver: {e}")))?;

    let range_str = raw
        .engines
        .and_then(|e| e.formula)
        .ok_or_else(|| Error::manifest("manifest is missing engines.formula"))?;
    let engine_range = VersionReq::parse(&range_str).map_err(|e| {
        Error::manifest(format!("engines.formula {range_str:?} is not a valid range: {e}"))
    })?;
    if options.enforce_engine && !engine_range.matches(options.engine_version) {
        return Err(Error::manifest(format!(
            "extension requires engine formula@{range_str}, host engine is {}",
            options.engine_version
        )));
    }

    let contributes = normalize_contributes(raw.contributes)?;

    let mut permissions = BTreeSet::new();
    for perm in &raw.permissions {
        permissions.insert(Permission::parse(perm)?);
    }

    let mut activation_events = Vec::with_capacity(raw.activation_events.len());
    for raw_event in &raw.activation_events {
        let event = ActivationEvent::parse(raw_event)?;
        check_event_target(&event, &contributes)?;
        activation_events.push(event);
    }

    Ok(Manifest {
        name,
        version,
        publisher,
        main,
        display_name: raw.display_name,
        engine_range,
        activation_events,
        permissions,
        contributes,
    })
}

fn required_string(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(Error::manifest(format!(
            "manifest is missing required field: {field}"
        ))),
    }
}

fn normalize_contributes(raw: RawContributes) -> Result<Contributes> {
    check_unique(
        raw.commands.iter().map(|c| c.command.as_str()),
        "contributes.commands",
    )?;
    check_unique(raw.panels.iter().map(|p| p.id.as_str()), "contributes.panels")?;
    check_unique(
        raw.custom_functions.iter().map(|f| f.name.as_str()),
        "contributes.customFunctions",
    )?;
    check_unique(
        raw.data_connectors.iter().map(|c| c.id.as_str()),
        "contributes.dataConnectors",
    )?;

    let mut custom_functions = Vec::with_capacity(raw.custom_functions.len());
    for func in raw.custom_functions {
        let result_type = func
            .result
            .and_then(|r| r.result_type)
            .ok_or_else(|| {
                Error::manifest(format!(
                    "custom function {:?} must declare result.type",
                    func.name
                ))
            })?;
        let raw_params = func.parameters.ok_or_else(|| {
            Error::manifest(format!(
                "custom function {:?} must declare a parameters array",
                func.name
            ))
        })?;
        let mut parameters = Vec::with_capacity(raw_params.len());
        for (index, param) in raw_params.into_iter().enumerate() {
            let (Some(name), Some(param_type)) = (param.name, param.param_type) else {
                return Err(Error::manifest(format!(
                    "custom function {:?} parameter #{index} must declare name and type",
                    func.name
                )));
            };
            parameters.push(ParameterSpec { name, param_type });
        }
        custom_functions.push(CustomFunctionContribution {
            name: func.name,
            description: func.description,
            result: ResultSpec { result_type },
            parameters,
        });
    }

    let mut configuration = BTreeMap::new();
    for (key, prop) in raw.configuration.properties {
        let value_type = prop.value_type.ok_or_else(|| {
            Error::manifest(format!("configuration property {key:?} must declare type"))
        })?;
        configuration.insert(
            key,
            ConfigProperty {
                value_type,
                default: prop.default,
                description: prop.description,
            },
        );
    }

    Ok(Contributes {
        commands: raw.commands,
        panels: raw.panels,
        keybindings: raw.keybindings,
        menus: raw.menus,
        custom_functions,
        data_connectors: raw.data_connectors,
        configuration,
    })
}

fn check_unique<'a>(ids: impl Iterator<Item = &'a str>, what: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(Error::manifest(format!("{what} contains an empty id")));
        }
        if !seen.insert(id) {
            return Err(Error::manifest(format!("duplicate id in {what}: {id}")));
        }
    }
    Ok(())
}

fn check_event_target(event: &ActivationEvent, contributes: &Contributes) -> Result<()> {
    let found = match event {
        ActivationEvent::StartupFinished => true,
        ActivationEvent::Command(id) => {
            contributes.commands.iter().any(|c| c.command == *id)
        }
        ActivationEvent::View(id) => contributes.panels.iter().any(|p| p.id == *id),
        ActivationEvent::CustomFunction(name) => {
            contributes.custom_functions.iter().any(|f| f.name == *name)
        }
        ActivationEvent::DataConnector(id) => {
            contributes.data_connectors.iter().any(|c| c.id == *id)
        }
    };
    if found {
        Ok(())
    } else {
        Err(Error::manifest(format!(
            "activation event {event} references an unknown contribution"
        )))
    }
}
