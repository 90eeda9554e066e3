//! Host-side implementation of every API operation workers may request.
//!
//! Dispatch is a static `namespace.method` mapping to required permissions
//! and a handler; no per-call reflection. Argument shape is validated
//! before permissions are consulted, so malformed calls never produce a
//! user-facing prompt. Range operations are size-capped before the
//! spreadsheet collaborator is touched.

use crate::a1::RangeRef;
use crate::audit::{AuditEvent, Principal};
use crate::error::{Error, Result};
use crate::events::HostEvent;
use crate::host::ExtensionHost;
use crate::manifest::{MenuItem, Permission};
use crate::permissions::PermissionSubject;
use crate::protocol::HostToWorker;
use crate::record::ExtensionRecord;
use crate::storage;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Permissions required per `namespace.method`. `None` means the
/// operation does not exist. Handle-scoped WebSocket operations are free:
/// opening the socket was the gated step.
pub(crate) fn required_permissions(
    namespace: &str,
    method: &str,
) -> Option<&'static [Permission]> {
    use Permission::{
        CellsRead, CellsWrite, Clipboard, Network, SheetsManage, Storage, UiCommands, UiMenus,
        UiPanels, WorkbookManage,
    };
    Some(match (namespace, method) {
        ("workbook", "getActiveWorkbook") => &[],
        ("workbook", "openWorkbook") => &[WorkbookManage],
        ("sheets", "getActiveSheet" | "list" | "get") => &[],
        ("sheets", "create" | "rename" | "remove" | "activate") => &[SheetsManage],
        ("cells", "getRange" | "getCell" | "getSelection") => &[CellsRead],
        ("cells", "setRange" | "setCell" | "setSelection") => &[CellsWrite],
        ("network", "fetch" | "openWebSocket") => &[Network],
        ("network", "sendWebSocketMessage" | "receiveWebSocketMessages" | "closeWebSocket") => &[],
        ("storage", "get" | "set" | "delete" | "keys") => &[Storage],
        ("config", "get" | "update") => &[],
        ("clipboard", "readText" | "writeText") => &[Clipboard],
        ("ui", "createPanel" | "setPanelHtml" | "postMessageToPanel") => &[UiPanels],
        ("ui", "registerContextMenu" | "removeContextMenu") => &[UiMenus],
        ("commands", "registerCommand" | "unregisterCommand") => &[UiCommands],
        ("dataConnectors", "register") => &[],
        _ => return None,
    })
}

fn arg<'a>(args: &'a [Value], index: usize, key: &str, what: &str) -> Result<&'a Value> {
    args.get(index)
        .ok_or_else(|| Error::validation(format!("{key}: missing {what} argument")))
}

fn arg_str<'a>(args: &'a [Value], index: usize, key: &str, what: &str) -> Result<&'a str> {
    let value = arg(args, index, key, what)?;
    let s = value
        .as_str()
        .ok_or_else(|| Error::validation(format!("{key}: {what} must be a string")))?;
    if s.is_empty() {
        return Err(Error::validation(format!("{key}: {what} must be non-empty")));
    }
    Ok(s)
}

fn arg_u32(args: &[Value], index: usize, key: &str, what: &str) -> Result<u32> {
    let value = arg(args, index, key, what)?;
    let n = value
        .as_u64()
        .ok_or_else(|| Error::validation(format!("{key}: {what} must be a positive integer")))?;
    u32::try_from(n)
        .ok()
        .filter(|n| *n >= 1)
        .ok_or_else(|| Error::validation(format!("{key}: {what} must be a 1-based index")))
}

/// Shape validation, run before any permission check. Returns the URL for
/// network operations so the allowlist path applies.
fn validate_shape(namespace: &str, method: &str, args: &[Value], key: &str) -> Result<Option<Url>> {
    match (namespace, method) {
        ("workbook", "openWorkbook") => {
            arg_str(args, 0, key, "path")?;
        }
        ("sheets", "get" | "create" | "remove" | "activate") => {
            arg_str(args, 0, key, "sheet name")?;
        }
        ("sheets", "rename") => {
            arg_str(args, 0, key, "current name")?;
            arg_str(args, 1, key, "new name")?;
        }
        ("cells", "getRange" | "setSelection") => {
            arg_str(args, 0, key, "range")?;
        }
        ("cells", "setRange") => {
            arg_str(args, 0, key, "range")?;
            let values = arg(args, 1, key, "values")?;
            if !values.is_array() {
                return Err(Error::validation(format!("{key}: values must be a 2D array")));
            }
        }
        ("cells", "getCell") => {
            arg_u32(args, 0, key, "row")?;
            arg_u32(args, 1, key, "col")?;
        }
        ("cells", "setCell") => {
            arg_u32(args, 0, key, "row")?;
            arg_u32(args, 1, key, "col")?;
            arg(args, 2, key, "value")?;
        }
        ("network", "fetch" | "openWebSocket") => {
            let raw = arg_str(args, 0, key, "url")?;
            let url = Url::parse(raw)
                .map_err(|e| Error::validation(format!("{key}: invalid URL {raw:?}: {e}")))?;
            let schemes: &[&str] = if method == "fetch" {
                &["http", "https"]
            } else {
                &["ws", "wss"]
            };
            if !schemes.contains(&url.scheme()) {
                return Err(Error::validation(format!(
                    "{key}: unsupported URL scheme {:?}",
                    url.scheme()
                )));
            }
            return Ok(Some(url));
        }
        ("network", "sendWebSocketMessage") => {
            arg_str(args, 0, key, "handle")?;
            arg_str(args, 1, key, "message")?;
        }
        ("network", "receiveWebSocketMessages" | "closeWebSocket") => {
            arg_str(args, 0, key, "handle")?;
        }
        ("storage", "get" | "delete") => {
            arg_str(args, 0, key, "storage key")?;
        }
        ("storage", "set") => {
            arg_str(args, 0, key, "storage key")?;
            arg(args, 1, key, "value")?;
        }
        ("config", "get" | "update") => {
            arg_str(args, 0, key, "configuration key")?;
        }
        ("clipboard", "writeText") => {
            arg_str(args, 0, key, "text")?;
        }
        ("ui", "createPanel") => {
            arg_str(args, 0, key, "panel id")?;
            arg_str(args, 1, key, "title")?;
        }
        ("ui", "setPanelHtml") => {
            arg_str(args, 0, key, "panel id")?;
            arg(args, 1, key, "html")?;
        }
        ("ui", "postMessageToPanel") => {
            arg_str(args, 0, key, "panel id")?;
            arg(args, 1, key, "message")?;
        }
        ("ui", "registerContextMenu") => {
            arg_str(args, 0, key, "menu registration id")?;
            arg_str(args, 1, key, "menu id")?;
            let items = arg(args, 2, key, "items")?;
            if !items.is_array() {
                return Err(Error::validation(format!("{key}: items must be an array")));
            }
        }
        ("ui", "removeContextMenu") => {
            arg_str(args, 0, key, "menu registration id")?;
        }
        ("commands", "registerCommand" | "unregisterCommand") => {
            arg_str(args, 0, key, "command id")?;
        }
        ("dataConnectors", "register") => {
            arg_str(args, 0, key, "connector id")?;
        }
        _ => {}
    }
    Ok(None)
}

impl ExtensionHost {
    /// Entry point for every worker `api_call`.
    pub(crate) async fn dispatch_api(
        &self,
        record: &Arc<ExtensionRecord>,
        namespace: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let key = format!("{namespace}.{method}");
        let required = required_permissions(namespace, method)
            .ok_or_else(|| Error::validation(format!("unknown API operation: {key}")))?;

        let url = validate_shape(namespace, method, &args, &key)?;

        let subject = PermissionSubject {
            extension_id: &record.id,
            display_name: record.manifest.display_name(),
            declared: &record.manifest.permissions,
        };
        if let Err(err) = self
            .inner
            .permissions
            .ensure(subject, required, &key, url.as_ref())
            .await
        {
            if namespace == "network" {
                self.inner.audit.log(AuditEvent {
                    principal: Principal::extension(&record.id),
                    action: "network.denied".to_string(),
                    api_key: Some(key.clone()),
                    permissions: required.iter().map(ToString::to_string).collect(),
                    url: url.as_ref().map(ToString::to_string),
                    message: err.to_string(),
                });
            }
            return Err(err);
        }

        self.execute_api(record, namespace, method, &args, url).await
    }

    #[allow(clippy::too_many_lines)]
    async fn execute_api(
        &self,
        record: &Arc<ExtensionRecord>,
        namespace: &str,
        method: &str,
        args: &[Value],
        url: Option<Url>,
    ) -> Result<Value> {
        let key = format!("{namespace}.{method}");
        let sheet = &self.inner.spreadsheet;
        match (namespace, method) {
            ("workbook", "getActiveWorkbook") => self.workbook_snapshot(),
            ("workbook", "openWorkbook") => sheet.open_workbook(arg_str(args, 0, &key, "path")?),

            ("sheets", "getActiveSheet") => Ok(json!(sheet.get_active_sheet()?)),
            ("sheets", "list") => Ok(json!(sheet.list_sheets()?)),
            ("sheets", "get") => Ok(serde_json::to_value(
                sheet.get_sheet(arg_str(args, 0, &key, "sheet name")?)?,
            )?),
            ("sheets", "create") => {
                sheet.create_sheet(arg_str(args, 0, &key, "sheet name")?)?;
                Ok(Value::Null)
            }
            ("sheets", "rename") => {
                sheet.rename_sheet(
                    arg_str(args, 0, &key, "current name")?,
                    arg_str(args, 1, &key, "new name")?,
                )?;
                Ok(Value::Null)
            }
            ("sheets", "remove") => {
                sheet.delete_sheet(arg_str(args, 0, &key, "sheet name")?)?;
                Ok(Value::Null)
            }
            ("sheets", "activate") => {
                sheet.activate_sheet(arg_str(args, 0, &key, "sheet name")?)?;
                Ok(Value::Null)
            }

            ("cells", "getRange") => {
                let range = self.checked_range(arg_str(args, 0, &key, "range")?)?;
                Ok(json!(sheet.get_range(&range)?))
            }
            ("cells", "setRange") => {
                let range = self.checked_range(arg_str(args, 0, &key, "range")?)?;
                let values: Vec<Vec<Value>> =
                    serde_json::from_value(arg(args, 1, &key, "values")?.clone()).map_err(|e| {
                        Error::validation(format!("{key}: values must be a 2D array: {e}"))
                    })?;
                sheet.set_range(&range, &values)?;
                Ok(Value::Null)
            }
            ("cells", "getCell") => {
                let row = arg_u32(args, 0, &key, "row")?;
                let col = arg_u32(args, 1, &key, "col")?;
                Ok(sheet.get_cell(row, col)?)
            }
            ("cells", "setCell") => {
                let row = arg_u32(args, 0, &key, "row")?;
                let col = arg_u32(args, 1, &key, "col")?;
                sheet.set_cell(row, col, arg(args, 2, &key, "value")?.clone())?;
                Ok(Value::Null)
            }
            ("cells", "getSelection") => {
                let selection = sheet.get_selection()?;
                if let Ok(range) = RangeRef::parse(&selection.range) {
                    self.check_range_size(&range)?;
                }
                Ok(serde_json::to_value(selection)?)
            }
            ("cells", "setSelection") => {
                let range = self.checked_range(arg_str(args, 0, &key, "range")?)?;
                sheet.set_selection(&range)?;
                Ok(Value::Null)
            }

            ("network", "fetch") => {
                self.perform_fetch(url.expect("validated above"), args.get(1))
                    .await
            }
            ("network", "openWebSocket") => {
                let handle = self
                    .inner
                    .websockets
                    .open(&record.id, &url.expect("validated above"))
                    .await?;
                Ok(json!({ "handle": handle }))
            }
            ("network", "sendWebSocketMessage") => {
                self.inner.websockets.send(
                    &record.id,
                    arg_str(args, 0, &key, "handle")?,
                    arg_str(args, 1, &key, "message")?,
                )?;
                Ok(Value::Null)
            }
            ("network", "receiveWebSocketMessages") => Ok(json!(
                self.inner
                    .websockets
                    .drain(&record.id, arg_str(args, 0, &key, "handle")?)?
            )),
            ("network", "closeWebSocket") => {
                self.inner
                    .websockets
                    .close(&record.id, arg_str(args, 0, &key, "handle")?)?;
                Ok(Value::Null)
            }

            ("storage", "get") => Ok(self
                .inner
                .storage
                .get(&record.id, arg_str(args, 0, &key, "storage key")?)?
                .unwrap_or(Value::Null)),
            ("storage", "set") => {
                self.inner.storage.set(
                    &record.id,
                    arg_str(args, 0, &key, "storage key")?,
                    arg(args, 1, &key, "value")?.clone(),
                )?;
                Ok(Value::Null)
            }
            ("storage", "delete") => Ok(json!(
                self.inner
                    .storage
                    .delete(&record.id, arg_str(args, 0, &key, "storage key")?)?
            )),
            ("storage", "keys") => Ok(json!(self.inner.storage.keys(&record.id)?)),

            ("config", "get") => {
                let config_name = arg_str(args, 0, &key, "configuration key")?;
                let stored = self
                    .inner
                    .storage
                    .get(&record.id, &storage::config_key(config_name))?;
                Ok(stored.unwrap_or_else(|| {
                    record
                        .manifest
                        .contributes
                        .configuration
                        .get(config_name)
                        .and_then(|prop| prop.default.clone())
                        .unwrap_or(Value::Null)
                }))
            }
            ("config", "update") => {
                let config_name = arg_str(args, 0, &key, "configuration key")?;
                if !record
                    .manifest
                    .contributes
                    .configuration
                    .contains_key(config_name)
                {
                    return Err(Error::validation(format!(
                        "configuration key {config_name:?} is not declared in contributes.configuration.properties"
                    )));
                }
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                self.inner
                    .storage
                    .set(&record.id, &storage::config_key(config_name), value.clone())?;
                // Only the owning extension observes the change.
                self.post_event_to(record, &HostEvent::config_changed(config_name, &value));
                Ok(Value::Null)
            }

            ("clipboard", "readText") => Ok(json!(
                self.inner.clipboard.lock().expect("clipboard poisoned").clone()
            )),
            ("clipboard", "writeText") => {
                let text = arg_str(args, 0, &key, "text")?;
                *self.inner.clipboard.lock().expect("clipboard poisoned") = text.to_string();
                Ok(Value::Null)
            }

            ("ui", "createPanel") => {
                self.inner.registry.create_panel(
                    &record.id,
                    arg_str(args, 0, &key, "panel id")?,
                    arg_str(args, 1, &key, "title")?,
                )?;
                Ok(Value::Null)
            }
            ("ui", "setPanelHtml") => {
                let html = arg(args, 1, &key, "html")?;
                self.inner.registry.set_panel_html(
                    &record.id,
                    arg_str(args, 0, &key, "panel id")?,
                    html.as_str().unwrap_or_default().to_string(),
                )?;
                Ok(Value::Null)
            }
            ("ui", "postMessageToPanel") => {
                self.inner.registry.push_panel_message(
                    &record.id,
                    arg_str(args, 0, &key, "panel id")?,
                    arg(args, 1, &key, "message")?.clone(),
                )?;
                Ok(Value::Null)
            }
            ("ui", "registerContextMenu") => {
                let items: Vec<MenuItem> =
                    serde_json::from_value(arg(args, 2, &key, "items")?.clone()).map_err(|e| {
                        Error::validation(format!("{key}: invalid menu items: {e}"))
                    })?;
                self.inner.registry.register_context_menu(
                    &record.id,
                    arg_str(args, 0, &key, "menu registration id")?,
                    arg_str(args, 1, &key, "menu id")?,
                    items,
                )?;
                Ok(Value::Null)
            }
            ("ui", "removeContextMenu") => {
                self.inner
                    .registry
                    .remove_context_menu(&record.id, arg_str(args, 0, &key, "menu registration id")?)?;
                Ok(Value::Null)
            }

            ("commands", "registerCommand") => {
                let command = arg_str(args, 0, &key, "command id")?;
                self.inner.registry.register_runtime_command(&record.id, command)?;
                record
                    .registered_commands
                    .lock()
                    .expect("registered commands poisoned")
                    .insert(command.to_string());
                Ok(Value::Null)
            }
            ("commands", "unregisterCommand") => {
                let command = arg_str(args, 0, &key, "command id")?;
                self.inner
                    .registry
                    .unregister_runtime_command(&record.id, command)?;
                record
                    .registered_commands
                    .lock()
                    .expect("registered commands poisoned")
                    .remove(command);
                Ok(Value::Null)
            }

            ("dataConnectors", "register") => {
                self.inner
                    .registry
                    .mark_connector_registered(&record.id, arg_str(args, 0, &key, "connector id")?)?;
                Ok(Value::Null)
            }

            _ => Err(Error::validation(format!("unknown API operation: {key}"))),
        }
    }

    /// Parse an A1 reference and enforce the cell-count cap before the
    /// spreadsheet collaborator is consulted.
    fn checked_range(&self, raw: &str) -> Result<RangeRef> {
        let range = RangeRef::parse(raw)?;
        self.check_range_size(&range)?;
        Ok(range)
    }

    pub(crate) fn check_range_size(&self, range: &RangeRef) -> Result<()> {
        let limit = self.inner.config.max_range_cells;
        let cells = range.cell_count();
        if cells > limit {
            return Err(Error::RangeTooLarge {
                range: range.to_string(),
                cells,
                limit,
            });
        }
        Ok(())
    }

    async fn perform_fetch(&self, url: Url, options: Option<&Value>) -> Result<Value> {
        let method_name = options
            .and_then(|o| o.get("method"))
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| Error::validation(format!("invalid HTTP method: {method_name}")))?;

        let mut request = self.inner.http.request(method, url);
        if let Some(headers) = options.and_then(|o| o.get("headers")).and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = options.and_then(|o| o.get("body")).and_then(Value::as_str) {
            request = request.body(body.to_string());
        }

        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers: Vec<Value> = response
            .headers()
            .iter()
            .map(|(name, value)| json!([name.as_str(), value.to_str().unwrap_or_default()]))
            .collect();
        let body_text = response.text().await?;

        Ok(json!({
            "ok": status.is_success(),
            "status": status.as_u16(),
            "statusText": status.canonical_reason().unwrap_or_default(),
            "url": final_url,
            "headers": headers,
            "bodyText": body_text,
        }))
    }
}

// ─── WebSocket mediation ────────────────────────────────────────────────────

struct WsConn {
    owner: String,
    outbound: tokio::sync::mpsc::UnboundedSender<String>,
    inbound: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicBool>,
}

/// Host-side registry of mediated WebSocket connections, keyed by handle.
#[derive(Default)]
pub(crate) struct WebSocketRegistry {
    conns: Mutex<HashMap<String, WsConn>>,
}

impl WebSocketRegistry {
    pub(crate) async fn open(&self, owner: &str, url: &Url) -> Result<String> {
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::http(format!("WebSocket connect failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let inbound = Arc::new(Mutex::new(Vec::new()));
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn({
            let inbound = Arc::clone(&inbound);
            let open = Arc::clone(&open);
            async move {
                while let Some(Ok(message)) = source.next().await {
                    if let Message::Text(text) = message {
                        inbound
                            .lock()
                            .expect("ws inbound poisoned")
                            .push(text.to_string());
                    }
                }
                open.store(false, Ordering::SeqCst);
            }
        });

        let handle = uuid::Uuid::new_v4().to_string();
        self.conns.lock().expect("ws registry poisoned").insert(
            handle.clone(),
            WsConn {
                owner: owner.to_string(),
                outbound,
                inbound,
                open,
            },
        );
        Ok(handle)
    }

    fn with_conn<R>(
        &self,
        owner: &str,
        handle: &str,
        f: impl FnOnce(&WsConn) -> Result<R>,
    ) -> Result<R> {
        let conns = self.conns.lock().expect("ws registry poisoned");
        match conns.get(handle) {
            Some(conn) if conn.owner == owner => f(conn),
            _ => Err(Error::validation(format!("unknown WebSocket handle: {handle}"))),
        }
    }

    pub(crate) fn send(&self, owner: &str, handle: &str, text: &str) -> Result<()> {
        self.with_conn(owner, handle, |conn| {
            if !conn.open.load(Ordering::SeqCst) {
                return Err(Error::validation("WebSocket is closed"));
            }
            conn.outbound
                .send(text.to_string())
                .map_err(|_| Error::validation("WebSocket is closed"))
        })
    }

    pub(crate) fn drain(&self, owner: &str, handle: &str) -> Result<Vec<String>> {
        self.with_conn(owner, handle, |conn| {
            Ok(std::mem::take(
                &mut *conn.inbound.lock().expect("ws inbound poisoned"),
            ))
        })
    }

    pub(crate) fn close(&self, owner: &str, handle: &str) -> Result<()> {
        let mut conns = self.conns.lock().expect("ws registry poisoned");
        match conns.get(handle) {
            Some(conn) if conn.owner == owner => {
                conns.remove(handle);
                Ok(())
            }
            _ => Err(Error::validation(format!("unknown WebSocket handle: {handle}"))),
        }
    }

    /// Tear down every connection the extension owns (worker termination
    /// and unload path).
    pub(crate) fn close_for_extension(&self, owner: &str) {
        self.conns
            .lock()
            .expect("ws registry poisoned")
            .retain(|_, conn| conn.owner != owner);
    }
}

impl ExtensionHost {
    /// Post a targeted event to one extension's worker, best-effort.
    pub(crate) fn post_event_to(&self, record: &Arc<ExtensionRecord>, event: &HostEvent) {
        if let Some(worker) = record.worker_handle() {
            let _ = worker.post(
                &record.id,
                HostToWorker::Event {
                    name: event.name.to_string(),
                    payload: event.payload.clone(),
                },
            );
        }
    }
}
