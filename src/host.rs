//! The extension host facade.
//!
//! Owns the extension table, worker lifecycle (spawn, pump, terminate),
//! activation coalescing, request routing with per-kind timeouts, and
//! event broadcasting. Must be constructed inside a tokio runtime.

use crate::audit::{AuditEvent, AuditSink, Principal};
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::events::HostEvent;
use crate::manifest::{ActivationEvent, Keybinding, Permission, ValidateOptions, validate};
use crate::paths::{path_is_inside, safe_canonicalize};
use crate::permission_store::PermissionStore;
use crate::permissions::{PermissionManager, PermissionPrompt};
use crate::protocol::{HostToWorker, WireError, WorkerToHost, new_request_id};
use crate::record::{ExtensionRecord, Lifecycle};
use crate::registry::{ContextMenuRegistration, Panel, RuntimeRegistry};
use crate::sandbox::WorkerSpec;
use crate::spreadsheet::{CellChange, Selection, SpreadsheetApi, Subscription};
use crate::storage::StorageStore;
use crate::worker::{WorkerHandle, spawn_worker};
use crate::api;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Snapshot of one loaded extension, for the embedding application.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub active: bool,
    pub lifecycle: &'static str,
}

const fn lifecycle_name(lifecycle: Lifecycle) -> &'static str {
    match lifecycle {
        Lifecycle::Loaded => "loaded",
        Lifecycle::Activating => "activating",
        Lifecycle::Active => "active",
        Lifecycle::Terminating => "terminating",
        Lifecycle::Dead => "dead",
    }
}

pub(crate) struct HostInner {
    pub config: HostConfig,
    pub spreadsheet: Arc<dyn SpreadsheetApi>,
    pub permissions: PermissionManager,
    pub storage: StorageStore,
    pub registry: RuntimeRegistry,
    pub audit: Arc<dyn AuditSink>,
    pub extensions: Mutex<BTreeMap<String, Arc<ExtensionRecord>>>,
    pub http: reqwest::Client,
    pub clipboard: Mutex<String>,
    pub websockets: api::WebSocketRegistry,
    /// Keeps spreadsheet listener registrations alive for the host's life.
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Public handle; cheap to clone.
#[derive(Clone)]
pub struct ExtensionHost {
    pub(crate) inner: Arc<HostInner>,
}

impl ExtensionHost {
    /// Build a host and wire spreadsheet event listeners. Requires a tokio
    /// runtime context.
    pub fn new(
        config: HostConfig,
        spreadsheet: Arc<dyn SpreadsheetApi>,
        prompt: Arc<dyn PermissionPrompt>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_root)?;
        let permissions = PermissionManager::new(
            PermissionStore::new(config.permissions_path()),
            prompt,
        );
        let storage = StorageStore::new(config.storage_path());

        let host = Self {
            inner: Arc::new(HostInner {
                config,
                spreadsheet,
                permissions,
                storage,
                registry: RuntimeRegistry::new(),
                audit,
                extensions: Mutex::new(BTreeMap::new()),
                http: reqwest::Client::new(),
                clipboard: Mutex::new(String::new()),
                websockets: api::WebSocketRegistry::default(),
                subscriptions: Mutex::new(Vec::new()),
            }),
        };
        host.attach_spreadsheet_listeners();
        Ok(host)
    }

    /// Subscribe to engine events and fan them into the broadcaster in
    /// observation order.
    fn attach_spreadsheet_listeners(&self) {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<HostEvent>();
        let max_cells = self.inner.config.max_range_cells;

        let mut subscriptions = Vec::with_capacity(3);
        subscriptions.push(self.inner.spreadsheet.on_selection_changed(Arc::new({
            let tx = event_tx.clone();
            move |selection: &Selection| {
                let _ = tx.send(HostEvent::selection_changed(selection, max_cells));
            }
        })));
        subscriptions.push(self.inner.spreadsheet.on_cell_changed(Arc::new({
            let tx = event_tx.clone();
            move |change: &CellChange| {
                let _ = tx.send(HostEvent::cell_changed(change));
            }
        })));
        subscriptions.push(self.inner.spreadsheet.on_sheet_activated(Arc::new({
            let tx = event_tx;
            move |name: &String| {
                let _ = tx.send(HostEvent::sheet_activated(name));
            }
        })));
        *self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions poisoned") = subscriptions;

        let host = self.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                host.broadcast(&event);
            }
        });
    }

    // ─── Loading ────────────────────────────────────────────────────────────

    /// Read and validate a manifest from `<path>/package.json`, provision
    /// storage, seed contributions, and spawn the worker.
    pub async fn load_extension(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let manifest_path = path.join("package.json");
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
            Error::manifest(format!("cannot read manifest {}: {e}", manifest_path.display()))
        })?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::manifest(format!("manifest is not valid JSON: {e}")))?;
        let manifest = validate(
            &value,
            ValidateOptions {
                engine_version: &self.inner.config.engine_version,
                enforce_engine: self.inner.config.enforce_engine,
            },
        )?;

        let id = manifest.extension_id();
        if id.contains(['/', '\\', '\0']) {
            return Err(Error::manifest(format!(
                "extension id {id:?} must not contain path separators"
            )));
        }

        let root = safe_canonicalize(path);
        let entrypoint = safe_canonicalize(&root.join(&manifest.main));
        if !path_is_inside(&root, &entrypoint) {
            return Err(Error::manifest(format!(
                "entrypoint {:?} escapes the extension root",
                manifest.main
            )));
        }

        let global_storage = self.inner.config.global_storage_dir(&id);
        let workspace_storage = self.inner.config.workspace_storage_dir(&id);
        std::fs::create_dir_all(&global_storage)?;
        std::fs::create_dir_all(&workspace_storage)?;

        {
            let extensions = self.inner.extensions.lock().expect("extensions poisoned");
            if extensions.contains_key(&id) {
                return Err(Error::validation(format!("extension {id} is already loaded")));
            }
        }

        self.inner.registry.seed_manifest(&id, &manifest)?;
        let record = Arc::new(ExtensionRecord::new(
            manifest,
            root,
            entrypoint,
            global_storage,
            workspace_storage,
        ));
        self.inner
            .extensions
            .lock()
            .expect("extensions poisoned")
            .insert(id.clone(), Arc::clone(&record));

        if let Err(err) = self.ensure_worker(&record).await {
            self.inner.registry.remove_extension(&id);
            self.inner
                .extensions
                .lock()
                .expect("extensions poisoned")
                .remove(&id);
            return Err(err);
        }

        tracing::info!(extension = %id, "loaded extension");
        self.inner.audit.log(AuditEvent {
            principal: Principal::extension(&id),
            action: "extension.loaded".to_string(),
            api_key: None,
            permissions: Vec::new(),
            url: None,
            message: format!("loaded from {}", record.root.display()),
        });
        Ok(id)
    }

    // ─── Activation & routing ───────────────────────────────────────────────

    /// Activate every `onStartupFinished` extension in parallel, then
    /// broadcast `workbookOpened` with the current snapshot.
    pub async fn startup(&self) -> Result<()> {
        let records: Vec<_> = self
            .records()
            .into_iter()
            .filter(|r| r.manifest.has_activation_event(&ActivationEvent::StartupFinished))
            .collect();

        let outcomes = futures::future::join_all(
            records.iter().map(|record| self.activate_record(record)),
        )
        .await;
        for (record, outcome) in records.iter().zip(outcomes) {
            if let Err(err) = outcome {
                tracing::warn!(extension = %record.id, "startup activation failed: {err}");
            }
        }

        let snapshot = self.workbook_snapshot()?;
        self.broadcast(&HostEvent::workbook_opened(snapshot));
        Ok(())
    }

    /// Broadcast `viewActivated` to all active extensions, then activate
    /// `onView` subscribers and wait for any contributed panel's HTML.
    pub async fn activate_view(&self, view_id: &str) -> Result<()> {
        let event = HostEvent::view_activated(view_id);
        // Never gated on any single extension's activation success.
        self.broadcast(&event);

        let target = ActivationEvent::View(view_id.to_string());
        for record in self.records() {
            if !record.manifest.has_activation_event(&target) {
                continue;
            }
            if !record.is_active() {
                match self.activate_record(&record).await {
                    // Freshly-activated extensions missed the broadcast.
                    Ok(()) => self.post_event_to(&record, &event),
                    Err(err) => {
                        tracing::warn!(extension = %record.id, "view activation failed: {err}");
                        continue;
                    }
                }
            }
            if record
                .manifest
                .contributes
                .panels
                .iter()
                .any(|panel| panel.id == view_id)
            {
                self.wait_for_panel_html(view_id).await;
            }
        }
        Ok(())
    }

    /// Route a command to its owner, activating on demand via
    /// `onCommand:<id>`.
    pub async fn execute_command(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        let owner = self
            .inner
            .registry
            .command_owner(command)
            .ok_or_else(|| Error::validation(format!("unknown command: {command}")))?;
        let record = self.record(&owner.extension_id)?;

        if !record.is_active() {
            let event = ActivationEvent::Command(command.to_string());
            if !record.manifest.has_activation_event(&event) {
                return Err(Error::validation(format!(
                    "extension {} is not active and does not declare {event}",
                    record.id
                )));
            }
            self.activate_record(&record).await?;
        }

        let id = new_request_id();
        self.request(
            &record,
            id.clone(),
            HostToWorker::ExecuteCommand {
                id,
                command: command.to_string(),
                args,
            },
            self.inner.config.command_timeout,
            &format!("command {command}"),
        )
        .await
    }

    pub async fn invoke_custom_function(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let owner = self
            .inner
            .registry
            .custom_function_owner(name)
            .ok_or_else(|| Error::validation(format!("unknown custom function: {name}")))?;
        let record = self.record(&owner)?;

        if !record.is_active() {
            let event = ActivationEvent::CustomFunction(name.to_string());
            if !record.manifest.has_activation_event(&event) {
                return Err(Error::validation(format!(
                    "extension {} is not active and does not declare {event}",
                    record.id
                )));
            }
            self.activate_record(&record).await?;
        }

        let id = new_request_id();
        self.request(
            &record,
            id.clone(),
            HostToWorker::InvokeCustomFunction {
                id,
                name: name.to_string(),
                args,
            },
            self.inner.config.custom_function_timeout,
            &format!("custom function {name}"),
        )
        .await
    }

    pub async fn invoke_data_connector(
        &self,
        connector: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let owner = self
            .inner
            .registry
            .data_connector_owner(connector)
            .ok_or_else(|| Error::validation(format!("unknown data connector: {connector}")))?;
        let record = self.record(&owner)?;

        if !record.is_active() {
            let event = ActivationEvent::DataConnector(connector.to_string());
            if !record.manifest.has_activation_event(&event) {
                return Err(Error::validation(format!(
                    "extension {} is not active and does not declare {event}",
                    record.id
                )));
            }
            self.activate_record(&record).await?;
        }

        let id = new_request_id();
        self.request(
            &record,
            id.clone(),
            HostToWorker::InvokeDataConnector {
                id,
                connector: connector.to_string(),
                method: method.to_string(),
                args,
            },
            self.inner.config.data_connector_timeout,
            &format!("data connector {connector}.{method}"),
        )
        .await
    }

    // ─── Lifecycle management ───────────────────────────────────────────────

    /// Terminate the worker, keeping the record and manifest
    /// contributions. A fresh worker spawns lazily on the next request.
    pub fn reload_extension(&self, extension_id: &str) -> Result<()> {
        let record = self.record(extension_id)?;
        self.terminate_worker(&record, None, &Error::worker_terminated(extension_id));
        Ok(())
    }

    /// Terminate the worker and erase the record and all contributions.
    pub fn unload_extension(&self, extension_id: &str) -> Result<()> {
        let record = self.record(extension_id)?;
        self.terminate_worker(&record, None, &Error::worker_terminated(extension_id));
        self.inner.registry.remove_extension(extension_id);
        self.inner
            .extensions
            .lock()
            .expect("extensions poisoned")
            .remove(extension_id);
        self.inner.audit.log(AuditEvent {
            principal: Principal::extension(extension_id),
            action: "extension.unloaded".to_string(),
            api_key: None,
            permissions: Vec::new(),
            url: None,
            message: "unloaded".to_string(),
        });
        Ok(())
    }

    /// Terminate every worker and drop every record. Persisted permission
    /// grants and storage survive.
    pub fn dispose(&self) {
        let records: Vec<_> = {
            let mut extensions = self.inner.extensions.lock().expect("extensions poisoned");
            let records = extensions.values().cloned().collect();
            extensions.clear();
            records
        };
        for record in records {
            self.terminate_worker(&record, None, &Error::worker_terminated(&record.id));
            self.inner.registry.remove_extension(&record.id);
        }
    }

    /// Reload the extension and clear its permissions, storage entries,
    /// and on-disk data directories. Clearing is best-effort, never fatal.
    pub fn reset_extension_state(&self, extension_id: &str) -> Result<()> {
        let record = self.record(extension_id)?;
        self.terminate_worker(&record, None, &Error::worker_terminated(extension_id));

        if let Err(err) = self.inner.permissions.reset(extension_id) {
            tracing::warn!(extension = %extension_id, "permission reset failed: {err}");
        }
        if let Err(err) = self.inner.storage.clear_extension(extension_id) {
            tracing::warn!(extension = %extension_id, "storage reset failed: {err}");
        }
        let data_dir = self.inner.config.extension_data_dir(extension_id);
        if let Err(err) = std::fs::remove_dir_all(&data_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(extension = %extension_id, "data dir removal failed: {err}");
            }
        }
        self.inner.audit.log(AuditEvent {
            principal: Principal::extension(extension_id),
            action: "extension.reset".to_string(),
            api_key: None,
            permissions: Vec::new(),
            url: None,
            message: "state reset".to_string(),
        });
        Ok(())
    }

    // ─── Host-application surface ───────────────────────────────────────────

    /// Broadcast `beforeSave` with the current workbook snapshot.
    pub fn before_save(&self) -> Result<()> {
        let snapshot = self.workbook_snapshot()?;
        self.broadcast(&HostEvent::before_save(snapshot));
        Ok(())
    }

    /// Loaded-extension snapshot for the application's extension list.
    #[must_use]
    pub fn extensions(&self) -> Vec<ExtensionInfo> {
        self.records()
            .into_iter()
            .map(|record| ExtensionInfo {
                id: record.id.clone(),
                display_name: record.manifest.display_name().to_string(),
                version: record.manifest.version.to_string(),
                active: record.is_active(),
                lifecycle: lifecycle_name(record.lifecycle()),
            })
            .collect()
    }

    /// Deliver a renderer-originated message to the panel's owning worker.
    pub fn post_message_to_extension_panel(&self, panel_id: &str, message: Value) -> Result<()> {
        let panel = self
            .inner
            .registry
            .panel(panel_id)
            .ok_or_else(|| Error::validation(format!("unknown panel: {panel_id}")))?;
        let record = self.record(&panel.extension_id)?;
        if let Some(worker) = record.worker_handle() {
            worker.post(
                &record.id,
                HostToWorker::PanelMessage {
                    panel_id: panel_id.to_string(),
                    message,
                },
            )?;
        }
        Ok(())
    }

    /// Drain a panel's renderer-bound message queue.
    #[must_use]
    pub fn drain_panel_messages(&self, panel_id: &str) -> Vec<Value> {
        self.inner.registry.drain_panel_messages(panel_id)
    }

    #[must_use]
    pub fn panels(&self) -> Vec<Panel> {
        self.inner.registry.panels()
    }

    #[must_use]
    pub fn context_menus(&self) -> Vec<ContextMenuRegistration> {
        self.inner.registry.context_menus()
    }

    /// All declared keybindings, for the renderer's keymap. Purely
    /// declarative; the host attaches no runtime behavior to them.
    #[must_use]
    pub fn keybindings(&self) -> Vec<(String, Keybinding)> {
        self.records()
            .into_iter()
            .flat_map(|record| {
                record
                    .manifest
                    .contributes
                    .keybindings
                    .iter()
                    .map(|binding| (record.id.clone(), binding.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn revoke_permissions(&self, extension_id: &str, permissions: &[Permission]) -> Result<()> {
        self.inner.permissions.revoke(extension_id, permissions)
    }

    pub fn reset_permissions(&self, extension_id: &str) -> Result<()> {
        self.inner.permissions.reset(extension_id)
    }

    pub fn reset_all_permissions(&self) -> Result<()> {
        self.inner.permissions.reset_all()
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    fn records(&self) -> Vec<Arc<ExtensionRecord>> {
        self.inner
            .extensions
            .lock()
            .expect("extensions poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn record(&self, extension_id: &str) -> Result<Arc<ExtensionRecord>> {
        self.inner
            .extensions
            .lock()
            .expect("extensions poisoned")
            .get(extension_id)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown extension: {extension_id}")))
    }

    pub(crate) fn workbook_snapshot(&self) -> Result<Value> {
        let sheet = &self.inner.spreadsheet;
        Ok(json!({
            "name": sheet.workbook_name(),
            "sheets": sheet.list_sheets()?,
            "activeSheet": sheet.get_active_sheet()?,
        }))
    }

    /// Deliver an event to every active extension, skipping workers that
    /// fail to accept it (they are likely terminating).
    pub(crate) fn broadcast(&self, event: &HostEvent) {
        for record in self.records() {
            if record.is_active() {
                self.post_event_to(&record, event);
            }
        }
    }

    /// Spawn (or reuse) the extension's worker. Concurrent spawn attempts
    /// are serialized per record.
    pub(crate) async fn ensure_worker(&self, record: &Arc<ExtensionRecord>) -> Result<WorkerHandle> {
        if let Some(handle) = record.worker_handle() {
            return Ok(handle);
        }
        let _guard = record.spawn_lock.lock().await;
        if let Some(handle) = record.worker_handle() {
            return Ok(handle);
        }

        let generation = record.next_generation();
        let spec = WorkerSpec {
            extension_id: record.id.clone(),
            extension_root: record.root.clone(),
            entrypoint: record.entrypoint.clone(),
            global_storage_path: record.global_storage_path.clone(),
            workspace_storage_path: record.workspace_storage_path.clone(),
            memory_limit: self.inner.config.worker_memory_limit,
            gc_threshold: self.inner.config.worker_gc_threshold(),
        };
        let (handle, receiver) = spawn_worker(
            spec,
            generation,
            self.inner.config.spawn_retry_attempts,
            self.inner.config.spawn_retry_base,
        )
        .await?;
        record.install_worker(handle.clone());
        self.spawn_pump(Arc::clone(record), receiver, generation);
        Ok(handle)
    }

    /// Consume worker-originated messages until the worker exits, then run
    /// termination bookkeeping (guarded by generation against replacements).
    fn spawn_pump(
        &self,
        record: Arc<ExtensionRecord>,
        mut receiver: UnboundedReceiver<WorkerToHost>,
        generation: u64,
    ) {
        let host = self.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    WorkerToHost::ApiCall {
                        id,
                        namespace,
                        method,
                        args,
                    } => {
                        // Handlers may suspend; responses are correlated by
                        // id, so interleaving with later messages is safe.
                        let host = host.clone();
                        let record = Arc::clone(&record);
                        tokio::spawn(async move {
                            let reply = match host
                                .dispatch_api(&record, &namespace, &method, args)
                                .await
                            {
                                Ok(result) => HostToWorker::ApiResult { id, result },
                                Err(err) => HostToWorker::ApiError {
                                    id,
                                    error: WireError::from(&err),
                                },
                            };
                            if let Some(worker) = record.worker_handle() {
                                if worker.generation == generation {
                                    let _ = worker.post(&record.id, reply);
                                }
                            }
                        });
                    }
                    WorkerToHost::Log { level, message } => match level.as_str() {
                        "error" => tracing::error!(target: "extension", extension = %record.id, "{message}"),
                        "warn" => tracing::warn!(target: "extension", extension = %record.id, "{message}"),
                        "debug" => tracing::debug!(target: "extension", extension = %record.id, "{message}"),
                        _ => tracing::info!(target: "extension", extension = %record.id, "{message}"),
                    },
                    WorkerToHost::Audit { event } => {
                        host.inner.audit.log(AuditEvent {
                            principal: Principal::extension(&record.id),
                            action: "extension.audit".to_string(),
                            api_key: None,
                            permissions: Vec::new(),
                            url: None,
                            message: event.to_string(),
                        });
                    }
                    reply => {
                        if let Some(id) = reply.reply_id() {
                            let id = id.to_string();
                            if let Some(outcome) = reply.reply_outcome() {
                                record.resolve_pending(&id, outcome);
                            }
                        }
                    }
                }
            }
            // Worker thread ended: crash, fatal error, or requested
            // termination. Bookkeeping is identical; the generation guard
            // skips it when a newer worker already replaced this one.
            host.terminate_worker(&record, Some(generation), &Error::worker_terminated(&record.id));
        });
    }

    /// Send a request and await its reply under `timeout`. Expiry rejects
    /// the caller with `EXTENSION_TIMEOUT` and terminates the worker;
    /// other pending requests are rejected with
    /// `EXTENSION_WORKER_TERMINATED` by the termination path.
    pub(crate) async fn request(
        &self,
        record: &Arc<ExtensionRecord>,
        id: String,
        message: HostToWorker,
        timeout: Duration,
        what: &str,
    ) -> Result<Value> {
        let handle = self.ensure_worker(record).await?;
        let receiver = record.register_pending(&id);
        if let Err(err) = handle.post(&record.id, message) {
            record.remove_pending(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(wire))) => Err(Error::from(wire)),
            Ok(Err(_dropped)) => Err(Error::worker_terminated(&record.id)),
            Err(_elapsed) => {
                record.remove_pending(&id);
                #[allow(clippy::cast_possible_truncation)]
                let err = Error::timeout(what, &record.id, timeout.as_millis() as u64);
                self.terminate_worker(record, None, &err);
                Err(err)
            }
        }
    }

    /// Idempotent activation: concurrent triggers coalesce onto a single
    /// attempt and observe the same outcome.
    pub(crate) async fn activate_record(&self, record: &Arc<ExtensionRecord>) -> Result<()> {
        if record.is_active() {
            return Ok(());
        }
        let (future, _started) = record.activation_future(|| {
            let host = self.clone();
            let record = Arc::clone(record);
            async move { host.do_activate(&record).await }.boxed().shared()
        });
        let result = future.await;
        record.clear_activation_slot();
        result
    }

    async fn do_activate(&self, record: &Arc<ExtensionRecord>) -> Result<()> {
        record.set_lifecycle(Lifecycle::Activating);
        let id = new_request_id();
        let message = HostToWorker::Activate {
            id: id.clone(),
            context: Value::Null,
        };
        match self
            .request(
                record,
                id,
                message,
                self.inner.config.activation_timeout,
                "activation",
            )
            .await
        {
            Ok(_) => {
                record.mark_active();
                tracing::debug!(extension = %record.id, "activated");
                Ok(())
            }
            Err(err) => {
                // activating -> dead, regardless of the failure kind.
                self.terminate_worker(record, None, &err);
                Err(err)
            }
        }
    }

    /// Shared termination bookkeeping. Never throws; safe to call twice.
    /// With `generation` set, only the matching worker is terminated
    /// (stale exit notifications are ignored).
    pub(crate) fn terminate_worker(
        &self,
        record: &Arc<ExtensionRecord>,
        generation: Option<u64>,
        reason: &Error,
    ) {
        let handle = record.begin_termination(generation);
        if handle.is_none() && generation.is_some() {
            return;
        }
        if let Some(handle) = handle {
            handle.interrupt();
        }
        record.reject_all_pending(reason);
        self.inner.registry.clear_runtime_artifacts(&record.id);
        record
            .registered_commands
            .lock()
            .expect("registered commands poisoned")
            .clear();
        self.inner.websockets.close_for_extension(&record.id);
        record.drop_activation_slot();
        record.finish_termination();
        tracing::debug!(extension = %record.id, "worker terminated: {reason}");
    }

    async fn wait_for_panel_html(&self, panel_id: &str) {
        let deadline = tokio::time::Instant::now() + self.inner.config.panel_html_timeout;
        loop {
            if self
                .inner
                .registry
                .panel(panel_id)
                .is_some_and(|panel| !panel.html.is_empty())
            {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(panel = %panel_id, "timed out waiting for panel HTML");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
