//! The isolated extension runtime.
//!
//! Each worker is an OS thread owning one QuickJS runtime. Before the
//! entrypoint runs, a restricted module resolver/loader pair is installed:
//! the synthetic `"formula"` module resolves to the host API façade,
//! Node-style builtins are denied by name (with or without a `node:`
//! prefix), and file specifiers are realpath-confined to the extension
//! root. The host talks to the worker over plain message channels; all
//! promise plumbing lives in the bundled bootstrap script.

use crate::error::{Error, Result};
use crate::paths::{path_is_inside, safe_canonicalize};
use crate::protocol::{HostToWorker, WireError, WorkerToHost};
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::{Declared, Module};
use rquickjs::{Context, Ctx, Function, Runtime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const BOOTSTRAP_JS: &str = include_str!("assets/bootstrap.js");
const API_MODULE_JS: &str = include_str!("assets/formula-api.js");

/// The one synthetic specifier extensions may import.
pub const API_MODULE_NAME: &str = "formula";

/// Node-style builtin modules that are denied by name. An explicit deny
/// list, not an allowlist of safe modules: unknown bare specifiers are
/// refused separately.
pub const DENIED_BUILTINS: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "crypto",
    "dgram",
    "dns",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "worker_threads",
    "zlib",
];

/// Strip a `node:` prefix so the deny check sees the normalized name.
#[must_use]
pub fn normalize_builtin_name(name: &str) -> &str {
    name.strip_prefix("node:").unwrap_or(name)
}

/// Classify a specifier the way the resolver will treat it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveDecision {
    Api,
    DeniedBuiltin(String),
    UnknownBare(String),
    File(PathBuf),
    EscapesRoot(PathBuf),
}

/// Pure resolution logic, shared by the resolver and its tests.
#[must_use]
pub fn classify_specifier(root: &Path, base: &str, name: &str) -> ResolveDecision {
    if name == API_MODULE_NAME {
        return ResolveDecision::Api;
    }

    let normalized = normalize_builtin_name(name);
    if DENIED_BUILTINS.contains(&normalized) {
        return ResolveDecision::DeniedBuiltin(normalized.to_string());
    }

    let path = Path::new(name);
    let is_pathlike = path.is_absolute() || name.starts_with("./") || name.starts_with("../");
    if !is_pathlike {
        return ResolveDecision::UnknownBare(name.to_string());
    }

    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let base_dir = Path::new(base).parent().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
        base_dir.join(path)
    };

    let mut resolved = safe_canonicalize(&candidate);
    if !resolved.exists() && resolved.extension().is_none() {
        let with_ext = resolved.with_extension("js");
        if with_ext.exists() {
            resolved = with_ext;
        }
    }

    if path_is_inside(root, &resolved) {
        ResolveDecision::File(resolved)
    } else {
        ResolveDecision::EscapesRoot(resolved)
    }
}

/// Module resolver installed into every worker runtime.
pub struct SandboxResolver {
    root: PathBuf,
    /// Set once activation completes; any resolution after that point is a
    /// dynamic import.
    activated: Arc<AtomicBool>,
}

impl SandboxResolver {
    #[must_use]
    pub fn new(root: PathBuf, activated: Arc<AtomicBool>) -> Self {
        Self {
            root: safe_canonicalize(&root),
            activated,
        }
    }
}

impl Resolver for SandboxResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        match classify_specifier(&self.root, base, name) {
            ResolveDecision::Api => Ok(API_MODULE_NAME.to_string()),
            ResolveDecision::DeniedBuiltin(builtin) => {
                let message = if self.activated.load(Ordering::SeqCst) {
                    format!("Dynamic import is not allowed: {builtin}")
                } else {
                    format!("builtin module '{builtin}' is not available in the sandbox")
                };
                Err(rquickjs::Error::new_resolving_message(base, name, message))
            }
            ResolveDecision::UnknownBare(bare) => Err(rquickjs::Error::new_resolving_message(
                base,
                name,
                format!("cannot resolve module '{bare}' in the sandbox"),
            )),
            ResolveDecision::File(path) => Ok(path.to_string_lossy().into_owned()),
            ResolveDecision::EscapesRoot(_) => Err(rquickjs::Error::new_resolving_message(
                base,
                name,
                format!("module path escapes the extension root: {name}"),
            )),
        }
    }
}

/// Module loader: serves the API façade and root-confined files.
pub struct SandboxModuleLoader {
    root: PathBuf,
}

impl SandboxModuleLoader {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root: safe_canonicalize(&root),
        }
    }
}

impl Loader for SandboxModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        if name == API_MODULE_NAME {
            return Module::declare(ctx.clone(), API_MODULE_NAME, API_MODULE_JS);
        }
        let path = Path::new(name);
        if !path_is_inside(&self.root, path) {
            return Err(rquickjs::Error::new_loading_message(
                name,
                "module path escapes the extension root",
            ));
        }
        let source = std::fs::read_to_string(path)
            .map_err(|err| rquickjs::Error::new_loading_message(name, err.to_string()))?;
        Module::declare(ctx.clone(), name, source)
    }
}

/// Everything a worker thread needs to start.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSpec {
    pub extension_id: String,
    pub extension_root: PathBuf,
    pub entrypoint: PathBuf,
    pub global_storage_path: PathBuf,
    pub workspace_storage_path: PathBuf,
    /// Heap cap in bytes; zero disables it.
    pub memory_limit: usize,
    pub gc_threshold: usize,
}

impl WorkerSpec {
    fn activation_context(&self, id: &str) -> serde_json::Value {
        serde_json::json!({
            "requestId": id,
            "extensionId": self.extension_id,
            "entrypoint": self.entrypoint.to_string_lossy(),
            "globalStoragePath": self.global_storage_path.to_string_lossy(),
            "workspaceStoragePath": self.workspace_storage_path.to_string_lossy(),
        })
    }

    /// Merge the storage paths into an `activate` message before it enters
    /// JS; the bootstrap imports the entrypoint from `context.entrypoint`.
    pub(crate) fn prepare(&self, message: HostToWorker) -> HostToWorker {
        match message {
            HostToWorker::Activate { id, .. } => {
                let context = self.activation_context(&id);
                HostToWorker::Activate { id, context }
            }
            other => other,
        }
    }
}

/// Entry point of the worker thread.
pub(crate) fn worker_main(
    spec: WorkerSpec,
    inbox: Receiver<HostToWorker>,
    outbox: UnboundedSender<WorkerToHost>,
    interrupt: Arc<AtomicBool>,
) {
    if let Err(err) = run_worker(&spec, &inbox, &outbox, &interrupt) {
        let _ = outbox.send(WorkerToHost::Log {
            level: "error".to_string(),
            message: format!("worker runtime failed: {err}"),
        });
    }
}

fn run_worker(
    spec: &WorkerSpec,
    inbox: &Receiver<HostToWorker>,
    outbox: &UnboundedSender<WorkerToHost>,
    interrupt: &Arc<AtomicBool>,
) -> Result<()> {
    let runtime = Runtime::new().map_err(|e| Error::sandbox(format!("create runtime: {e}")))?;
    if spec.memory_limit > 0 {
        runtime.set_memory_limit(spec.memory_limit);
        runtime.set_gc_threshold(spec.gc_threshold);
    }
    {
        let interrupt = Arc::clone(interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.load(Ordering::Relaxed))));
    }

    let activated = Arc::new(AtomicBool::new(false));
    runtime.set_loader(
        SandboxResolver::new(spec.extension_root.clone(), Arc::clone(&activated)),
        SandboxModuleLoader::new(spec.extension_root.clone()),
    );

    let context =
        Context::full(&runtime).map_err(|e| Error::sandbox(format!("create context: {e}")))?;
    context
        .with(|ctx| ctx.eval::<(), _>(BOOTSTRAP_JS))
        .map_err(|e| Error::sandbox(format!("bootstrap failed: {e}")))?;

    loop {
        if interrupt.load(Ordering::Relaxed) {
            break;
        }
        pump_jobs(&runtime);
        if !flush_outbox(&context, outbox, &activated) {
            break;
        }

        let message = match next_timer_wait(&context) {
            Some(delay) => match inbox.recv_timeout(delay) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match inbox.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            },
        };

        match message {
            Some(message) => dispatch(&context, &spec.prepare(message), outbox),
            None => run_timers(&context),
        }
    }

    Ok(())
}

/// Run queued promise jobs to quiescence. A job that throws has already
/// surfaced its failure through promise rejection handling in JS.
fn pump_jobs(runtime: &Runtime) {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) | Err(_) => {}
            Ok(false) => break,
        }
    }
}

/// Drain worker-originated messages out of JS. Returns false when the host
/// side is gone.
fn flush_outbox(
    context: &Context,
    outbox: &UnboundedSender<WorkerToHost>,
    activated: &Arc<AtomicBool>,
) -> bool {
    let drained: String = match context.with(|ctx| {
        let drain: Function = ctx.globals().get("__formulaDrain")?;
        drain.call(())
    }) {
        Ok(json) => json,
        Err(_) => return true,
    };
    let Ok(messages) = serde_json::from_str::<Vec<WorkerToHost>>(&drained) else {
        return true;
    };
    for message in messages {
        if matches!(message, WorkerToHost::ActivateResult { .. }) {
            activated.store(true, Ordering::SeqCst);
        }
        if outbox.send(message).is_err() {
            return false;
        }
    }
    true
}

fn next_timer_wait(context: &Context) -> Option<Duration> {
    let millis: f64 = context
        .with(|ctx| {
            let due: Function = ctx.globals().get("__formulaNextTimerDue")?;
            due.call(())
        })
        .ok()?;
    if millis < 0.0 {
        None
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(Duration::from_millis(millis as u64))
    }
}

fn run_timers(context: &Context) {
    let _ = context.with(|ctx| {
        let run: Function = ctx.globals().get("__formulaRunTimers")?;
        run.call::<_, ()>(())
    });
}

/// Hand one host message to the JS dispatcher. A synchronous throw (e.g.
/// malformed message, interrupted runtime) is reported back as the
/// matching error reply so the host's pending entry settles.
fn dispatch(context: &Context, message: &HostToWorker, outbox: &UnboundedSender<WorkerToHost>) {
    let Ok(json) = serde_json::to_string(message) else {
        return;
    };
    let failure: Option<String> = context.with(|ctx| {
        let dispatch: Function = ctx.globals().get("__formulaDispatch").ok()?;
        match dispatch.call::<_, ()>((json.as_str(),)) {
            Ok(()) => None,
            Err(rquickjs::Error::Exception) => {
                // Pull the pending exception so later calls start clean.
                let caught = ctx.catch();
                Some(
                    caught
                        .as_object()
                        .and_then(|obj| obj.get::<_, String>("message").ok())
                        .unwrap_or_else(|| "worker dispatch failed".to_string()),
                )
            }
            Err(err) => Some(err.to_string()),
        }
    });
    if let Some(detail) = failure {
        if let Some(reply) = error_reply_for(message, detail) {
            let _ = outbox.send(reply);
        }
    }
}

/// The error reply matching a request message, if it expects one.
fn error_reply_for(message: &HostToWorker, detail: String) -> Option<WorkerToHost> {
    let error = WireError::new(detail);
    match message {
        HostToWorker::Activate { id, .. } => Some(WorkerToHost::ActivateError {
            id: id.clone(),
            error,
        }),
        HostToWorker::ExecuteCommand { id, .. } => Some(WorkerToHost::CommandError {
            id: id.clone(),
            error,
        }),
        HostToWorker::InvokeCustomFunction { id, .. } => Some(WorkerToHost::CustomFunctionError {
            id: id.clone(),
            error,
        }),
        HostToWorker::InvokeDataConnector { id, .. } => Some(WorkerToHost::DataConnectorError {
            id: id.clone(),
            error,
        }),
        _ => None,
    }
}
