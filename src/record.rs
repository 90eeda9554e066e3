//! Per-extension state owned by the host.

use crate::error::{CODE_WORKER_TERMINATED, Error, Result};
use crate::manifest::Manifest;
use crate::protocol::WireError;
use crate::worker::WorkerHandle;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Extension lifecycle, as observed by host callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Loaded,
    Activating,
    Active,
    Terminating,
    Dead,
}

pub(crate) type ActivationFuture = Shared<BoxFuture<'static, Result<()>>>;

#[derive(Debug)]
pub(crate) struct WorkerState {
    pub worker: Option<WorkerHandle>,
    pub active: bool,
    pub lifecycle: Lifecycle,
    next_generation: u64,
}

/// One loaded extension: manifest, worker handle, in-flight requests, and
/// runtime registrations. Destroyed on unload or dispose.
pub(crate) struct ExtensionRecord {
    pub id: String,
    pub manifest: Manifest,
    pub root: PathBuf,
    pub entrypoint: PathBuf,
    pub global_storage_path: PathBuf,
    pub workspace_storage_path: PathBuf,

    state: Mutex<WorkerState>,
    pending: Mutex<HashMap<String, oneshot::Sender<std::result::Result<Value, WireError>>>>,
    /// Command ids registered at runtime; cleared on worker termination.
    pub registered_commands: Mutex<HashSet<String>>,
    /// Coalesces concurrent activation attempts onto one future.
    pub(crate) activation: Mutex<Option<ActivationFuture>>,
    /// Serializes concurrent worker spawn attempts.
    pub(crate) spawn_lock: tokio::sync::Mutex<()>,
}

impl ExtensionRecord {
    pub fn new(
        manifest: Manifest,
        root: PathBuf,
        entrypoint: PathBuf,
        global_storage_path: PathBuf,
        workspace_storage_path: PathBuf,
    ) -> Self {
        Self {
            id: manifest.extension_id(),
            manifest,
            root,
            entrypoint,
            global_storage_path,
            workspace_storage_path,
            state: Mutex::new(WorkerState {
                worker: None,
                active: false,
                lifecycle: Lifecycle::Loaded,
                next_generation: 0,
            }),
            pending: Mutex::new(HashMap::new()),
            registered_commands: Mutex::new(HashSet::new()),
            activation: Mutex::new(None),
            spawn_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().expect("record poisoned").active
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().expect("record poisoned").lifecycle
    }

    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.state.lock().expect("record poisoned").lifecycle = lifecycle;
    }

    pub fn mark_active(&self) {
        let mut state = self.state.lock().expect("record poisoned");
        state.active = true;
        state.lifecycle = Lifecycle::Active;
    }

    pub fn worker_handle(&self) -> Option<WorkerHandle> {
        self.state.lock().expect("record poisoned").worker.clone()
    }

    pub fn next_generation(&self) -> u64 {
        let mut state = self.state.lock().expect("record poisoned");
        state.next_generation += 1;
        state.next_generation
    }

    pub fn install_worker(&self, handle: WorkerHandle) {
        let mut state = self.state.lock().expect("record poisoned");
        if state.lifecycle == Lifecycle::Dead {
            state.lifecycle = Lifecycle::Loaded;
        }
        state.worker = Some(handle);
    }

    /// Take the current worker for termination, flipping lifecycle to
    /// `Terminating`. Returns `None` when termination already happened.
    pub fn begin_termination(&self, generation: Option<u64>) -> Option<WorkerHandle> {
        let mut state = self.state.lock().expect("record poisoned");
        if let Some(generation) = generation {
            if state.worker.as_ref().map(|w| w.generation) != Some(generation) {
                return None;
            }
        }
        state.active = false;
        if state.worker.is_some() {
            state.lifecycle = Lifecycle::Terminating;
        }
        state.worker.take()
    }

    pub fn finish_termination(&self) {
        let mut state = self.state.lock().expect("record poisoned");
        state.active = false;
        state.lifecycle = Lifecycle::Dead;
    }

    pub fn register_pending(
        &self,
        id: &str,
    ) -> oneshot::Receiver<std::result::Result<Value, WireError>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(id.to_string(), tx);
        rx
    }

    pub fn remove_pending(&self, id: &str) {
        self.pending.lock().expect("pending table poisoned").remove(id);
    }

    /// Fulfil one pending request; unknown ids are dropped silently (the
    /// caller may have timed out already).
    pub fn resolve_pending(&self, id: &str, outcome: std::result::Result<Value, WireError>) {
        let entry = self.pending.lock().expect("pending table poisoned").remove(id);
        if let Some(tx) = entry {
            let _ = tx.send(outcome);
        }
    }

    /// Reject everything in flight. After this the pending table is empty.
    pub fn reject_all_pending(&self, reason: &Error) {
        let entries: Vec<_> = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .drain()
            .collect();
        for (_, tx) in entries {
            let _ = tx.send(Err(WireError {
                message: reason.to_string(),
                name: Some("ExtensionWorkerTerminatedError".to_string()),
                code: Some(CODE_WORKER_TERMINATED.to_string()),
                stack: None,
            }));
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }

    /// Current activation future, installing `make()` when none is in
    /// flight. Returns `(future, started)`.
    pub(crate) fn activation_future(
        &self,
        make: impl FnOnce() -> ActivationFuture,
    ) -> (ActivationFuture, bool) {
        let mut slot = self.activation.lock().expect("activation slot poisoned");
        if let Some(existing) = slot.as_ref() {
            (existing.clone(), false)
        } else {
            let fut = make();
            *slot = Some(fut.clone());
            (fut, true)
        }
    }

    /// Drop the activation slot once its future has settled.
    pub(crate) fn clear_activation_slot(&self) {
        let mut slot = self.activation.lock().expect("activation slot poisoned");
        if slot.as_ref().is_some_and(|fut| fut.peek().is_some()) {
            *slot = None;
        }
    }

    /// Forcibly drop the slot (termination path).
    pub(crate) fn drop_activation_slot(&self) {
        *self.activation.lock().expect("activation slot poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ValidateOptions, validate};
    use semver::Version;
    use serde_json::json;

    fn record() -> ExtensionRecord {
        let raw = json!({
            "name": "x",
            "version": "1.0.0",
            "publisher": "t",
            "main": "./e.js",
            "engines": { "formula": "^1.0.0" }
        });
        let version = Version::new(1, 0, 0);
        let manifest = validate(
            &raw,
            ValidateOptions {
                engine_version: &version,
                enforce_engine: true,
            },
        )
        .unwrap();
        ExtensionRecord::new(
            manifest,
            PathBuf::from("/ext"),
            PathBuf::from("/ext/e.js"),
            PathBuf::from("/data/g"),
            PathBuf::from("/data/w"),
        )
    }

    #[tokio::test]
    async fn pending_rejection_empties_table_and_notifies_callers() {
        let record = record();
        let rx1 = record.register_pending("r1");
        let rx2 = record.register_pending("r2");
        assert_eq!(record.pending_len(), 2);

        record.reject_all_pending(&Error::worker_terminated("t.x"));
        assert_eq!(record.pending_len(), 0);

        for rx in [rx1, rx2] {
            let outcome = rx.await.unwrap();
            let err = Error::from(outcome.unwrap_err());
            assert_eq!(err.code(), Some(CODE_WORKER_TERMINATED));
            assert_eq!(err.name(), "ExtensionWorkerTerminatedError");
        }
    }

    #[tokio::test]
    async fn resolve_pending_is_single_shot() {
        let record = record();
        let rx = record.register_pending("r1");
        record.resolve_pending("r1", Ok(json!(42)));
        record.resolve_pending("r1", Ok(json!(43)));
        assert_eq!(rx.await.unwrap().unwrap(), json!(42));
        assert_eq!(record.pending_len(), 0);
    }

    #[test]
    fn lifecycle_transitions() {
        let record = record();
        assert_eq!(record.lifecycle(), Lifecycle::Loaded);
        record.set_lifecycle(Lifecycle::Activating);
        record.mark_active();
        assert!(record.is_active());

        assert!(record.begin_termination(None).is_none());
        record.finish_termination();
        assert_eq!(record.lifecycle(), Lifecycle::Dead);
        assert!(!record.is_active());
    }

    #[test]
    fn stale_generation_does_not_begin_termination() {
        let record = record();
        // No worker installed; any generation-gated request is a no-op.
        assert!(record.begin_termination(Some(7)).is_none());
        assert_ne!(record.lifecycle(), Lifecycle::Terminating);
    }
}
