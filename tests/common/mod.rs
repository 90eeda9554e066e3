//! Shared harness for integration tests: temp data root, in-memory
//! spreadsheet, scripted permission prompt, recording audit sink, and
//! on-disk extension fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use formula_host::audit::{AuditEvent, AuditSink};
use formula_host::permissions::{PermissionPrompt, PromptRequest};
use formula_host::spreadsheet::InMemorySpreadsheet;
use formula_host::{ExtensionHost, HostConfig};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Install a stderr subscriber once per test binary so `RUST_LOG` makes
/// host and worker traces visible when a test fails.
fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Prompt double: answers from an override queue, then a default.
pub struct ScriptedPrompt {
    default_answer: bool,
    overrides: Mutex<VecDeque<bool>>,
    pub requests: Mutex<Vec<PromptRequest>>,
}

impl ScriptedPrompt {
    pub fn allow_all() -> Arc<Self> {
        Arc::new(Self {
            default_answer: true,
            overrides: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn deny_all() -> Arc<Self> {
        Arc::new(Self {
            default_answer: false,
            overrides: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answer the next prompts from `answers`, then fall back to `default`.
    pub fn with_answers(default: bool, answers: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            default_answer: default,
            overrides: Mutex::new(answers.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<PromptRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PermissionPrompt for ScriptedPrompt {
    async fn request(&self, request: PromptRequest) -> bool {
        self.requests.lock().unwrap().push(request);
        self.overrides
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_answer)
    }
}

pub struct RecordingAudit {
    pub events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn actions(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.action.clone())
            .collect()
    }
}

impl AuditSink for RecordingAudit {
    fn log(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct TestHarness {
    pub dir: tempfile::TempDir,
    pub host: ExtensionHost,
    pub sheet: Arc<InMemorySpreadsheet>,
    pub prompt: Arc<ScriptedPrompt>,
    pub audit: Arc<RecordingAudit>,
}

impl TestHarness {
    pub fn data_root(&self) -> PathBuf {
        self.dir.path().join("host-data")
    }

    /// Write an extension package (manifest + sources) under the temp dir.
    pub fn write_extension(
        &self,
        dir_name: &str,
        manifest: &Value,
        sources: &[(&str, &str)],
    ) -> PathBuf {
        let root = self.dir.path().join(dir_name);
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("package.json"),
            serde_json::to_string_pretty(manifest).unwrap(),
        )
        .unwrap();
        for (name, source) in sources {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, source).unwrap();
        }
        root
    }

    /// Seed `permissions.json` directly. Only meaningful before the first
    /// permission check (the store loads on demand).
    pub fn seed_permissions(&self, grants: &Value) {
        let path = self.data_root().join("permissions.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_string_pretty(grants).unwrap()).unwrap();
    }
}

pub fn build_harness(
    prompt: Arc<ScriptedPrompt>,
    configure: impl FnOnce(&mut HostConfig),
) -> TestHarness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = HostConfig::for_data_root(dir.path().join("host-data"));
    configure(&mut config);

    let sheet = Arc::new(InMemorySpreadsheet::new());
    let audit = RecordingAudit::new();
    let host = ExtensionHost::new(
        config,
        Arc::clone(&sheet) as Arc<dyn formula_host::spreadsheet::SpreadsheetApi>,
        Arc::clone(&prompt) as Arc<dyn PermissionPrompt>,
        Arc::clone(&audit) as Arc<dyn AuditSink>,
    )
    .unwrap();

    TestHarness {
        dir,
        host,
        sheet,
        prompt,
        audit,
    }
}

pub fn harness() -> TestHarness {
    build_harness(ScriptedPrompt::allow_all(), |_| {})
}
