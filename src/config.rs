//! Host configuration.

use semver::Version;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cap on cells in one range read/write or selection payload.
pub const DEFAULT_MAX_RANGE_CELLS: u64 = 200_000;

/// Default worker heap cap (old generation). Zero disables the cap.
pub const DEFAULT_WORKER_MEMORY_LIMIT: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root directory for host-owned state (`permissions.json`,
    /// `storage.json`, `extension-data/`).
    pub data_root: PathBuf,

    /// Version of the host's spreadsheet engine, checked against each
    /// manifest's `engines.formula` range.
    pub engine_version: Version,

    /// Whether `engines.formula` mismatches reject the manifest.
    pub enforce_engine: bool,

    pub activation_timeout: Duration,
    pub command_timeout: Duration,
    pub custom_function_timeout: Duration,
    pub data_connector_timeout: Duration,

    /// How long `activateView` waits for a contributed panel's HTML.
    pub panel_html_timeout: Duration,

    /// Cap on cells per range operation and per selection payload.
    pub max_range_cells: u64,

    /// Worker heap cap in bytes; zero disables it. The young-generation
    /// threshold is derived as `clamp(16 MiB, cap/4, 64 MiB)`.
    pub worker_memory_limit: usize,

    /// Bounded retry for transient worker spawn failures (`EAGAIN`).
    pub spawn_retry_attempts: u32,
    pub spawn_retry_base: Duration,
}

impl HostConfig {
    #[must_use]
    pub fn new(data_root: impl Into<PathBuf>, engine_version: Version) -> Self {
        Self {
            data_root: data_root.into(),
            engine_version,
            enforce_engine: true,
            activation_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            custom_function_timeout: Duration::from_secs(30),
            data_connector_timeout: Duration::from_secs(30),
            panel_html_timeout: Duration::from_secs(5),
            max_range_cells: DEFAULT_MAX_RANGE_CELLS,
            worker_memory_limit: DEFAULT_WORKER_MEMORY_LIMIT,
            spawn_retry_attempts: 5,
            spawn_retry_base: Duration::from_millis(10),
        }
    }

    #[must_use]
    pub fn permissions_path(&self) -> PathBuf {
        self.data_root.join("permissions.json")
    }

    #[must_use]
    pub fn storage_path(&self) -> PathBuf {
        self.data_root.join("storage.json")
    }

    #[must_use]
    pub fn extension_data_dir(&self, extension_id: &str) -> PathBuf {
        self.data_root.join("extension-data").join(extension_id)
    }

    #[must_use]
    pub fn global_storage_dir(&self, extension_id: &str) -> PathBuf {
        self.extension_data_dir(extension_id).join("globalStorage")
    }

    #[must_use]
    pub fn workspace_storage_dir(&self, extension_id: &str) -> PathBuf {
        self.extension_data_dir(extension_id)
            .join("workspaceStorage")
    }

    /// Young-generation GC threshold derived from the heap cap.
    #[must_use]
    pub fn worker_gc_threshold(&self) -> usize {
        const MIB: usize = 1024 * 1024;
        if self.worker_memory_limit == 0 {
            return 0;
        }
        (self.worker_memory_limit / 4).clamp(16 * MIB, 64 * MIB)
    }
}

impl HostConfig {
    /// Configuration rooted at `data_root` with engine version 1.0.0.
    /// Intended for tests and embedding hosts that do not enforce engines.
    #[must_use]
    pub fn for_data_root(data_root: impl AsRef<Path>) -> Self {
        Self::new(data_root.as_ref().to_path_buf(), Version::new(1, 0, 0))
    }
}
