//! Host-side worker lifecycle: spawning the sandbox thread, posting
//! messages into it, and interrupting it.
//!
//! Spawn failures that look like thread exhaustion (`EAGAIN`) are retried
//! with exponential backoff bounded by a small attempt count; any other
//! error propagates immediately.

use crate::error::{Error, Result};
use crate::protocol::{HostToWorker, WorkerToHost};
use crate::sandbox::{WorkerSpec, worker_main};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedReceiver;

/// Handle to a live worker thread. Dropping the handle (or calling
/// [`WorkerHandle::interrupt`]) lets the thread wind down; rejection of
/// in-flight requests is the host's bookkeeping, not the handle's.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    sender: std::sync::mpsc::Sender<HostToWorker>,
    interrupt: Arc<AtomicBool>,
    /// Monotonic per-extension counter; guards stale exit notifications
    /// from terminating a replacement worker.
    pub generation: u64,
}

impl WorkerHandle {
    /// Post a message to the worker. Fails with a worker-terminated error
    /// when the thread is gone.
    pub fn post(&self, extension_id: &str, message: HostToWorker) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| Error::worker_terminated(extension_id))
    }

    /// Ask the runtime to abort whatever script is executing. Safe to call
    /// multiple times.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

fn is_thread_exhaustion(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc_eagain())
}

const fn libc_eagain() -> i32 {
    // EAGAIN on every platform we build for.
    11
}

/// Spawn a worker thread for `spec`, returning the handle and the stream
/// of worker-originated messages.
pub(crate) async fn spawn_worker(
    spec: WorkerSpec,
    generation: u64,
    retry_attempts: u32,
    retry_base: std::time::Duration,
) -> Result<(WorkerHandle, UnboundedReceiver<WorkerToHost>)> {
    let mut attempt: u32 = 0;
    loop {
        let (inbox_tx, inbox_rx) = std::sync::mpsc::channel();
        let (outbox_tx, outbox_rx) = tokio::sync::mpsc::unbounded_channel();
        let interrupt = Arc::new(AtomicBool::new(false));

        let thread = std::thread::Builder::new().name(format!("formula-ext-{}", spec.extension_id));
        let spawn_result = thread.spawn({
            let spec = spec.clone();
            let interrupt = Arc::clone(&interrupt);
            move || worker_main(spec, inbox_rx, outbox_tx, interrupt)
        });

        match spawn_result {
            Ok(_join) => {
                return Ok((
                    WorkerHandle {
                        sender: inbox_tx,
                        interrupt,
                        generation,
                    },
                    outbox_rx,
                ));
            }
            Err(err) if is_thread_exhaustion(&err) && attempt < retry_attempts => {
                let backoff = retry_base * 2u32.saturating_pow(attempt);
                tracing::warn!(
                    extension = %spec.extension_id,
                    attempt,
                    "worker spawn hit thread exhaustion, retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(Error::io(format!(
                    "failed to spawn worker for {}: {err}",
                    spec.extension_id
                )));
            }
        }
    }
}
