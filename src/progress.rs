//! Per-request progress files for long-running workflows (spec §4.3).
//!
//! A workflow that will not finish inside one request's response cycle
//! writes its progress to a temp file, line by line, and hands the file's
//! URL path back to the caller in the initial `{status: "running", ...}`
//! response. A dedicated streaming route tails that file and forwards each
//! line until it reads the completion sentinel or the worker dies.
//!
//! Every spawned worker is registered in a supervised set keyed by a
//! stable-prefixed name (spec §4.3 invariant, Design Note §9 "threads named
//! with a prefix"), so [`crate::state::AppState`]'s shutdown path can await
//! every outstanding one instead of racing the process exit against them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

/// Written as the final line of a progress file on success.
pub const COMPLETION_SENTINEL: &str = "__XOLO_PROGRESS_COMPLETE__";

/// Prefix every progress-worker task name carries, so the shutdown
/// coordinator can tell them apart from watcher tasks in logs and metrics.
pub const PROGRESS_WORKER_PREFIX: &str = "xolo-progress-";

/// Handle to a single long-running workflow's progress file. Cloned and
/// moved into the spawned workflow task; the HTTP handler keeps only the
/// `stream_file` path to hand back to the client.
#[derive(Clone)]
pub struct ProgressHandle {
    path: Arc<PathBuf>,
    writer: Arc<AsyncMutex<Option<tokio::fs::File>>>,
}

impl ProgressHandle {
    fn new(path: PathBuf) -> Self {
        ProgressHandle {
            path: Arc::new(path),
            writer: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_open(&self) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            *guard = Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&*self.path)
                    .await?,
            );
        }
        Ok(())
    }

    /// Appends one progress line, optionally echoing it at `log_level`
    /// through `tracing` (spec §4.3: "optionally emits at the given log
    /// level").
    pub async fn progress(&self, msg: impl AsRef<str>, log_level: Option<tracing::Level>) {
        let msg = msg.as_ref();
        if let Err(e) = self.write_line(msg).await {
            warn!(path = %self.path.display(), error = %e, "failed to write progress line");
        }
        match log_level {
            Some(tracing::Level::ERROR) => error!("{msg}"),
            Some(tracing::Level::WARN) => warn!("{msg}"),
            Some(_) => tracing::info!("{msg}"),
            None => {}
        }
    }

    /// Always emitted on workflow failure, per spec §4.3.
    pub async fn error(&self, msg: impl AsRef<str>) {
        let line = format!("ERROR: {}", msg.as_ref());
        if let Err(e) = self.write_line(&line).await {
            warn!(path = %self.path.display(), error = %e, "failed to write progress error line");
        }
        error!("{}", msg.as_ref());
    }

    pub async fn complete(&self) {
        if let Err(e) = self.write_line(COMPLETION_SENTINEL).await {
            warn!(path = %self.path.display(), error = %e, "failed to write progress completion sentinel");
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        self.ensure_open().await?;
        let mut guard = self.writer.lock().await;
        let file = guard.as_mut().expect("ensure_open just initialized this");
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }
}

/// Owns the registry of live progress workers so shutdown can await them.
pub struct ProgressRegistry {
    dir: PathBuf,
    handles: AsyncMutex<Vec<(String, JoinHandle<()>)>>,
}

impl ProgressRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ProgressRegistry {
            dir: dir.into(),
            handles: AsyncMutex::new(Vec::new()),
        }
    }

    /// Creates a fresh progress file and spawns `workflow` with a
    /// [`ProgressHandle`] into it, returning the handle's path (for the
    /// initial `{status: "running", ...}` response) immediately.
    pub async fn spawn<F, Fut>(&self, label: &str, workflow: F) -> PathBuf
    where
        F: FnOnce(ProgressHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let filename = format!("{}{}-{}.progress", PROGRESS_WORKER_PREFIX, label, Uuid::new_v4());
        let path = self.dir.join(filename);
        let handle = ProgressHandle::new(path.clone());
        let name = format!("{PROGRESS_WORKER_PREFIX}{label}");

        let task_handle = tokio::spawn({
            let handle = handle.clone();
            async move { workflow(handle).await }
        });

        let mut handles = self.handles.lock().await;
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((name, task_handle));

        path
    }

    pub async fn outstanding_count(&self) -> usize {
        let mut handles = self.handles.lock().await;
        handles.retain(|(_, h)| !h.is_finished());
        handles.len()
    }

    /// Waits up to `budget` for every registered worker to finish, logging
    /// which ones (if any) did not (spec §5 shutdown: "waits for ... all
    /// named progress workers to terminate").
    pub async fn drain(&self, budget: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let remaining_names: Vec<String> = {
                let mut handles = self.handles.lock().await;
                handles.retain(|(_, h)| !h.is_finished());
                handles.iter().map(|(n, _)| n.clone()).collect()
            };
            if remaining_names.is_empty() || tokio::time::Instant::now() >= deadline {
                if !remaining_names.is_empty() {
                    warn!(workers = ?remaining_names, "shutdown proceeding with progress workers still outstanding");
                }
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }
}

/// Tails `path` line-by-line, forwarding each to `tx`, stopping at
/// [`COMPLETION_SENTINEL`] or when no new line appears after `idle_timeout`
/// (guards against a crashed worker that never wrote the sentinel). Never
/// called while holding an entity lock (spec §4.3 invariant).
pub async fn tail_progress_file(
    path: PathBuf,
    tx: mpsc::Sender<String>,
    idle_timeout: std::time::Duration,
) {
    let mut retries = 0;
    let file = loop {
        match tokio::fs::File::open(&path).await {
            Ok(f) => break f,
            Err(_) if retries < 50 => {
                retries += 1;
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            Err(e) => {
                let _ = tx.send(format!("ERROR: progress file never appeared: {e}")).await;
                return;
            }
        }
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::time::timeout(idle_timeout, reader.read_line(&mut line)).await;
        match read {
            Ok(Ok(0)) => {
                // No new bytes; give the writer a moment and seek back in
                // case more arrives (blocking-read-loop per spec §4.3).
                tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                let _ = reader.get_mut().stream_position().await;
                continue;
            }
            Ok(Ok(_)) => {
                let text = line.trim_end_matches('\n').to_string();
                if text == COMPLETION_SENTINEL {
                    return;
                }
                if tx.send(text).await.is_err() {
                    return;
                }
            }
            Ok(Err(e)) => {
                let _ = tx.send(format!("ERROR: reading progress file: {e}")).await;
                return;
            }
            Err(_) => {
                let _ = tx
                    .send("ERROR: progress stream timed out waiting for worker output".into())
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn progress_then_complete_round_trips() {
        let dir = tempdir().unwrap();
        let registry = ProgressRegistry::new(dir.path());
        let path = registry
            .spawn("test", |handle| async move {
                handle.progress("step 1", None).await;
                handle.progress("step 2", None).await;
                handle.complete().await;
            })
            .await;

        // give the spawned task a moment to finish writing.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("step 1"));
        assert!(content.contains("step 2"));
        assert!(content.ends_with(&format!("{COMPLETION_SENTINEL}\n")));
    }

    #[tokio::test]
    async fn drain_returns_once_worker_finishes() {
        let dir = tempdir().unwrap();
        let registry = ProgressRegistry::new(dir.path());
        registry
            .spawn("test", |handle| async move {
                handle.complete().await;
            })
            .await;
        registry.drain(std::time::Duration::from_secs(2)).await;
        assert_eq!(registry.outstanding_count().await, 0);
    }
}
