//! Parallel local tree walk
//!
//! A fixed pool of tokio tasks drains a bounded queue of directories. A
//! worker that finds the queue full keeps the subdirectory on its own
//! depth-first stack, so discovery never blocks and never spawns extra tasks.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tidesync_core::{ItemMetadata, SyncError, SyncResult};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::pattern::ExcludeSet;

pub const DEFAULT_SCAN_WORKERS: usize = 8;
pub const MAX_SCAN_WORKERS: usize = 32;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Scanner {
    workers: usize,
    queue_capacity: usize,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_WORKERS)
    }
}

impl Scanner {
    /// `workers` is clamped to 1..=32
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.clamp(1, MAX_SCAN_WORKERS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Every regular file under `root` not matched by `excludes`, sorted by
    /// root-relative path.
    pub async fn scan(
        &self,
        cancel: &CancellationToken,
        root: &Path,
        excludes: &ExcludeSet,
    ) -> SyncResult<Vec<ItemMetadata>> {
        let root_meta = tokio::fs::metadata(root)
            .await
            .map_err(|source| SyncError::Scan {
                path: root.to_path_buf(),
                source,
            })?;
        if !root_meta.is_dir() {
            return Err(SyncError::Scan {
                path: root.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            });
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let state = Arc::new(ScanState {
            root: root.to_path_buf(),
            excludes: excludes.clone(),
            pending: AtomicUsize::new(1),
            done: cancel.child_token(),
            items: Mutex::new(Vec::new()),
            first_error: Mutex::new(None),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        });
        state
            .tx
            .try_send(root.to_path_buf())
            .map_err(|e| SyncError::Other(anyhow::anyhow!("seeding scan queue: {e}")))?;

        tracing::debug!(root = %root.display(), workers = self.workers, "scan started");
        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            workers.spawn(run_worker(state.clone()));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                state.fail(SyncError::Other(anyhow::anyhow!("scan worker panicked: {e}")));
            }
        }

        if let Some(err) = state
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut items = std::mem::take(&mut *state.items.lock().unwrap_or_else(PoisonError::into_inner));
        items.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!(root = %root.display(), files = items.len(), "scan complete");
        Ok(items)
    }
}

struct ScanState {
    root: PathBuf,
    excludes: ExcludeSet,
    /// Directories discovered but not yet fully read
    pending: AtomicUsize,
    /// Fires on completion, first error, or outer cancellation
    done: CancellationToken,
    items: Mutex<Vec<ItemMetadata>>,
    first_error: Mutex<Option<SyncError>>,
    tx: mpsc::Sender<PathBuf>,
    rx: tokio::sync::Mutex<mpsc::Receiver<PathBuf>>,
}

impl ScanState {
    fn fail(&self, err: SyncError) {
        let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        self.done.cancel();
    }

    fn finish_dir(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.cancel();
        }
    }

    /// Queue a subdirectory, or keep it local when the queue is full
    fn discover(&self, dir: PathBuf, stack: &mut Vec<PathBuf>) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.tx.try_send(dir) {
            let dir = match e {
                mpsc::error::TrySendError::Full(dir) | mpsc::error::TrySendError::Closed(dir) => dir,
            };
            stack.push(dir);
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            parts.push(component.as_os_str().to_str()?);
        }
        Some(parts.join("/"))
    }

    async fn read_dir(&self, dir: &Path, stack: &mut Vec<PathBuf>) -> SyncResult<()> {
        let scan_err = |source: io::Error| SyncError::Scan {
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => match classify_open_error(e.kind(), dir == self.root) {
                OpenDirOutcome::SkipUnreadable => {
                    tracing::warn!(dir = %dir.display(), "permission denied, skipping directory");
                    return Ok(());
                }
                OpenDirOutcome::SkipVanished => {
                    tracing::debug!(dir = %dir.display(), "directory vanished during scan");
                    return Ok(());
                }
                OpenDirOutcome::Abort => return Err(scan_err(e)),
            },
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(scan_err(e)),
            };

            if file_type.is_dir() {
                self.discover(path, stack);
                continue;
            }

            let meta = if file_type.is_symlink() {
                match tokio::fs::metadata(&path).await {
                    Ok(m) if m.is_file() => m,
                    Ok(_) => {
                        tracing::debug!(path = %path.display(), "not following symlink to directory");
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::debug!(path = %path.display(), "dangling symlink");
                        continue;
                    }
                    Err(e) => return Err(scan_err(e)),
                }
            } else if file_type.is_file() {
                match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(scan_err(e)),
                }
            } else {
                continue;
            };

            let Some(rel) = self.relative(&path) else {
                tracing::warn!(path = %path.display(), "skipping non-UTF-8 path");
                continue;
            };
            if self.excludes.is_excluded(&rel) {
                tracing::trace!(path = %rel, "excluded");
                continue;
            }

            found.push(ItemMetadata {
                path: rel,
                size: meta.len(),
                mod_time: meta.modified().ok(),
                fingerprint: None,
            });
        }

        if !found.is_empty() {
            self.items
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(found);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenDirOutcome {
    SkipUnreadable,
    SkipVanished,
    Abort,
}

/// Only permission errors and subdirectories deleted mid-walk are skipped;
/// every other open failure fails the scan.
fn classify_open_error(kind: io::ErrorKind, is_root: bool) -> OpenDirOutcome {
    match kind {
        io::ErrorKind::PermissionDenied => OpenDirOutcome::SkipUnreadable,
        io::ErrorKind::NotFound if !is_root => OpenDirOutcome::SkipVanished,
        _ => OpenDirOutcome::Abort,
    }
}

async fn run_worker(state: Arc<ScanState>) {
    loop {
        let next = {
            let mut rx = state.rx.lock().await;
            tokio::select! {
                _ = state.done.cancelled() => None,
                dir = rx.recv() => dir,
            }
        };
        let Some(dir) = next else { break };

        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            if state.done.is_cancelled() {
                return;
            }
            if let Err(e) = state.read_dir(&dir, &mut stack).await {
                state.fail(e);
                return;
            }
            state.finish_dir();
        }
    }
}
