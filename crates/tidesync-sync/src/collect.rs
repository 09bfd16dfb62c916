//! Phase 2: fingerprint collection for same-size items
//!
//! Each ambiguous item costs one local read (CRC-64/NVME of the whole file)
//! and one remote `head`. A fixed pool of workers pulls indices from a shared
//! counter; output index `i` always describes input index `i`. The first
//! failure stops the pool and is returned; no partial list escapes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tidesync_core::{FingerprintData, ItemRef, RemoteLocation, SyncError, SyncResult};
use tidesync_storage::ObjectStore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FINGERPRINT_WORKERS: usize = 16;

pub struct FingerprintCollector {
    store: Arc<dyn ObjectStore>,
    workers: usize,
}

impl FingerprintCollector {
    pub fn new(store: Arc<dyn ObjectStore>, workers: usize) -> Self {
        Self {
            store,
            workers: workers.max(1),
        }
    }

    pub async fn collect(
        &self,
        cancel: &CancellationToken,
        items: &[ItemRef],
        local_root: &Path,
        location: &RemoteLocation,
    ) -> SyncResult<Vec<FingerprintData>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let job = Arc::new(CollectJob {
            items: items.to_vec(),
            local_root: local_root.to_path_buf(),
            location: location.clone(),
            store: self.store.clone(),
            next: AtomicUsize::new(0),
            stop: cancel.child_token(),
            first_error: Mutex::new(None),
        });

        let workers = self.workers.min(items.len());
        tracing::debug!(items = items.len(), workers, "collecting fingerprints");
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(job.clone().run_worker());
        }

        let mut slots: Vec<Option<FingerprintData>> = vec![None; items.len()];
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(done) => {
                    for (index, data) in done {
                        slots[index] = Some(data);
                    }
                }
                Err(e) => job.fail(SyncError::Other(anyhow::anyhow!(
                    "fingerprint worker panicked: {e}"
                ))),
            }
        }

        if let Some(err) = job
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

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    SyncError::Other(anyhow::anyhow!("fingerprint slot {index} left empty"))
                })
            })
            .collect()
    }
}

struct CollectJob {
    items: Vec<ItemRef>,
    local_root: PathBuf,
    location: RemoteLocation,
    store: Arc<dyn ObjectStore>,
    next: AtomicUsize,
    stop: CancellationToken,
    first_error: Mutex<Option<SyncError>>,
}

impl CollectJob {
    fn fail(&self, err: SyncError) {
        let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            tracing::debug!(error = %err, "fingerprint collection failed, stopping workers");
            *slot = Some(err);
        }
        self.stop.cancel();
    }

    async fn run_worker(self: Arc<Self>) -> Vec<(usize, FingerprintData)> {
        let mut done = Vec::new();
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let index = self.next.fetch_add(1, Ordering::Relaxed);
            let Some(item) = self.items.get(index) else {
                break;
            };
            match self.fingerprint(item).await {
                Ok(data) => done.push((index, data)),
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        done
    }

    async fn fingerprint(&self, item: &ItemRef) -> SyncResult<FingerprintData> {
        let path = self.local_root.join(&item.path);
        let key = self.location.key_for(&item.path);

        let local = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || tidesync_checksum::fingerprint_file(&path))
        };
        let (local, remote) = tokio::join!(local, self.store.head(&key));

        let source_fingerprint = local
            .map_err(|e| SyncError::Other(anyhow::anyhow!("fingerprint task failed: {e}")))?
            .map_err(|source| SyncError::LocalFingerprint { path, source })?;
        let head = remote.map_err(|source| SyncError::RemoteFingerprint { key, source })?;

        Ok(FingerprintData {
            item: item.clone(),
            source_fingerprint,
            // Unrecorded remote fingerprint: never equal to a computed one
            dest_fingerprint: head.fingerprint.unwrap_or_default(),
        })
    }
}
