//! Plan construction: scan + list, then the three phases

use std::path::Path;
use std::sync::Arc;
use tidesync_core::config::SyncConfig;
use tidesync_core::{PlanItem, RemoteLocation, SyncError, SyncResult};
use tidesync_storage::ObjectStore;
use tokio_util::sync::CancellationToken;

use crate::collect::FingerprintCollector;
use crate::pattern::{ExcludeSet, PatternMatcher};
use crate::phases::{compare, generate};
use crate::scanner::Scanner;

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Plan deletion of remote objects with no local counterpart
    pub delete: bool,
    pub excludes: Vec<String>,
}

pub struct Planner {
    store: Arc<dyn ObjectStore>,
    matcher: PatternMatcher,
    scanner: Scanner,
    collector: FingerprintCollector,
}

impl Planner {
    pub fn new(store: Arc<dyn ObjectStore>, scan_workers: usize, fingerprint_workers: usize) -> Self {
        Self {
            collector: FingerprintCollector::new(store.clone(), fingerprint_workers),
            store,
            matcher: PatternMatcher::new(),
            scanner: Scanner::new(scan_workers),
        }
    }

    pub fn from_config(store: Arc<dyn ObjectStore>, cfg: &SyncConfig) -> Self {
        Self::new(store, cfg.scan_workers, cfg.fingerprint_workers)
    }

    /// Compute the actions that make `location` mirror `local_root`.
    ///
    /// Excluded paths are dropped on both sides, so an excluded remote
    /// object is never planned for deletion.
    pub async fn plan(
        &self,
        cancel: &CancellationToken,
        local_root: &Path,
        location: &RemoteLocation,
        options: &PlanOptions,
    ) -> SyncResult<Vec<PlanItem>> {
        let excludes = ExcludeSet::new(&self.matcher, &options.excludes)?;

        tracing::info!(
            local = %local_root.display(),
            remote = %location,
            excludes = excludes.len(),
            delete = options.delete,
            "scanning local tree and listing remote objects"
        );
        let list = async {
            self.store
                .list(&location.prefix)
                .await
                .map_err(|source| SyncError::List {
                    location: location.to_string(),
                    source,
                })
        };
        let (local, mut remote) =
            tokio::try_join!(self.scanner.scan(cancel, local_root, &excludes), list)?;
        remote.retain(|item| !excludes.is_excluded(&item.path));
        tracing::info!(local = local.len(), remote = remote.len(), "inventory complete");

        let phase1 = compare(&local, &remote, options.delete);
        tracing::info!(
            new = phase1.new_items.len(),
            deleted = phase1.deleted_items.len(),
            size_mismatch = phase1.size_mismatch.len(),
            need_fingerprint = phase1.need_fingerprint.len(),
            identical = phase1.identical.len(),
            "phase 1 complete"
        );

        let fingerprints = self
            .collector
            .collect(cancel, &phase1.need_fingerprint, local_root, location)
            .await?;
        let changed = fingerprints.iter().filter(|fp| !fp.matches()).count();
        tracing::info!(
            checked = fingerprints.len(),
            changed,
            "phase 2 complete"
        );

        let plan = generate(&phase1, &fingerprints, local_root, location);
        tracing::info!(actions = plan.len(), "phase 3 complete");
        Ok(plan)
    }
}
