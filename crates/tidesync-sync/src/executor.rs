//! Plan execution with bounded concurrency
//!
//! Every item runs in its own task behind a semaphore. A failed item is
//! recorded in its [`ExecutionResult`] and never stops its siblings; only
//! cancellation of the whole run does, and then unstarted items report
//! [`SyncError::Cancelled`].
//!
//! Stores whose sessions die with a failed part get whole-session retries:
//! each attempt opens a fresh session and aborts it on failure.

use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tidesync_checksum::Crc64Hasher;
use tidesync_core::{Action, ExecutionFailure, ExecutionResult, PlanItem, StoreError, SyncError};
use tidesync_storage::{CompletedPart, ObjectStore, PutOptions, Retrier, RetryFailure, SessionId};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::multipart::{self, DEFAULT_MULTIPART_THRESHOLD, MAX_OBJECT_SIZE, MAX_PART_SIZE};

pub const DEFAULT_CONCURRENCY: usize = 32;

/// Receives per-item progress; used for console output
pub trait ExecutionObserver: Send + Sync {
    fn started(&self, _item: &PlanItem) {}
    fn finished(&self, _result: &ExecutionResult) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    pub concurrency: usize,
    /// Uploads of at least this many bytes go through a multipart session;
    /// anything above 5 GiB always does
    pub multipart_threshold: u64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
        }
    }
}

pub struct Executor {
    store: Arc<dyn ObjectStore>,
    opts: ExecutorOptions,
    observer: Arc<dyn ExecutionObserver>,
    session_retrier: Option<Retrier>,
}

impl Executor {
    pub fn new(store: Arc<dyn ObjectStore>, opts: ExecutorOptions) -> Self {
        Self {
            store,
            opts: ExecutorOptions {
                concurrency: opts.concurrency.max(1),
                multipart_threshold: opts.multipart_threshold.min(MAX_PART_SIZE),
            },
            observer: Arc::new(NoopObserver),
            session_retrier: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Retry multipart uploads as a whole when the store cannot resume a
    /// session after a failed part
    pub fn with_session_retrier(mut self, retrier: Retrier) -> Self {
        self.session_retrier = Some(retrier);
        self
    }

    /// Apply every item; one result per item, in completion order.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        items: Vec<PlanItem>,
    ) -> Vec<ExecutionResult> {
        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(self.opts.concurrency));
        let mut tasks = JoinSet::new();

        for item in items {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let worker = ItemWorker {
                store: self.store.clone(),
                multipart_threshold: self.opts.multipart_threshold,
                session_retrier: self.session_retrier.clone(),
                cancel: cancel.clone(),
            };
            let observer = self.observer.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return ExecutionResult {
                        item,
                        error: Some(SyncError::Cancelled),
                    };
                };

                observer.started(&item);
                let outcome = AssertUnwindSafe(worker.apply(&item)).catch_unwind().await;
                let error = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(source)) => Some(SyncError::Execution {
                        action: item.action.as_str(),
                        key: item.remote_key.clone(),
                        source,
                    }),
                    Err(_) => Some(SyncError::Execution {
                        action: item.action.as_str(),
                        key: item.remote_key.clone(),
                        source: ExecutionFailure::Rejected("worker panicked".into()),
                    }),
                };
                let result = ExecutionResult { item, error };
                observer.finished(&result);
                result
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    if let Some(err) = &result.error {
                        tracing::warn!(key = %result.item.remote_key, error = %err, "item failed");
                    }
                    results.push(result);
                }
                // Tasks catch their own panics, so only runtime shutdown lands here
                Err(e) => tracing::error!(error = %e, "execution task aborted"),
            }
        }

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        tracing::info!(items = total, failed, "execution complete");
        results
    }
}

/// Objects above the single-request limit must be chunked whatever the threshold
fn uses_multipart(size: u64, threshold: u64) -> bool {
    size >= threshold || size > MAX_PART_SIZE
}

/// Fold a whole-session retry outcome back into one item failure
fn session_failure(failure: RetryFailure<ExecutionFailure>) -> ExecutionFailure {
    match failure {
        RetryFailure::Permanent(e) => e,
        RetryFailure::Exhausted {
            attempts,
            last: ExecutionFailure::Remote(source),
        } => ExecutionFailure::Remote(StoreError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }),
        RetryFailure::Exhausted { last, .. } => last,
        RetryFailure::Cancelled => ExecutionFailure::Remote(StoreError::Cancelled),
    }
}

fn retryable_remote(err: &ExecutionFailure) -> bool {
    matches!(err, ExecutionFailure::Remote(e) if e.is_retryable())
}

struct ItemWorker {
    store: Arc<dyn ObjectStore>,
    multipart_threshold: u64,
    session_retrier: Option<Retrier>,
    cancel: CancellationToken,
}

impl ItemWorker {
    async fn apply(&self, item: &PlanItem) -> Result<(), ExecutionFailure> {
        match item.action {
            Action::Delete => {
                self.store.delete(&item.remote_key).await?;
                tracing::debug!(key = %item.remote_key, "deleted");
                Ok(())
            }
            Action::Upload => {
                let path = item.local_path.as_deref().ok_or_else(|| {
                    ExecutionFailure::Rejected("upload has no local path".into())
                })?;
                self.upload(item, path).await
            }
        }
    }

    async fn upload(&self, item: &PlanItem, path: &Path) -> Result<(), ExecutionFailure> {
        let local_err = |source| ExecutionFailure::Local {
            path: path.to_path_buf(),
            source,
        };
        let size = tokio::fs::metadata(path).await.map_err(local_err)?.len();
        if size > MAX_OBJECT_SIZE {
            return Err(ExecutionFailure::Rejected(format!(
                "{size} bytes exceeds the {MAX_OBJECT_SIZE}-byte object limit"
            )));
        }
        let content_type = mime_guess::from_path(path)
            .first_raw()
            .map(str::to_string);

        if uses_multipart(size, self.multipart_threshold) {
            self.upload_multipart(item, path, size, content_type).await
        } else {
            self.upload_single(item, path, content_type).await
        }
    }

    async fn upload_single(
        &self,
        item: &PlanItem,
        path: &Path,
        content_type: Option<String>,
    ) -> Result<(), ExecutionFailure> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| ExecutionFailure::Local {
                path: path.to_path_buf(),
                source,
            })?;
        let fingerprint = tidesync_checksum::fingerprint_bytes(&data);
        if let Some(planned) = item.fingerprint.as_deref() {
            if planned != fingerprint {
                tracing::warn!(
                    path = %path.display(),
                    planned,
                    actual = %fingerprint,
                    "file changed since planning, uploading current content"
                );
            }
        }

        let opts = PutOptions {
            fingerprint: Some(fingerprint),
            content_type,
        };
        let bytes = data.len();
        self.store
            .put(&item.remote_key, Bytes::from(data), &opts)
            .await?;
        tracing::debug!(key = %item.remote_key, bytes, "uploaded");
        Ok(())
    }

    async fn upload_multipart(
        &self,
        item: &PlanItem,
        path: &Path,
        size: u64,
        content_type: Option<String>,
    ) -> Result<(), ExecutionFailure> {
        let fingerprint = match &item.fingerprint {
            Some(fp) => fp.clone(),
            None => {
                let owned = path.to_path_buf();
                tokio::task::spawn_blocking(move || tidesync_checksum::fingerprint_file(&owned))
                    .await
                    .map_err(|e| ExecutionFailure::Rejected(format!("fingerprint task failed: {e}")))?
                    .map_err(|source| ExecutionFailure::Local {
                        path: path.to_path_buf(),
                        source,
                    })?
            }
        };

        let part_size = multipart::part_size(size);
        let opts = PutOptions {
            fingerprint: Some(fingerprint.clone()),
            content_type,
        };
        let attempt = || self.multipart_attempt(item, path, size, part_size, &fingerprint, &opts);

        match &self.session_retrier {
            Some(retrier) if !self.store.resumable_sessions() => retrier
                .run(&self.cancel, retryable_remote, attempt)
                .await
                .map_err(session_failure),
            _ => attempt().await,
        }
    }

    /// One session from creation to completion; aborted on any failure
    async fn multipart_attempt(
        &self,
        item: &PlanItem,
        path: &Path,
        size: u64,
        part_size: u64,
        fingerprint: &str,
        opts: &PutOptions,
    ) -> Result<(), ExecutionFailure> {
        let session = self
            .store
            .create_session(&item.remote_key, part_size, opts)
            .await?;
        tracing::debug!(
            key = %item.remote_key,
            size,
            part_size,
            parts = multipart::part_count(size, part_size),
            "multipart upload started"
        );

        let outcome = match self.send_parts(&session, path, part_size, fingerprint).await {
            Ok(parts) => self
                .store
                .complete_session(&session, &parts)
                .await
                .map(|()| parts.len())
                .map_err(ExecutionFailure::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(parts) => {
                tracing::debug!(key = %item.remote_key, parts, "multipart upload complete");
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self.store.abort_session(&session).await {
                    tracing::warn!(
                        key = %item.remote_key,
                        session = %session,
                        error = %abort_err,
                        "failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn send_parts(
        &self,
        session: &SessionId,
        path: &Path,
        part_size: u64,
        fingerprint: &str,
    ) -> Result<Vec<CompletedPart>, ExecutionFailure> {
        let local_err = |source| ExecutionFailure::Local {
            path: path.to_path_buf(),
            source,
        };
        let part_len = usize::try_from(part_size)
            .map_err(|_| ExecutionFailure::Rejected(format!("part size {part_size} too large")))?;
        let mut file = tokio::fs::File::open(path).await.map_err(local_err)?;
        let mut hasher = Crc64Hasher::new();
        let mut parts = Vec::new();

        loop {
            let mut buf = Vec::with_capacity(part_len);
            let n = (&mut file)
                .take(part_size)
                .read_to_end(&mut buf)
                .await
                .map_err(local_err)?;
            if n == 0 && !parts.is_empty() {
                break;
            }
            hasher.update(&buf);

            let part_number = u32::try_from(parts.len() + 1)
                .map_err(|_| ExecutionFailure::Rejected("too many parts".into()))?;
            let part = self
                .store
                .upload_part(session, part_number, Bytes::from(buf))
                .await?;
            parts.push(part);

            if n < part_len {
                break;
            }
        }

        if hasher.finalize() != fingerprint {
            return Err(ExecutionFailure::Rejected(format!(
                "{} changed while uploading, fingerprint no longer matches",
                path.display()
            )));
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = ExecutorOptions::default();
        assert_eq!(opts.concurrency, 32);
        assert_eq!(opts.multipart_threshold, 8 * 1024 * 1024);
    }

    #[test]
    fn objects_above_part_limit_always_use_multipart() {
        let threshold = u64::MAX;
        assert!(!uses_multipart(MAX_PART_SIZE, threshold));
        assert!(uses_multipart(MAX_PART_SIZE + 1, threshold));
        assert!(uses_multipart(8 * 1024 * 1024, DEFAULT_MULTIPART_THRESHOLD));
        assert!(!uses_multipart(8 * 1024 * 1024 - 1, DEFAULT_MULTIPART_THRESHOLD));
    }

    #[test]
    fn threshold_is_clamped_to_part_limit() {
        struct Unused;

        #[async_trait::async_trait]
        impl ObjectStore for Unused {
            async fn list(&self, _: &str) -> Result<Vec<tidesync_core::ItemMetadata>, StoreError> {
                unreachable!()
            }
            async fn head(&self, _: &str) -> Result<tidesync_storage::ObjectHead, StoreError> {
                unreachable!()
            }
            async fn put(&self, _: &str, _: Bytes, _: &PutOptions) -> Result<(), StoreError> {
                unreachable!()
            }
            async fn delete(&self, _: &str) -> Result<(), StoreError> {
                unreachable!()
            }
            async fn create_session(&self, _: &str, _: u64, _: &PutOptions) -> Result<SessionId, StoreError> {
                unreachable!()
            }
            async fn upload_part(&self, _: &SessionId, _: u32, _: Bytes) -> Result<CompletedPart, StoreError> {
                unreachable!()
            }
            async fn complete_session(&self, _: &SessionId, _: &[CompletedPart]) -> Result<(), StoreError> {
                unreachable!()
            }
            async fn abort_session(&self, _: &SessionId) -> Result<(), StoreError> {
                unreachable!()
            }
            fn describe(&self) -> String {
                "unused".into()
            }
        }

        let executor = Executor::new(
            Arc::new(Unused),
            ExecutorOptions {
                concurrency: 0,
                multipart_threshold: u64::MAX,
            },
        );
        assert_eq!(executor.opts.concurrency, 1);
        assert_eq!(executor.opts.multipart_threshold, MAX_PART_SIZE);
    }

    #[test]
    fn exhausted_session_retries_report_attempts() {
        let failure = session_failure(RetryFailure::Exhausted {
            attempts: 6,
            last: ExecutionFailure::Remote(StoreError::Temporary("reset".into())),
        });
        match failure {
            ExecutionFailure::Remote(StoreError::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 6);
                assert!(matches!(*source, StoreError::Temporary(_)));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }

        let cancelled = session_failure(RetryFailure::Cancelled);
        assert!(matches!(cancelled, ExecutionFailure::Remote(StoreError::Cancelled)));

        let permanent = session_failure(RetryFailure::Permanent(ExecutionFailure::Rejected("x".into())));
        assert!(matches!(permanent, ExecutionFailure::Rejected(_)));
    }

    #[test]
    fn only_retryable_remote_failures_restart_sessions() {
        assert!(retryable_remote(&ExecutionFailure::Remote(StoreError::Temporary("t".into()))));
        assert!(!retryable_remote(&ExecutionFailure::Remote(StoreError::NotFound("k".into()))));
        assert!(!retryable_remote(&ExecutionFailure::Rejected("changed".into())));
        assert!(!retryable_remote(&ExecutionFailure::Local {
            path: "a".into(),
            source: std::io::Error::other("io"),
        }));
    }
}
