//! [`ObjectStore`] backed by an OpenDAL operator
//!
//! On S3 the fingerprint is the object's native full-object CRC-64/NVME
//! checksum, read and written through [`NativeChecksums`]; a user-metadata
//! copy (`crc64nvme`) covers backends without native checksums. Multipart
//! sessions are OpenDAL writers configured with the planned part size; the
//! writer performs the actual part uploads, and S3 computes the native
//! checksum of the assembled object.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use opendal::{ErrorKind, Operator, Writer};
use std::collections::HashMap;
use tidesync_core::{ItemMetadata, StoreError};
use tokio::sync::Mutex;

use crate::native_checksum::NativeChecksums;
use crate::store::{CompletedPart, ObjectHead, ObjectStore, PutOptions, SessionId};

/// User-metadata key holding the encoded full-object CRC-64/NVME
pub const FINGERPRINT_METADATA_KEY: &str = "crc64nvme";

struct Session {
    key: String,
    fingerprint: Option<String>,
    writer: Writer,
    /// Etags of parts written so far, in order
    parts: Vec<String>,
}

pub struct OpendalStore {
    op: Operator,
    name: String,
    part_concurrency: usize,
    native: Option<NativeChecksums>,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl OpendalStore {
    pub fn new(op: Operator, name: impl Into<String>, part_concurrency: usize) -> Self {
        let store = Self {
            op,
            name: name.into(),
            part_concurrency: part_concurrency.max(1),
            native: None,
            sessions: Mutex::new(HashMap::new()),
        };
        if !store.records_fingerprints() {
            tracing::debug!(
                target_store = %store.name,
                "backend cannot store user metadata; remote fingerprints will be absent"
            );
        }
        store
    }

    /// Route `head` and single-request `put` through native S3 checksums
    pub fn with_native_checksums(mut self, native: NativeChecksums) -> Self {
        self.native = Some(native);
        self
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Whether writes can carry the fingerprint as user metadata
    pub fn records_fingerprints(&self) -> bool {
        self.op.info().full_capability().write_with_user_metadata
    }

    fn user_metadata(&self, opts: &PutOptions) -> Option<Vec<(String, String)>> {
        match &opts.fingerprint {
            Some(fp) if self.records_fingerprints() => {
                Some(vec![(FINGERPRINT_METADATA_KEY.to_string(), fp.clone())])
            }
            _ => None,
        }
    }

    fn content_type<'a>(&self, opts: &'a PutOptions) -> Option<&'a str> {
        if self.op.info().full_capability().write_with_content_type {
            opts.content_type.as_deref()
        } else {
            None
        }
    }

    async fn take_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown upload session {id}")))
    }

    async fn put_back(&self, id: &SessionId, session: Session) {
        self.sessions.lock().await.insert(id.clone(), session);
    }

    /// Abort the writer after a failure; the session is already gone, so a
    /// retryable result means "start a new session", never "call again".
    async fn fail_session(
        &self,
        id: &SessionId,
        mut session: Session,
        what: &str,
        err: opendal::Error,
    ) -> StoreError {
        tracing::debug!(
            session = %id,
            key = %session.key,
            stage = what,
            error = %err,
            "upload session failed"
        );
        if let Err(abort_err) = session.writer.abort().await {
            tracing::warn!(
                session = %id,
                key = %session.key,
                error = %abort_err,
                "aborting failed upload session"
            );
        }
        map_opendal_error(err, &session.key)
    }

    /// Compare the checksum S3 computed for an assembled object against the
    /// fingerprint the session was opened with
    async fn verify_assembled(&self, key: &str, expected: Option<&str>) -> Result<(), StoreError> {
        let (Some(native), Some(expected)) = (&self.native, expected) else {
            return Ok(());
        };
        let head = native.head(key).await?;
        match head.fingerprint.as_deref() {
            Some(actual) if actual != expected => Err(StoreError::api(
                "BadDigest",
                400,
                format!("{key}: stored checksum {actual} does not match {expected}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Classify an OpenDAL error for retry
pub fn map_opendal_error(err: opendal::Error, key: &str) -> StoreError {
    match err.kind() {
        ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
        ErrorKind::RateLimited => StoreError::api("SlowDown", 503, err.to_string()),
        ErrorKind::ConfigInvalid
        | ErrorKind::Unsupported
        | ErrorKind::IsADirectory
        | ErrorKind::NotADirectory => StoreError::InvalidRequest(format!("{key}: {err}")),
        _ if err.is_temporary() => StoreError::Temporary(format!("{key}: {err}")),
        _ => StoreError::Other(format!("{key}: {err}")),
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ItemMetadata>, StoreError> {
        let prefix = prefix.trim_matches('/');
        let dir = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };
        let list_path = if dir.is_empty() { "/" } else { dir.as_str() };

        let mut lister = self
            .op
            .lister_with(list_path)
            .recursive(true)
            .await
            .map_err(|e| map_opendal_error(e, list_path))?;

        let mut items = Vec::new();
        while let Some(entry) = lister
            .try_next()
            .await
            .map_err(|e| map_opendal_error(e, list_path))?
        {
            let path = entry.path();
            if path.ends_with('/') || entry.metadata().is_dir() {
                continue;
            }
            let rel = path
                .strip_prefix(dir.as_str())
                .unwrap_or(path)
                .trim_start_matches('/');
            if rel.is_empty() {
                continue;
            }

            // Backends that omit sizes from listings report zero; stat those.
            let listed = entry.metadata().content_length();
            let size = if listed > 0 {
                listed
            } else {
                self.op
                    .stat(path)
                    .await
                    .map_err(|e| map_opendal_error(e, path))?
                    .content_length()
            };
            items.push(ItemMetadata::new(rel, size));
        }

        items.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!(prefix, objects = items.len(), "listed remote objects");
        Ok(items)
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError> {
        if let Some(native) = &self.native {
            return native.head(key).await;
        }
        let meta = self
            .op
            .stat(key)
            .await
            .map_err(|e| map_opendal_error(e, key))?;
        let fingerprint = meta
            .user_metadata()
            .and_then(|m| m.get(FINGERPRINT_METADATA_KEY))
            .filter(|fp| !fp.is_empty())
            .cloned();
        Ok(ObjectHead {
            size: meta.content_length(),
            fingerprint,
        })
    }

    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> Result<(), StoreError> {
        if let Some(native) = &self.native {
            return native.put(key, body, opts).await;
        }
        let mut req = self.op.write_with(key, body);
        if let Some(ct) = self.content_type(opts) {
            req = req.content_type(ct);
        }
        if let Some(meta) = self.user_metadata(opts) {
            req = req.user_metadata(meta);
        }
        req.await.map_err(|e| map_opendal_error(e, key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.op
            .delete(key)
            .await
            .map_err(|e| map_opendal_error(e, key))
    }

    async fn create_session(
        &self,
        key: &str,
        part_size: u64,
        opts: &PutOptions,
    ) -> Result<SessionId, StoreError> {
        let chunk = usize::try_from(part_size)
            .map_err(|_| StoreError::InvalidRequest(format!("part size {part_size} too large")))?;
        let mut req = self
            .op
            .writer_with(key)
            .chunk(chunk)
            .concurrent(self.part_concurrency);
        if let Some(ct) = self.content_type(opts) {
            req = req.content_type(ct);
        }
        if let Some(meta) = self.user_metadata(opts) {
            req = req.user_metadata(meta);
        }
        let writer = req.await.map_err(|e| map_opendal_error(e, key))?;

        let id = SessionId(uuid::Uuid::new_v4().to_string());
        self.put_back(
            &id,
            Session {
                key: key.to_string(),
                fingerprint: opts.fingerprint.clone(),
                writer,
                parts: Vec::new(),
            },
        )
        .await;
        tracing::debug!(key, session = %id, part_size, "upload session created");
        Ok(id)
    }

    async fn upload_part(
        &self,
        session: &SessionId,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        let mut state = self.take_session(session).await?;
        let expected = state.parts.len() as u32 + 1;
        if part_number != expected {
            self.put_back(session, state).await;
            return Err(StoreError::InvalidRequest(format!(
                "part {part_number} out of order in session {session}, expected {expected}"
            )));
        }

        let etag = tidesync_checksum::fingerprint_bytes(&body);
        if let Err(e) = state.writer.write(body).await {
            return Err(self.fail_session(session, state, "part upload", e).await);
        }
        state.parts.push(etag.clone());
        self.put_back(session, state).await;

        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_session(
        &self,
        session: &SessionId,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let mut state = self.take_session(session).await?;
        let in_order = parts.len() == state.parts.len()
            && parts
                .iter()
                .zip(&state.parts)
                .enumerate()
                .all(|(i, (p, etag))| p.part_number as usize == i + 1 && &p.etag == etag);
        if !in_order {
            let uploaded = state.parts.len();
            if let Err(e) = state.writer.abort().await {
                tracing::warn!(session = %session, error = %e, "aborting mismatched session");
            }
            return Err(StoreError::InvalidRequest(format!(
                "session {session}: completion lists {} parts, {uploaded} were uploaded",
                parts.len()
            )));
        }

        if let Err(e) = state.writer.close().await {
            return Err(self.fail_session(session, state, "completion", e).await);
        }
        tracing::debug!(key = %state.key, parts = parts.len(), "upload session completed");
        self.verify_assembled(&state.key, state.fingerprint.as_deref())
            .await
    }

    async fn abort_session(&self, session: &SessionId) -> Result<(), StoreError> {
        let Some(mut state) = self.sessions.lock().await.remove(session) else {
            return Ok(());
        };
        state
            .writer
            .abort()
            .await
            .map_err(|e| map_opendal_error(e, &state.key))
    }

    /// A failed OpenDAL write closes the writer, taking the session with it
    fn resumable_sessions(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
