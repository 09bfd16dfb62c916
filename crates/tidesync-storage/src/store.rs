//! Remote object store capability

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tidesync_core::{ItemMetadata, StoreError};

/// Size and recorded full-object fingerprint of one remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub fingerprint: Option<String>,
}

/// Attributes attached to a new object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Encoded full-object CRC-64/NVME
    pub fingerprint: Option<String>,
    pub content_type: Option<String>,
}

/// Handle of an open chunked upload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the store returned for one uploaded part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based
    pub part_number: u32,
    pub etag: String,
}

/// Operations the sync engine needs from a remote container.
///
/// Keys are bucket-relative; the container itself is bound when the store is
/// constructed.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object under `prefix`, with paths relative to the prefix
    async fn list(&self, prefix: &str) -> Result<Vec<ItemMetadata>, StoreError>;

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError>;

    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn create_session(
        &self,
        key: &str,
        part_size: u64,
        opts: &PutOptions,
    ) -> Result<SessionId, StoreError>;

    async fn upload_part(
        &self,
        session: &SessionId,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError>;

    async fn complete_session(
        &self,
        session: &SessionId,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError>;

    async fn abort_session(&self, session: &SessionId) -> Result<(), StoreError>;

    /// Whether a session survives a failed `upload_part` or
    /// `complete_session`, so that call alone can be attempted again.
    ///
    /// When false, a failed call has already torn the session down and only
    /// a fresh session can recover.
    fn resumable_sessions(&self) -> bool {
        true
    }

    /// Human-readable target, used in log lines
    fn describe(&self) -> String;
}

#[async_trait]
impl<S: ObjectStore + ?Sized> ObjectStore for Arc<S> {
    async fn list(&self, prefix: &str) -> Result<Vec<ItemMetadata>, StoreError> {
        (**self).list(prefix).await
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError> {
        (**self).head(key).await
    }

    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> Result<(), StoreError> {
        (**self).put(key, body, opts).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn create_session(
        &self,
        key: &str,
        part_size: u64,
        opts: &PutOptions,
    ) -> Result<SessionId, StoreError> {
        (**self).create_session(key, part_size, opts).await
    }

    async fn upload_part(
        &self,
        session: &SessionId,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        (**self).upload_part(session, part_number, body).await
    }

    async fn complete_session(
        &self,
        session: &SessionId,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        (**self).complete_session(session, parts).await
    }

    async fn abort_session(&self, session: &SessionId) -> Result<(), StoreError> {
        (**self).abort_session(session).await
    }

    fn resumable_sessions(&self) -> bool {
        (**self).resumable_sessions()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
