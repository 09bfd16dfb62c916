//! Shared fixtures: an in-memory object store with failure injection

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidesync_core::{ItemMetadata, StoreError};
use tidesync_storage::{
    CompletedPart, ObjectHead, ObjectStore, PutOptions, Retrier, RetryPolicy, Sleeper,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Head,
    Put,
    Delete,
    CreateSession,
    UploadPart,
    Complete,
    Abort,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub fingerprint: Option<String>,
    pub content_type: Option<String>,
}

struct OpenSession {
    key: String,
    opts: PutOptions,
    parts: Vec<Vec<u8>>,
}

#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    sessions: Mutex<HashMap<String, OpenSession>>,
    failures: Mutex<HashMap<(Op, String), VecDeque<StoreError>>>,
    calls: Mutex<Vec<(Op, String)>>,
    next_session: AtomicU32,
    head_delay_ms: Option<u64>,
    /// A failed part or completion discards the session, like OpenDAL writers
    fragile_sessions: bool,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep a random 0..max_ms before answering `head`
    pub fn with_head_delay(mut self, max_ms: u64) -> Self {
        self.head_delay_ms = Some(max_ms);
        self
    }

    /// Sessions do not survive a failed `upload_part` or `complete_session`
    pub fn with_fragile_sessions(mut self) -> Self {
        self.fragile_sessions = true;
        self
    }

    /// Store an object with its fingerprint recorded
    pub fn insert(&self, key: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                fingerprint: Some(tidesync_checksum::fingerprint_bytes(data)),
                content_type: None,
            },
        );
    }

    /// Store an object without a recorded fingerprint
    pub fn insert_unfingerprinted(&self, key: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                fingerprint: None,
                content_type: None,
            },
        );
    }

    /// Queue `times` failures for `op` on `key` (the prefix for `list`)
    pub fn fail(&self, op: Op, key: &str, times: usize, make: impl Fn() -> StoreError) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry((op, key.to_string())).or_default();
        for _ in 0..times {
            queue.push_back(make());
        }
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().unwrap().iter().filter(|(o, _)| *o == op).count()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn record(&self, op: Op, key: &str) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push((op, key.to_string()));
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(op, key.to_string()))
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record a session call, discarding the session on failure if fragile
    fn record_session(
        &self,
        op: Op,
        session: &tidesync_storage::SessionId,
        key: &str,
    ) -> Result<(), StoreError> {
        let result = self.record(op, key);
        if result.is_err() && self.fragile_sessions {
            self.sessions.lock().unwrap().remove(&session.0);
        }
        result
    }

    fn session_key(&self, session: &tidesync_storage::SessionId) -> Result<String, StoreError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&session.0)
            .map(|s| s.key.clone())
            .ok_or_else(|| StoreError::InvalidRequest(format!("no session {session}")))
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ItemMetadata>, StoreError> {
        self.record(Op::List, prefix)?;
        let dir = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(key, obj)| {
                key.strip_prefix(dir.as_str())
                    .map(|rel| ItemMetadata::new(rel, obj.data.len() as u64))
            })
            .collect())
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError> {
        if let Some(max) = self.head_delay_ms {
            let delay = rand::thread_rng().gen_range(0..=max);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.record(Op::Head, key)?;
        self.object(key)
            .map(|obj| ObjectHead {
                size: obj.data.len() as u64,
                fingerprint: obj.fingerprint,
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> Result<(), StoreError> {
        self.record(Op::Put, key)?;
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: body.to_vec(),
                fingerprint: opts.fingerprint.clone(),
                content_type: opts.content_type.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.record(Op::Delete, key)?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn create_session(
        &self,
        key: &str,
        _part_size: u64,
        opts: &PutOptions,
    ) -> Result<tidesync_storage::SessionId, StoreError> {
        self.record(Op::CreateSession, key)?;
        let id = format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().unwrap().insert(
            id.clone(),
            OpenSession {
                key: key.to_string(),
                opts: opts.clone(),
                parts: Vec::new(),
            },
        );
        Ok(tidesync_storage::SessionId(id))
    }

    async fn upload_part(
        &self,
        session: &tidesync_storage::SessionId,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        let key = self.session_key(session)?;
        self.record_session(Op::UploadPart, session, &key)?;
        let mut sessions = self.sessions.lock().unwrap();
        let open = sessions
            .get_mut(&session.0)
            .ok_or_else(|| StoreError::InvalidRequest(format!("no session {session}")))?;
        if part_number as usize != open.parts.len() + 1 {
            return Err(StoreError::InvalidRequest(format!(
                "part {part_number} out of order"
            )));
        }
        open.parts.push(body.to_vec());
        Ok(CompletedPart {
            part_number,
            etag: format!("etag-{part_number}"),
        })
    }

    async fn complete_session(
        &self,
        session: &tidesync_storage::SessionId,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let key = self.session_key(session)?;
        self.record_session(Op::Complete, session, &key)?;
        let open = self
            .sessions
            .lock()
            .unwrap()
            .remove(&session.0)
            .ok_or_else(|| StoreError::InvalidRequest(format!("no session {session}")))?;
        if parts.len() != open.parts.len() {
            return Err(StoreError::InvalidRequest("part list mismatch".into()));
        }
        self.objects.lock().unwrap().insert(
            open.key,
            StoredObject {
                data: open.parts.concat(),
                fingerprint: open.opts.fingerprint,
                content_type: open.opts.content_type,
            },
        );
        Ok(())
    }

    async fn abort_session(&self, session: &tidesync_storage::SessionId) -> Result<(), StoreError> {
        let key = self.session_key(session).unwrap_or_default();
        self.record(Op::Abort, &key)?;
        self.sessions.lock().unwrap().remove(&session.0);
        Ok(())
    }

    fn resumable_sessions(&self) -> bool {
        !self.fragile_sessions
    }

    fn describe(&self) -> String {
        "fake://bucket".into()
    }
}

/// Sleeper that returns at once
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _delay: Duration) {}
}

pub fn instant_retrier() -> Retrier {
    Retrier::new(RetryPolicy::default()).with_sleeper(Arc::new(InstantSleeper))
}

pub fn write_file(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}
