//! Exponential backoff with jitter for remote-store calls
//!
//! [`Retrier::run`] is generic over any async operation and a caller-supplied
//! classifier; [`RetryingStore`] applies it to every [`ObjectStore`] method.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tidesync_core::config::RetryConfig;
use tidesync_core::{ItemMetadata, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::store::{CompletedPart, ObjectHead, ObjectStore, PutOptions, SessionId};

/// Fraction of the computed delay added or removed at random
const JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `retry` (0-based): `base * 2^retry`, shifted by
    /// `jitter * 25%` (jitter in [-1, 1]), never above `max_delay`.
    pub fn delay_for(&self, retry: u32, jitter: f64) -> Duration {
        let max = self.max_delay.as_nanos();
        let exp = match 1u128.checked_shl(retry) {
            Some(factor) if retry < 64 => self.base_delay.as_nanos().saturating_mul(factor),
            _ => u128::MAX,
        };
        // Anything above twice the cap stays above it after jitter
        let exp = exp.min(max.saturating_mul(2));
        let offset = (exp as f64 * JITTER_FRACTION * jitter.clamp(-1.0, 1.0)) as i128;
        let jittered = (exp as i128).saturating_add(offset).max(0) as u128;
        Duration::from_nanos(u64::try_from(jittered.min(max)).unwrap_or(u64::MAX))
    }
}

/// Source of jitter samples in [-1, 1]
pub trait Jitter: Send + Sync {
    fn sample(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Why [`Retrier::run`] gave up
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The classifier rejected the error; returned as-is
    Permanent(E),
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
    Cancelled,
}

impl From<RetryFailure<StoreError>> for StoreError {
    fn from(failure: RetryFailure<StoreError>) -> Self {
        match failure {
            RetryFailure::Permanent(e) => e,
            RetryFailure::Exhausted { attempts, last } => StoreError::RetryExhausted {
                attempts,
                source: Box::new(last),
            },
            RetryFailure::Cancelled => StoreError::Cancelled,
        }
    }
}

#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    jitter: Arc<dyn Jitter>,
    sleeper: Arc<dyn Sleeper>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            jitter: Arc::new(RandomJitter),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, `classify` rejects its error, attempts run
    /// out, or `cancel` fires.
    pub async fn run<T, E, C, F, Fut>(
        &self,
        cancel: &CancellationToken,
        classify: C,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display,
        C: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure::Cancelled);
            }
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !classify(&err) {
                return Err(RetryFailure::Permanent(err));
            }
            if attempt >= max_attempts {
                tracing::warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(RetryFailure::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.policy.delay_for(attempt - 1, self.jitter.sample());
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient error, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }

    /// [`run`](Self::run) classified by [`StoreError::is_retryable`]
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run(cancel, StoreError::is_retryable, op)
            .await
            .map_err(StoreError::from)
    }
}

/// Decorator applying one [`Retrier`] to every call of the wrapped store
pub struct RetryingStore<S> {
    inner: S,
    retrier: Retrier,
    cancel: CancellationToken,
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S, retrier: Retrier, cancel: CancellationToken) -> Self {
        Self {
            inner,
            retrier,
            cancel,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    async fn list(&self, prefix: &str) -> Result<Vec<ItemMetadata>, StoreError> {
        self.retrier
            .call(&self.cancel, || self.inner.list(prefix))
            .instrument(tracing::debug_span!("store_list", prefix))
            .await
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError> {
        self.retrier
            .call(&self.cancel, || self.inner.head(key))
            .instrument(tracing::debug_span!("store_head", key))
            .await
    }

    async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> Result<(), StoreError> {
        self.retrier
            .call(&self.cancel, || self.inner.put(key, body.clone(), opts))
            .instrument(tracing::debug_span!("store_put", key, bytes = body.len()))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.retrier
            .call(&self.cancel, || self.inner.delete(key))
            .instrument(tracing::debug_span!("store_delete", key))
            .await
    }

    async fn create_session(
        &self,
        key: &str,
        part_size: u64,
        opts: &PutOptions,
    ) -> Result<SessionId, StoreError> {
        self.retrier
            .call(&self.cancel, || self.inner.create_session(key, part_size, opts))
            .instrument(tracing::debug_span!("store_create_session", key, part_size))
            .await
    }

    async fn upload_part(
        &self,
        session: &SessionId,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        let span = tracing::debug_span!("store_upload_part", session = %session, part_number);
        if !self.inner.resumable_sessions() {
            return self
                .inner
                .upload_part(session, part_number, body)
                .instrument(span)
                .await;
        }
        self.retrier
            .call(&self.cancel, || {
                self.inner.upload_part(session, part_number, body.clone())
            })
            .instrument(span)
            .await
    }

    async fn complete_session(
        &self,
        session: &SessionId,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let span = tracing::debug_span!("store_complete_session", session = %session);
        if !self.inner.resumable_sessions() {
            return self
                .inner
                .complete_session(session, parts)
                .instrument(span)
                .await;
        }
        self.retrier
            .call(&self.cancel, || self.inner.complete_session(session, parts))
            .instrument(span)
            .await
    }

    async fn abort_session(&self, session: &SessionId) -> Result<(), StoreError> {
        self.retrier
            .call(&self.cancel, || self.inner.abort_session(session))
            .instrument(tracing::debug_span!("store_abort_session", session = %session))
            .await
    }

    fn resumable_sessions(&self) -> bool {
        self.inner.resumable_sessions()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}
