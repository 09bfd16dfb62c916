//! tidesync-storage: remote object store capability + OpenDAL S3 adapter
//!
//! Everything above this crate talks to [`ObjectStore`]. The production
//! implementation is [`OpendalStore`]; [`RetryingStore`] wraps any store with
//! exponential backoff so every remote call shares one retry policy.

pub mod native_checksum;
pub mod opendal_store;
pub mod operator;
pub mod retry;
pub mod store;

pub use native_checksum::NativeChecksums;
pub use opendal_store::{OpendalStore, FINGERPRINT_METADATA_KEY};
pub use operator::{build_operator, resolve_region, s3_options, S3Options};
pub use retry::{Jitter, RandomJitter, Retrier, RetryFailure, RetryPolicy, RetryingStore, Sleeper, TokioSleeper};
pub use store::{CompletedPart, ObjectHead, ObjectStore, PutOptions, SessionId};
