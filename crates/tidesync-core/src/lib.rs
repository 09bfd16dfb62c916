//! tidesync-core: shared data model, error taxonomy, and configuration schema

pub mod config;
pub mod error;
pub mod types;

pub use error::{ExecutionFailure, StoreError, SyncError, SyncResult};
pub use types::{
    Action, ExecutionResult, FingerprintData, ItemMetadata, ItemRef, Phase1Result, PlanItem,
    Reason, RemoteLocation,
};
