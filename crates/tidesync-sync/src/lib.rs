//! tidesync-sync: the planning and execution engine
//!
//! # Pipeline
//! - [`scanner`] walks the local tree while the store lists the remote prefix
//! - [`phases::compare`] partitions both snapshots by path and size
//! - [`collect`] fingerprints the same-size items on both sides
//! - [`phases::generate`] emits the ordered plan
//! - [`executor`] applies it with bounded concurrency
//!
//! [`planner::Planner`] wires the first four together.

pub mod collect;
pub mod executor;
pub mod multipart;
pub mod pattern;
pub mod phases;
pub mod planner;
pub mod report;
pub mod scanner;

pub use collect::FingerprintCollector;
pub use executor::{ExecutionObserver, Executor, ExecutorOptions, NoopObserver};
pub use pattern::{translate, ExcludeSet, PatternMatcher};
pub use planner::{PlanOptions, Planner};
pub use report::{PlanReport, ResultReport};
pub use scanner::Scanner;
