//! The two pure planning phases
//!
//! Phase 1 ([`compare`]) partitions the local and remote snapshots by path.
//! Phase 2 (fingerprint collection) lives in [`crate::collect`] because it
//! performs I/O. Phase 3 ([`generate`]) turns both outputs into the plan.

pub mod compare;
pub mod generate;

pub use compare::compare;
pub use generate::generate;
