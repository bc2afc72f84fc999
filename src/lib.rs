//! `stratadb` is a log-structured, step-partitioned versioned
//! key-value engine: the state layer of a blockchain node.
//!
//! For each domain (accounts, storage, code, commitment) it keeps both
//! the latest value of every key and enough history to answer
//! point-in-time queries at any historical transaction number.
//!
//! This crate is intentionally opinionated about correctness first:
//! - Time is partitioned into fixed-size steps; a finished step is
//!   collated into immutable, content-checksummed files and the
//!   promoted hot rows are pruned.
//! - Reads merge memory, hot tier, and files, newest version first.
//! - Files follow a strict `.tmp` → fsync → rename discipline; a crash
//!   can leave behind only `.tmp` outputs, which the next open removes.
//! - Every write records its pre-image, so any prefix of history can
//!   be restored by unwinding.

pub mod cancel;
pub mod commitment;
pub mod domain;
pub mod engine;
pub mod files;
pub mod history;
pub mod index;
pub mod kv;
pub mod merge;
pub mod options;
pub mod registry;
pub mod segment;
pub mod shared;
pub mod step;

pub use cancel::Cancel;
pub use commitment::{CommitmentState, CommitmentTrie, FoldedMerkle, COMMITMENT_STATE_KEY};
pub use domain::{Domain, DomainSnapshot};
pub use engine::{DomainKind, Engine, EngineSnapshot, IndexKind, SnapshotDirs};
pub use options::{EngineOptions, IndexFlavor};
pub use shared::SharedDomains;
