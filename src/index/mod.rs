//! Access indexes built over finished segments.
//!
//! All of these are regenerable accessors: losing one never loses
//! data, the engine rebuilds it from the segment.

pub mod btree;
pub mod elias_fano;
pub mod existence;
pub mod hashed;

pub use btree::{BtCursor, BtIndex, DEFAULT_BTREE_M};
pub use elias_fano::EliasFano;
pub use existence::{ExistenceFilter, ExistenceFilterBuilder};
pub use hashed::HashedIndex;
