//! Storage Module
//!
//! Persistent storage layer using SSTable-like format.
//!
//! ## Responsibilities
//! - Persist flushed memtables to disk in sorted format
//! - Point lookups newest → oldest
//! - Prefix scans merged across tables (for namespace snapshots)
//!
//! Tables are only ever added; compaction is out of scope.

mod sstable;
mod manager;

pub use sstable::{Lookup, SSTable, SSTableBuilder, SSTableReader};
pub use manager::StorageManager;
