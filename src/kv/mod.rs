//! Key-Value Contract Module
//!
//! The narrow interface the allocator, freelist and catalog consume from the
//! transactional store. `Engine` is the in-crate implementation.
//!
//! ## Key Layout
//! ```text
//! ┌──────────────────┬──────┬─────────────────────┐
//! │ namespace (utf8) │ 0x00 │ key (raw bytes)     │
//! └──────────────────┴──────┴─────────────────────┘
//! ```
//! Keys of one namespace are contiguous and ordered by raw key bytes, so a
//! namespace scan is a prefix scan.

mod snapshot;
mod transaction;

use std::sync::Arc;

use crate::error::Result;
use crate::merge::MergeOperator;

pub use snapshot::Snapshot;
pub use transaction::{Transaction, TxnOp};

/// Namespaces used by the catalog
pub mod namespace {
    /// Extent freelist: big-endian offset → big-endian run length
    pub const FREELIST: &str = "F";
    /// Bitmap freelist: big-endian group index → bitmap bytes
    pub const BITMAP: &str = "B";
    /// Object metadata: name → encoded record
    pub const METADATA: &str = "M";
    /// Aggregate counters (merge operator namespace)
    pub const AGGREGATE: &str = "A";
    /// Superblock records
    pub const SUPERBLOCK: &str = "S";
}

/// Separator between namespace and key
const SEPARATOR: u8 = 0x00;

/// Transactional, namespaced, ordered key-value store
///
/// Implementations must make `submit_transaction_sync` all-or-nothing and
/// durable before returning `Ok`, and must serve `snapshot` from a view that
/// later commits do not change.
pub trait KeyValueDb {
    /// Point lookup; `None` when the key does not exist
    fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Consistent copy of every live key in `ns`, ordered by raw key bytes
    fn snapshot(&self, ns: &str) -> Result<Snapshot>;

    /// Apply every operation of `txn` atomically and durably
    fn submit_transaction_sync(&self, txn: Transaction) -> Result<()>;

    /// Install the operator that resolves `Transaction::merge` in `ns`
    fn set_merge_operator(&self, ns: &str, operator: Arc<dyn MergeOperator>) -> Result<()>;

    /// Flush and release the store
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Build the physical key for `key` in namespace `ns`
pub fn combine_key(ns: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ns.len() + 1 + key.len());
    out.extend_from_slice(ns.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(key);
    out
}

/// Physical prefix shared by every key of `ns`
pub fn namespace_prefix(ns: &str) -> Vec<u8> {
    combine_key(ns, &[])
}

/// Split a physical key into (namespace, key)
pub fn split_key(raw: &[u8]) -> Option<(&str, &[u8])> {
    let pos = raw.iter().position(|&b| b == SEPARATOR)?;
    let ns = std::str::from_utf8(&raw[..pos]).ok()?;
    Some((ns, &raw[pos + 1..]))
}
