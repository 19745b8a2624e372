//! Namespace snapshots
//!
//! A materialized, point-in-time view of one namespace. Later commits never
//! change a snapshot that was already taken.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::Transaction;

/// Ordered copy of every live key in one namespace (namespace-relative keys)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Snapshot {
    pub fn new(entries: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Self { entries }
    }

    /// Snapshot with the sets/removes staged in `txn` for `ns` applied
    pub fn with_staged(mut self, txn: &Transaction, ns: &str) -> Self {
        txn.overlay(ns, &mut self.entries);
        self
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    /// All entries in ascending key order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Entries with key >= `start`, ascending
    pub fn range_from<'a>(&'a self, start: &[u8]) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.entries
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Greatest entry with key <= `target`
    pub fn floor(&self, target: &[u8]) -> Option<(&[u8], &[u8])> {
        self.entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(target)))
            .next_back()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.entries
    }
}
