//! Storage Manager
//!
//! Owns the directory of flushed SSTables.
//!
//! ## Responsibilities
//! - Discover tables on startup and drop leftovers of interrupted flushes
//! - Point lookups newest → oldest
//! - Turn a full memtable into a new numbered table
//! - Merge prefix scans across tables

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ExtentError, Result};
use crate::memtable::{MemTable, MemTableEntry};

use super::{Lookup, SSTable, SSTableBuilder, SSTableReader};

/// Open tables plus the id the next flush receives
struct Tables {
    /// Newest first
    readers: Vec<SSTableReader>,
    next_id: u64,
}

/// Manages the storage layer
///
/// Every method takes `&self`; the table list sits behind one RwLock.
/// Lookups take it for writing too, since a reader moves its file cursor.
pub struct StorageManager {
    dir: PathBuf,
    tables: RwLock<Tables>,
}

impl StorageManager {
    /// Open or create the table directory
    ///
    /// `.tmp` files are half-built tables from a crash and are removed.
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;

        let mut ids = discover(path)?;
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let readers = ids
            .iter()
            .map(|&id| SSTableReader::open(&table_path(path, id)))
            .collect::<Result<Vec<_>>>()?;
        if !readers.is_empty() {
            info!(count = readers.len(), dir = %path.display(), "Opened SSTables");
        }

        Ok(Self {
            dir: path.to_path_buf(),
            tables: RwLock::new(Tables {
                readers,
                next_id: ids.first().map_or(1, |&id| id + 1),
            }),
        })
    }

    /// Newest value of `key`; `None` if absent or deleted
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut tables = self.tables.write();

        for reader in tables.readers.iter_mut().filter(|r| r.might_contain(key)) {
            match reader.get(key)? {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Deleted => return Ok(None),
                Lookup::Absent => {}
            }
        }
        Ok(None)
    }

    /// Merge every table's entries under `prefix`, newer tables winning
    ///
    /// Tombstones are kept as `None` so the caller can overlay the memtable
    /// and drop them afterwards.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Option<Vec<u8>>>> {
        let mut tables = self.tables.write();
        let mut merged = BTreeMap::new();

        for reader in tables.readers.iter_mut().rev() {
            merged.extend(reader.scan_prefix(prefix)?);
        }
        Ok(merged)
    }

    /// Write `memtable` out as the newest table
    pub fn flush(&self, memtable: &MemTable) -> Result<SSTable> {
        if memtable.is_empty() {
            return Err(ExtentError::Storage("Cannot flush empty MemTable".to_string()));
        }

        let mut tables = self.tables.write();
        let id = tables.next_id;
        let path = table_path(&self.dir, id);

        let mut builder = SSTableBuilder::new(&path)?;
        for (key, entry) in memtable.iter() {
            match entry {
                MemTableEntry::Value(v) => builder.add(&key, &v)?,
                MemTableEntry::Tombstone => builder.add_tombstone(&key)?,
            }
        }
        let summary = builder.finish()?;

        tables.readers.insert(0, SSTableReader::open(&path)?);
        tables.next_id += 1;

        debug!(id, entries = summary.entry_count, bytes = summary.file_size, "Flushed SSTable");
        Ok(summary)
    }

    pub fn sstable_count(&self) -> usize {
        self.tables.read().readers.len()
    }
}

/// Ids of finished tables in `dir`; removes interrupted builds
fn discover(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "tmp") {
            warn!(path = %path.display(), "Removing incomplete SSTable");
            fs::remove_file(&path)?;
            continue;
        }
        ids.extend(table_id(&path));
    }
    Ok(ids)
}

fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("sstable_{:06}.sst", id))
}

/// "sstable_000042.sst" → Some(42)
fn table_id(path: &Path) -> Option<u64> {
    if path.extension()? != "sst" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("sstable_")?
        .parse()
        .ok()
}
