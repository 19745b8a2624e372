//! Freelist Module
//!
//! Durable mirror of the device's free space, stored in the key-value
//! engine. Mutations are staged into a caller-supplied `Transaction` so they
//! commit atomically with the catalog records that caused them.
//!
//! ## Encodings
//! - `Extent` (namespace `F`): BE offset → BE run length
//! - `Bitmap` (namespace `B`): BE group index → `blocks_per_key / 8` bytes,
//!   bit set = allocated, absent key = whole group free
//!
//! ## Superblock (namespace `S`)
//! `freelist_type`, `size`, `alloc_unit`, `reserved_head`, and for bitmaps
//! `blocks_per_key`. Written once at create, read at open.

mod bitmap;
mod extent;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;

use tracing::{error, info};

use crate::alloc::Extent;
use crate::codec;
use crate::config::Config;
use crate::error::{ExtentError, Result};
use crate::kv::{namespace, KeyValueDb, Transaction};

use bitmap::BitmapFreelist;
use extent::ExtentFreelist;

/// Superblock record keys
pub mod superblock {
    pub const FREELIST_TYPE: &[u8] = b"freelist_type";
    pub const SIZE: &[u8] = b"size";
    pub const ALLOC_UNIT: &[u8] = b"alloc_unit";
    pub const RESERVED_HEAD: &[u8] = b"reserved_head";
    pub const BLOCKS_PER_KEY: &[u8] = b"blocks_per_key";
}

/// Durable freelist encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreelistKind {
    Extent,
    Bitmap,
}

impl FreelistKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreelistKind::Extent => "extent",
            FreelistKind::Bitmap => "bitmap",
        }
    }

    /// Namespace holding this encoding's records
    pub fn namespace(&self) -> &'static str {
        match self {
            FreelistKind::Extent => namespace::FREELIST,
            FreelistKind::Bitmap => namespace::BITMAP,
        }
    }
}

impl fmt::Display for FreelistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FreelistKind {
    type Err = ExtentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extent" => Ok(FreelistKind::Extent),
            "bitmap" => Ok(FreelistKind::Bitmap),
            other => Err(ExtentError::Config(format!("Unknown freelist type: {}", other))),
        }
    }
}

enum Encoding {
    Extent(ExtentFreelist),
    Bitmap(BitmapFreelist),
}

/// Durable free-space manager
pub struct FreelistManager {
    kind: FreelistKind,
    capacity: u64,
    alloc_unit: u64,
    reserved_head: u64,
    encoding: Encoding,
    /// Lazily started by `enumerate_next`, cleared by `enumerate_reset`
    cursor: Option<FreeRuns>,
}

impl FreelistManager {
    fn with_params(
        kind: FreelistKind,
        capacity: u64,
        alloc_unit: u64,
        reserved_head: u64,
        blocks_per_key: u64,
    ) -> Self {
        let encoding = match kind {
            FreelistKind::Extent => Encoding::Extent(ExtentFreelist::new(capacity)),
            FreelistKind::Bitmap => {
                Encoding::Bitmap(BitmapFreelist::new(capacity, alloc_unit, blocks_per_key))
            }
        };
        Self {
            kind,
            capacity,
            alloc_unit,
            reserved_head,
            encoding,
            cursor: None,
        }
    }

    /// Stage a fresh freelist covering the whole device minus the reserved
    /// head, plus the superblock records
    pub fn create(config: &Config, txn: &mut Transaction) -> Result<Self> {
        config.validate()?;

        let kind = config.freelist_kind;
        let capacity = config.device_size;
        let head = config.reserved_head_aligned();
        let mgr = Self::with_params(
            kind,
            capacity,
            config.alloc_unit,
            head,
            config.bitmap_blocks_per_key,
        );

        let sb = namespace::SUPERBLOCK;
        txn.set(sb, superblock::FREELIST_TYPE, kind.as_str().as_bytes().to_vec());
        txn.set(sb, superblock::SIZE, codec::encode_u64_value(capacity));
        txn.set(sb, superblock::ALLOC_UNIT, codec::encode_u64_value(config.alloc_unit));
        txn.set(sb, superblock::RESERVED_HEAD, codec::encode_u64_value(head));

        let mut view = StagedView::new(kind.namespace(), BTreeMap::new(), txn);
        match &mgr.encoding {
            Encoding::Extent(enc) => {
                enc.stage_release(&mut view, Extent::new(head, capacity - head))?;
            }
            Encoding::Bitmap(enc) => {
                view.txn.set(
                    sb,
                    superblock::BLOCKS_PER_KEY,
                    codec::encode_u64_value(config.bitmap_blocks_per_key),
                );
                // Absent groups read as free; only the head needs bits
                enc.stage_allocate(&mut view, Extent::new(0, head))?;
            }
        }

        info!(
            freelist = %kind,
            capacity,
            alloc_unit = config.alloc_unit,
            reserved_head = head,
            "Freelist created"
        );
        Ok(mgr)
    }

    /// Reattach to an existing freelist without mutating it
    ///
    /// The superblock selects the encoding; its device size and allocation
    /// unit must match `config`.
    pub fn open<D: KeyValueDb>(db: &D, config: &Config) -> Result<Self> {
        let sb = namespace::SUPERBLOCK;
        let kind_raw = db
            .get(sb, superblock::FREELIST_TYPE)?
            .ok_or_else(|| ExtentError::CorruptRecord("superblock is missing".to_string()))?;
        let kind: FreelistKind = std::str::from_utf8(&kind_raw)
            .map_err(|_| ExtentError::CorruptRecord("freelist_type is not UTF-8".to_string()))?
            .parse()?;

        let capacity = read_u64(db, superblock::SIZE)?;
        let alloc_unit = read_u64(db, superblock::ALLOC_UNIT)?;
        let reserved_head = read_u64(db, superblock::RESERVED_HEAD)?;

        if capacity != config.device_size {
            return Err(ExtentError::CorruptRecord(format!(
                "superblock size {} does not match configured device size {}",
                capacity, config.device_size
            )));
        }
        if alloc_unit != config.alloc_unit {
            return Err(ExtentError::Config(format!(
                "superblock alloc_unit {} does not match configured {}",
                alloc_unit, config.alloc_unit
            )));
        }

        let blocks_per_key = match kind {
            FreelistKind::Bitmap => {
                let bpk = read_u64(db, superblock::BLOCKS_PER_KEY)?;
                if bpk == 0 || bpk % 8 != 0 {
                    return Err(ExtentError::CorruptRecord(format!(
                        "invalid blocks_per_key {}",
                        bpk
                    )));
                }
                bpk
            }
            FreelistKind::Extent => 0,
        };

        info!(freelist = %kind, capacity, alloc_unit, "Freelist opened");
        Ok(Self::with_params(kind, capacity, alloc_unit, reserved_head, blocks_per_key))
    }

    /// Stage allocation of one range
    pub fn allocate<D: KeyValueDb>(
        &self,
        db: &D,
        offset: u64,
        length: u64,
        txn: &mut Transaction,
    ) -> Result<()> {
        self.allocate_all(db, &[Extent::new(offset, length)], txn)
    }

    /// Stage release of one range
    pub fn release<D: KeyValueDb>(
        &self,
        db: &D,
        offset: u64,
        length: u64,
        txn: &mut Transaction,
    ) -> Result<()> {
        self.release_all(db, &[Extent::new(offset, length)], txn)
    }

    /// Stage allocation of every extent against one snapshot
    ///
    /// Earlier stagings in `txn` are visible, so extents may be split from
    /// the same run.
    pub fn allocate_all<D: KeyValueDb>(
        &self,
        db: &D,
        extents: &[Extent],
        txn: &mut Transaction,
    ) -> Result<()> {
        let mut view = self.staged_view(db, txn)?;
        for &e in extents.iter().filter(|e| e.length > 0) {
            let staged = match &self.encoding {
                Encoding::Extent(enc) => enc.stage_allocate(&mut view, e),
                Encoding::Bitmap(enc) => enc.stage_allocate(&mut view, e),
            };
            if let Err(err) = staged {
                error!(extent = %e, error = %err, "Freelist allocate rejected");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stage release of every extent against one snapshot
    pub fn release_all<D: KeyValueDb>(
        &self,
        db: &D,
        extents: &[Extent],
        txn: &mut Transaction,
    ) -> Result<()> {
        let mut view = self.staged_view(db, txn)?;
        for &e in extents.iter().filter(|e| e.length > 0) {
            let staged = match &self.encoding {
                Encoding::Extent(enc) => enc.stage_release(&mut view, e),
                Encoding::Bitmap(enc) => enc.stage_release(&mut view, e),
            };
            if let Err(err) = staged {
                error!(extent = %e, error = %err, "Freelist release rejected");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stage removal of every freelist record
    pub(crate) fn stage_clear<D: KeyValueDb>(&self, db: &D, txn: &mut Transaction) -> Result<()> {
        let ns = self.kind.namespace();
        for (key, _) in db.snapshot(ns)?.iter() {
            txn.remove(ns, key);
        }
        Ok(())
    }

    /// Stage a freelist that is exactly `free` (ascending, non-overlapping)
    /// on top of an empty namespace
    pub(crate) fn stage_rebuild(&self, free: &[Extent], txn: &mut Transaction) -> Result<()> {
        let mut view = StagedView::new(self.kind.namespace(), BTreeMap::new(), txn);
        match &self.encoding {
            Encoding::Extent(enc) => {
                for &e in free.iter().filter(|e| e.length > 0) {
                    enc.stage_release(&mut view, e)?;
                }
            }
            Encoding::Bitmap(enc) => {
                // Start from all-allocated, then clear each free run
                let mut cursor = 0;
                for &e in free {
                    if e.offset > cursor {
                        enc.stage_allocate(&mut view, Extent::new(cursor, e.offset - cursor))?;
                    }
                    cursor = cursor.max(e.end());
                }
                if cursor < self.capacity {
                    enc.stage_allocate(&mut view, Extent::new(cursor, self.capacity - cursor))?;
                }
            }
        }
        Ok(())
    }

    /// Restart enumeration from the lowest offset
    pub fn enumerate_reset(&mut self) {
        self.cursor = None;
    }

    /// Next free run in ascending offset order, or `None` when exhausted
    ///
    /// The first call after a reset takes a snapshot; later commits do not
    /// affect the sequence in progress.
    pub fn enumerate_next<D: KeyValueDb>(&mut self, db: &D) -> Result<Option<(u64, u64)>> {
        if self.cursor.is_none() {
            self.cursor = Some(self.free_runs(db)?);
        }
        Ok(self
            .cursor
            .as_mut()
            .and_then(|runs| runs.next())
            .map(|e| (e.offset, e.length)))
    }

    /// Iterator over current free runs, ascending and coalesced
    pub fn free_runs<D: KeyValueDb>(&self, db: &D) -> Result<FreeRuns> {
        let snapshot = db.snapshot(self.kind.namespace())?.into_inner();
        let raw = match &self.encoding {
            Encoding::Extent(enc) => enc.decode_runs(&snapshot)?,
            Encoding::Bitmap(enc) => enc.decode_runs(&snapshot)?,
        };
        Ok(FreeRuns::new(raw))
    }

    /// Total durable free bytes
    pub fn get_free<D: KeyValueDb>(&self, db: &D) -> Result<u64> {
        Ok(self.free_runs(db)?.map(|e| e.length).sum())
    }

    pub fn kind(&self) -> FreelistKind {
        self.kind
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn alloc_unit(&self) -> u64 {
        self.alloc_unit
    }

    /// Reserved head, already rounded to the allocation unit
    pub fn reserved_head(&self) -> u64 {
        self.reserved_head
    }

    fn staged_view<'a, D: KeyValueDb>(
        &self,
        db: &D,
        txn: &'a mut Transaction,
    ) -> Result<StagedView<'a>> {
        let ns = self.kind.namespace();
        let view = db.snapshot(ns)?.with_staged(txn, ns).into_inner();
        Ok(StagedView::new(ns, view, txn))
    }
}

fn read_u64<D: KeyValueDb>(db: &D, key: &[u8]) -> Result<u64> {
    let raw = db.get(namespace::SUPERBLOCK, key)?.ok_or_else(|| {
        ExtentError::CorruptRecord(format!(
            "superblock record {} is missing",
            String::from_utf8_lossy(key)
        ))
    })?;
    codec::decode_u64_value(&raw)
}

/// Snapshot of one namespace with this transaction's writes applied; every
/// write goes to both the view and the transaction
struct StagedView<'a> {
    ns: &'static str,
    view: BTreeMap<Vec<u8>, Vec<u8>>,
    txn: &'a mut Transaction,
}

impl<'a> StagedView<'a> {
    fn new(ns: &'static str, view: BTreeMap<Vec<u8>, Vec<u8>>, txn: &'a mut Transaction) -> Self {
        Self { ns, view, txn }
    }

    fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.view.get(key).map(|v| v.as_slice())
    }

    /// Greatest entry with key <= `target`
    fn floor(&self, target: &[u8]) -> Option<(&[u8], &[u8])> {
        self.view
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(target)))
            .next_back()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Least entry with key >= `target`
    fn ceiling(&self, target: &[u8]) -> Option<(&[u8], &[u8])> {
        self.view
            .range::<[u8], _>((Bound::Included(target), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.txn.set(self.ns, &key, value.clone());
        self.view.insert(key, value);
    }

    fn remove(&mut self, key: &[u8]) {
        self.txn.remove(self.ns, key);
        self.view.remove(key);
    }
}

/// Ascending, coalesced free runs
pub struct FreeRuns {
    raw: std::vec::IntoIter<Extent>,
    pending: Option<Extent>,
}

impl FreeRuns {
    fn new(raw: Vec<Extent>) -> Self {
        Self {
            raw: raw.into_iter(),
            pending: None,
        }
    }
}

impl Iterator for FreeRuns {
    type Item = Extent;

    fn next(&mut self) -> Option<Extent> {
        let mut current = match self.pending.take() {
            Some(e) => e,
            None => self.raw.next()?,
        };
        for next in self.raw.by_ref() {
            if next.offset == current.end() {
                current.length += next.length;
            } else {
                self.pending = Some(next);
                break;
            }
        }
        Some(current)
    }
}
