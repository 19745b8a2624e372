//! Metadata Catalog
//!
//! Maps object names to the extents they own. Every mutation is one
//! key-value transaction that updates the freelist, the metadata record and
//! the aggregate counters together, so durable state never shows half of a
//! save or delete.
//!
//! ## Save
//! ```text
//! reserve ─► plan ─► stage (freelist + record + counters) ─► commit ─► apply_plan
//!    │         │                                               │
//!    └─────────┴──── unreserve on any failure ◄────────────────┘
//! ```
//! The in-memory allocator only changes after a successful commit.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::alloc::{total_length, Extent, SpaceAllocator};
use crate::codec::MetadataRecord;
use crate::config::{round_up, Config};
use crate::error::{ExtentError, Result};
use crate::freelist::{superblock, FreelistManager};
use crate::kv::{namespace, KeyValueDb, Transaction};
use crate::merge::{decode_elements, encode_elements, AggregateMergeOperator};

/// Key of the catalog's aggregate record in the `A` namespace
pub const COUNTERS_KEY: &[u8] = b"catalog";

/// First-fit search starts here
const ALLOC_HINT: u64 = 0;

/// One catalog object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub name: String,
    pub size: u64,
    pub extents: Vec<Extent>,
}

impl ObjectMetadata {
    /// Bytes held on the device (size rounded up to the allocation unit)
    pub fn allocated_bytes(&self) -> u64 {
        total_length(&self.extents)
    }
}

/// Running totals kept through the merge operator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogCounters {
    pub objects: i64,
    pub allocated_bytes: i64,
    pub saves: i64,
    pub deletes: i64,
}

impl CatalogCounters {
    const ELEMENTS: usize = 4;

    fn delta(objects: i64, bytes: i64, saves: i64, deletes: i64) -> Vec<u8> {
        encode_elements(&[objects, bytes, saves, deletes])
    }

    fn encode(&self) -> Vec<u8> {
        Self::delta(self.objects, self.allocated_bytes, self.saves, self.deletes)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let v = decode_elements(bytes)?;
        if v.len() != Self::ELEMENTS {
            return Err(ExtentError::CorruptRecord(format!(
                "catalog counters have {} elements, expected {}",
                v.len(),
                Self::ELEMENTS
            )));
        }
        Ok(Self {
            objects: v[0],
            allocated_bytes: v[1],
            saves: v[2],
            deletes: v[3],
        })
    }
}

/// Point-in-time catalog summary
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogStats {
    pub counters: CatalogCounters,
    pub capacity: u64,
    pub reserved_head: u64,
    pub free: u64,
    pub reserved: u64,
    pub fragmentation: f64,
}

/// Two owners claiming the same bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    pub first: String,
    pub second: String,
    pub offset: u64,
    pub length: u64,
}

/// Result of `MetadataCatalog::verify`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub objects: usize,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    /// Bytes neither free, reserved nor owned by any object
    pub leaked_bytes: u64,
    pub overlaps: Vec<Overlap>,
    pub mismatches: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.leaked_bytes == 0 && self.overlaps.is_empty() && self.mismatches.is_empty()
    }
}

const OWNER_FREE: &str = "<free>";
const OWNER_HEAD: &str = "<reserved head>";

/// Name → extents catalog over a transactional key-value store
///
/// Owns the store, the allocator and the freelist. Mutating methods take
/// `&mut self`; share a catalog across threads behind a mutex.
pub struct MetadataCatalog<D: KeyValueDb> {
    config: Config,
    db: D,
    allocator: SpaceAllocator,
    freelist: FreelistManager,
}

impl<D: KeyValueDb> MetadataCatalog<D> {
    /// Format `db`: stage a fresh freelist and superblock, then build the
    /// allocator from it
    pub fn create(config: Config, db: D) -> Result<Self> {
        config.validate()?;
        if db.get(namespace::SUPERBLOCK, superblock::FREELIST_TYPE)?.is_some() {
            return Err(ExtentError::Config(
                "store already holds a freelist; use open".to_string(),
            ));
        }
        register_merge_operator(&db)?;

        let mut txn = Transaction::new();
        let freelist = FreelistManager::create(&config, &mut txn)?;
        db.submit_transaction_sync(txn)
            .map_err(into_transaction_failure)?;

        let mut catalog = Self::assemble(config, db, freelist)?;
        catalog.rebuild_allocator()?;
        info!(
            capacity = catalog.allocator.capacity(),
            free = catalog.allocator.get_free(),
            "Catalog created"
        );
        Ok(catalog)
    }

    /// Attach to an existing store and rebuild the allocator from its
    /// freelist
    pub fn open(config: Config, db: D) -> Result<Self> {
        config.validate()?;
        register_merge_operator(&db)?;
        let freelist = FreelistManager::open(&db, &config)?;

        let mut catalog = Self::assemble(config, db, freelist)?;
        catalog.rebuild_allocator()?;
        info!(
            capacity = catalog.allocator.capacity(),
            free = catalog.allocator.get_free(),
            "Catalog opened"
        );
        Ok(catalog)
    }

    fn assemble(config: Config, db: D, freelist: FreelistManager) -> Result<Self> {
        let allocator = SpaceAllocator::new(
            config.allocator_kind,
            freelist.capacity(),
            freelist.alloc_unit(),
        )?;
        Ok(Self {
            config,
            db,
            allocator,
            freelist,
        })
    }

    /// Replace the allocator with one seeded from a freelist enumeration
    fn rebuild_allocator(&mut self) -> Result<()> {
        let mut allocator = SpaceAllocator::new(
            self.config.allocator_kind,
            self.freelist.capacity(),
            self.freelist.alloc_unit(),
        )?;

        self.freelist.enumerate_reset();
        let mut runs = 0usize;
        while let Some((offset, length)) = self.freelist.enumerate_next(&self.db)? {
            allocator.init_add_free(offset, length)?;
            runs += 1;
        }
        self.freelist.enumerate_reset();

        debug!(runs, free = allocator.get_free(), "Allocator rebuilt");
        self.allocator = allocator;
        Ok(())
    }

    /// Allocate space for `name` and record it
    pub fn save(&mut self, name: &str, size: u64) -> Result<ObjectMetadata> {
        if self.db.get(namespace::METADATA, name.as_bytes())?.is_some() {
            return Err(ExtentError::AlreadyExists(name.to_string()));
        }

        let unit = self.freelist.alloc_unit();
        let Some(want) = round_up(size, unit) else {
            return Err(ExtentError::CapacityExceeded {
                requested: size,
                available: self.allocator.available(),
            });
        };
        if !self.allocator.reserve(want) {
            return Err(ExtentError::CapacityExceeded {
                requested: want,
                available: self.allocator.available(),
            });
        }

        let extents = match self.stage_save(name, size, want) {
            Ok((extents, txn)) => match self.db.submit_transaction_sync(txn) {
                Ok(()) => extents,
                Err(e) => {
                    self.allocator.unreserve(want);
                    warn!(name, error = %e, "Save commit failed");
                    return Err(into_transaction_failure(e));
                }
            },
            Err(e) => {
                self.allocator.unreserve(want);
                return Err(e);
            }
        };

        if let Err(e) = self.allocator.apply_plan(&extents) {
            error!(name, error = %e, "Committed plan does not match allocator");
            return Err(e);
        }

        debug!(name, size, extents = extents.len(), "Object saved");
        Ok(ObjectMetadata {
            name: name.to_string(),
            size,
            extents,
        })
    }

    /// Plan extents and build the save transaction; nothing is mutated
    fn stage_save(&self, name: &str, size: u64, want: u64) -> Result<(Vec<Extent>, Transaction)> {
        let unit = self.freelist.alloc_unit();
        let extents = self
            .allocator
            .plan(want, unit, self.config.max_extent_size, ALLOC_HINT)?;

        let got = total_length(&extents);
        if got < want {
            return Err(ExtentError::FragmentationFailure {
                wanted: want,
                allocated: got,
            });
        }

        let mut txn = Transaction::new();
        self.freelist.allocate_all(&self.db, &extents, &mut txn)?;
        txn.set(
            namespace::METADATA,
            name.as_bytes(),
            MetadataRecord::new(size, extents.clone()).encode(),
        );
        txn.merge(
            namespace::AGGREGATE,
            COUNTERS_KEY,
            CatalogCounters::delta(1, got as i64, 1, 0),
        );
        Ok((extents, txn))
    }

    /// Look up an object
    pub fn load(&self, name: &str) -> Result<ObjectMetadata> {
        let raw = self
            .db
            .get(namespace::METADATA, name.as_bytes())?
            .ok_or_else(|| ExtentError::NotFound(name.to_string()))?;
        let record = MetadataRecord::decode(&raw)?;
        Ok(ObjectMetadata {
            name: name.to_string(),
            size: record.size,
            extents: record.extents,
        })
    }

    /// Remove an object and return its extents to the freelist
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let object = self.load(name)?;
        let bytes = object.allocated_bytes();

        let mut txn = Transaction::new();
        txn.remove(namespace::METADATA, name.as_bytes());
        self.freelist
            .release_all(&self.db, &object.extents, &mut txn)?;
        txn.merge(
            namespace::AGGREGATE,
            COUNTERS_KEY,
            CatalogCounters::delta(-1, -(bytes as i64), 0, 1),
        );

        if let Err(e) = self.db.submit_transaction_sync(txn) {
            warn!(name, error = %e, "Delete commit failed");
            return Err(into_transaction_failure(e));
        }

        for e in &object.extents {
            if let Err(err) = self.allocator.release(e.offset, e.length) {
                error!(name, extent = %e, error = %err, "Committed release does not match allocator");
                return Err(err);
            }
        }

        debug!(name, bytes, "Object deleted");
        Ok(())
    }

    /// Every object in name order
    pub fn list(&self) -> Result<Vec<ObjectMetadata>> {
        self.db
            .snapshot(namespace::METADATA)?
            .iter()
            .map(|(key, value)| {
                let name = std::str::from_utf8(key).map_err(|_| {
                    ExtentError::CorruptRecord(format!("object name {:?} is not UTF-8", key))
                })?;
                let record = MetadataRecord::decode(value)?;
                Ok(ObjectMetadata {
                    name: name.to_string(),
                    size: record.size,
                    extents: record.extents,
                })
            })
            .collect()
    }

    /// Aggregate counters; zeros before the first save
    pub fn counters(&self) -> Result<CatalogCounters> {
        match self.db.get(namespace::AGGREGATE, COUNTERS_KEY)? {
            Some(raw) => CatalogCounters::decode(&raw),
            None => Ok(CatalogCounters::default()),
        }
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        Ok(CatalogStats {
            counters: self.counters()?,
            capacity: self.allocator.capacity(),
            reserved_head: self.freelist.reserved_head(),
            free: self.allocator.get_free(),
            reserved: self.allocator.get_reserved(),
            fragmentation: self.allocator.fragmentation(),
        })
    }

    /// Cross-check metadata, freelist, counters and allocator
    pub fn verify(&self) -> Result<VerifyReport> {
        let objects = self.list()?;
        let free: Vec<Extent> = self.freelist.free_runs(&self.db)?.collect();

        let mut claims: Vec<(Extent, &str)> = Vec::new();
        claims.push((Extent::new(0, self.freelist.reserved_head()), OWNER_HEAD));
        claims.extend(free.iter().map(|&e| (e, OWNER_FREE)));
        for object in &objects {
            claims.extend(object.extents.iter().map(|&e| (e, object.name.as_str())));
        }
        claims.retain(|(e, _)| e.length > 0);
        claims.sort_by_key(|(e, _)| (e.offset, e.length));

        let mut overlaps = Vec::new();
        let mut covered = 0u64;
        let mut frontier: Option<(Extent, &str)> = None;
        for &(extent, owner) in &claims {
            match frontier {
                Some((last, last_owner)) if last.end() > extent.offset => {
                    let end = last.end().min(extent.end());
                    overlaps.push(Overlap {
                        first: last_owner.to_string(),
                        second: owner.to_string(),
                        offset: extent.offset,
                        length: end - extent.offset,
                    });
                    if extent.end() > last.end() {
                        covered += extent.end() - last.end();
                        frontier = Some((extent, owner));
                    }
                }
                _ => {
                    covered += extent.length;
                    frontier = Some((extent, owner));
                }
            }
        }

        let capacity = self.freelist.capacity();
        let allocated_bytes: u64 = objects.iter().map(|o| o.allocated_bytes()).sum();
        let free_bytes = total_length(&free);
        let head = self.freelist.reserved_head();

        let mut mismatches = Vec::new();
        if free_bytes + allocated_bytes + head != capacity {
            mismatches.push(format!(
                "free {} + allocated {} + head {} != capacity {}",
                free_bytes, allocated_bytes, head, capacity
            ));
        }
        if self.allocator.get_free() != free_bytes {
            mismatches.push(format!(
                "allocator free {} != freelist free {}",
                self.allocator.get_free(),
                free_bytes
            ));
        }
        let counters = self.counters()?;
        if counters.objects != objects.len() as i64 {
            mismatches.push(format!(
                "counter objects {} != {} records",
                counters.objects,
                objects.len()
            ));
        }
        if counters.allocated_bytes != allocated_bytes as i64 {
            mismatches.push(format!(
                "counter bytes {} != {} allocated",
                counters.allocated_bytes, allocated_bytes
            ));
        }
        for object in &objects {
            if object.allocated_bytes() < object.size {
                mismatches.push(format!(
                    "{} holds {} bytes for size {}",
                    object.name,
                    object.allocated_bytes(),
                    object.size
                ));
            }
        }

        let report = VerifyReport {
            objects: objects.len(),
            allocated_bytes,
            free_bytes,
            leaked_bytes: capacity.saturating_sub(covered),
            overlaps,
            mismatches,
        };
        if !report.is_consistent() {
            warn!(
                leaked = report.leaked_bytes,
                overlaps = report.overlaps.len(),
                mismatches = report.mismatches.len(),
                "Catalog verification found problems"
            );
        }
        Ok(report)
    }

    /// Recompute the freelist and counters from the metadata records
    ///
    /// Returns the number of free bytes gained. Refuses to run while
    /// objects overlap each other.
    pub fn rebuild_freelist(&mut self) -> Result<u64> {
        let objects = self.list()?;
        let capacity = self.freelist.capacity();

        let mut used: Vec<(Extent, &str)> = vec![(Extent::new(0, self.freelist.reserved_head()), OWNER_HEAD)];
        for object in &objects {
            used.extend(object.extents.iter().map(|&e| (e, object.name.as_str())));
        }
        used.retain(|(e, _)| e.length > 0);
        used.sort_by_key(|(e, _)| (e.offset, e.length));

        let mut free = Vec::new();
        let mut cursor = 0u64;
        let mut last_owner = OWNER_HEAD;
        for &(extent, owner) in &used {
            if extent.offset < cursor {
                let err = ExtentError::ConsistencyViolation(format!(
                    "{} and {} both claim 0x{:x}",
                    last_owner, owner, extent.offset
                ));
                error!(error = %err, "Freelist rebuild refused");
                return Err(err);
            }
            if extent.end() > capacity {
                return Err(ExtentError::ConsistencyViolation(format!(
                    "{} claims {} past the device end",
                    owner, extent
                )));
            }
            if extent.offset > cursor {
                free.push(Extent::new(cursor, extent.offset - cursor));
            }
            cursor = extent.end();
            last_owner = owner;
        }
        if cursor < capacity {
            free.push(Extent::new(cursor, capacity - cursor));
        }

        let before = self.freelist.get_free(&self.db)?;
        let history = self.counters()?;
        let counters = CatalogCounters {
            objects: objects.len() as i64,
            allocated_bytes: objects.iter().map(|o| o.allocated_bytes() as i64).sum(),
            ..history
        };

        let mut txn = Transaction::new();
        self.freelist.stage_clear(&self.db, &mut txn)?;
        self.freelist.stage_rebuild(&free, &mut txn)?;
        txn.set(namespace::AGGREGATE, COUNTERS_KEY, counters.encode());
        self.db
            .submit_transaction_sync(txn)
            .map_err(into_transaction_failure)?;

        self.rebuild_allocator()?;
        let after = self.allocator.get_free();
        info!(before, after, "Freelist rebuilt from catalog");
        Ok(after.saturating_sub(before))
    }

    /// Flush and close the store
    pub fn close(self) -> Result<()> {
        info!(objects = ?self.counters().map(|c| c.objects).ok(), "Catalog closing");
        self.db.close()
    }

    pub fn allocator(&self) -> &SpaceAllocator {
        &self.allocator
    }

    pub fn freelist(&self) -> &FreelistManager {
        &self.freelist
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn register_merge_operator<D: KeyValueDb>(db: &D) -> Result<()> {
    db.set_merge_operator(namespace::AGGREGATE, Arc::new(AggregateMergeOperator::new()))
}

fn into_transaction_failure(e: ExtentError) -> ExtentError {
    match e {
        ExtentError::TransactionFailure(_) => e,
        other => ExtentError::TransactionFailure(other.to_string()),
    }
}
