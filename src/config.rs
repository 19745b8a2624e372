//! Configuration for extentdb
//!
//! Centralized configuration with sensible defaults. A `Config` value is
//! passed explicitly to `Engine::open` and `MetadataCatalog::{create, open}`.

use std::path::PathBuf;

use crate::alloc::AllocatorKind;
use crate::error::{ExtentError, Result};
use crate::freelist::FreelistKind;

/// Main configuration for an extentdb instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files (WAL, SSTables, etc.)
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── wal.log          (write-ahead log)
    ///     └── sstables/        (SSTable files)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync WAL
    pub wal_sync_strategy: WalSyncStrategy,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Max size of memtable before flush (in bytes)
    pub memtable_size_limit: usize,

    // -------------------------------------------------------------------------
    // Device / Allocation Configuration
    // -------------------------------------------------------------------------
    /// Total device capacity in bytes
    pub device_size: u64,

    /// Allocation unit; every extent handed out is a multiple of it
    pub alloc_unit: u64,

    /// Bytes at the start of the device never handed out (rounded up to
    /// `alloc_unit` when the freelist is created)
    pub reserved_head: u64,

    /// Longest single extent the allocator may emit (0 = unlimited)
    pub max_extent_size: u64,

    /// In-memory allocator backend
    pub allocator_kind: AllocatorKind,

    /// Durable freelist encoding (recorded in the superblock on create)
    pub freelist_kind: FreelistKind,

    /// Blocks covered by one bitmap freelist record (multiple of 8)
    pub bitmap_blocks_per_key: u64,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N uncommitted entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./extentdb_data"),
            wal_sync_strategy: WalSyncStrategy::EveryWrite,
            memtable_size_limit: 4 * 1024 * 1024, // 4 MB
            device_size: 1024 * 1024 * 1024,      // 1 GB
            alloc_unit: 64 * 1024,                // 64 KB
            reserved_head: 8 * 1024,              // 8 KB
            max_extent_size: 0,
            allocator_kind: AllocatorKind::Extent,
            freelist_kind: FreelistKind::Extent,
            bitmap_blocks_per_key: 1024,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reserved head region rounded up to the allocation unit
    pub fn reserved_head_aligned(&self) -> u64 {
        // Saturates so validate() reports an oversized head instead of wrapping
        round_up(self.reserved_head, self.alloc_unit).unwrap_or(u64::MAX)
    }

    /// Check the allocation parameters for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.alloc_unit == 0 || !self.alloc_unit.is_power_of_two() {
            return Err(ExtentError::Config(format!(
                "alloc_unit must be a non-zero power of two, got {}",
                self.alloc_unit
            )));
        }
        if self.device_size % self.alloc_unit != 0 {
            return Err(ExtentError::Config(format!(
                "device_size {} is not a multiple of alloc_unit {}",
                self.device_size, self.alloc_unit
            )));
        }
        if self.reserved_head_aligned() > self.device_size {
            return Err(ExtentError::Config(format!(
                "reserved head {} exceeds device size {}",
                self.reserved_head_aligned(),
                self.device_size
            )));
        }
        if self.max_extent_size != 0 && self.max_extent_size < self.alloc_unit {
            return Err(ExtentError::Config(format!(
                "max_extent_size {} is smaller than alloc_unit {}",
                self.max_extent_size, self.alloc_unit
            )));
        }
        if self.bitmap_blocks_per_key == 0 || self.bitmap_blocks_per_key % 8 != 0 {
            return Err(ExtentError::Config(format!(
                "bitmap_blocks_per_key must be a non-zero multiple of 8, got {}",
                self.bitmap_blocks_per_key
            )));
        }
        Ok(())
    }
}

/// Round `value` up to the next multiple of `unit`; `None` on overflow
pub fn round_up(value: u64, unit: u64) -> Option<u64> {
    if unit == 0 {
        return Some(value);
    }
    value.div_ceil(unit).checked_mul(unit)
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the memtable size limit (in bytes)
    pub fn memtable_size_limit(mut self, size: usize) -> Self {
        self.config.memtable_size_limit = size;
        self
    }

    /// Set the device capacity (in bytes)
    pub fn device_size(mut self, size: u64) -> Self {
        self.config.device_size = size;
        self
    }

    /// Set the allocation unit (in bytes)
    pub fn alloc_unit(mut self, unit: u64) -> Self {
        self.config.alloc_unit = unit;
        self
    }

    /// Set the reserved head region (in bytes)
    pub fn reserved_head(mut self, size: u64) -> Self {
        self.config.reserved_head = size;
        self
    }

    /// Set the maximum extent length (0 = unlimited)
    pub fn max_extent_size(mut self, size: u64) -> Self {
        self.config.max_extent_size = size;
        self
    }

    /// Select the in-memory allocator backend
    pub fn allocator_kind(mut self, kind: AllocatorKind) -> Self {
        self.config.allocator_kind = kind;
        self
    }

    /// Select the durable freelist encoding
    pub fn freelist_kind(mut self, kind: FreelistKind) -> Self {
        self.config.freelist_kind = kind;
        self
    }

    /// Set the number of blocks per bitmap freelist record
    pub fn bitmap_blocks_per_key(mut self, blocks: u64) -> Self {
        self.config.bitmap_blocks_per_key = blocks;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
