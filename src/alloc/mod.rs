//! Space Allocator Module
//!
//! In-memory index of free device space. It is a cache rebuilt from the
//! durable freelist at startup and never persisted directly.
//!
//! ## Two-Phase Allocation
//! ```text
//! reserve(size) ──► plan(want, unit, max, hint) ──► commit ──► apply_plan(extents)
//!      │                     │                                      │
//!  counter only        read-only search                 init_rm_free + consume
//! ```
//! `allocate` performs `plan` and `apply_plan` back to back for callers that
//! have nothing to commit in between.
//!
//! ## Backends
//! - `Extent`: ordered map of free runs, coalesced on release
//! - `Bitmap`: one bit per allocation unit (set = allocated)

mod bitmap;
mod extent;

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{ExtentError, Result};

pub use bitmap::BitmapAllocator;
pub use extent::ExtentAllocator;

/// A contiguous byte range on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}~0x{:x}", self.offset, self.length)
    }
}

/// Sum of extent lengths
pub fn total_length(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.length).sum()
}

/// In-memory allocator backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Extent,
    Bitmap,
}

impl AllocatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocatorKind::Extent => "extent",
            AllocatorKind::Bitmap => "bitmap",
        }
    }
}

impl FromStr for AllocatorKind {
    type Err = ExtentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extent" => Ok(AllocatorKind::Extent),
            "bitmap" => Ok(AllocatorKind::Bitmap),
            other => Err(ExtentError::Config(format!("Unknown allocator kind: {}", other))),
        }
    }
}

enum Backend {
    Extent(ExtentAllocator),
    Bitmap(BitmapAllocator),
}

impl Backend {
    fn insert_free(&mut self, extent: Extent) -> Result<()> {
        match self {
            Backend::Extent(a) => a.insert_free(extent),
            Backend::Bitmap(a) => a.insert_free(extent),
        }
    }

    fn remove_free(&mut self, extent: Extent) -> Result<()> {
        match self {
            Backend::Extent(a) => a.remove_free(extent),
            Backend::Bitmap(a) => a.remove_free(extent),
        }
    }

    fn free_runs(&self) -> Vec<Extent> {
        match self {
            Backend::Extent(a) => a.free_runs(),
            Backend::Bitmap(a) => a.free_runs(),
        }
    }

    fn largest_run(&self) -> u64 {
        match self {
            Backend::Extent(a) => a.largest_run(),
            Backend::Bitmap(a) => a.free_runs().iter().map(|r| r.length).max().unwrap_or(0),
        }
    }
}

/// Free-space index with soft reservations
///
/// Not internally synchronized. A reserve→plan→commit→apply sequence must
/// run under a single owner (the catalog takes `&mut self`).
pub struct SpaceAllocator {
    kind: AllocatorKind,
    capacity: u64,
    free: u64,
    reserved: u64,
    backend: Backend,
}

impl SpaceAllocator {
    /// Create an allocator with no free space
    ///
    /// `block_size` is the bitmap granularity; the extent backend accepts
    /// ranges of any alignment.
    pub fn new(kind: AllocatorKind, capacity: u64, block_size: u64) -> Result<Self> {
        let backend = match kind {
            AllocatorKind::Extent => Backend::Extent(ExtentAllocator::new(capacity)),
            AllocatorKind::Bitmap => Backend::Bitmap(BitmapAllocator::new(capacity, block_size)?),
        };
        Ok(Self {
            kind,
            capacity,
            free: 0,
            reserved: 0,
            backend,
        })
    }

    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    /// Seed a free run (bootstrap)
    pub fn init_add_free(&mut self, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.backend.insert_free(Extent::new(offset, length))?;
        self.free += length;
        Ok(())
    }

    /// Mark a currently free range allocated; reservations are untouched
    pub fn init_rm_free(&mut self, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.backend.remove_free(Extent::new(offset, length))?;
        self.free -= length;
        Ok(())
    }

    /// Soft reservation: succeeds iff `free - reserved >= size`
    pub fn reserve(&mut self, size: u64) -> bool {
        if self.available() < size {
            return false;
        }
        self.reserved += size;
        true
    }

    /// Return an unused reservation
    pub fn unreserve(&mut self, size: u64) {
        self.reserved = self.reserved.saturating_sub(size);
    }

    /// First-fit search without mutating anything
    ///
    /// Runs at or after `hint` are tried first, then the search wraps to the
    /// start of the device. Every extent is a multiple of `min_unit` and no
    /// longer than `max_extent_size` (0 = unlimited). The total is at most
    /// `want_size` rounded down to `min_unit`; a shorter result means the
    /// free space is too fragmented.
    pub fn plan(
        &self,
        want_size: u64,
        min_unit: u64,
        max_extent_size: u64,
        hint: u64,
    ) -> Result<Vec<Extent>> {
        if min_unit == 0 {
            return Err(ExtentError::Config("min_unit must be non-zero".to_string()));
        }

        let max_chunk = match max_extent_size {
            0 => u64::MAX,
            m => m - m % min_unit,
        };
        if max_chunk == 0 {
            return Err(ExtentError::Config(format!(
                "max_extent_size {} is smaller than min_unit {}",
                max_extent_size, min_unit
            )));
        }

        let runs = self.backend.free_runs();
        let mut remaining = want_size - want_size % min_unit;
        let mut out = Vec::new();

        // Pass 1: the part of each run at or after the hint
        let after = runs.iter().filter(|r| r.end() > hint).map(|r| {
            let start = r.offset.max(hint);
            Extent::new(start, r.end() - start)
        });
        // Pass 2: wrap around to whatever lies before the hint
        let before = runs.iter().filter(|r| r.offset < hint).map(|r| {
            Extent::new(r.offset, r.end().min(hint) - r.offset)
        });

        for segment in after.chain(before) {
            if remaining == 0 {
                break;
            }
            let start = align_up(segment.offset, min_unit);
            if start >= segment.end() {
                continue;
            }
            let usable = segment.end() - start;
            let mut take = (usable - usable % min_unit).min(remaining);
            let mut offset = start;
            while take > 0 {
                let len = take.min(max_chunk);
                out.push(Extent::new(offset, len));
                offset += len;
                take -= len;
                remaining -= len;
            }
        }

        Ok(out)
    }

    /// Apply a committed plan: remove each extent from the free index and
    /// consume the matching reservation
    pub fn apply_plan(&mut self, extents: &[Extent]) -> Result<()> {
        for e in extents {
            self.init_rm_free(e.offset, e.length)?;
        }
        self.unreserve(total_length(extents));
        Ok(())
    }

    /// `plan` followed by `apply_plan`
    pub fn allocate(
        &mut self,
        want_size: u64,
        min_unit: u64,
        max_extent_size: u64,
        hint: u64,
    ) -> Result<Vec<Extent>> {
        let extents = self.plan(want_size, min_unit, max_extent_size, hint)?;
        self.apply_plan(&extents)?;
        debug!(
            want = want_size,
            got = total_length(&extents),
            extents = extents.len(),
            "Allocated"
        );
        Ok(extents)
    }

    /// Return a range to the free index
    ///
    /// Fails with `ConsistencyViolation` if any part of it is already free.
    pub fn release(&mut self, offset: u64, length: u64) -> Result<()> {
        self.init_add_free(offset, length)?;
        debug!(offset, length, "Released");
        Ok(())
    }

    pub fn get_free(&self) -> u64 {
        self.free
    }

    pub fn get_reserved(&self) -> u64 {
        self.reserved
    }

    /// Free bytes not promised to a reservation
    pub fn available(&self) -> u64 {
        self.free.saturating_sub(self.reserved)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current free runs, ascending and coalesced
    pub fn free_runs(&self) -> Vec<Extent> {
        self.backend.free_runs()
    }

    /// `1 - largest_free_run / free`; 0 when nothing is free
    pub fn fragmentation(&self) -> f64 {
        if self.free == 0 {
            return 0.0;
        }
        1.0 - self.backend.largest_run() as f64 / self.free as f64
    }
}

fn align_up(value: u64, unit: u64) -> u64 {
    match value % unit {
        0 => value,
        r => value + (unit - r),
    }
}

fn check_bounds(extent: Extent, capacity: u64) -> Result<()> {
    match extent.offset.checked_add(extent.length) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(ExtentError::ConsistencyViolation(format!(
            "extent {} lies outside device of {} bytes",
            extent, capacity
        ))),
    }
}
