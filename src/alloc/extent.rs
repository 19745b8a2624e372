//! Extent-map backend
//!
//! Free runs keyed by start offset. Adjacent runs are always coalesced, so
//! the map never holds two runs that touch.

use std::collections::BTreeMap;

use super::{check_bounds, Extent};
use crate::error::{ExtentError, Result};

pub struct ExtentAllocator {
    capacity: u64,
    /// offset → length
    runs: BTreeMap<u64, u64>,
}

impl ExtentAllocator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            runs: BTreeMap::new(),
        }
    }

    /// Insert a free run, merging with neighbours
    pub fn insert_free(&mut self, extent: Extent) -> Result<()> {
        check_bounds(extent, self.capacity)?;
        let mut start = extent.offset;
        let mut end = extent.end();

        let prev = self.runs.range(..=start).next_back().map(|(&o, &l)| (o, l));
        let next = self.runs.range(start..).next().map(|(&o, &l)| (o, l));

        if let Some((po, pl)) = prev {
            if po + pl > start {
                return Err(double_free(extent, Extent::new(po, pl)));
            }
        }
        if let Some((no, nl)) = next {
            if no < end {
                return Err(double_free(extent, Extent::new(no, nl)));
            }
        }

        if let Some((po, pl)) = prev {
            if po + pl == start {
                self.runs.remove(&po);
                start = po;
            }
        }
        if let Some((no, nl)) = next {
            if no == end {
                self.runs.remove(&no);
                end = no + nl;
            }
        }

        self.runs.insert(start, end - start);
        Ok(())
    }

    /// Remove a range that must lie entirely inside one free run
    pub fn remove_free(&mut self, extent: Extent) -> Result<()> {
        check_bounds(extent, self.capacity)?;
        let end = extent.end();

        let (run_start, run_len) = self
            .runs
            .range(..=extent.offset)
            .next_back()
            .map(|(&o, &l)| (o, l))
            .filter(|&(o, l)| o + l >= end)
            .ok_or_else(|| {
                ExtentError::ConsistencyViolation(format!("range {} is not free", extent))
            })?;

        self.runs.remove(&run_start);
        if run_start < extent.offset {
            self.runs.insert(run_start, extent.offset - run_start);
        }
        let run_end = run_start + run_len;
        if end < run_end {
            self.runs.insert(end, run_end - end);
        }
        Ok(())
    }

    pub fn free_runs(&self) -> Vec<Extent> {
        self.runs.iter().map(|(&o, &l)| Extent::new(o, l)).collect()
    }

    pub fn largest_run(&self) -> u64 {
        self.runs.values().copied().max().unwrap_or(0)
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

fn double_free(extent: Extent, existing: Extent) -> ExtentError {
    ExtentError::ConsistencyViolation(format!(
        "release of {} overlaps free run {}",
        extent, existing
    ))
}
