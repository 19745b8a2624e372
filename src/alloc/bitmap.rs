//! Bitmap backend
//!
//! One bit per block, packed into u64 words. Bit set = allocated. Padding
//! bits past the last block stay set so they are never reported free.

use super::{check_bounds, Extent};
use crate::error::{ExtentError, Result};

const WORD_BITS: u64 = 64;

pub struct BitmapAllocator {
    block_size: u64,
    blocks: u64,
    words: Vec<u64>,
}

impl BitmapAllocator {
    /// Every block starts allocated
    pub fn new(capacity: u64, block_size: u64) -> Result<Self> {
        if block_size == 0 || capacity % block_size != 0 {
            return Err(ExtentError::Config(format!(
                "capacity {} is not a multiple of block size {}",
                capacity, block_size
            )));
        }
        let blocks = capacity / block_size;
        let word_count = blocks.div_ceil(WORD_BITS) as usize;
        Ok(Self {
            block_size,
            blocks,
            words: vec![u64::MAX; word_count],
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Clear bits for `extent`; every bit must currently be set
    pub fn insert_free(&mut self, extent: Extent) -> Result<()> {
        let (first, count) = self.blocks_of(extent)?;
        if let Some(b) = (first..first + count).find(|&b| !self.is_allocated(b)) {
            return Err(ExtentError::ConsistencyViolation(format!(
                "release of {} covers free block {}",
                extent, b
            )));
        }
        for b in first..first + count {
            self.clear(b);
        }
        Ok(())
    }

    /// Set bits for `extent`; every bit must currently be clear
    pub fn remove_free(&mut self, extent: Extent) -> Result<()> {
        let (first, count) = self.blocks_of(extent)?;
        if let Some(b) = (first..first + count).find(|&b| self.is_allocated(b)) {
            return Err(ExtentError::ConsistencyViolation(format!(
                "range {} covers allocated block {}",
                extent, b
            )));
        }
        for b in first..first + count {
            self.set(b);
        }
        Ok(())
    }

    /// Maximal runs of clear bits, in bytes
    pub fn free_runs(&self) -> Vec<Extent> {
        let mut runs = Vec::new();
        let mut start: Option<u64> = None;
        let mut b = 0;

        while b < self.blocks {
            let word = self.words[(b / WORD_BITS) as usize];
            if b % WORD_BITS == 0 {
                // Whole-word fast paths
                if start.is_none() && word == u64::MAX {
                    b += WORD_BITS;
                    continue;
                }
                if start.is_some() && word == 0 {
                    b += WORD_BITS;
                    continue;
                }
            }

            let free = word & (1 << (b % WORD_BITS)) == 0;
            match (free, start) {
                (true, None) => start = Some(b),
                (false, Some(s)) => {
                    runs.push(self.to_extent(s, b));
                    start = None;
                }
                _ => {}
            }
            b += 1;
        }

        if let Some(s) = start {
            runs.push(self.to_extent(s, self.blocks));
        }
        runs
    }

    fn to_extent(&self, first: u64, end: u64) -> Extent {
        Extent::new(first * self.block_size, (end - first) * self.block_size)
    }

    fn blocks_of(&self, extent: Extent) -> Result<(u64, u64)> {
        check_bounds(extent, self.blocks * self.block_size)?;
        if extent.offset % self.block_size != 0 || extent.length % self.block_size != 0 {
            return Err(ExtentError::ConsistencyViolation(format!(
                "extent {} is not aligned to block size {}",
                extent, self.block_size
            )));
        }
        Ok((extent.offset / self.block_size, extent.length / self.block_size))
    }

    fn is_allocated(&self, block: u64) -> bool {
        self.words[(block / WORD_BITS) as usize] & (1 << (block % WORD_BITS)) != 0
    }

    fn set(&mut self, block: u64) {
        self.words[(block / WORD_BITS) as usize] |= 1 << (block % WORD_BITS);
    }

    fn clear(&mut self, block: u64) {
        self.words[(block / WORD_BITS) as usize] &= !(1 << (block % WORD_BITS));
    }
}
