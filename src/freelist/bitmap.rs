//! Bitmap encoding: one bit per allocation unit, grouped per key
//!
//! Bit `i` of a group lives in byte `i / 8`, bit `i % 8` (LSB first).

use std::collections::BTreeMap;

use super::StagedView;
use crate::alloc::Extent;
use crate::codec;
use crate::error::{ExtentError, Result};

pub(super) struct BitmapFreelist {
    block_size: u64,
    blocks: u64,
    blocks_per_key: u64,
}

impl BitmapFreelist {
    pub(super) fn new(capacity: u64, block_size: u64, blocks_per_key: u64) -> Self {
        Self {
            block_size,
            blocks: capacity / block_size,
            blocks_per_key,
        }
    }

    fn group_bytes(&self) -> usize {
        (self.blocks_per_key / 8) as usize
    }

    fn group_count(&self) -> u64 {
        self.blocks.div_ceil(self.blocks_per_key)
    }

    pub(super) fn stage_allocate(&self, view: &mut StagedView<'_>, extent: Extent) -> Result<()> {
        self.stage_bits(view, extent, true)
    }

    pub(super) fn stage_release(&self, view: &mut StagedView<'_>, extent: Extent) -> Result<()> {
        self.stage_bits(view, extent, false)
    }

    /// Flip every bit of `extent` to `allocated`; each must start opposite
    fn stage_bits(&self, view: &mut StagedView<'_>, extent: Extent, allocated: bool) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        let (first, end) = self.block_range(extent)?;

        // Validate every touched group before staging any of them
        let mut updates: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut block = first;
        while block < end {
            let group = block / self.blocks_per_key;
            let group_end = ((group + 1) * self.blocks_per_key).min(end);
            let mut bits = self.load_group(view, group)?;

            for b in block..group_end {
                let bit = b - group * self.blocks_per_key;
                let (byte, mask) = ((bit / 8) as usize, 1u8 << (bit % 8));
                if (bits[byte] & mask != 0) == allocated {
                    return Err(ExtentError::ConsistencyViolation(format!(
                        "{} of {}: block {} is already {}",
                        if allocated { "allocate" } else { "release" },
                        extent,
                        b,
                        if allocated { "allocated" } else { "free" }
                    )));
                }
                if allocated {
                    bits[byte] |= mask;
                } else {
                    bits[byte] &= !mask;
                }
            }

            updates.push((group, bits));
            block = group_end;
        }

        for (group, bits) in updates {
            let key = codec::encode_offset_key(group);
            if bits.iter().all(|&b| b == 0) {
                if view.get(&key).is_some() {
                    view.remove(&key);
                }
            } else {
                view.set(key.to_vec(), bits);
            }
        }
        Ok(())
    }

    fn load_group(&self, view: &StagedView<'_>, group: u64) -> Result<Vec<u8>> {
        match view.get(&codec::encode_offset_key(group)) {
            Some(bits) => {
                self.check_group(group, bits)?;
                Ok(bits.to_vec())
            }
            None => Ok(vec![0; self.group_bytes()]),
        }
    }

    fn check_group(&self, group: u64, bits: &[u8]) -> Result<()> {
        if bits.len() != self.group_bytes() {
            return Err(ExtentError::CorruptRecord(format!(
                "bitmap group {} has {} bytes, expected {}",
                group,
                bits.len(),
                self.group_bytes()
            )));
        }
        Ok(())
    }

    fn block_range(&self, extent: Extent) -> Result<(u64, u64)> {
        let in_bounds = extent
            .offset
            .checked_add(extent.length)
            .is_some_and(|end| end <= self.blocks * self.block_size);
        if !in_bounds
            || extent.offset % self.block_size != 0
            || extent.length % self.block_size != 0
        {
            return Err(ExtentError::ConsistencyViolation(format!(
                "extent {} is unaligned or outside the device",
                extent
            )));
        }
        let first = extent.offset / self.block_size;
        Ok((first, first + extent.length / self.block_size))
    }

    /// Free runs in ascending order; blocks past the device end never count
    pub(super) fn decode_runs(&self, records: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<Vec<Extent>> {
        for (key, bits) in records {
            let group = codec::decode_offset_key(key)?;
            if group >= self.group_count() {
                return Err(ExtentError::CorruptRecord(format!(
                    "bitmap group {} is past the device end",
                    group
                )));
            }
            self.check_group(group, bits)?;
        }

        let mut runs: Vec<Extent> = Vec::new();
        let mut push_blocks = |first: u64, end: u64| {
            let e = Extent::new(first * self.block_size, (end - first) * self.block_size);
            match runs.last_mut() {
                Some(last) if last.end() == e.offset => last.length += e.length,
                _ => runs.push(e),
            }
        };

        for group in 0..self.group_count() {
            let base = group * self.blocks_per_key;
            let limit = (base + self.blocks_per_key).min(self.blocks);

            let Some(bits) = records.get(codec::encode_offset_key(group).as_slice()) else {
                push_blocks(base, limit);
                continue;
            };

            let mut start: Option<u64> = None;
            for b in base..limit {
                let bit = b - base;
                let free = bits[(bit / 8) as usize] & (1u8 << (bit % 8)) == 0;
                match (free, start) {
                    (true, None) => start = Some(b),
                    (false, Some(s)) => {
                        push_blocks(s, b);
                        start = None;
                    }
                    _ => {}
                }
            }
            if let Some(s) = start {
                push_blocks(s, limit);
            }
        }

        Ok(runs)
    }
}
