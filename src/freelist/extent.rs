//! Extent encoding: one record per free run

use std::collections::BTreeMap;

use super::StagedView;
use crate::alloc::Extent;
use crate::codec;
use crate::error::{ExtentError, Result};

pub(super) struct ExtentFreelist {
    capacity: u64,
}

impl ExtentFreelist {
    pub(super) fn new(capacity: u64) -> Self {
        Self { capacity }
    }

    /// Split `extent` out of the run that contains it
    pub(super) fn stage_allocate(&self, view: &mut StagedView<'_>, extent: Extent) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        self.check_range(extent)?;
        let key = codec::encode_offset_key(extent.offset);
        let run = match view.floor(&key) {
            Some((k, v)) => decode_run(k, v)?,
            None => return Err(not_free(extent)),
        };
        if run.end() < extent.end() {
            return Err(not_free(extent));
        }

        view.remove(&codec::encode_offset_key(run.offset));
        if run.offset < extent.offset {
            view.set(
                codec::encode_offset_key(run.offset).to_vec(),
                codec::encode_u64_value(extent.offset - run.offset),
            );
        }
        if extent.end() < run.end() {
            view.set(
                codec::encode_offset_key(extent.end()).to_vec(),
                codec::encode_u64_value(run.end() - extent.end()),
            );
        }
        Ok(())
    }

    /// Insert `extent` as free, merging with touching neighbours
    pub(super) fn stage_release(&self, view: &mut StagedView<'_>, extent: Extent) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        self.check_range(extent)?;
        let key = codec::encode_offset_key(extent.offset);

        let prev = match view.floor(&key) {
            Some((k, v)) => Some(decode_run(k, v)?),
            None => None,
        };
        let next = match view.ceiling(&key) {
            Some((k, v)) => Some(decode_run(k, v)?),
            None => None,
        };

        if let Some(p) = prev.filter(|p| p.overlaps(&extent)) {
            return Err(not_allocated(extent, p));
        }
        if let Some(n) = next.filter(|n| n.overlaps(&extent)) {
            return Err(not_allocated(extent, n));
        }

        let mut merged = extent;
        if let Some(p) = prev.filter(|p| p.end() == extent.offset) {
            view.remove(&codec::encode_offset_key(p.offset));
            merged = Extent::new(p.offset, merged.end() - p.offset);
        }
        if let Some(n) = next.filter(|n| n.offset == extent.end()) {
            view.remove(&codec::encode_offset_key(n.offset));
            merged.length += n.length;
        }

        view.set(
            codec::encode_offset_key(merged.offset).to_vec(),
            codec::encode_u64_value(merged.length),
        );
        Ok(())
    }

    /// `extent` must end inside the device; checked before any `end()`
    fn check_range(&self, extent: Extent) -> Result<()> {
        match extent.offset.checked_add(extent.length) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(ExtentError::ConsistencyViolation(format!(
                "extent {} lies outside device of {} bytes",
                extent, self.capacity
            ))),
        }
    }

    pub(super) fn decode_runs(&self, records: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<Vec<Extent>> {
        records
            .iter()
            .map(|(k, v)| {
                let run = decode_run(k, v)?;
                if run.end() > self.capacity {
                    return Err(ExtentError::CorruptRecord(format!(
                        "free run {} is past the device end",
                        run
                    )));
                }
                Ok(run)
            })
            .collect()
    }
}

fn decode_run(key: &[u8], value: &[u8]) -> Result<Extent> {
    let offset = codec::decode_offset_key(key)?;
    let length = codec::decode_u64_value(value)?;
    if offset.checked_add(length).is_none() {
        return Err(ExtentError::CorruptRecord(format!(
            "free run at 0x{:x} overflows",
            offset
        )));
    }
    Ok(Extent::new(offset, length))
}

fn not_free(extent: Extent) -> ExtentError {
    ExtentError::ConsistencyViolation(format!("allocate of {}: range is not free", extent))
}

fn not_allocated(extent: Extent, free: Extent) -> ExtentError {
    ExtentError::ConsistencyViolation(format!(
        "release of {}: overlaps free run {}",
        extent, free
    ))
}
