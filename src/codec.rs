//! Record encodings shared by the freelist and catalog
//!
//! ## Offset Keys / Length Values
//! Big-endian u64, so ascending key order is ascending offset order.
//!
//! ## Metadata Record (little-endian)
//! ```text
//! ┌─────────┬──────────┬───────────┬────────────────────────────────────┐
//! │ ver (1) │ size (8) │ count (8) │ count × (offset (8), length (8))   │
//! └─────────┴──────────┴───────────┴────────────────────────────────────┘
//! ```

use crate::alloc::Extent;
use crate::error::{ExtentError, Result};

/// Current metadata record version
pub const METADATA_VERSION: u8 = 1;

/// version + size + count
const METADATA_HEADER_SIZE: usize = 1 + 8 + 8;
const EXTENT_SIZE: usize = 16;

/// Encode a device offset (or group index) as an ordered key
pub fn encode_offset_key(offset: u64) -> [u8; 8] {
    offset.to_be_bytes()
}

pub fn decode_offset_key(key: &[u8]) -> Result<u64> {
    be_u64(key, "offset key")
}

pub fn encode_u64_value(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub fn decode_u64_value(value: &[u8]) -> Result<u64> {
    be_u64(value, "u64 value")
}

fn be_u64(bytes: &[u8], what: &str) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| {
        ExtentError::CorruptRecord(format!("{} has {} bytes, expected 8", what, bytes.len()))
    })?;
    Ok(u64::from_be_bytes(arr))
}

/// Persisted body of one catalog object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub size: u64,
    pub extents: Vec<Extent>,
}

impl MetadataRecord {
    pub fn new(size: u64, extents: Vec<Extent>) -> Self {
        Self { size, extents }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(METADATA_HEADER_SIZE + self.extents.len() * EXTENT_SIZE);
        buf.push(METADATA_VERSION);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&(self.extents.len() as u64).to_le_bytes());
        for e in &self.extents {
            buf.extend_from_slice(&e.offset.to_le_bytes());
            buf.extend_from_slice(&e.length.to_le_bytes());
        }
        buf
    }

    /// Rejects unknown versions, truncation, trailing bytes and overlapping
    /// extents
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < METADATA_HEADER_SIZE {
            return Err(ExtentError::CorruptRecord(format!(
                "metadata record truncated: {} bytes",
                data.len()
            )));
        }
        if data[0] != METADATA_VERSION {
            return Err(ExtentError::CorruptRecord(format!(
                "unknown metadata version {}",
                data[0]
            )));
        }

        let size = le_u64(&data[1..9]);
        let count = le_u64(&data[9..17]);

        let expected = (count as u128) * EXTENT_SIZE as u128 + METADATA_HEADER_SIZE as u128;
        if (data.len() as u128) < expected {
            return Err(ExtentError::CorruptRecord(format!(
                "metadata record truncated: {} extents need {} bytes, have {}",
                count,
                expected,
                data.len()
            )));
        }
        if (data.len() as u128) > expected {
            return Err(ExtentError::CorruptRecord(format!(
                "metadata record has {} trailing bytes",
                data.len() as u128 - expected
            )));
        }

        let extents: Vec<Extent> = data[METADATA_HEADER_SIZE..]
            .chunks_exact(EXTENT_SIZE)
            .map(|c| Extent::new(le_u64(&c[0..8]), le_u64(&c[8..16])))
            .collect();

        if extents.iter().any(|e| e.offset.checked_add(e.length).is_none()) {
            return Err(ExtentError::CorruptRecord(
                "metadata extent overflows the address space".to_string(),
            ));
        }

        let mut sorted = extents.clone();
        sorted.sort();
        if let Some(pair) = sorted.windows(2).find(|w| w[0].overlaps(&w[1])) {
            return Err(ExtentError::CorruptRecord(format!(
                "metadata extents {} and {} overlap",
                pair[0], pair[1]
            )));
        }

        Ok(Self { size, extents })
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
