//! Merge Operators
//!
//! A merge operator combines the stored value of a key with an incoming
//! operand at commit time, so counters can be bumped by submitting a small
//! delta instead of a read-modify-write round trip.
//!
//! ## Aggregate Encoding
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────────┐
//! │ i64 LE (8)   │ i64 LE (8)   │ ... │ i64 LE (8)   │
//! └──────────────┴──────────────┴─────┴──────────────┘
//! ```

use crate::error::{ExtentError, Result};

/// Combines an existing value with an incoming operand
pub trait MergeOperator: Send + Sync {
    /// Stable name, for logging
    fn name(&self) -> &'static str;

    /// Produce the new value; `existing` is `None` for a missing key
    fn merge(&self, existing: Option<&[u8]>, operand: &[u8]) -> Result<Vec<u8>>;
}

/// Element width of aggregate arrays
pub const ELEMENT_WIDTH: usize = 8;

/// Element-wise wrapping sum of little-endian i64 arrays
///
/// Commutative and associative. Negative operands subtract.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateMergeOperator;

impl AggregateMergeOperator {
    pub fn new() -> Self {
        Self
    }
}

impl MergeOperator for AggregateMergeOperator {
    fn name(&self) -> &'static str {
        "aggregate_i64"
    }

    fn merge(&self, existing: Option<&[u8]>, operand: &[u8]) -> Result<Vec<u8>> {
        if operand.len() % ELEMENT_WIDTH != 0 {
            return Err(ExtentError::CorruptRecord(format!(
                "Merge operand length {} is not a multiple of {}",
                operand.len(),
                ELEMENT_WIDTH
            )));
        }

        let Some(existing) = existing else {
            return Ok(operand.to_vec());
        };

        if existing.len() != operand.len() {
            return Err(ExtentError::CorruptRecord(format!(
                "Merge length mismatch: existing {} bytes, operand {} bytes",
                existing.len(),
                operand.len()
            )));
        }

        let mut out = Vec::with_capacity(existing.len());
        for (a, b) in existing
            .chunks_exact(ELEMENT_WIDTH)
            .zip(operand.chunks_exact(ELEMENT_WIDTH))
        {
            let sum = decode_element(a).wrapping_add(decode_element(b));
            out.extend_from_slice(&sum.to_le_bytes());
        }
        Ok(out)
    }
}

/// Encode an array of counters
pub fn encode_elements(values: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * ELEMENT_WIDTH);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode an array of counters
pub fn decode_elements(bytes: &[u8]) -> Result<Vec<i64>> {
    if bytes.len() % ELEMENT_WIDTH != 0 {
        return Err(ExtentError::CorruptRecord(format!(
            "Aggregate length {} is not a multiple of {}",
            bytes.len(),
            ELEMENT_WIDTH
        )));
    }
    Ok(bytes.chunks_exact(ELEMENT_WIDTH).map(decode_element).collect())
}

fn decode_element(chunk: &[u8]) -> i64 {
    let mut buf = [0u8; ELEMENT_WIDTH];
    buf.copy_from_slice(chunk);
    i64::from_le_bytes(buf)
}
