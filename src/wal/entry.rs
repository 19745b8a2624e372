//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ExtentError, Result};

/// Header size: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// A single entry in the WAL: every operation of one committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// The operations of the transaction, in submission order
    pub ops: Vec<Operation>,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Operations that can be logged
///
/// Merges are resolved by the engine before logging, so only their
/// resulting `Put` reaches the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key
    Delete { key: Vec<u8> },
}

impl Operation {
    /// The key this operation targets
    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Put { key, .. } => key,
            Operation::Delete { key } => key,
        }
    }
}

impl WalEntry {
    /// Create an entry stamped with the current time
    pub fn new(lsn: u64, ops: Vec<Operation>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { lsn, ops, timestamp }
    }

    /// Serialize to the on-disk form: header followed by the bincode payload
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let data = bincode::serialize(self)?;
        if data.len() > u32::MAX as usize {
            return Err(ExtentError::WalWrite(format!(
                "Entry too large: {} bytes",
                data.len()
            )));
        }

        let crc = crc32fast::hash(&data);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + data.len());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&data);
        Ok(bytes)
    }

    /// Deserialize a complete on-disk entry, validating length and CRC
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ExtentError::WalCorruption(format!(
                "Entry shorter than header: {} bytes",
                bytes.len()
            )));
        }

        let header = parse_header(&bytes[..HEADER_SIZE]);
        let end = HEADER_SIZE + header.len as usize;
        if bytes.len() < end {
            return Err(ExtentError::WalCorruption(format!(
                "Truncated entry: expected {} bytes, got {}",
                end,
                bytes.len()
            )));
        }

        Self::decode_payload(&header, &bytes[HEADER_SIZE..end])
    }

    /// Validate a payload against its already-parsed header
    pub(super) fn decode_payload(header: &EntryHeader, data: &[u8]) -> Result<Self> {
        let computed = crc32fast::hash(data);
        if computed != header.crc {
            return Err(ExtentError::WalCorruption(format!(
                "CRC mismatch at LSN {}: stored {:#010x}, computed {:#010x}",
                header.lsn, header.crc, computed
            )));
        }

        let entry: WalEntry = bincode::deserialize(data)
            .map_err(|e| ExtentError::WalCorruption(format!("Undecodable entry: {}", e)))?;

        if entry.lsn != header.lsn {
            return Err(ExtentError::WalCorruption(format!(
                "LSN mismatch: header {}, payload {}",
                header.lsn, entry.lsn
            )));
        }

        Ok(entry)
    }
}

/// Parsed fixed-size entry header
#[derive(Debug, Clone, Copy)]
pub(super) struct EntryHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: u32,
}

/// Parse a header; caller guarantees `bytes.len() >= HEADER_SIZE`
pub(super) fn parse_header(bytes: &[u8]) -> EntryHeader {
    let mut lsn = [0u8; 8];
    let mut crc = [0u8; 4];
    let mut len = [0u8; 4];
    lsn.copy_from_slice(&bytes[0..8]);
    crc.copy_from_slice(&bytes[8..12]);
    len.copy_from_slice(&bytes[12..16]);
    EntryHeader {
        lsn: u64::from_le_bytes(lsn),
        crc: u32::from_le_bytes(crc),
        len: u32::from_le_bytes(len),
    }
}
