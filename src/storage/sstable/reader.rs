//! SSTable Reader
//!
//! Opens SSTable files and provides O(log n) key lookups via in-memory index.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::Path;

use crate::error::{ExtentError, Result};

use super::{
    le_u16, le_u32, le_u64, Lookup, FOOTER_SIZE, HEADER_SIZE, MAGIC, TOMBSTONE_MARKER, VERSION,
};

/// Reader for SSTable files with in-memory index for O(log n) lookups
pub struct SSTableReader {
    /// File handle for reading entries
    file: BufReader<File>,
    /// In-memory index: key → file offset
    index: BTreeMap<Vec<u8>, u64>,
}

impl SSTableReader {
    /// Open an SSTable for reading
    ///
    /// Verifies the data-block CRC and loads the entire index into memory.
    /// The header's entry count must match the index.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(ExtentError::Storage(format!(
                "SSTable too small: {} bytes",
                file_size
            )));
        }

        // Read and validate header
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(ExtentError::Storage(format!(
                "Invalid SSTable magic: expected EXDB, got {:?}",
                &header[0..4]
            )));
        }

        let version = le_u16(&header[4..6]);
        if version != VERSION {
            return Err(ExtentError::Storage(format!(
                "Unsupported SSTable version: {}",
                version
            )));
        }

        let entry_count = le_u64(&header[6..14]);

        // Read footer to get index offset
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;

        let index_offset = le_u64(&footer[0..8]);
        let data_crc = le_u32(&footer[8..12]);

        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(ExtentError::Storage(format!(
                "SSTable index offset {} out of bounds",
                index_offset
            )));
        }

        // Verify the data block
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut data = vec![0u8; (index_offset - HEADER_SIZE) as usize];
        file.read_exact(&mut data)?;
        let computed = crc32fast::hash(&data);
        if computed != data_crc {
            return Err(ExtentError::Storage(format!(
                "SSTable data CRC mismatch in {}: stored {:#010x}, computed {:#010x}",
                path.display(),
                data_crc,
                computed
            )));
        }

        // Index block size = file_size - footer_size - index_offset
        let index_block_size = file_size - FOOTER_SIZE - index_offset;
        let mut index_data = vec![0u8; index_block_size as usize];
        file.read_exact(&mut index_data)?;

        // Parse index entries: [key_len(4)][offset(8)][key]
        let mut index = BTreeMap::new();
        let mut pos = 0;
        while pos < index_data.len() {
            if pos + 12 > index_data.len() {
                return Err(ExtentError::Storage("Truncated SSTable index".to_string()));
            }
            let key_len = le_u32(&index_data[pos..pos + 4]) as usize;
            let offset = le_u64(&index_data[pos + 4..pos + 12]);
            pos += 12;

            if pos + key_len > index_data.len() {
                return Err(ExtentError::Storage("Truncated SSTable index key".to_string()));
            }
            index.insert(index_data[pos..pos + key_len].to_vec(), offset);
            pos += key_len;
        }

        if index.len() as u64 != entry_count {
            return Err(ExtentError::Storage(format!(
                "SSTable {} header claims {} entries, index has {}",
                path.display(),
                entry_count,
                index.len()
            )));
        }

        Ok(Self {
            file: BufReader::new(file),
            index,
        })
    }

    /// Get a value by key — O(log n) lookup via in-memory index
    pub fn get(&mut self, key: &[u8]) -> Result<Lookup> {
        let offset = match self.index.get(key) {
            Some(&off) => off,
            None => return Ok(Lookup::Absent),
        };

        match self.read_value_at(offset)? {
            Some(value) => Ok(Lookup::Found(value)),
            None => Ok(Lookup::Deleted),
        }
    }

    /// Every entry whose key starts with `prefix`, in key order
    ///
    /// A `None` value is a tombstone.
    pub fn scan_prefix(&mut self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        let targets: Vec<(Vec<u8>, u64)> = self
            .index
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, off)| (k.clone(), *off))
            .collect();

        let mut out = Vec::with_capacity(targets.len());
        for (key, offset) in targets {
            let value = self.read_value_at(offset)?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Read the value of the entry starting at `offset` (None = tombstone)
    fn read_value_at(&mut self, offset: u64) -> Result<Option<Vec<u8>>> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; 8];
        self.file.read_exact(&mut header)?;

        let key_len = le_u32(&header[0..4]);
        let val_len = le_u32(&header[4..8]);

        // Skip the key (the index already matched it)
        self.file.seek(SeekFrom::Current(key_len as i64))?;

        if val_len == TOMBSTONE_MARKER {
            return Ok(None);
        }

        let mut value = vec![0u8; val_len as usize];
        self.file.read_exact(&mut value)?;
        Ok(Some(value))
    }

    /// False only when `key` is outside this table's key range
    pub(crate) fn might_contain(&self, key: &[u8]) -> bool {
        match (self.index.keys().next(), self.index.keys().next_back()) {
            (Some(min), Some(max)) => key >= min.as_slice() && key <= max.as_slice(),
            _ => false,
        }
    }
}
