//! WAL Reader
//!
//! Handles reading entries from the WAL file.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use crate::error::{ExtentError, Result};
use super::entry::parse_header;
use super::{WalEntry, HEADER_SIZE};

/// Upper bound on a single entry payload; anything larger is garbage
const MAX_ENTRY_SIZE: u32 = 256 * 1024 * 1024;

/// Result of reading one position of the log
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete, checksummed entry
    Entry(WalEntry),
    /// Clean end of file on an entry boundary
    Eof,
    /// The file ends inside an entry (partial write)
    Torn,
    /// A complete entry whose checksum or payload is invalid
    Corrupt(String),
}

/// Reads entries from the WAL file
pub struct WalReader {
    file: BufReader<File>,
    /// Byte offset just past the last complete entry read
    position: u64,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file: BufReader::new(file),
            position: 0,
        })
    }

    /// Offset of the end of the last valid entry
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next position of the log, classifying what was found
    pub fn read_next(&mut self) -> Result<ReadOutcome> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        let n = read_full(&mut self.file, &mut header_bytes)?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        if n < HEADER_SIZE {
            return Ok(ReadOutcome::Torn);
        }

        let header = parse_header(&header_bytes);
        if header.len > MAX_ENTRY_SIZE {
            return Ok(ReadOutcome::Corrupt(format!(
                "Entry length {} exceeds maximum",
                header.len
            )));
        }

        let mut data = vec![0u8; header.len as usize];
        let n = read_full(&mut self.file, &mut data)?;
        if n < data.len() {
            return Ok(ReadOutcome::Torn);
        }

        match WalEntry::decode_payload(&header, &data) {
            Ok(entry) => {
                self.position += (HEADER_SIZE + data.len()) as u64;
                Ok(ReadOutcome::Entry(entry))
            }
            Err(ExtentError::WalCorruption(msg)) => Ok(ReadOutcome::Corrupt(msg)),
            Err(e) => Err(e),
        }
    }

    /// Read the next entry from the WAL
    ///
    /// Returns `Ok(None)` at a clean end of file; a torn or corrupt entry is
    /// an error.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        match self.read_next()? {
            ReadOutcome::Entry(entry) => Ok(Some(entry)),
            ReadOutcome::Eof => Ok(None),
            ReadOutcome::Torn => Err(ExtentError::WalCorruption(format!(
                "Partial entry at offset {}",
                self.position
            ))),
            ReadOutcome::Corrupt(msg) => Err(ExtentError::WalCorruption(msg)),
        }
    }

    /// Iterate over all valid entries
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over WAL entries; stops after the first error
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` as far as the file allows; returns the number of bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
