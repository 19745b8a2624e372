//! WAL Writer
//!
//! Handles appending entries to the WAL file.
//!
//! A failed append (short write or failed fsync) cuts the log back to its
//! previous length so the next entry never lands behind a torn one. If that
//! cut fails too the writer is poisoned and refuses further appends.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, error, warn};

use crate::config::WalSyncStrategy;
use crate::error::{ExtentError, Result};
use super::{Operation, WalEntry, WalRecovery};

/// Byte sink under a [`WalWriter`]; a plain [`File`] in production
pub trait WalFile: Write + Seek {
    fn set_len(&self, len: u64) -> io::Result<()>;
    fn sync_data(&self) -> io::Result<()>;
    fn sync_all(&self) -> io::Result<()>;
}

impl WalFile for File {
    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }
}

/// Writes entries to the WAL file
pub struct WalWriter<F: WalFile = File> {
    file: F,
    /// LSN the next append will receive
    current_lsn: u64,
    sync_strategy: WalSyncStrategy,
    /// Entries appended since the last fsync
    unsynced: usize,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
}

impl WalWriter<File> {
    /// Open or create a WAL file
    ///
    /// An existing log is scanned so LSNs continue after its last valid
    /// entry. Callers recover the log before opening it for writing.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let last_lsn = if path.exists() {
            WalRecovery::verify(path)?.last_lsn
        } else {
            0
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        Self::from_file(file, last_lsn + 1, sync_strategy)
    }
}

impl<F: WalFile> WalWriter<F> {
    /// Wrap an already positioned sink; appends go to its end
    pub fn from_file(mut file: F, next_lsn: u64, sync_strategy: WalSyncStrategy) -> Result<Self> {
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            current_lsn: next_lsn.max(1),
            sync_strategy,
            unsynced: 0,
            poisoned: false,
        })
    }

    /// Append one transaction to the WAL; returns its LSN
    ///
    /// On error nothing of the entry stays in the log and the LSN is not
    /// consumed.
    pub fn append(&mut self, ops: Vec<Operation>) -> Result<u64> {
        if self.poisoned {
            return Err(ExtentError::TransactionFailure(
                "WAL writer is poisoned after a failed rollback".to_string(),
            ));
        }

        let lsn = self.current_lsn;
        let entry = WalEntry::new(lsn, ops);
        let bytes = entry.serialize()?;
        let prev_len = self.file.stream_position()?;

        if let Err(e) = self.write_entry(lsn, &bytes) {
            self.rollback(prev_len);
            return Err(e);
        }
        self.current_lsn += 1;

        debug!(lsn, bytes = bytes.len(), "WAL append");
        Ok(lsn)
    }

    fn write_entry(&mut self, lsn: u64, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .map_err(|e| ExtentError::WalWrite(format!("append LSN {}: {}", lsn, e)))?;

        let pending = self.unsynced + 1;
        let must_sync = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => pending >= count.max(1),
        };
        if must_sync {
            self.sync()
        } else {
            self.unsynced = pending;
            Ok(())
        }
    }

    /// Cut the log back to `len` after a failed append
    fn rollback(&mut self, len: u64) {
        let restored = self
            .file
            .set_len(len)
            .and_then(|()| self.file.seek(SeekFrom::Start(len)));
        match restored {
            Ok(_) => warn!(len, "WAL append rolled back"),
            Err(e) => {
                error!(len, error = %e, "WAL rollback failed, writer poisoned");
                self.poisoned = true;
            }
        }
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| ExtentError::WalWrite(format!("fsync: {}", e)))?;
        self.unsynced = 0;
        Ok(())
    }

    /// Discard all entries (their contents are durable elsewhere)
    ///
    /// LSNs keep increasing for as long as this writer lives. A log reopened
    /// empty starts again at 1. An emptied log is in a known state, so this
    /// also clears poisoning.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        self.unsynced = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Get the current LSN (the one the next append receives)
    pub fn current_lsn(&self) -> u64 {
        self.current_lsn
    }

    /// Whether a failed rollback has disabled appends
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}
