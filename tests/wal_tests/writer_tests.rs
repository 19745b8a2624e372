//! Tests for WAL Writer
//!
//! These tests verify:
//! - LSN generation and sequencing
//! - Sync strategies (EveryWrite, EveryNEntries)
//! - Truncation keeps LSNs increasing
//! - Reopen continues after the last entry
//! - Failed appends are rolled back or poison the writer

use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use extentdb::config::WalSyncStrategy;
use extentdb::error::ExtentError;
use extentdb::wal::{Operation, WalFile, WalReader, WalWriter};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("test.wal");
    (temp_dir, wal_path)
}

fn put(i: usize) -> Vec<Operation> {
    vec![Operation::Put {
        key: format!("key{}", i).into_bytes(),
        value: format!("val{}", i).into_bytes(),
    }]
}

/// In-memory log whose writes, syncs and truncations can be made to fail
#[derive(Clone, Default)]
struct FaultyFile {
    state: Arc<Mutex<FaultState>>,
}

#[derive(Default)]
struct FaultState {
    data: Cursor<Vec<u8>>,
    /// Bytes accepted before writes start failing
    write_budget: Option<usize>,
    fail_sync: bool,
    fail_set_len: bool,
}

impl FaultyFile {
    fn with<T>(&self, f: impl FnOnce(&mut FaultState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn len(&self) -> u64 {
        self.with(|s| s.data.get_ref().len() as u64)
    }

    /// Replay the captured bytes through the on-disk reader
    fn lsns(&self, dir: &TempDir) -> Vec<u64> {
        let path = dir.path().join("captured.wal");
        std::fs::write(&path, self.with(|s| s.data.get_ref().clone())).unwrap();
        let reader = WalReader::open(&path).unwrap();
        reader.entries().map(|e| e.unwrap().lsn).collect()
    }
}

impl Write for FaultyFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(|s| {
            let n = match s.write_budget {
                Some(0) => return Err(io::Error::other("no space left")),
                Some(left) => buf.len().min(left),
                None => buf.len(),
            };
            if let Some(left) = s.write_budget.as_mut() {
                *left -= n;
            }
            s.data.write(&buf[..n])
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FaultyFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.with(|s| s.data.seek(pos))
    }
}

impl WalFile for FaultyFile {
    fn set_len(&self, len: u64) -> io::Result<()> {
        self.with(|s| {
            if s.fail_set_len {
                return Err(io::Error::other("truncate refused"));
            }
            s.data.get_mut().resize(len as usize, 0);
            Ok(())
        })
    }

    fn sync_data(&self) -> io::Result<()> {
        self.with(|s| {
            if s.fail_sync {
                Err(io::Error::other("fsync failed"))
            } else {
                Ok(())
            }
        })
    }

    fn sync_all(&self) -> io::Result<()> {
        self.sync_data()
    }
}

fn faulty_writer() -> (FaultyFile, WalWriter<FaultyFile>) {
    let file = FaultyFile::default();
    let writer = WalWriter::from_file(file.clone(), 1, WalSyncStrategy::EveryWrite).unwrap();
    (file, writer)
}

// =============================================================================
// Basic Writing Tests
// =============================================================================

#[test]
fn test_write_single_entry() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    let lsn = writer.append(put(0)).unwrap();

    assert_eq!(lsn, 1);
    assert_eq!(writer.current_lsn(), 2);
}

#[test]
fn test_lsn_sequential() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    for i in 0..50 {
        assert_eq!(writer.append(put(i)).unwrap(), (i + 1) as u64);
    }
}

#[test]
fn test_one_entry_per_transaction() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
        let mut ops = put(1);
        ops.extend(put(2));
        ops.push(Operation::Delete { key: b"key1".to_vec() });
        writer.append(ops).unwrap();
    }

    let mut reader = WalReader::open(&wal_path).unwrap();
    let entry = reader.next_entry().unwrap().unwrap();
    assert_eq!(entry.ops.len(), 3);
    assert!(reader.next_entry().unwrap().is_none());
}

// =============================================================================
// Sync Strategy Tests
// =============================================================================

#[test]
fn test_every_n_entries_still_readable() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer =
            WalWriter::open(&wal_path, WalSyncStrategy::EveryNEntries { count: 4 }).unwrap();
        for i in 0..10 {
            writer.append(put(i)).unwrap();
        }
        writer.sync().unwrap();
    }

    let reader = WalReader::open(&wal_path).unwrap();
    let entries: Vec<_> = reader.entries().collect::<Result<_, _>>().unwrap();
    assert_eq!(entries.len(), 10);
}

// =============================================================================
// Reopen / Truncate Tests
// =============================================================================

#[test]
fn test_reopen_continues_lsn() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
        for i in 0..3 {
            writer.append(put(i)).unwrap();
        }
    }

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    assert_eq!(writer.current_lsn(), 4);
    assert_eq!(writer.append(put(3)).unwrap(), 4);
}

#[test]
fn test_truncate_empties_file_and_keeps_lsn() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    writer.append(put(0)).unwrap();
    writer.append(put(1)).unwrap();
    writer.truncate().unwrap();

    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);
    assert_eq!(writer.append(put(2)).unwrap(), 3);

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert_eq!(reader.next_entry().unwrap().unwrap().lsn, 3);
}

#[test]
fn test_truncate_then_reopen_restarts_lsn() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(put(0)).unwrap();
        writer.append(put(1)).unwrap();
        writer.truncate().unwrap();
    }

    // Nothing on disk remembers the old LSNs
    let writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    assert_eq!(writer.current_lsn(), 1);
}

// =============================================================================
// Failed Append Tests
// =============================================================================

#[test]
fn test_short_write_is_rolled_back() {
    let temp = TempDir::new().unwrap();
    let (file, mut writer) = faulty_writer();

    writer.append(put(0)).unwrap();
    let len = file.len();

    file.with(|s| s.write_budget = Some(5));
    let err = writer.append(put(1)).unwrap_err();
    assert!(matches!(err, ExtentError::WalWrite(_)));
    assert_eq!(file.len(), len);
    assert_eq!(writer.current_lsn(), 2);
    assert!(!writer.is_poisoned());

    file.with(|s| s.write_budget = None);
    assert_eq!(writer.append(put(2)).unwrap(), 2);
    assert_eq!(file.lsns(&temp), vec![1, 2]);
}

#[test]
fn test_failed_sync_is_rolled_back() {
    let temp = TempDir::new().unwrap();
    let (file, mut writer) = faulty_writer();

    writer.append(put(0)).unwrap();
    let len = file.len();

    file.with(|s| s.fail_sync = true);
    assert!(writer.append(put(1)).is_err());
    assert_eq!(file.len(), len);

    file.with(|s| s.fail_sync = false);
    assert_eq!(writer.append(put(2)).unwrap(), 2);
    assert_eq!(file.lsns(&temp), vec![1, 2]);
}

#[test]
fn test_failed_rollback_poisons_writer() {
    let (file, mut writer) = faulty_writer();
    writer.append(put(0)).unwrap();

    file.with(|s| {
        s.write_budget = Some(5);
        s.fail_set_len = true;
    });
    assert!(writer.append(put(1)).is_err());
    assert!(writer.is_poisoned());

    // Healthy again, but the torn tail is still there
    file.with(|s| {
        s.write_budget = None;
        s.fail_set_len = false;
    });
    let err = writer.append(put(2)).unwrap_err();
    assert!(matches!(err, ExtentError::TransactionFailure(_)));

    writer.truncate().unwrap();
    assert!(!writer.is_poisoned());
    assert_eq!(writer.append(put(3)).unwrap(), 2);
}
