//! Tests for WAL Recovery
//!
//! These tests verify:
//! - Recovery from a clean WAL (no corruption)
//! - Recovery with partial writes (truncated tail)
//! - Recovery with corrupted entries (CRC mismatch)
//! - Verify mode (stats only, file untouched)

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use extentdb::config::WalSyncStrategy;
use extentdb::wal::{Operation, WalEntry, WalRecovery, WalWriter};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("test.wal");
    (temp_dir, wal_path)
}

fn write_entries_via_writer(path: &PathBuf, count: usize) {
    let mut writer = WalWriter::open(path, WalSyncStrategy::EveryWrite).unwrap();
    for i in 0..count {
        writer
            .append(vec![Operation::Put {
                key: format!("key{}", i).into_bytes(),
                value: format!("value{}", i).into_bytes(),
            }])
            .unwrap();
    }
}

fn append_raw(path: &PathBuf, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Clean WAL Tests
// =============================================================================

#[test]
fn test_recover_empty_file() {
    let (_temp, wal_path) = setup_temp_wal();
    File::create(&wal_path).unwrap();

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result.entries_recovered, 0);
    assert_eq!(result.last_lsn, 0);
    assert!(!result.was_truncated);
}

#[test]
fn test_recover_multiple_entries() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 10);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert_eq!(entries.len(), 10);
    assert_eq!(result.entries_recovered, 10);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(result.last_lsn, 10);
    assert!(!result.was_truncated);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.lsn, (i + 1) as u64);
    }
}

// =============================================================================
// Partial Write Tests
// =============================================================================

#[test]
fn test_recover_truncates_torn_transaction() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 3);
    let valid_len = std::fs::metadata(&wal_path).unwrap().len();

    // A two-op transaction cut short: neither op may survive
    let torn = WalEntry::new(
        4,
        vec![
            Operation::Put { key: b"a".to_vec(), value: b"1".to_vec() },
            Operation::Put { key: b"b".to_vec(), value: b"2".to_vec() },
        ],
    )
    .serialize()
    .unwrap();
    append_raw(&wal_path, &torn[..torn.len() - 5]);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(result.last_lsn, 3);
    assert!(result.was_truncated);
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), valid_len);
}

#[test]
fn test_recover_header_only_fragment() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 1);
    append_raw(&wal_path, &[0u8; 7]);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(result.was_truncated);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_recover_stops_at_corrupt_entry() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 2);

    let mut bad = WalEntry::new(3, vec![Operation::Delete { key: b"key0".to_vec() }])
        .serialize()
        .unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0x55;
    append_raw(&wal_path, &bad);

    let (entries, result) = WalRecovery::recover(&wal_path).unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(result.entries_corrupted, 1);
    assert!(result.was_truncated);

    // Second recovery sees a clean log
    let (_, again) = WalRecovery::recover(&wal_path).unwrap();
    assert!(!again.was_truncated);
    assert_eq!(again.entries_recovered, 2);
}

// =============================================================================
// Verify Tests
// =============================================================================

#[test]
fn test_verify_does_not_modify() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 2);
    append_raw(&wal_path, &[1, 2, 3]);
    let len_before = std::fs::metadata(&wal_path).unwrap().len();

    let result = WalRecovery::verify(&wal_path).unwrap();

    assert_eq!(result.entries_recovered, 2);
    assert!(result.was_truncated);
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), len_before);
}
