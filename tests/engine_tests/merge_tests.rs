//! Tests for merge operators
//!
//! These tests verify:
//! - Element-wise aggregate arithmetic
//! - Merges resolved at commit against stored and staged values
//! - Shape errors reject the whole transaction
//! - Merged values survive restart without the operator

use std::sync::Arc;

use extentdb::config::Config;
use extentdb::engine::Engine;
use extentdb::error::ExtentError;
use extentdb::kv::{KeyValueDb, Transaction};
use extentdb::merge::{decode_elements, encode_elements, AggregateMergeOperator, MergeOperator};
use tempfile::TempDir;

fn engine_with_aggregate(dir: &std::path::Path) -> Engine {
    let engine = Engine::create_and_open(Config::builder().data_dir(dir).build()).unwrap();
    KeyValueDb::set_merge_operator(&engine, "A", Arc::new(AggregateMergeOperator::new())).unwrap();
    engine
}

fn merge(engine: &Engine, key: &[u8], values: &[i64]) -> extentdb::Result<()> {
    let mut txn = Transaction::new();
    txn.merge("A", key, encode_elements(values));
    engine.submit_transaction_sync(txn)
}

fn read(engine: &Engine, key: &[u8]) -> Vec<i64> {
    decode_elements(&engine.get("A", key).unwrap().unwrap()).unwrap()
}

// =============================================================================
// Operator Tests
// =============================================================================

#[test]
fn test_element_wise_sum() {
    let op = AggregateMergeOperator::new();
    let out = op
        .merge(Some(&encode_elements(&[1, 2, 3])), &encode_elements(&[10, 20, 30]))
        .unwrap();
    assert_eq!(decode_elements(&out).unwrap(), vec![11, 22, 33]);
}

#[test]
fn test_missing_key_yields_operand() {
    let op = AggregateMergeOperator::new();
    let operand = encode_elements(&[5, -7]);
    assert_eq!(op.merge(None, &operand).unwrap(), operand);
}

#[test]
fn test_negative_and_wrapping() {
    let op = AggregateMergeOperator::new();
    let out = op
        .merge(Some(&encode_elements(&[i64::MAX, 10])), &encode_elements(&[1, -15]))
        .unwrap();
    assert_eq!(decode_elements(&out).unwrap(), vec![i64::MIN, -5]);
}

#[test]
fn test_shape_errors() {
    let op = AggregateMergeOperator::new();

    let err = op
        .merge(Some(&encode_elements(&[1, 2])), &encode_elements(&[1, 2, 3]))
        .unwrap_err();
    assert!(matches!(err, ExtentError::CorruptRecord(_)));

    let err = op.merge(None, &[0u8; 7]).unwrap_err();
    assert!(matches!(err, ExtentError::CorruptRecord(_)));

    assert!(decode_elements(&[0u8; 9]).is_err());
}

// =============================================================================
// Engine Integration Tests
// =============================================================================

#[test]
fn test_merge_through_engine() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with_aggregate(temp.path());

    merge(&engine, b"c", &[1, 2, 3]).unwrap();
    merge(&engine, b"c", &[10, 20, 30]).unwrap();

    assert_eq!(read(&engine, b"c"), vec![11, 22, 33]);
}

#[test]
fn test_merges_within_one_transaction_accumulate() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with_aggregate(temp.path());

    let mut txn = Transaction::new();
    txn.set("A", b"c", encode_elements(&[100]));
    txn.merge("A", b"c", encode_elements(&[1]));
    txn.merge("A", b"c", encode_elements(&[1]));
    engine.submit_transaction_sync(txn).unwrap();

    assert_eq!(read(&engine, b"c"), vec![102]);
}

#[test]
fn test_bad_merge_rejects_whole_transaction() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with_aggregate(temp.path());
    merge(&engine, b"c", &[1, 1]).unwrap();

    let mut txn = Transaction::new();
    txn.set("M", b"obj", b"record".to_vec());
    txn.merge("A", b"c", encode_elements(&[1]));
    let err = engine.submit_transaction_sync(txn).unwrap_err();

    assert!(matches!(err, ExtentError::CorruptRecord(_)));
    assert_eq!(engine.get("M", b"obj").unwrap(), None);
    assert_eq!(read(&engine, b"c"), vec![1, 1]);
}

#[test]
fn test_merge_without_operator_fails() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with_aggregate(temp.path());

    let mut txn = Transaction::new();
    txn.merge("Z", b"c", encode_elements(&[1]));
    assert!(engine.submit_transaction_sync(txn).is_err());
}

#[test]
fn test_merged_value_survives_restart() {
    let temp = TempDir::new().unwrap();
    {
        let engine = engine_with_aggregate(temp.path());
        merge(&engine, b"c", &[4, 5]).unwrap();
        merge(&engine, b"c", &[1, 1]).unwrap();
    }

    // Recovery replays resolved values; no operator registered here
    let engine = Engine::open(Config::builder().data_dir(temp.path()).build()).unwrap();
    assert_eq!(read(&engine, b"c"), vec![5, 6]);
}
