//! Record Codec Tests
//!
//! Tests verify:
//! - Offset keys sort in address order
//! - Metadata records decode what they encode
//! - Malformed records are rejected as corrupt

use extentdb::alloc::Extent;
use extentdb::codec::{
    decode_offset_key, decode_u64_value, encode_offset_key, encode_u64_value, MetadataRecord,
    METADATA_VERSION,
};
use extentdb::error::ExtentError;

fn sample() -> MetadataRecord {
    MetadataRecord::new(
        5000,
        vec![Extent::new(0x20000, 0x1000), Extent::new(0x8000, 0x1000)],
    )
}

#[test]
fn test_offset_keys_sort_by_address() {
    let offsets = [0u64, 1, 255, 256, 0x1_0000_0000, u64::MAX];
    let keys: Vec<[u8; 8]> = offsets.iter().map(|&o| encode_offset_key(o)).collect();

    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(sorted, keys);

    for (&o, k) in offsets.iter().zip(&keys) {
        assert_eq!(decode_offset_key(k).unwrap(), o);
    }
}

#[test]
fn test_offset_key_wrong_length() {
    assert!(matches!(
        decode_offset_key(&[0u8; 7]),
        Err(ExtentError::CorruptRecord(_))
    ));
    assert!(matches!(
        decode_u64_value(&[0u8; 9]),
        Err(ExtentError::CorruptRecord(_))
    ));
    assert_eq!(decode_u64_value(&encode_u64_value(42)).unwrap(), 42);
}

#[test]
fn test_metadata_layout() {
    let encoded = sample().encode();

    assert_eq!(encoded.len(), 1 + 8 + 8 + 2 * 16);
    assert_eq!(encoded[0], METADATA_VERSION);
    assert_eq!(&encoded[1..9], &5000u64.to_le_bytes());
    assert_eq!(&encoded[9..17], &2u64.to_le_bytes());
    assert_eq!(&encoded[17..25], &0x20000u64.to_le_bytes());
}

#[test]
fn test_metadata_decode_keeps_extent_order() {
    let decoded = MetadataRecord::decode(&sample().encode()).unwrap();
    assert_eq!(decoded, sample());
    assert_eq!(decoded.extents[0].offset, 0x20000);
}

#[test]
fn test_metadata_empty_extents() {
    let record = MetadataRecord::new(0, Vec::new());
    assert_eq!(MetadataRecord::decode(&record.encode()).unwrap(), record);
}

#[test]
fn test_metadata_unknown_version() {
    let mut encoded = sample().encode();
    encoded[0] = METADATA_VERSION + 1;

    let err = MetadataRecord::decode(&encoded).unwrap_err();
    assert!(matches!(err, ExtentError::CorruptRecord(_)));
}

#[test]
fn test_metadata_truncated() {
    let encoded = sample().encode();

    for len in [0, 1, 16, encoded.len() - 1] {
        let err = MetadataRecord::decode(&encoded[..len]).unwrap_err();
        assert!(matches!(err, ExtentError::CorruptRecord(_)), "len {}", len);
    }
}

#[test]
fn test_metadata_trailing_bytes() {
    let mut encoded = sample().encode();
    encoded.push(0);

    assert!(matches!(
        MetadataRecord::decode(&encoded),
        Err(ExtentError::CorruptRecord(_))
    ));
}

#[test]
fn test_metadata_huge_count() {
    let mut encoded = sample().encode();
    encoded[9..17].copy_from_slice(&u64::MAX.to_le_bytes());

    assert!(matches!(
        MetadataRecord::decode(&encoded),
        Err(ExtentError::CorruptRecord(_))
    ));
}

#[test]
fn test_metadata_overlapping_extents() {
    let record = MetadataRecord::new(
        0x3000,
        vec![Extent::new(0x1000, 0x2000), Extent::new(0x2000, 0x1000)],
    );

    assert!(matches!(
        MetadataRecord::decode(&record.encode()),
        Err(ExtentError::CorruptRecord(_))
    ));
}

#[test]
fn test_metadata_extent_overflow() {
    let record = MetadataRecord::new(1, vec![Extent::new(u64::MAX - 10, 0x1000)]);

    assert!(matches!(
        MetadataRecord::decode(&record.encode()),
        Err(ExtentError::CorruptRecord(_))
    ));
}
