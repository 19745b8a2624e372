//! MetadataCatalog Tests
//!
//! Tests verify:
//! - save/load/delete semantics and errors
//! - Extent placement (first fit, reuse after delete)
//! - Space accounting invariant across save/delete sequences
//! - Aggregate counters and stats
//! - Rebuild of the allocator on reopen

use extentdb::alloc::{AllocatorKind, Extent};
use extentdb::catalog::{CatalogCounters, MetadataCatalog};
use extentdb::config::{round_up, Config};
use extentdb::engine::Engine;
use extentdb::error::ExtentError;
use extentdb::freelist::FreelistKind;
use tempfile::TempDir;

use crate::support::{create_catalog, open_catalog, small_config, COMBOS, KIB, MIB};

// =============================================================================
// Placement Tests
// =============================================================================

#[test]
fn test_reuse_after_delete() {
    for (alloc, freelist) in COMBOS {
        let temp = TempDir::new().unwrap();
        let mut catalog = create_catalog(small_config(temp.path(), alloc, freelist));

        let f1 = catalog.save("f1", 2 * MIB).unwrap();
        let f2 = catalog.save("f2", 2 * MIB).unwrap();
        assert_eq!(f1.extents, vec![Extent::new(2 * MIB, 2 * MIB)]);
        assert_eq!(f2.extents, vec![Extent::new(4 * MIB, 2 * MIB)]);

        catalog.delete("f1").unwrap();
        let f3 = catalog.save("f3", 4 * MIB).unwrap();
        assert_eq!(
            f3.extents,
            vec![Extent::new(2 * MIB, 2 * MIB), Extent::new(6 * MIB, 2 * MIB)]
        );

        let loaded = catalog.load("f3").unwrap();
        assert_eq!(loaded, f3);
        assert_eq!(catalog.allocator().get_free(), 0);
    }
}

#[test]
fn test_size_rounded_to_unit() {
    let temp = TempDir::new().unwrap();
    let mut catalog = create_catalog(small_config(
        temp.path(),
        AllocatorKind::Extent,
        FreelistKind::Extent,
    ));

    let obj = catalog.save("odd", 3 * MIB + 1).unwrap();

    assert_eq!(obj.size, 3 * MIB + 1);
    assert_eq!(obj.allocated_bytes(), 4 * MIB);
    assert_eq!(catalog.load("odd").unwrap().size, 3 * MIB + 1);
}

#[test]
fn test_max_extent_size_respected() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .device_size(16 * MIB)
        .alloc_unit(MIB)
        .reserved_head(0)
        .max_extent_size(2 * MIB)
        .build();
    let mut catalog = create_catalog(config);

    let obj = catalog.save("big", 7 * MIB).unwrap();
    assert_eq!(obj.extents.len(), 4);
    assert!(obj.extents.iter().all(|e| e.length <= 2 * MIB));
    assert_eq!(obj.allocated_bytes(), 7 * MIB);
}

#[test]
fn test_zero_size_object() {
    let temp = TempDir::new().unwrap();
    let mut catalog = create_catalog(small_config(
        temp.path(),
        AllocatorKind::Extent,
        FreelistKind::Extent,
    ));
    let free = catalog.allocator().get_free();

    let obj = catalog.save("empty", 0).unwrap();
    assert!(obj.extents.is_empty());
    assert_eq!(catalog.load("empty").unwrap().size, 0);
    assert_eq!(catalog.allocator().get_free(), free);

    catalog.delete("empty").unwrap();
    assert!(matches!(catalog.load("empty"), Err(ExtentError::NotFound(_))));
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_save_existing_name() {
    let temp = TempDir::new().unwrap();
    let mut catalog = create_catalog(small_config(
        temp.path(),
        AllocatorKind::Extent,
        FreelistKind::Extent,
    ));
    catalog.save("f", 2 * MIB).unwrap();
    let free = catalog.allocator().get_free();

    let err = catalog.save("f", 2 * MIB).unwrap_err();
    assert!(matches!(err, ExtentError::AlreadyExists(_)));
    assert_eq!(catalog.allocator().get_free(), free);
    assert_eq!(catalog.allocator().get_reserved(), 0);
}

#[test]
fn test_capacity_exceeded() {
    for (alloc, freelist) in COMBOS {
        let temp = TempDir::new().unwrap();
        let mut catalog = create_catalog(small_config(temp.path(), alloc, freelist));

        let err = catalog.save("huge", 7 * MIB).unwrap_err();
        match err {
            ExtentError::CapacityExceeded { requested, available } => {
                assert_eq!(requested, 8 * MIB);
                assert_eq!(available, 6 * MIB);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(catalog.allocator().get_reserved(), 0);
        assert!(catalog.list().unwrap().is_empty());
    }
}

#[test]
fn test_size_near_u64_max() {
    for (alloc, freelist) in COMBOS {
        let temp = TempDir::new().unwrap();
        let mut catalog = create_catalog(small_config(temp.path(), alloc, freelist));
        let free = catalog.allocator().get_free();

        for size in [u64::MAX, u64::MAX - 1, u64::MAX - 2 * MIB] {
            let err = catalog.save("huge", size).unwrap_err();
            assert!(
                matches!(err, ExtentError::CapacityExceeded { .. }),
                "size {}: {:?}",
                size,
                err
            );
        }

        assert!(matches!(catalog.load("huge"), Err(ExtentError::NotFound(_))));
        assert_eq!(catalog.allocator().get_free(), free);
        assert_eq!(catalog.allocator().get_reserved(), 0);
        assert_eq!(catalog.counters().unwrap().saves, 0);
    }
}

#[test]
fn test_load_and_delete_missing() {
    let temp = TempDir::new().unwrap();
    let mut catalog = create_catalog(small_config(
        temp.path(),
        AllocatorKind::Extent,
        FreelistKind::Extent,
    ));

    assert!(matches!(catalog.load("nope"), Err(ExtentError::NotFound(_))));
    assert!(matches!(catalog.delete("nope"), Err(ExtentError::NotFound(_))));
}

#[test]
fn test_create_twice_rejected() {
    let temp = TempDir::new().unwrap();
    let config = small_config(temp.path(), AllocatorKind::Extent, FreelistKind::Extent);
    let catalog = create_catalog(config.clone());
    catalog.close().unwrap();

    let engine = Engine::open(config.clone()).unwrap();
    let err = MetadataCatalog::create(config, engine).err().unwrap();
    assert!(matches!(err, ExtentError::Config(_)));
}

#[test]
fn test_invalid_config_rejected() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .device_size(8 * MIB)
        .alloc_unit(3 * KIB)
        .build();
    let engine = Engine::create_and_open(config.clone()).unwrap();

    let err = MetadataCatalog::create(config, engine).err().unwrap();
    assert!(matches!(err, ExtentError::Config(_)));
}

// =============================================================================
// Accounting Tests
// =============================================================================

#[test]
fn test_space_invariant_over_sequence() {
    for (alloc, freelist) in COMBOS {
        let temp = TempDir::new().unwrap();
        let config = Config::builder()
            .data_dir(temp.path())
            .device_size(64 * MIB)
            .alloc_unit(MIB)
            .reserved_head(8 * KIB)
            .allocator_kind(alloc)
            .freelist_kind(freelist)
            .build();
        let head = config.reserved_head_aligned();
        let mut catalog = create_catalog(config);

        let sizes = [3 * MIB, 1, 5 * MIB + 7, 0, 2 * MIB, 9 * MIB];
        let mut live: Vec<(String, u64)> = Vec::new();

        for (i, &size) in sizes.iter().enumerate() {
            let name = format!("obj{}", i);
            catalog.save(&name, size).unwrap();
            live.push((name, size));

            if i % 2 == 1 {
                let (victim, _) = live.remove(0);
                catalog.delete(&victim).unwrap();
            }

            let used: u64 = live.iter().map(|(_, s)| round_up(*s, MIB).unwrap()).sum();
            let durable = catalog.freelist().get_free(catalog.db()).unwrap();
            assert_eq!(catalog.allocator().get_free() + head + used, 64 * MIB);
            assert_eq!(durable, catalog.allocator().get_free());
        }

        assert!(catalog.verify().unwrap().is_consistent());
    }
}

#[test]
fn test_counters_and_stats() {
    let temp = TempDir::new().unwrap();
    let mut catalog = create_catalog(small_config(
        temp.path(),
        AllocatorKind::Extent,
        FreelistKind::Extent,
    ));
    assert_eq!(catalog.counters().unwrap(), CatalogCounters::default());

    catalog.save("a", MIB).unwrap();
    catalog.save("b", 2 * MIB).unwrap();
    catalog.delete("a").unwrap();

    assert_eq!(
        catalog.counters().unwrap(),
        CatalogCounters {
            objects: 1,
            allocated_bytes: (2 * MIB) as i64,
            saves: 2,
            deletes: 1,
        }
    );

    let stats = catalog.stats().unwrap();
    assert_eq!(stats.capacity, 8 * MIB);
    assert_eq!(stats.reserved_head, 2 * MIB);
    assert_eq!(stats.free, 4 * MIB);
    assert_eq!(stats.reserved, 0);
    assert_eq!(stats.counters.objects, 1);
}

#[test]
fn test_list_in_name_order() {
    let temp = TempDir::new().unwrap();
    let mut catalog = create_catalog(small_config(
        temp.path(),
        AllocatorKind::Extent,
        FreelistKind::Extent,
    ));
    for name in ["charlie", "alpha", "bravo"] {
        catalog.save(name, KIB).unwrap();
    }

    let names: Vec<String> = catalog.list().unwrap().into_iter().map(|o| o.name).collect();
    assert_eq!(names, vec!["alpha", "bravo", "charlie"]);
}

// =============================================================================
// Reopen Tests
// =============================================================================

#[test]
fn test_reopen_rebuilds_allocator() {
    for (alloc, freelist) in COMBOS {
        let temp = TempDir::new().unwrap();
        let config = small_config(temp.path(), alloc, freelist);

        let (runs_before, f2) = {
            let mut catalog = create_catalog(config.clone());
            catalog.save("f1", 2 * MIB).unwrap();
            let f2 = catalog.save("f2", 2 * MIB).unwrap();
            catalog.delete("f1").unwrap();
            let runs = catalog.allocator().free_runs();
            catalog.close().unwrap();
            (runs, f2)
        };

        let catalog = open_catalog(config);
        assert_eq!(catalog.allocator().free_runs(), runs_before);
        assert_eq!(catalog.load("f2").unwrap(), f2);
        assert_eq!(catalog.counters().unwrap().objects, 1);
    }
}

#[test]
fn test_reopen_after_crash_without_close() {
    let temp = TempDir::new().unwrap();
    let config = small_config(temp.path(), AllocatorKind::Extent, FreelistKind::Extent);

    {
        let mut catalog = create_catalog(config.clone());
        catalog.save("f1", 2 * MIB).unwrap();
        // Dropped: committed state lives only in the WAL
    }

    let mut catalog = open_catalog(config);
    assert_eq!(catalog.load("f1").unwrap().extents, vec![Extent::new(2 * MIB, 2 * MIB)]);
    assert_eq!(catalog.allocator().get_free(), 4 * MIB);
    assert_eq!(
        catalog.save("f2", 2 * MIB).unwrap().extents,
        vec![Extent::new(4 * MIB, 2 * MIB)]
    );
}

#[test]
fn test_open_with_other_allocator_kind() {
    let temp = TempDir::new().unwrap();
    let config = small_config(temp.path(), AllocatorKind::Extent, FreelistKind::Bitmap);
    {
        let mut catalog = create_catalog(config.clone());
        catalog.save("f1", 4 * MIB).unwrap();
        catalog.close().unwrap();
    }

    let mut config = config;
    config.allocator_kind = AllocatorKind::Bitmap;
    let catalog = open_catalog(config);

    assert_eq!(catalog.allocator().kind(), AllocatorKind::Bitmap);
    assert_eq!(catalog.allocator().free_runs(), vec![Extent::new(6 * MIB, 2 * MIB)]);
}
