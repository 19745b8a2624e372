//! # extentdb
//!
//! A persistent space-allocation and object-metadata catalog:
//! - In-memory extent allocator with soft reservations
//! - Durable freelist mirrored in a transactional key-value store
//! - Catalog of object name → extent list, mutated atomically
//! - Aggregate counters maintained through a merge operator
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MetadataCatalog                          │
//! │            (save / load / delete / verify)                   │
//! └──────┬──────────────────────┬───────────────────────┬───────┘
//!        │                      │                       │
//!        ▼                      ▼                       │
//! ┌──────────────┐     ┌─────────────────┐              │
//! │SpaceAllocator│◄────│ FreelistManager │              │
//! │ (in memory)  │ init│ (staged in txn) │              │
//! └──────────────┘     └────────┬────────┘              │
//!                               │                       │
//! ┌─────────────────────────────▼───────────────────────▼───────┐
//! │               KeyValueDb (Engine: one txn = one WAL entry)   │
//! └──────┬───────────────────────┬──────────────────────────────┘
//!        ▼                       ▼
//!   ┌─────────────┐       ┌─────────────┐      ┌─────────────┐
//!   │     WAL     │       │  MemTable   │─────►│   Storage   │
//!   │  (Append)   │       │  (RwLock)   │flush │  (SSTable)  │
//!   └─────────────┘       └─────────────┘      └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod wal;
pub mod memtable;
pub mod storage;
pub mod kv;
pub mod merge;
pub mod engine;

pub mod alloc;
pub mod codec;
pub mod freelist;
pub mod catalog;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ExtentError, Result};
pub use config::{Config, WalSyncStrategy};
pub use engine::Engine;
pub use kv::{KeyValueDb, Snapshot, Transaction};
pub use alloc::{AllocatorKind, Extent, SpaceAllocator};
pub use freelist::{FreelistKind, FreelistManager};
pub use merge::{AggregateMergeOperator, MergeOperator};
pub use catalog::{CatalogCounters, CatalogStats, MetadataCatalog, ObjectMetadata, VerifyReport};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of extentdb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
