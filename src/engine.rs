//! Engine Module
//!
//! The transactional key-value engine behind the catalog.
//!
//! ## Responsibilities
//! - Coordinate WAL, MemTable, and Storage
//! - Apply whole transactions atomically (one WAL entry each)
//! - Resolve merge operands at commit time
//! - Serve namespace snapshots
//! - Manage crash recovery on startup

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ExtentError, Result};
use crate::kv::{self, KeyValueDb, Snapshot, Transaction, TxnOp};
use crate::memtable::{MemTable, MemTableEntry};
use crate::merge::MergeOperator;
use crate::storage::StorageManager;
use crate::wal::{Operation, WalRecovery, WalWriter};

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Commits** (submit/flush): Serialized by `write_lock`
///   - Only ONE transaction is applied at a time
///   - Must acquire: write_lock → WAL → memtable → storage (write)
///
/// - **Point reads** (get): no write_lock; memtable and SSTable list each
///   have their own lock
///
/// - **Snapshots**: taken under `write_lock` so no commit or flush is
///   half-applied while the namespace is copied
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Directory for all data files (SSTables)
    storage_dir: PathBuf,

    /// Write-ahead log for durability (exclusive access needed)
    wal: Mutex<WalWriter>,

    /// In-memory table for recent writes (internal RwLock)
    memtable: MemTable,

    /// Persistent storage manager (internal RwLock on sstables vec)
    storage: StorageManager,

    /// Merge operators by namespace
    merge_operators: RwLock<HashMap<String, Arc<dyn MergeOperator>>>,

    /// Serializes commits, flushes and snapshots
    write_lock: Mutex<()>,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const WAL_FILENAME: &'static str = "wal.log";
    const SSTABLE_DIR: &'static str = "sstables";

    /// Open an existing engine
    ///
    /// Fails if `config.data_dir` does not exist.
    pub fn open(config: Config) -> Result<Self> {
        if !config.data_dir.is_dir() {
            return Err(ExtentError::Storage(format!(
                "Data directory {} does not exist",
                config.data_dir.display()
            )));
        }
        Self::open_inner(config)
    }

    /// Create the data directory if needed, then open
    pub fn create_and_open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        Self::open_inner(config)
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().data_dir(path).build();
        Self::create_and_open(config)
    }

    /// On startup:
    /// 1. Open storage (loads existing SSTables)
    /// 2. Recover the WAL and replay it into the memtable
    /// 3. Flush recovered data and truncate the WAL
    fn open_inner(config: Config) -> Result<Self> {
        let storage_dir = config.data_dir.join(Self::SSTABLE_DIR);
        let wal_path = config.data_dir.join(Self::WAL_FILENAME);

        let storage = StorageManager::open(&storage_dir)?;
        let memtable = MemTable::new();

        if wal_path.exists() {
            let (entries, recovery) = WalRecovery::recover(&wal_path)?;

            if recovery.entries_recovered > 0 || recovery.entries_corrupted > 0 {
                info!(
                    recovered = recovery.entries_recovered,
                    corrupted = recovery.entries_corrupted,
                    last_lsn = recovery.last_lsn,
                    "WAL recovery"
                );
            }

            for entry in entries {
                for op in entry.ops {
                    match op {
                        Operation::Put { key, value } => {
                            memtable.put(key, value);
                        }
                        Operation::Delete { key } => {
                            memtable.delete(key);
                        }
                    }
                }
            }
        }

        let mut wal = WalWriter::open(&wal_path, config.wal_sync_strategy)?;

        // Recovered data becomes durable in an SSTable before the WAL goes
        if !memtable.is_empty() {
            info!(entries = memtable.entry_count(), "Flushing recovered entries to SSTable");
            storage.flush(&memtable)?;
            memtable.clear();
            wal.truncate()?;
        }

        Ok(Self {
            config,
            storage_dir,
            wal: Mutex::new(wal),
            memtable,
            storage,
            merge_operators: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        })
    }

    // =========================================================================
    // Raw (physical key) access
    // =========================================================================

    /// Look up a physical key
    ///
    /// Search order:
    /// 1. MemTable (most recent writes)
    /// 2. SSTables (newest to oldest)
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.memtable.get(key) {
            return match entry {
                MemTableEntry::Value(value) => Ok(Some(value)),
                MemTableEntry::Tombstone => Ok(None),
            };
        }

        self.storage.get(key)
    }

    /// Resolve a transaction into WAL operations
    ///
    /// Merges see values staged earlier in the same transaction.
    fn resolve(&self, txn: Transaction) -> Result<Vec<Operation>> {
        let mut staged: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
        let mut ops = Vec::with_capacity(txn.len());

        for op in txn.into_ops() {
            match op {
                TxnOp::Set { ns, key, value } => {
                    let raw = kv::combine_key(&ns, &key);
                    staged.insert(raw.clone(), Some(value.clone()));
                    ops.push(Operation::Put { key: raw, value });
                }
                TxnOp::Remove { ns, key } => {
                    let raw = kv::combine_key(&ns, &key);
                    staged.insert(raw.clone(), None);
                    ops.push(Operation::Delete { key: raw });
                }
                TxnOp::Merge { ns, key, operand } => {
                    let operator = self.merge_operators.read().get(&ns).cloned().ok_or_else(|| {
                        ExtentError::Storage(format!("No merge operator for namespace {:?}", ns))
                    })?;

                    let raw = kv::combine_key(&ns, &key);
                    let existing = match staged.get(&raw) {
                        Some(value) => value.clone(),
                        None => self.get_raw(&raw)?,
                    };

                    let value = operator.merge(existing.as_deref(), &operand)?;
                    staged.insert(raw.clone(), Some(value.clone()));
                    ops.push(Operation::Put { key: raw, value });
                }
            }
        }

        Ok(ops)
    }

    /// Submit a transaction and wait until it is durable
    ///
    /// Steps:
    /// 1. Acquire write lock
    /// 2. Resolve merges (nothing is written if this fails)
    /// 3. Append the whole batch as one WAL entry
    /// 4. Apply to MemTable
    /// 5. Flush if the memtable is full
    pub fn submit_transaction_sync(&self, txn: Transaction) -> Result<()> {
        let _write_guard = lock(&self.write_lock, "Write")?;

        let ops = self.resolve(txn)?;
        if ops.is_empty() {
            return Ok(());
        }

        let lsn = {
            let mut wal = lock(&self.wal, "WAL")?;
            wal.append(ops.clone())
                .map_err(|e| ExtentError::TransactionFailure(e.to_string()))?
        };

        let mut new_size = self.memtable.size();
        for op in ops {
            new_size = match op {
                Operation::Put { key, value } => self.memtable.put(key, value),
                Operation::Delete { key } => self.memtable.delete(key),
            };
        }
        debug!(lsn, memtable_size = new_size, "Transaction committed");

        // The commit is already durable in the WAL; a failed flush is retried
        // on the next trigger instead of failing the commit.
        if new_size >= self.config.memtable_size_limit {
            if let Err(e) = self.flush_internal() {
                warn!(error = %e, "Memtable flush failed after commit");
            }
        }

        Ok(())
    }

    /// Get a value by namespace and key
    pub fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_raw(&kv::combine_key(ns, key))
    }

    /// Consistent copy of every live key in `ns`
    pub fn snapshot(&self, ns: &str) -> Result<Snapshot> {
        let _write_guard = lock(&self.write_lock, "Write")?;

        let prefix = kv::namespace_prefix(ns);
        let mut merged = self.storage.scan_prefix(&prefix)?;
        for (key, entry) in self.memtable.scan_prefix(&prefix) {
            let value = match entry {
                MemTableEntry::Value(v) => Some(v),
                MemTableEntry::Tombstone => None,
            };
            merged.insert(key, value);
        }

        let entries: BTreeMap<Vec<u8>, Vec<u8>> = merged
            .into_iter()
            .filter_map(|(key, value)| Some((key[prefix.len()..].to_vec(), value?)))
            .collect();

        Ok(Snapshot::new(entries))
    }

    /// Install a merge operator for `ns`
    pub fn set_merge_operator(&self, ns: &str, operator: Arc<dyn MergeOperator>) {
        debug!(ns, operator = operator.name(), "Merge operator registered");
        self.merge_operators.write().insert(ns.to_string(), operator);
    }

    /// Flush memtable to disk (public API)
    ///
    /// Forces a flush regardless of memtable size
    pub fn flush(&self) -> Result<()> {
        let _write_guard = lock(&self.write_lock, "Write")?;
        self.flush_internal()
    }

    /// Internal flush implementation (called with write lock held)
    fn flush_internal(&self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }

        // Step 1: Flush memtable to SSTable (StorageManager internally locks)
        self.storage.flush(&self.memtable)?;

        // Step 2: Clear memtable
        self.memtable.clear();

        // Step 3: Truncate WAL (entries are now durable in SSTable)
        lock(&self.wal, "WAL")?.truncate()?;

        Ok(())
    }

    /// Close the engine gracefully
    ///
    /// Flushes any pending data and syncs to disk
    pub fn close(self) -> Result<()> {
        self.flush()?;
        lock(&self.wal, "WAL")?.sync()?;
        info!(dir = %self.config.data_dir.display(), "Engine closed");
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Get the storage directory path (where SSTables are stored)
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Get the current memtable size
    pub fn memtable_size(&self) -> usize {
        self.memtable.size()
    }

    /// Get the memtable entry count
    pub fn memtable_entry_count(&self) -> usize {
        self.memtable.entry_count()
    }

    /// Get the number of SSTables
    pub fn sstable_count(&self) -> usize {
        self.storage.sstable_count()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl KeyValueDb for Engine {
    fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Engine::get(self, ns, key)
    }

    fn snapshot(&self, ns: &str) -> Result<Snapshot> {
        Engine::snapshot(self, ns)
    }

    fn submit_transaction_sync(&self, txn: Transaction) -> Result<()> {
        Engine::submit_transaction_sync(self, txn)
    }

    fn set_merge_operator(&self, ns: &str, operator: Arc<dyn MergeOperator>) -> Result<()> {
        Engine::set_merge_operator(self, ns, operator);
        Ok(())
    }

    fn close(self) -> Result<()> {
        Engine::close(self)
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|e| ExtentError::LockPoisoned(format!("{} lock poisoned: {}", what, e)))
}
