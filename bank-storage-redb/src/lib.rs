//! # Bank Storage - redb
//!
//! Durable pattern store on the redb embedded database.
//!
//! This crate provides:
//! - Crash-safe persistence: every successful insert or outcome attach is
//!   committed before the call returns
//! - An append-only operation log driving `iter_since` in commit order
//! - A `(context, strategy)` statistics table recomputed on outcome attach
//! - An in-memory similarity index rebuilt on open, so queries never
//!   deserialize the whole table
//! - Read-only mode once corruption is detected
//!
//! ## Example
//!
//! ```no_run
//! use bank_storage_redb::RedbPatternStore;
//! use bank_core::similarity::SimilarityMetric;
//! use std::path::Path;
//!
//! # async fn example() -> bank_core::Result<()> {
//! let store =
//!     RedbPatternStore::open(Path::new("./bank.redb"), SimilarityMetric::Cosine, None).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use bank_core::similarity::SimilarityMetric;
use bank_core::types::{Pattern, PatternId, StrategyStats};
use bank_core::{Error, Result};

mod ops;

/// On-disk schema version; opening a database written by an unknown
/// schema refuses with `Corrupt`.
pub const SCHEMA_VERSION: u32 = 1;

/// Maximum size for one pattern row (1 MiB).
///
/// Prevents OOM from oversized rows written by a buggy or hostile peer
/// before they reach deserialization.
pub const MAX_PATTERN_ROW_SIZE: usize = 1_000_000;

// Table definitions
pub(crate) const PATTERNS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("patterns");
pub(crate) const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("op_log");
pub(crate) const STATS_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("strategy_stats");
pub(crate) const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

pub(crate) const META_SCHEMA_VERSION: &str = "schema_version";
pub(crate) const META_EMBEDDING_DIM: &str = "embedding_dim";

/// Timeout duration for database operations
const DB_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry in the append-only operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum LogOp {
    /// A pattern was committed under this id
    Insert(PatternId),
    /// An outcome was attached to this id
    AttachOutcome(PatternId),
}

/// Execute a blocking redb operation off the async runtime, with a timeout.
async fn with_db_timeout<T, F>(operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(DB_OPERATION_TIMEOUT, tokio::task::spawn_blocking(operation)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(Error::StorageUnavailable(format!(
            "task join error: {join_err}"
        ))),
        Err(_) => Err(Error::StorageUnavailable(format!(
            "database operation timed out after {DB_OPERATION_TIMEOUT:?}"
        ))),
    }
}

/// In-memory mirror of the committed state, serving reads and similarity
/// scans. Updated under the write path's lock only after the durable
/// commit succeeds, so readers never observe an uncommitted row.
#[derive(Default)]
#[derive(Debug)]
pub(crate) struct IndexInner {
    pub(crate) dim: Option<usize>,
    pub(crate) next_seq: u64,
    pub(crate) patterns: HashMap<PatternId, Pattern>,
    /// Insert order, for `iter_since`
    pub(crate) log: Vec<PatternId>,
    pub(crate) stats: BTreeMap<(String, String), StrategyStats>,
}

/// Durable pattern store backed by redb.
#[derive(Debug)]
pub struct RedbPatternStore {
    pub(crate) db: Arc<Database>,
    pub(crate) metric: SimilarityMetric,
    pub(crate) index: Arc<RwLock<IndexInner>>,
    /// Serializes writers; readers go straight to the index
    pub(crate) write_lock: tokio::sync::Mutex<()>,
    pub(crate) read_only: AtomicBool,
}

impl RedbPatternStore {
    /// Open (or create) a store at `path`.
    ///
    /// `configured_dim` fixes the embedding dimension at creation; passing
    /// a different value for an existing store is refused.
    pub async fn open(
        path: &Path,
        metric: SimilarityMetric,
        configured_dim: Option<usize>,
    ) -> Result<Self> {
        info!("opening pattern store at {}", path.display());

        let path_buf = path.to_path_buf();
        let db = with_db_timeout(move || {
            Database::create(&path_buf)
                .map_err(|e| Error::StorageUnavailable(format!("failed to open database: {e}")))
        })
        .await?;
        let db = Arc::new(db);

        let loaded = {
            let db = Arc::clone(&db);
            with_db_timeout(move || Self::load_or_init(&db, configured_dim)).await?
        };

        info!(
            patterns = loaded.patterns.len(),
            dim = ?loaded.dim,
            "pattern store ready"
        );

        Ok(Self {
            db,
            metric,
            index: Arc::new(RwLock::new(loaded)),
            write_lock: tokio::sync::Mutex::new(()),
            read_only: AtomicBool::new(false),
        })
    }

    /// True once corruption has been detected; all writes refuse.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn enter_read_only(&self, why: &str) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            warn!("store entering read-only mode: {why}");
        }
    }

    /// Initialize tables on first open, otherwise verify the schema
    /// version and rebuild the in-memory index from the committed rows.
    fn load_or_init(db: &Database, configured_dim: Option<usize>) -> Result<IndexInner> {
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::StorageUnavailable(format!("failed to begin write: {e}")))?;
        {
            let mut meta = write_txn
                .open_table(META_TABLE)
                .map_err(|e| Error::StorageUnavailable(format!("failed to open metadata: {e}")))?;

            let existing_version = meta
                .get(META_SCHEMA_VERSION)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?
                .map(|raw| -> Result<u32> {
                    let bytes: [u8; 4] = raw.value().try_into().map_err(|_| {
                        Error::Corrupt("schema version cell is malformed".to_string())
                    })?;
                    Ok(u32::from_be_bytes(bytes))
                })
                .transpose()?;

            match existing_version {
                Some(version) => {
                    if version != SCHEMA_VERSION {
                        return Err(Error::Corrupt(format!(
                            "unknown schema version {version}, expected {SCHEMA_VERSION}"
                        )));
                    }
                }
                None => {
                    meta.insert(META_SCHEMA_VERSION, SCHEMA_VERSION.to_be_bytes().as_slice())
                        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                }
            }

            // A configured dimension fixes D now, whether the store is
            // brand new or existing-but-empty; conflicts surface below
            let dim_recorded = meta
                .get(META_EMBEDDING_DIM)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?
                .is_some();
            if let (false, Some(dim)) = (dim_recorded, configured_dim) {
                meta.insert(META_EMBEDDING_DIM, (dim as u32).to_be_bytes().as_slice())
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            }

            // Ensure the remaining tables exist
            write_txn
                .open_table(PATTERNS_TABLE)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            write_txn
                .open_table(LOG_TABLE)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            write_txn
                .open_table(STATS_TABLE)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::StorageUnavailable(format!("failed to commit: {e}")))?;

        let mut inner = IndexInner::default();

        let read_txn = db
            .begin_read()
            .map_err(|e| Error::StorageUnavailable(format!("failed to begin read: {e}")))?;

        let meta = read_txn
            .open_table(META_TABLE)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        if let Some(raw) = meta
            .get(META_EMBEDDING_DIM)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?
        {
            let bytes: [u8; 4] = raw
                .value()
                .try_into()
                .map_err(|_| Error::Corrupt("embedding dimension cell is malformed".to_string()))?;
            inner.dim = Some(u32::from_be_bytes(bytes) as usize);
        }
        if let (Some(existing), Some(configured)) = (inner.dim, configured_dim) {
            if existing != configured {
                return Err(Error::BadParameters(format!(
                    "embedding_dim {configured} conflicts with existing store dimension {existing}"
                )));
            }
        }

        let patterns_table = read_txn
            .open_table(PATTERNS_TABLE)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        for item in patterns_table
            .iter()
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?
        {
            let (key, value) = item.map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            if value.value().len() > MAX_PATTERN_ROW_SIZE {
                return Err(Error::Corrupt("oversized pattern row".to_string()));
            }
            let pattern: Pattern = postcard::from_bytes(value.value())
                .map_err(|e| Error::Corrupt(format!("undecodable pattern row: {e}")))?;
            let key_bytes: [u8; 32] = key
                .value()
                .try_into()
                .map_err(|_| Error::Corrupt("pattern key is not 32 bytes".to_string()))?;
            let id = PatternId::from_bytes(key_bytes);
            if pattern.id != id {
                return Err(Error::Corrupt(format!(
                    "pattern row key {id} disagrees with its record"
                )));
            }
            if let Some(dim) = inner.dim {
                if pattern.embedding.len() != dim {
                    return Err(Error::Corrupt(format!(
                        "pattern {id} has dimension {}, store expects {dim}",
                        pattern.embedding.len()
                    )));
                }
            } else {
                inner.dim = Some(pattern.embedding.len());
            }
            inner.patterns.insert(id, pattern);
        }

        let log_table = read_txn
            .open_table(LOG_TABLE)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        for item in log_table
            .iter()
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?
        {
            let (seq, value) = item.map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            let op: LogOp = postcard::from_bytes(value.value())
                .map_err(|e| Error::Corrupt(format!("undecodable log entry: {e}")))?;
            inner.next_seq = inner.next_seq.max(seq.value() + 1);
            if let LogOp::Insert(id) = op {
                if !inner.patterns.contains_key(&id) {
                    return Err(Error::Corrupt(format!(
                        "log references missing pattern {id}"
                    )));
                }
                inner.log.push(id);
            }
        }

        let stats_table = read_txn
            .open_table(STATS_TABLE)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        for item in stats_table
            .iter()
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?
        {
            let (key, value) = item.map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            let row: StrategyStats = postcard::from_bytes(value.value())
                .map_err(|e| Error::Corrupt(format!("undecodable stats row: {e}")))?;
            let (context, strategy) = key.value();
            inner
                .stats
                .insert((context.to_string(), strategy.to_string()), row);
        }

        Ok(inner)
    }

    /// Verify the backing database answers a read transaction.
    pub async fn check_database(&self) -> Result<bool> {
        let db = Arc::clone(&self.db);
        with_db_timeout(move || Ok(db.begin_read().is_ok())).await
    }
}
